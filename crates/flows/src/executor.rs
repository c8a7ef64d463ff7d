//! Flow graph traversal.
//!
//! Each run walks from a node, accumulating node delays into future send
//! times, and hands every message-bearing node to the delivery scheduler.
//! Interactive nodes end the run in a suspended state; a reply to the
//! dispatched message later resumes from the chosen branch.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use chatflow_core::event_bus::{make_event, noop_sink, EventSink};
use chatflow_core::flow::{FlowDefinition, NodePayload};
use chatflow_core::payload::PayloadBuilder;
use chatflow_core::types::{Correlation, EventType, FlowExecutionCursor, ScheduledMessage, Tenant};
use chatflow_core::{ChatflowError, ChatflowResult};
use chatflow_delivery::{after_secs, DeliveryScheduler};

use crate::graph::FlowGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Terminal {
    /// Reached an `end` node.
    End,
    /// Reached a node with no outgoing edge.
    DeadEnd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TraversalOutcome {
    /// Waiting on a reply to the interactive node `node_id`.
    Suspended { node_id: String },
    Completed { terminal: Terminal },
}

#[derive(Debug, Clone, Serialize)]
pub struct TraversalReport {
    pub flow_id: Uuid,
    pub recipient: String,
    /// Scheduled message ids in dispatch order.
    pub dispatched: Vec<Uuid>,
    pub outcome: TraversalOutcome,
}

impl TraversalReport {
    pub fn is_suspended(&self) -> bool {
        matches!(self.outcome, TraversalOutcome::Suspended { .. })
    }
}

/// Where a run starts and who it talks to.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub tenant: &'a Tenant,
    pub recipient: &'a str,
    /// Transport id of the inbound message that triggered the run.
    pub reply_to: Option<&'a str>,
    pub now: DateTime<Utc>,
}

pub struct FlowGraphExecutor {
    scheduler: Arc<DeliveryScheduler>,
    builder: PayloadBuilder,
    event_sink: Arc<dyn EventSink>,
}

impl FlowGraphExecutor {
    pub fn new(scheduler: Arc<DeliveryScheduler>, builder: PayloadBuilder) -> Self {
        Self {
            scheduler,
            builder,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Runs `flow` from its start node.
    pub fn run(&self, flow: &FlowDefinition, ctx: RunContext<'_>) -> ChatflowResult<TraversalReport> {
        let graph = FlowGraph::build(flow)?;
        self.walk(flow, &graph, graph.start(), ctx)
    }

    /// Continues a suspended run along the branch for `option_id`. The
    /// delay accumulator starts again from zero.
    pub fn resume(
        &self,
        flow: &FlowDefinition,
        cursor: &FlowExecutionCursor,
        option_id: &str,
        ctx: RunContext<'_>,
    ) -> ChatflowResult<TraversalReport> {
        let graph = FlowGraph::build(flow)?;
        let from = graph.node(&cursor.last_dispatched_node_id)?;
        let target = graph.branch(&from.id, option_id).ok_or_else(|| {
            ChatflowError::validation(format!(
                "node '{}' has no branch for option '{}'",
                from.id, option_id
            ))
        })?;
        debug!(
            flow_id = %flow.id,
            from = %from.id,
            option = %option_id,
            target = %target,
            "Resuming flow"
        );
        self.walk(flow, &graph, target, ctx)
    }

    /// Plans the whole run first and schedules only if every node resolved,
    /// so an aborted run leaves nothing behind.
    fn walk(
        &self,
        flow: &FlowDefinition,
        graph: &FlowGraph<'_>,
        from: &str,
        ctx: RunContext<'_>,
    ) -> ChatflowResult<TraversalReport> {
        let reply_to = if flow.reply_context { ctx.reply_to } else { None };
        let mut planned: Vec<ScheduledMessage> = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut offset_secs: u64 = 0;
        let mut current = from;

        let outcome = loop {
            if !visited.insert(current) {
                return Err(ChatflowError::validation(format!(
                    "flow {} loops back to node '{}' without waiting for a reply",
                    flow.id, current
                )));
            }
            let node = graph.node(current)?;
            offset_secs = offset_secs.checked_add(node.delay_secs).ok_or_else(|| {
                ChatflowError::validation(format!(
                    "accumulated delay overflows at node '{}'",
                    node.id
                ))
            })?;

            if matches!(node.payload, NodePayload::End) {
                break TraversalOutcome::Completed {
                    terminal: Terminal::End,
                };
            }
            if node.payload.is_dispatchable() {
                let payload = self
                    .builder
                    .build(ctx.tenant, ctx.recipient, &node.payload, reply_to)?;
                let send_at = after_secs(ctx.now, offset_secs)?;
                let row = ScheduledMessage::new(
                    ctx.tenant.clone(),
                    Correlation::flow(flow.id),
                    ctx.recipient,
                    payload,
                    send_at,
                );
                // Only rows a reply can point back to leave a cursor behind.
                if node.payload.is_interactive() {
                    planned.push(row.with_flow_node(flow.id, node.id.clone()));
                    break TraversalOutcome::Suspended {
                        node_id: node.id.clone(),
                    };
                }
                planned.push(row);
            }
            match graph.next(current) {
                Some(next) => current = next,
                None => {
                    break TraversalOutcome::Completed {
                        terminal: Terminal::DeadEnd,
                    }
                }
            }
        };

        let mut dispatched = Vec::with_capacity(planned.len());
        for msg in planned {
            dispatched.push(self.scheduler.schedule_row(msg)?);
        }

        let event_type = match &outcome {
            TraversalOutcome::Suspended { .. } => EventType::FlowSuspended,
            TraversalOutcome::Completed { .. } => EventType::FlowCompleted,
        };
        info!(
            flow_id = %flow.id,
            recipient = %ctx.recipient,
            dispatched = dispatched.len(),
            outcome = ?outcome,
            "Flow traversal finished"
        );
        self.event_sink.emit(make_event(
            event_type,
            Some(ctx.tenant),
            flow.id.to_string(),
            Some(ctx.recipient),
        ));

        Ok(TraversalReport {
            flow_id: flow.id,
            recipient: ctx.recipient.to_string(),
            dispatched,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::collaborators::{
        InMemoryAssets, InMemoryConversations, InMemoryLedger, RecordingTransport,
    };
    use chatflow_core::event_bus::capture_sink;
    use chatflow_core::flow::{FlowEdge, FlowNode, MatchMode, MediaSource, ReplyOption, TimeWindow};
    use chatflow_core::memory::MemoryBackend;
    use chatflow_core::store::ScheduledMessageStore;
    use chrono::{Duration, TimeZone};

    fn tenant() -> Tenant {
        Tenant::new("acct", "dev")
    }

    fn setup() -> (MemoryBackend, FlowGraphExecutor) {
        let backend = MemoryBackend::new();
        let scheduler = Arc::new(DeliveryScheduler::new(
            backend.messages.clone(),
            backend.cursors.clone(),
            Arc::new(RecordingTransport::new()),
            Arc::new(InMemoryConversations::new()),
            Arc::new(InMemoryLedger::new()),
        ));
        let executor = FlowGraphExecutor::new(scheduler, PayloadBuilder::new(Arc::new(InMemoryAssets::new())));
        (backend, executor)
    }

    fn node(id: &str, payload: NodePayload, delay_secs: u64) -> FlowNode {
        FlowNode {
            id: id.into(),
            payload,
            delay_secs,
        }
    }

    fn text(body: &str) -> NodePayload {
        NodePayload::Text {
            body: body.into(),
            preview_url: false,
        }
    }

    fn edge(source: &str, handle: &str, target: &str) -> FlowEdge {
        FlowEdge {
            source: source.into(),
            source_handle: handle.into(),
            target: target.into(),
        }
    }

    fn flow(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> FlowDefinition {
        FlowDefinition {
            id: Uuid::new_v4(),
            tenant: tenant(),
            name: "onboarding".into(),
            triggers: vec!["hi".into()],
            match_mode: MatchMode::ExactIgnoreCase,
            active: true,
            window: TimeWindow::default(),
            cooldown_secs: 0,
            reply_context: false,
            nodes,
            edges,
            nurturing: vec![],
            forward: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn ctx(tenant: &Tenant, now: DateTime<Utc>) -> RunContext<'_> {
        RunContext {
            tenant,
            recipient: "5511900",
            reply_to: Some("wamid.inbound"),
            now,
        }
    }

    fn send_times(backend: &MemoryBackend, ids: &[Uuid]) -> Vec<DateTime<Utc>> {
        backend
            .messages
            .get_many(&tenant(), ids)
            .unwrap()
            .into_iter()
            .map(|m| m.send_at)
            .collect()
    }

    fn menu() -> NodePayload {
        NodePayload::Button {
            body: "Pick one".into(),
            header: None,
            footer: None,
            buttons: vec![
                ReplyOption {
                    id: "opt-sales".into(),
                    title: "Sales".into(),
                },
                ReplyOption {
                    id: "opt-support".into(),
                    title: "Support".into(),
                },
            ],
        }
    }

    #[test]
    fn test_delays_accumulate_along_chain() {
        let (backend, executor) = setup();
        let tn = tenant();
        let f = flow(
            vec![
                node("start", NodePayload::Start, 0),
                node("a", text("one"), 5),
                node("b", text("two"), 10),
                node("c", text("three"), 0),
            ],
            vec![
                edge("start", "source", "a"),
                edge("a", "source", "b"),
                edge("b", "b", "c"),
            ],
        );
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let report = executor.run(&f, ctx(&tn, t)).unwrap();

        assert_eq!(report.outcome, TraversalOutcome::Completed { terminal: Terminal::DeadEnd });
        assert_eq!(
            send_times(&backend, &report.dispatched),
            vec![
                t + Duration::seconds(5),
                t + Duration::seconds(15),
                t + Duration::seconds(15)
            ]
        );
    }

    #[test]
    fn test_interactive_node_suspends_and_resume_resets_delay() {
        let (backend, executor) = setup();
        let tn = tenant();
        let sink = capture_sink();
        let executor = executor.with_event_sink(sink.clone());
        let f = flow(
            vec![
                node("start", NodePayload::Start, 0),
                node("hello", text("Welcome!"), 3),
                node("menu", menu(), 4),
                node("sales", text("Sales will call you"), 2),
                node("bye", NodePayload::End, 0),
            ],
            vec![
                edge("start", "source", "hello"),
                edge("hello", "source", "menu"),
                edge("menu", "opt-sales", "sales"),
                edge("sales", "source", "bye"),
            ],
        );
        let t = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let report = executor.run(&f, ctx(&tn, t)).unwrap();
        assert_eq!(report.outcome, TraversalOutcome::Suspended { node_id: "menu".into() });
        assert_eq!(report.dispatched.len(), 2);
        let menu_row = backend.messages.get(&tenant(), &report.dispatched[1]).unwrap().unwrap();
        assert_eq!(menu_row.flow_node.as_ref().unwrap().node_id, "menu");
        let hello_row = backend.messages.get(&tenant(), &report.dispatched[0]).unwrap().unwrap();
        assert!(hello_row.flow_node.is_none());
        assert_eq!(menu_row.send_at, t + Duration::seconds(7));

        let cursor = FlowExecutionCursor {
            transport_message_id: "wamid.menu".into(),
            tenant: tenant(),
            flow_id: f.id,
            recipient: "5511900".into(),
            last_dispatched_node_id: "menu".into(),
            created_at: t,
        };
        let later = t + Duration::minutes(3);
        let resumed = executor.resume(&f, &cursor, "opt-sales", ctx(&tn, later)).unwrap();
        assert_eq!(resumed.outcome, TraversalOutcome::Completed { terminal: Terminal::End });
        assert_eq!(send_times(&backend, &resumed.dispatched), vec![later + Duration::seconds(2)]);
        assert_eq!(sink.count_type(EventType::FlowSuspended), 1);
        assert_eq!(sink.count_type(EventType::FlowCompleted), 1);

        let unknown = executor.resume(&f, &cursor, "opt-nope", ctx(&tn, later));
        assert!(matches!(unknown, Err(ChatflowError::Validation(_))));
    }

    #[test]
    fn test_unresolved_reference_schedules_nothing() {
        let (backend, executor) = setup();
        let tn = tenant();
        let f = flow(
            vec![
                node("start", NodePayload::Start, 0),
                node("hello", text("Hi"), 0),
                node(
                    "promo",
                    NodePayload::Image {
                        media: MediaSource::Asset("missing-banner".into()),
                        caption: None,
                    },
                    0,
                ),
            ],
            vec![edge("start", "source", "hello"), edge("hello", "source", "promo")],
        );
        let err = executor.run(&f, ctx(&tn, Utc::now())).unwrap_err();
        assert!(err.is_traversal_local());
        assert!(backend.messages.is_empty());
    }

    #[test]
    fn test_cycle_without_interaction_is_rejected() {
        let (_, executor) = setup();
        let tn = tenant();
        let f = flow(
            vec![
                node("start", NodePayload::Start, 0),
                node("a", text("ping"), 1),
                node("b", text("pong"), 1),
            ],
            vec![
                edge("start", "source", "a"),
                edge("a", "source", "b"),
                edge("b", "source", "a"),
            ],
        );
        assert!(executor.run(&f, ctx(&tn, Utc::now())).is_err());
    }

    #[test]
    fn test_reply_context_quotes_inbound() {
        let (backend, executor) = setup();
        let tn = tenant();
        let mut f = flow(
            vec![node("start", NodePayload::Start, 0), node("a", text("Hey"), 0)],
            vec![edge("start", "source", "a")],
        );
        f.reply_context = true;
        let report = executor.run(&f, ctx(&tn, Utc::now())).unwrap();
        let row = backend.messages.get(&tenant(), &report.dispatched[0]).unwrap().unwrap();
        assert_eq!(row.payload["context"]["message_id"], "wamid.inbound");
    }

    #[test]
    fn test_oversized_delay_aborts_run() {
        let (backend, executor) = setup();
        let tn = tenant();
        let f = flow(
            vec![
                node("start", NodePayload::Start, 0),
                node("a", text("soon"), 5),
                node("b", text("much later"), 10_000_000_000_000_000),
            ],
            vec![edge("start", "source", "a"), edge("a", "source", "b")],
        );
        let err = executor.run(&f, ctx(&tn, Utc::now())).unwrap_err();
        assert!(err.is_traversal_local());
        assert!(backend.messages.is_empty());

        let g = flow(
            vec![
                node("start", NodePayload::Start, u64::MAX),
                node("a", text("never"), 1),
            ],
            vec![edge("start", "source", "a")],
        );
        assert!(matches!(
            executor.run(&g, ctx(&tn, Utc::now())),
            Err(ChatflowError::Validation(_))
        ));
        assert!(backend.messages.is_empty());
    }
}
