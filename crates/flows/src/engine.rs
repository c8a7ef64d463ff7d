//! Flow engine — owns flow definitions and turns inbound messages into
//! flow runs.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use chatflow_core::collaborators::{AssetCatalog, PhonebookLookup};
use chatflow_core::config::AppConfig;
use chatflow_core::event_bus::{make_event, noop_sink, EventSink};
use chatflow_core::flow::{FlowDefinition, NodePayload};
use chatflow_core::payload::PayloadBuilder;
use chatflow_core::store::{CursorStore, FlowStore};
use chatflow_core::types::{Correlation, EventType, InboundMessage, Tenant};
use chatflow_core::{ChatflowError, ChatflowResult};
use chatflow_delivery::DeliveryScheduler;

use crate::executor::{FlowGraphExecutor, RunContext, Terminal, TraversalOutcome, TraversalReport};
use crate::graph::FlowGraph;
use crate::nurturing::NurturingScheduler;
use crate::trigger::TriggerMatcher;

/// What one inbound message set in motion.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundReport {
    /// Flows newly engaged by trigger matching.
    pub engaged: Vec<Uuid>,
    /// Flow resumed by an interactive reply.
    pub resumed: Option<Uuid>,
    /// Flows whose traversal was abandoned.
    pub aborted: Vec<Uuid>,
    /// Messages scheduled across all runs, forwards and nurturing included.
    pub scheduled: usize,
}

pub struct FlowEngine {
    flows: Arc<dyn FlowStore>,
    cursors: Arc<dyn CursorStore>,
    scheduler: Arc<DeliveryScheduler>,
    builder: PayloadBuilder,
    matcher: TriggerMatcher,
    executor: FlowGraphExecutor,
    nurturing: NurturingScheduler,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("matcher", &self.matcher)
            .finish()
    }
}

impl FlowEngine {
    pub fn new(
        flows: Arc<dyn FlowStore>,
        cursors: Arc<dyn CursorStore>,
        scheduler: Arc<DeliveryScheduler>,
        assets: Arc<dyn AssetCatalog>,
        phonebook: Arc<dyn PhonebookLookup>,
    ) -> ChatflowResult<Self> {
        let builder = PayloadBuilder::new(assets);
        Ok(Self {
            executor: FlowGraphExecutor::new(scheduler.clone(), builder.clone()),
            nurturing: NurturingScheduler::new(scheduler.clone(), builder.clone(), phonebook)?,
            matcher: TriggerMatcher::default(),
            flows,
            cursors,
            scheduler,
            builder,
            event_sink: noop_sink(),
        })
    }

    /// Applies the tenant clock offset and the nurturing window.
    pub fn with_config(mut self, config: &AppConfig) -> ChatflowResult<Self> {
        let offset = config.delivery.utc_offset()?;
        self.matcher = TriggerMatcher::new(offset);
        self.nurturing = self.nurturing.with_config(&config.flows, offset)?;
        Ok(self)
    }

    /// Attach an event sink for emitting flow events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.executor = self.executor.with_event_sink(sink.clone());
        self.nurturing = self.nurturing.with_event_sink(sink.clone());
        self.event_sink = sink;
        self
    }

    // ─── Flow CRUD ──────────────────────────────────────────────────────

    /// Validates the graph and stores the flow.
    pub fn create_flow(&self, flow: FlowDefinition) -> ChatflowResult<Uuid> {
        FlowGraph::validate(&flow)?;
        let id = flow.id;
        info!(flow_id = %id, name = %flow.name, tenant = %flow.tenant, "Creating flow");
        self.flows.insert(flow)?;
        Ok(id)
    }

    pub fn get_flow(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<FlowDefinition> {
        self.flows
            .get(tenant, id)?
            .ok_or_else(|| ChatflowError::not_found("Flow", id))
    }

    pub fn list_flows(&self, tenant: &Tenant) -> ChatflowResult<Vec<FlowDefinition>> {
        self.flows.list(tenant)
    }

    /// Replaces a stored flow after validating its graph.
    pub fn update_flow(&self, mut flow: FlowDefinition) -> ChatflowResult<()> {
        FlowGraph::validate(&flow)?;
        flow.updated_at = Utc::now();
        if !self.flows.update(&flow)? {
            return Err(ChatflowError::not_found("Flow", flow.id));
        }
        info!(flow_id = %flow.id, "Updated flow");
        Ok(())
    }

    /// Turns a flow on or off. Switching off drops all of its pending
    /// nurturing and forgets its suspended runs.
    pub fn set_active(&self, tenant: &Tenant, id: &Uuid, active: bool) -> ChatflowResult<()> {
        let mut flow = self.get_flow(tenant, id)?;
        flow.active = active;
        flow.updated_at = Utc::now();
        self.flows.update(&flow)?;
        info!(flow_id = %id, active, "Updating flow status");
        if !active {
            self.release(tenant, id)?;
        }
        Ok(())
    }

    pub fn delete_flow(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<()> {
        if !self.flows.delete(tenant, id)? {
            return Err(ChatflowError::not_found("Flow", id));
        }
        self.release(tenant, id)?;
        info!(flow_id = %id, "Deleted flow");
        Ok(())
    }

    fn release(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<()> {
        let cancelled = self.nurturing.cancel(tenant, *id, None)?;
        let cursors = self.cursors.remove_for_flow(tenant, id)?;
        info!(flow_id = %id, cancelled, cursors, "Released flow state");
        Ok(())
    }

    // ─── Inbound messages ───────────────────────────────────────────────

    /// Resumes a suspended run when the message answers one of its
    /// interactive nodes; otherwise runs every flow the text engages.
    /// Delays become future send times, so this never blocks on delivery.
    /// The cooldown clock starts only when a run schedules something.
    pub fn handle_inbound(&self, msg: &InboundMessage) -> ChatflowResult<InboundReport> {
        let mut report = InboundReport::default();
        if self.try_resume(msg, &mut report)? {
            return Ok(report);
        }

        let now = msg.received_at;
        let candidates: Vec<FlowDefinition> = self
            .flows
            .list(&msg.tenant)?
            .into_iter()
            .filter(|f| f.active)
            .collect();
        let mut last_engaged = HashMap::new();
        for flow in candidates.iter().filter(|f| f.cooldown_secs > 0) {
            if let Some(at) = self.flows.last_engagement(&msg.tenant, &flow.id, &msg.sender)? {
                last_engaged.insert(flow.id, at);
            }
        }

        for flow in self.matcher.matching(&msg.text, &candidates, now, &last_engaged) {
            info!(flow_id = %flow.id, recipient = %msg.sender, "Flow engaged");
            metrics::counter!("flows.engaged").increment(1);
            self.event_sink.emit(make_event(
                EventType::FlowEngaged,
                Some(&msg.tenant),
                flow.id.to_string(),
                Some(&msg.sender),
            ));
            report.engaged.push(flow.id);

            let ctx = RunContext {
                tenant: &msg.tenant,
                recipient: &msg.sender,
                reply_to: msg.transport_message_id.as_deref(),
                now,
            };
            let outcome = self.executor.run(flow, ctx).and_then(|run| {
                let scheduled = self.forward(flow, msg)? + self.after_run(flow, &run, now)?;
                self.anchor_cooldown(flow, msg, &run)?;
                // A fresh run supersedes menus left by earlier ones.
                self.cursors
                    .remove_for_recipient(&msg.tenant, &flow.id, &msg.sender)?;
                Ok(scheduled)
            });
            self.settle_run(flow, msg, outcome, &mut report)?;
        }
        Ok(report)
    }

    fn try_resume(&self, msg: &InboundMessage, report: &mut InboundReport) -> ChatflowResult<bool> {
        let Some(reply) = &msg.reply else {
            return Ok(false);
        };
        let Some(cursor) = self.cursors.get(&msg.tenant, &reply.context_message_id)? else {
            return Ok(false);
        };
        if cursor.recipient != msg.sender {
            warn!(
                context = %reply.context_message_id,
                sender = %msg.sender,
                "Reply sender does not own the referenced message"
            );
            return Ok(false);
        }
        let flow = match self.flows.get(&msg.tenant, &cursor.flow_id)? {
            Some(flow) if flow.active => flow,
            _ => return Ok(false),
        };

        info!(flow_id = %flow.id, recipient = %msg.sender, option = %reply.option_id, "Flow resumed");
        self.event_sink.emit(make_event(
            EventType::FlowResumed,
            Some(&msg.tenant),
            flow.id.to_string(),
            Some(&msg.sender),
        ));
        report.resumed = Some(flow.id);

        let ctx = RunContext {
            tenant: &msg.tenant,
            recipient: &msg.sender,
            reply_to: msg.transport_message_id.as_deref(),
            now: msg.received_at,
        };
        let outcome = self
            .executor
            .resume(&flow, &cursor, &reply.option_id, ctx)
            .and_then(|run| {
                let scheduled = self.after_run(&flow, &run, msg.received_at)?;
                self.anchor_cooldown(&flow, msg, &run)?;
                self.cursors.remove(&msg.tenant, &reply.context_message_id)?;
                Ok(scheduled)
            });
        self.settle_run(&flow, msg, outcome, report)?;
        Ok(true)
    }

    /// Records the engagement a cooldown counts from, for runs that
    /// scheduled at least one message.
    fn anchor_cooldown(
        &self,
        flow: &FlowDefinition,
        msg: &InboundMessage,
        run: &TraversalReport,
    ) -> ChatflowResult<()> {
        if run.dispatched.is_empty() {
            return Ok(());
        }
        self.flows
            .record_engagement(&msg.tenant, &flow.id, &msg.sender, msg.received_at)
    }

    /// Restarts nurturing once a run stops without waiting for a reply.
    /// Runs that finish on an `end` node get no nurturing.
    fn after_run(
        &self,
        flow: &FlowDefinition,
        run: &TraversalReport,
        now: DateTime<Utc>,
    ) -> ChatflowResult<usize> {
        let mut scheduled = run.dispatched.len();
        let TraversalOutcome::Completed { terminal } = run.outcome else {
            return Ok(scheduled);
        };
        self.nurturing
            .cancel(&flow.tenant, flow.id, Some(&run.recipient))?;
        if terminal != Terminal::End {
            scheduled += self.nurturing.arm(flow, &run.recipient, now)?.len();
        }
        Ok(scheduled)
    }

    /// Copies the inbound text to the flow's forward number, if any.
    fn forward(&self, flow: &FlowDefinition, msg: &InboundMessage) -> ChatflowResult<usize> {
        let Some(rule) = &flow.forward else {
            return Ok(0);
        };
        let body = match &rule.prefix {
            Some(prefix) => format!("{} {}: {}", prefix, msg.sender, msg.text),
            None => format!("{}: {}", msg.sender, msg.text),
        };
        let payload = self.builder.build(
            &msg.tenant,
            &rule.to,
            &NodePayload::Text {
                body,
                preview_url: false,
            },
            None,
        )?;
        self.scheduler.schedule(
            &msg.tenant,
            Correlation::flow(flow.id),
            &rule.to,
            payload,
            msg.received_at,
        )?;
        Ok(1)
    }

    /// Folds a run's result into the report. Errors that only concern this
    /// run are logged; anything else propagates.
    fn settle_run(
        &self,
        flow: &FlowDefinition,
        msg: &InboundMessage,
        outcome: ChatflowResult<usize>,
        report: &mut InboundReport,
    ) -> ChatflowResult<()> {
        match outcome {
            Ok(scheduled) => {
                report.scheduled += scheduled;
                Ok(())
            }
            Err(e) if e.is_traversal_local() => {
                warn!(flow_id = %flow.id, recipient = %msg.sender, error = %e, "Flow run aborted");
                metrics::counter!("flows.aborted").increment(1);
                self.event_sink.emit(make_event(
                    EventType::FlowAborted,
                    Some(&msg.tenant),
                    flow.id.to_string(),
                    Some(&msg.sender),
                ));
                report.aborted.push(flow.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
