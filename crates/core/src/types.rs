use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChatflowResult;
use crate::status::{Status, StatusMachine};

/// Tenant scope. Every persisted entity and every store query carries one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenant {
    pub account_id: String,
    pub device_id: String,
}

impl Tenant {
    pub fn new(account_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            device_id: device_id.into(),
        }
    }
}

impl std::fmt::Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.account_id, self.device_id)
    }
}

/// Which component scheduled a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    Broadcast,
    Flow,
    FlowNurturing,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerKind::Broadcast => "broadcast",
            SchedulerKind::Flow => "flow",
            SchedulerKind::FlowNurturing => "flow-nurturing",
        }
    }
}

/// Correlation key used for bulk cancellation and control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Correlation {
    pub scheduler_id: Uuid,
    pub kind: SchedulerKind,
}

impl Correlation {
    pub fn broadcast(id: Uuid) -> Self {
        Self {
            scheduler_id: id,
            kind: SchedulerKind::Broadcast,
        }
    }

    pub fn flow(id: Uuid) -> Self {
        Self {
            scheduler_id: id,
            kind: SchedulerKind::Flow,
        }
    }

    pub fn nurturing(flow_id: Uuid) -> Self {
        Self {
            scheduler_id: flow_id,
            kind: SchedulerKind::FlowNurturing,
        }
    }
}

/// A transport-ready message body plus its kind label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub message_type: String,
    pub body: serde_json::Value,
}

/// The flow node a scheduled message was produced by. Captured into a
/// [`FlowExecutionCursor`] once the transport assigns a message id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowNodeRef {
    pub flow_id: Uuid,
    pub node_id: String,
}

/// A message waiting for, or past, its delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub tenant: Tenant,
    pub correlation: Correlation,
    pub recipient: String,
    pub payload: serde_json::Value,
    pub message_type: String,
    pub send_at: DateTime<Utc>,
    pub status: Status,
    #[serde(default)]
    pub flow_node: Option<FlowNodeRef>,
    #[serde(default)]
    pub transport_message_id: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ScheduledMessage {
    /// A fresh PENDING row.
    pub fn new(
        tenant: Tenant,
        correlation: Correlation,
        recipient: impl Into<String>,
        payload: OutboundPayload,
        send_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant,
            correlation,
            recipient: recipient.into(),
            payload: payload.body,
            message_type: payload.message_type,
            send_at,
            status: Status::Pending,
            flow_node: None,
            transport_message_id: None,
            failed_at: None,
            failed_reason: None,
            sent_at: None,
            delivered_at: None,
            read_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_flow_node(mut self, flow_id: Uuid, node_id: impl Into<String>) -> Self {
        self.flow_node = Some(FlowNodeRef {
            flow_id,
            node_id: node_id.into(),
        });
        self
    }

    /// Moves the row to `to`, rejecting edges outside the lifecycle graph.
    pub fn transition(&mut self, to: Status) -> ChatflowResult<()> {
        self.status = StatusMachine::check(self.status, to)?;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> ChatflowResult<()> {
        self.transition(Status::Failed)?;
        self.failed_at = Some(at);
        self.failed_reason = Some(reason.into());
        Ok(())
    }

    pub fn mark_sent(&mut self, transport_message_id: String, at: DateTime<Utc>) -> ChatflowResult<()> {
        self.transition(Status::Sent)?;
        self.sent_at = Some(at);
        self.transport_message_id = Some(transport_message_id);
        Ok(())
    }
}

/// Resumption point for a flow that suspended on an interactive node,
/// keyed by the transport message id of the dispatched node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecutionCursor {
    pub transport_message_id: String,
    pub tenant: Tenant,
    pub flow_id: Uuid,
    pub recipient: String,
    pub last_dispatched_node_id: String,
    pub created_at: DateTime<Utc>,
}

// ─── Broadcasts ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastStatus {
    Active,
    Paused,
}

/// Daily send window and volume used to spread a bulk send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingWindow {
    pub start_date: NaiveDate,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
    pub daily_count: u32,
}

/// How a broadcast's send times are computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum Pacing {
    /// Same-day send, one message every `delay_secs` from the start call.
    /// Unset uses the configured instant delay.
    Instant {
        #[serde(default)]
        delay_secs: Option<u64>,
    },
    Paced(PacingWindow),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    pub id: Uuid,
    pub tenant: Tenant,
    pub name: String,
    pub status: BroadcastStatus,
    pub pacing: Pacing,
    /// Scheduled message ids in recipient order.
    pub message_ids: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Remaining rows of a broadcast grouped by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastSummary {
    pub pending: usize,
    pub processing: usize,
    pub paused: usize,
    pub failed: usize,
    /// Rows already sent and removed from the scheduler.
    pub completed: usize,
}

// ─── Inbound traffic and receipts ───────────────────────────────────────────

/// A recipient's selection on a previously dispatched interactive message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveReply {
    /// Transport id of the message being replied to.
    pub context_message_id: String,
    /// Button/row id the recipient chose.
    pub option_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub tenant: Tenant,
    pub sender: String,
    pub text: String,
    pub transport_message_id: Option<String>,
    #[serde(default)]
    pub reply: Option<InteractiveReply>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn text(tenant: Tenant, sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tenant,
            sender: sender.into(),
            text: text.into(),
            transport_message_id: None,
            reply: None,
            received_at: Utc::now(),
        }
    }
}

/// Delivery receipt posted by the transport's webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub transport_message_id: String,
    pub status: Status,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Durable record of a send attempt, owned by the conversation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub tenant: Tenant,
    pub recipient: String,
    pub correlation: Correlation,
    pub scheduled_message_id: Uuid,
    pub message_type: String,
    pub payload: serde_json::Value,
    pub status: Status,
    pub transport_message_id: Option<String>,
    pub failed_reason: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl ConversationRecord {
    pub fn from_scheduled(msg: &ScheduledMessage) -> Self {
        Self {
            tenant: msg.tenant.clone(),
            recipient: msg.recipient.clone(),
            correlation: msg.correlation,
            scheduled_message_id: msg.id,
            message_type: msg.message_type.clone(),
            payload: msg.payload.clone(),
            status: msg.status,
            transport_message_id: msg.transport_message_id.clone(),
            failed_reason: msg.failed_reason.clone(),
            sent_at: msg.sent_at,
            delivered_at: msg.delivered_at,
            read_at: msg.read_at,
            failed_at: msg.failed_at,
        }
    }

    /// Applies a receipt if it moves the record forward. Returns whether
    /// anything changed.
    pub fn apply_receipt(&mut self, receipt: &DeliveryReceipt) -> bool {
        if !self.status.receipt_advances(receipt.status) {
            return false;
        }
        self.status = receipt.status;
        match receipt.status {
            Status::Delivered => self.delivered_at = Some(receipt.timestamp),
            Status::Read => {
                self.read_at = Some(receipt.timestamp);
                self.delivered_at.get_or_insert(receipt.timestamp);
            }
            Status::Failed => {
                self.failed_at = Some(receipt.timestamp);
                self.failed_reason = receipt.reason.clone();
            }
            _ => {}
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub conversation_id: String,
    pub record: ConversationRecord,
    pub stored_at: DateTime<Utc>,
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// Engine event emitted through the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub tenant: Option<Tenant>,
    /// Flow, broadcast or scheduled message the event is about.
    pub subject_id: String,
    pub recipient: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FlowEngaged,
    FlowResumed,
    FlowCompleted,
    FlowSuspended,
    FlowAborted,
    MessageScheduled,
    MessageSent,
    MessageFailed,
    MessagesCancelled,
    ReceiptApplied,
    NurturingArmed,
    NurturingCancelled,
    BroadcastStarted,
    BroadcastPaused,
    BroadcastResumed,
    BroadcastResent,
    BroadcastDeleted,
}

/// `HH:mm` (de)serialization for [`NaiveTime`].
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%H:%M";

    pub fn parse(value: &str) -> Result<NaiveTime, chrono::ParseError> {
        NaiveTime::parse_from_str(value.trim(), FORMAT)
    }

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
