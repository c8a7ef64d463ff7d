//! Persisted collections. Every query except the drain's due-row scan is
//! scoped by tenant.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ChatflowResult;
use crate::flow::FlowDefinition;
use crate::status::Status;
use crate::types::{Broadcast, Correlation, FlowExecutionCursor, ScheduledMessage, Tenant};

/// Row selector for bulk operations on scheduled messages.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub correlation: Option<Correlation>,
    pub recipient: Option<String>,
    /// Empty matches every status.
    pub statuses: Vec<Status>,
}

impl MessageFilter {
    pub fn correlation(correlation: Correlation) -> Self {
        Self {
            correlation: Some(correlation),
            ..Self::default()
        }
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn statuses(mut self, statuses: &[Status]) -> Self {
        self.statuses = statuses.to_vec();
        self
    }

    pub fn matches(&self, msg: &ScheduledMessage) -> bool {
        self.correlation.map_or(true, |c| c == msg.correlation)
            && self.recipient.as_deref().map_or(true, |r| r == msg.recipient)
            && (self.statuses.is_empty() || self.statuses.contains(&msg.status))
    }
}

pub trait ScheduledMessageStore: Send + Sync {
    fn insert(&self, msg: ScheduledMessage) -> ChatflowResult<()>;

    fn get(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<Option<ScheduledMessage>>;

    /// Rows for `ids` in the given order; missing ids are skipped.
    fn get_many(&self, tenant: &Tenant, ids: &[Uuid]) -> ChatflowResult<Vec<ScheduledMessage>>;

    fn find(&self, tenant: &Tenant, filter: &MessageFilter) -> ChatflowResult<Vec<ScheduledMessage>>;

    /// PENDING rows with `send_at <= now` across all tenants, oldest first.
    fn due(&self, now: DateTime<Utc>, limit: usize) -> ChatflowResult<Vec<ScheduledMessage>>;

    /// Flips PENDING rows among `ids` to PROCESSING as one atomic step per
    /// row and returns only the rows this call flipped.
    fn claim(&self, ids: &[Uuid]) -> ChatflowResult<Vec<ScheduledMessage>>;

    /// Replaces a row. Returns `false` if it no longer exists.
    fn update(&self, msg: &ScheduledMessage) -> ChatflowResult<bool>;

    fn delete(&self, id: &Uuid) -> ChatflowResult<bool>;

    /// Moves every matching row to `to` and returns the ids that moved.
    /// Rows whose status does not allow the transition are left alone.
    fn transition_matching(
        &self,
        tenant: &Tenant,
        filter: &MessageFilter,
        to: Status,
    ) -> ChatflowResult<Vec<Uuid>>;

    /// Sets a new `send_at` and flips the row back to PENDING, but only if
    /// it is still at `expected`.
    fn reschedule(
        &self,
        tenant: &Tenant,
        id: &Uuid,
        expected: Status,
        send_at: DateTime<Utc>,
    ) -> ChatflowResult<bool>;

    fn delete_matching(&self, tenant: &Tenant, filter: &MessageFilter) -> ChatflowResult<usize>;
}

pub trait FlowStore: Send + Sync {
    fn insert(&self, flow: FlowDefinition) -> ChatflowResult<()>;
    fn get(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<Option<FlowDefinition>>;
    fn list(&self, tenant: &Tenant) -> ChatflowResult<Vec<FlowDefinition>>;
    fn update(&self, flow: &FlowDefinition) -> ChatflowResult<bool>;
    fn delete(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<bool>;

    /// Remembers that `flow_id` engaged `recipient` at `at` (cooldown anchor).
    fn record_engagement(
        &self,
        tenant: &Tenant,
        flow_id: &Uuid,
        recipient: &str,
        at: DateTime<Utc>,
    ) -> ChatflowResult<()>;

    fn last_engagement(
        &self,
        tenant: &Tenant,
        flow_id: &Uuid,
        recipient: &str,
    ) -> ChatflowResult<Option<DateTime<Utc>>>;
}

pub trait BroadcastStore: Send + Sync {
    fn insert(&self, broadcast: Broadcast) -> ChatflowResult<()>;
    fn get(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<Option<Broadcast>>;
    fn update(&self, broadcast: &Broadcast) -> ChatflowResult<bool>;
    fn delete(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<bool>;
}

pub trait CursorStore: Send + Sync {
    fn put(&self, cursor: FlowExecutionCursor) -> ChatflowResult<()>;
    fn get(
        &self,
        tenant: &Tenant,
        transport_message_id: &str,
    ) -> ChatflowResult<Option<FlowExecutionCursor>>;
    fn remove(&self, tenant: &Tenant, transport_message_id: &str) -> ChatflowResult<bool>;
    fn remove_for_flow(&self, tenant: &Tenant, flow_id: &Uuid) -> ChatflowResult<usize>;
    /// Drops every cursor `recipient` holds in `flow_id`.
    fn remove_for_recipient(
        &self,
        tenant: &Tenant,
        flow_id: &Uuid,
        recipient: &str,
    ) -> ChatflowResult<usize>;
}
