//! In-process collection stores backed by DashMap for lock-free concurrent
//! access. Row-level updates happen under the owning shard's lock, which is
//! what makes `claim` and `reschedule` atomic per row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::ChatflowResult;
use crate::flow::FlowDefinition;
use crate::status::{Status, StatusMachine};
use crate::store::{
    BroadcastStore, CursorStore, FlowStore, MessageFilter, ScheduledMessageStore,
};
use crate::types::{Broadcast, FlowExecutionCursor, ScheduledMessage, Tenant};

#[derive(Default)]
pub struct InMemoryScheduledMessages {
    rows: DashMap<Uuid, ScheduledMessage>,
}

impl InMemoryScheduledMessages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl ScheduledMessageStore for InMemoryScheduledMessages {
    fn insert(&self, msg: ScheduledMessage) -> ChatflowResult<()> {
        self.rows.insert(msg.id, msg);
        Ok(())
    }

    fn get(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<Option<ScheduledMessage>> {
        Ok(self
            .rows
            .get(id)
            .filter(|r| r.tenant == *tenant)
            .map(|r| r.value().clone()))
    }

    fn get_many(&self, tenant: &Tenant, ids: &[Uuid]) -> ChatflowResult<Vec<ScheduledMessage>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.get(tenant, id)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn find(&self, tenant: &Tenant, filter: &MessageFilter) -> ChatflowResult<Vec<ScheduledMessage>> {
        let mut out: Vec<ScheduledMessage> = self
            .rows
            .iter()
            .filter(|r| r.tenant == *tenant && filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|m| m.send_at);
        Ok(out)
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> ChatflowResult<Vec<ScheduledMessage>> {
        let mut out: Vec<ScheduledMessage> = self
            .rows
            .iter()
            .filter(|r| r.status == Status::Pending && r.send_at <= now)
            .map(|r| r.value().clone())
            .collect();
        out.sort_by_key(|m| m.send_at);
        out.truncate(limit);
        Ok(out)
    }

    fn claim(&self, ids: &[Uuid]) -> ChatflowResult<Vec<ScheduledMessage>> {
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut row) = self.rows.get_mut(id) {
                if row.status == Status::Pending {
                    row.status = Status::Processing;
                    claimed.push(row.value().clone());
                }
            }
        }
        Ok(claimed)
    }

    fn update(&self, msg: &ScheduledMessage) -> ChatflowResult<bool> {
        match self.rows.get_mut(&msg.id) {
            Some(mut row) => {
                *row = msg.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, id: &Uuid) -> ChatflowResult<bool> {
        Ok(self.rows.remove(id).is_some())
    }

    fn transition_matching(
        &self,
        tenant: &Tenant,
        filter: &MessageFilter,
        to: Status,
    ) -> ChatflowResult<Vec<Uuid>> {
        let mut moved = Vec::new();
        for mut row in self.rows.iter_mut() {
            if row.tenant != *tenant || !filter.matches(row.value()) {
                continue;
            }
            if StatusMachine::can_transition(row.status, to) {
                row.status = to;
                moved.push(row.id);
            }
        }
        Ok(moved)
    }

    fn reschedule(
        &self,
        tenant: &Tenant,
        id: &Uuid,
        expected: Status,
        send_at: DateTime<Utc>,
    ) -> ChatflowResult<bool> {
        let Some(mut row) = self.rows.get_mut(id) else {
            return Ok(false);
        };
        if row.tenant != *tenant
            || row.status != expected
            || !StatusMachine::can_transition(expected, Status::Pending)
        {
            return Ok(false);
        }
        row.status = Status::Pending;
        row.send_at = send_at;
        row.failed_at = None;
        row.failed_reason = None;
        Ok(true)
    }

    fn delete_matching(&self, tenant: &Tenant, filter: &MessageFilter) -> ChatflowResult<usize> {
        let mut removed = 0;
        self.rows.retain(|_, row| {
            let hit = row.tenant == *tenant && filter.matches(row);
            removed += usize::from(hit);
            !hit
        });
        Ok(removed)
    }
}

#[derive(Default)]
pub struct InMemoryFlows {
    flows: DashMap<Uuid, FlowDefinition>,
    engagements: DashMap<(Tenant, Uuid, String), DateTime<Utc>>,
}

impl InMemoryFlows {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowStore for InMemoryFlows {
    fn insert(&self, flow: FlowDefinition) -> ChatflowResult<()> {
        self.flows.insert(flow.id, flow);
        Ok(())
    }

    fn get(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<Option<FlowDefinition>> {
        Ok(self
            .flows
            .get(id)
            .filter(|f| f.tenant == *tenant)
            .map(|f| f.value().clone()))
    }

    fn list(&self, tenant: &Tenant) -> ChatflowResult<Vec<FlowDefinition>> {
        let mut out: Vec<FlowDefinition> = self
            .flows
            .iter()
            .filter(|f| f.tenant == *tenant)
            .map(|f| f.value().clone())
            .collect();
        out.sort_by_key(|f| f.created_at);
        Ok(out)
    }

    fn update(&self, flow: &FlowDefinition) -> ChatflowResult<bool> {
        match self.flows.get_mut(&flow.id) {
            Some(mut existing) if existing.tenant == flow.tenant => {
                *existing = flow.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<bool> {
        Ok(self
            .flows
            .remove_if(id, |_, f| f.tenant == *tenant)
            .is_some())
    }

    fn record_engagement(
        &self,
        tenant: &Tenant,
        flow_id: &Uuid,
        recipient: &str,
        at: DateTime<Utc>,
    ) -> ChatflowResult<()> {
        self.engagements
            .insert((tenant.clone(), *flow_id, recipient.to_string()), at);
        Ok(())
    }

    fn last_engagement(
        &self,
        tenant: &Tenant,
        flow_id: &Uuid,
        recipient: &str,
    ) -> ChatflowResult<Option<DateTime<Utc>>> {
        Ok(self
            .engagements
            .get(&(tenant.clone(), *flow_id, recipient.to_string()))
            .map(|at| *at))
    }
}

#[derive(Default)]
pub struct InMemoryBroadcasts {
    broadcasts: DashMap<Uuid, Broadcast>,
}

impl InMemoryBroadcasts {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BroadcastStore for InMemoryBroadcasts {
    fn insert(&self, broadcast: Broadcast) -> ChatflowResult<()> {
        self.broadcasts.insert(broadcast.id, broadcast);
        Ok(())
    }

    fn get(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<Option<Broadcast>> {
        Ok(self
            .broadcasts
            .get(id)
            .filter(|b| b.tenant == *tenant)
            .map(|b| b.value().clone()))
    }

    fn update(&self, broadcast: &Broadcast) -> ChatflowResult<bool> {
        match self.broadcasts.get_mut(&broadcast.id) {
            Some(mut existing) if existing.tenant == broadcast.tenant => {
                *existing = broadcast.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<bool> {
        Ok(self
            .broadcasts
            .remove_if(id, |_, b| b.tenant == *tenant)
            .is_some())
    }
}

#[derive(Default)]
pub struct InMemoryCursors {
    cursors: DashMap<(Tenant, String), FlowExecutionCursor>,
}

impl InMemoryCursors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    fn remove_where(
        &self,
        hit: impl Fn(&(Tenant, String), &FlowExecutionCursor) -> bool,
    ) -> usize {
        let mut removed = 0;
        self.cursors.retain(|key, cursor| {
            let drop = hit(key, cursor);
            removed += usize::from(drop);
            !drop
        });
        removed
    }
}

impl CursorStore for InMemoryCursors {
    fn put(&self, cursor: FlowExecutionCursor) -> ChatflowResult<()> {
        self.cursors.insert(
            (cursor.tenant.clone(), cursor.transport_message_id.clone()),
            cursor,
        );
        Ok(())
    }

    fn get(
        &self,
        tenant: &Tenant,
        transport_message_id: &str,
    ) -> ChatflowResult<Option<FlowExecutionCursor>> {
        Ok(self
            .cursors
            .get(&(tenant.clone(), transport_message_id.to_string()))
            .map(|c| c.value().clone()))
    }

    fn remove(&self, tenant: &Tenant, transport_message_id: &str) -> ChatflowResult<bool> {
        Ok(self
            .cursors
            .remove(&(tenant.clone(), transport_message_id.to_string()))
            .is_some())
    }

    fn remove_for_flow(&self, tenant: &Tenant, flow_id: &Uuid) -> ChatflowResult<usize> {
        Ok(self.remove_where(|(t, _), c| t == tenant && c.flow_id == *flow_id))
    }

    fn remove_for_recipient(
        &self,
        tenant: &Tenant,
        flow_id: &Uuid,
        recipient: &str,
    ) -> ChatflowResult<usize> {
        Ok(self.remove_where(|(t, _), c| {
            t == tenant && c.flow_id == *flow_id && c.recipient == recipient
        }))
    }
}

/// All persisted collections, in memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub messages: Arc<InMemoryScheduledMessages>,
    pub flows: Arc<InMemoryFlows>,
    pub broadcasts: Arc<InMemoryBroadcasts>,
    pub cursors: Arc<InMemoryCursors>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}
