//! Broadcast lifecycle: start, pause, resume, resend, delete.
//!
//! A broadcast owns one scheduled message per recipient, correlated by the
//! broadcast id. Pause parks PENDING rows as PAUSED so the drain skips them;
//! resume and resend rebuild send times from the original pacing in
//! recipient order.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use chatflow_core::collaborators::PhonebookLookup;
use chatflow_core::config::DeliveryConfig;
use chatflow_core::event_bus::{make_event, noop_sink, EventSink};
use chatflow_core::flow::{NodePayload, TemplateVariable};
use chatflow_core::payload::{personalize, PayloadBuilder};
use chatflow_core::store::{BroadcastStore, MessageFilter};
use chatflow_core::types::{
    Broadcast, BroadcastStatus, BroadcastSummary, Correlation, EventType, Pacing, Tenant,
};
use chatflow_core::{ChatflowError, ChatflowResult, Status};

use crate::pacing::TimeDistributionGenerator;
use crate::scheduler::DeliveryScheduler;

/// Input for [`BroadcastController::start`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastRequest {
    pub tenant: Tenant,
    pub name: String,
    pub pacing: Pacing,
    pub payload: NodePayload,
    /// Phonebook placeholders used in `payload`.
    #[serde(default)]
    pub variables: Vec<TemplateVariable>,
    pub recipients: Vec<String>,
}

/// Send-time source for one broadcast run.
struct SendClock {
    generator: TimeDistributionGenerator,
    fixed_delay: Option<u64>,
}

impl SendClock {
    fn next(&mut self) -> ChatflowResult<DateTime<Utc>> {
        match self.fixed_delay {
            Some(secs) => self.generator.next_after(secs),
            None => self.generator.next_paced(),
        }
    }
}

pub struct BroadcastController {
    scheduler: Arc<DeliveryScheduler>,
    broadcasts: Arc<dyn BroadcastStore>,
    builder: PayloadBuilder,
    phonebook: Arc<dyn PhonebookLookup>,
    offset: FixedOffset,
    instant_delay_secs: u64,
    event_sink: Arc<dyn EventSink>,
}

impl BroadcastController {
    pub fn new(
        scheduler: Arc<DeliveryScheduler>,
        broadcasts: Arc<dyn BroadcastStore>,
        builder: PayloadBuilder,
        phonebook: Arc<dyn PhonebookLookup>,
    ) -> Self {
        Self {
            scheduler,
            broadcasts,
            builder,
            phonebook,
            offset: Utc.fix(),
            instant_delay_secs: DeliveryConfig::default().instant_delay_secs,
            event_sink: noop_sink(),
        }
    }

    pub fn with_config(mut self, config: &DeliveryConfig) -> ChatflowResult<Self> {
        self.offset = config.utc_offset()?;
        self.instant_delay_secs = config.instant_delay_secs;
        Ok(self)
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn start(&self, request: BroadcastRequest) -> ChatflowResult<Broadcast> {
        self.start_at(request, Utc::now())
    }

    /// Schedules one message per recipient and stores the broadcast. Every
    /// payload and send time is worked out before anything is scheduled, so
    /// a bad reference leaves no partial broadcast behind. A paced window
    /// whose start already passed begins at `now`.
    pub fn start_at(&self, request: BroadcastRequest, now: DateTime<Utc>) -> ChatflowResult<Broadcast> {
        if request.recipients.is_empty() {
            return Err(ChatflowError::validation("broadcast has no recipients"));
        }
        let tenant = &request.tenant;
        let mut payloads = Vec::with_capacity(request.recipients.len());
        for recipient in &request.recipients {
            let personalized = personalize(
                self.phonebook.as_ref(),
                tenant,
                recipient,
                &request.payload,
                &request.variables,
            )?;
            payloads.push(self.builder.build(tenant, recipient, &personalized, None)?);
        }

        let mut clock = self.clock(&request.pacing, now)?;
        let send_times = (0..payloads.len())
            .map(|_| clock.next())
            .collect::<ChatflowResult<Vec<_>>>()?;

        let id = Uuid::new_v4();
        let correlation = Correlation::broadcast(id);
        let mut message_ids = Vec::with_capacity(payloads.len());
        for ((recipient, payload), send_at) in
            request.recipients.iter().zip(payloads).zip(send_times)
        {
            message_ids.push(self.scheduler.schedule(tenant, correlation, recipient, payload, send_at)?);
        }

        let broadcast = Broadcast {
            id,
            tenant: tenant.clone(),
            name: request.name,
            status: BroadcastStatus::Active,
            pacing: request.pacing,
            message_ids,
            created_at: now,
            updated_at: now,
        };
        self.broadcasts.insert(broadcast.clone())?;

        info!(
            broadcast_id = %id,
            tenant = %tenant,
            recipients = broadcast.message_ids.len(),
            "Broadcast started"
        );
        metrics::counter!("broadcasts.started").increment(1);
        self.emit(EventType::BroadcastStarted, &broadcast);
        Ok(broadcast)
    }

    pub fn get(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<Broadcast> {
        self.broadcasts
            .get(tenant, id)?
            .ok_or_else(|| ChatflowError::not_found("Broadcast", id))
    }

    /// Parks the broadcast's PENDING rows. Returns how many were paused.
    pub fn pause(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<usize> {
        let mut broadcast = self.get(tenant, id)?;
        let filter = MessageFilter::correlation(Correlation::broadcast(*id)).statuses(&[Status::Pending]);
        let paused = self
            .scheduler
            .messages()
            .transition_matching(tenant, &filter, Status::Paused)?;

        broadcast.status = BroadcastStatus::Paused;
        broadcast.updated_at = Utc::now();
        self.broadcasts.update(&broadcast)?;

        info!(broadcast_id = %id, paused = paused.len(), "Broadcast paused");
        self.emit(EventType::BroadcastPaused, &broadcast);
        Ok(paused.len())
    }

    pub fn resume(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<usize> {
        self.resume_at(tenant, id, Utc::now())
    }

    /// Reassigns send times to PAUSED rows in recipient order and flips
    /// them back to PENDING.
    pub fn resume_at(&self, tenant: &Tenant, id: &Uuid, now: DateTime<Utc>) -> ChatflowResult<usize> {
        let resumed = self.requeue(tenant, id, Status::Paused, now, EventType::BroadcastResumed)?;
        info!(broadcast_id = %id, resumed, "Broadcast resumed");
        Ok(resumed)
    }

    pub fn resend(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<usize> {
        self.resend_at(tenant, id, Utc::now())
    }

    /// Same as resume, for FAILED rows.
    pub fn resend_at(&self, tenant: &Tenant, id: &Uuid, now: DateTime<Utc>) -> ChatflowResult<usize> {
        let resent = self.requeue(tenant, id, Status::Failed, now, EventType::BroadcastResent)?;
        info!(broadcast_id = %id, resent, "Broadcast failures requeued");
        metrics::counter!("broadcasts.resent").increment(resent as u64);
        Ok(resent)
    }

    /// Removes the broadcast and every one of its rows, whatever their
    /// status. Returns how many rows were removed.
    pub fn delete(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<usize> {
        let broadcast = self.get(tenant, id)?;
        let filter = MessageFilter::correlation(Correlation::broadcast(*id));
        let removed = self.scheduler.messages().delete_matching(tenant, &filter)?;
        self.broadcasts.delete(tenant, id)?;

        info!(broadcast_id = %id, removed, "Broadcast deleted");
        self.emit(EventType::BroadcastDeleted, &broadcast);
        Ok(removed)
    }

    /// Remaining rows by status. Sent rows are gone from the scheduler and
    /// count as completed.
    pub fn summary(&self, tenant: &Tenant, id: &Uuid) -> ChatflowResult<BroadcastSummary> {
        let broadcast = self.get(tenant, id)?;
        let rows = self
            .scheduler
            .messages()
            .find(tenant, &MessageFilter::correlation(Correlation::broadcast(*id)))?;

        let mut summary = BroadcastSummary::default();
        for row in &rows {
            match row.status {
                Status::Pending => summary.pending += 1,
                Status::Processing => summary.processing += 1,
                Status::Paused => summary.paused += 1,
                Status::Failed => summary.failed += 1,
                _ => {}
            }
        }
        summary.completed = broadcast.message_ids.len().saturating_sub(rows.len());
        Ok(summary)
    }

    fn requeue(
        &self,
        tenant: &Tenant,
        id: &Uuid,
        from: Status,
        now: DateTime<Utc>,
        event: EventType,
    ) -> ChatflowResult<usize> {
        let mut broadcast = self.get(tenant, id)?;
        let messages = self.scheduler.messages();
        let mut clock = self.clock(&broadcast.pacing, now)?;

        let mut plan = Vec::new();
        for row in messages.get_many(tenant, &broadcast.message_ids)? {
            if row.status == from {
                plan.push((row.id, clock.next()?));
            }
        }
        let mut moved = 0;
        for (row_id, send_at) in plan {
            if messages.reschedule(tenant, &row_id, from, send_at)? {
                moved += 1;
            }
        }

        broadcast.status = BroadcastStatus::Active;
        broadcast.updated_at = now;
        self.broadcasts.update(&broadcast)?;
        self.emit(event, &broadcast);
        Ok(moved)
    }

    /// Paced clocks never start before `now`.
    fn clock(&self, pacing: &Pacing, now: DateTime<Utc>) -> ChatflowResult<SendClock> {
        match pacing {
            Pacing::Instant { delay_secs } => Ok(SendClock {
                generator: TimeDistributionGenerator::unpaced(now, self.offset),
                fixed_delay: Some(delay_secs.unwrap_or(self.instant_delay_secs)),
            }),
            Pacing::Paced(window) => Ok(SendClock {
                generator: TimeDistributionGenerator::resumed(window, self.offset, now)?,
                fixed_delay: None,
            }),
        }
    }

    fn emit(&self, event_type: EventType, broadcast: &Broadcast) {
        self.event_sink.emit(make_event(
            event_type,
            Some(&broadcast.tenant),
            broadcast.id.to_string(),
            None,
        ));
    }
}
