//! Nurturing — delayed follow-ups armed after a flow run completes.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveTime, Offset, Utc};
use tracing::info;
use uuid::Uuid;

use chatflow_core::collaborators::PhonebookLookup;
use chatflow_core::config::FlowConfig;
use chatflow_core::event_bus::{make_event, noop_sink, EventSink};
use chatflow_core::flow::FlowDefinition;
use chatflow_core::payload::{personalize, PayloadBuilder};
use chatflow_core::types::{Correlation, EventType, Tenant};
use chatflow_core::ChatflowResult;
use chatflow_delivery::{DeliveryScheduler, TimeDistributionGenerator};

pub struct NurturingScheduler {
    scheduler: Arc<DeliveryScheduler>,
    builder: PayloadBuilder,
    phonebook: Arc<dyn PhonebookLookup>,
    offset: FixedOffset,
    window: (NaiveTime, NaiveTime),
    event_sink: Arc<dyn EventSink>,
}

impl NurturingScheduler {
    pub fn new(
        scheduler: Arc<DeliveryScheduler>,
        builder: PayloadBuilder,
        phonebook: Arc<dyn PhonebookLookup>,
    ) -> ChatflowResult<Self> {
        Ok(Self {
            scheduler,
            builder,
            phonebook,
            offset: Utc.fix(),
            window: FlowConfig::default().nurturing_window()?,
            event_sink: noop_sink(),
        })
    }

    pub fn with_config(mut self, flows: &FlowConfig, offset: FixedOffset) -> ChatflowResult<Self> {
        self.window = flows.nurturing_window()?;
        self.offset = offset;
        Ok(self)
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Schedules the flow's nurturing steps for `recipient`. Step offsets
    /// add up, each one counted from the previous step's send time. A step
    /// landing outside the nurturing window moves to its next opening.
    pub fn arm(
        &self,
        flow: &FlowDefinition,
        recipient: &str,
        now: DateTime<Utc>,
    ) -> ChatflowResult<Vec<Uuid>> {
        if flow.nurturing.is_empty() {
            return Ok(Vec::new());
        }
        let tenant = &flow.tenant;
        let mut payloads = Vec::with_capacity(flow.nurturing.len());
        for step in &flow.nurturing {
            let personalized = personalize(
                self.phonebook.as_ref(),
                tenant,
                recipient,
                &step.payload,
                &step.variables,
            )?;
            payloads.push(self.builder.build(tenant, recipient, &personalized, None)?);
        }

        let (start, end) = self.window;
        let mut clock = TimeDistributionGenerator::starting_at(now, start, end, 1, self.offset)?;
        let correlation = Correlation::nurturing(flow.id);
        let send_times = flow
            .nurturing
            .iter()
            .map(|step| clock.next_after_in_window(step.after_secs))
            .collect::<ChatflowResult<Vec<_>>>()?;
        let mut ids = Vec::with_capacity(payloads.len());
        for (payload, send_at) in payloads.into_iter().zip(send_times) {
            ids.push(self.scheduler.schedule(tenant, correlation, recipient, payload, send_at)?);
        }

        info!(
            flow_id = %flow.id,
            recipient = %recipient,
            steps = ids.len(),
            "Nurturing armed"
        );
        self.event_sink.emit(make_event(
            EventType::NurturingArmed,
            Some(tenant),
            flow.id.to_string(),
            Some(recipient),
        ));
        Ok(ids)
    }

    /// Drops not-yet-sent nurturing for `flow_id`, for one recipient or for
    /// everyone.
    pub fn cancel(
        &self,
        tenant: &Tenant,
        flow_id: Uuid,
        recipient: Option<&str>,
    ) -> ChatflowResult<usize> {
        let removed = self
            .scheduler
            .cancel(tenant, Correlation::nurturing(flow_id), recipient)?;
        if removed > 0 {
            self.event_sink.emit(make_event(
                EventType::NurturingCancelled,
                Some(tenant),
                flow_id.to_string(),
                recipient,
            ));
        }
        Ok(removed)
    }
}
