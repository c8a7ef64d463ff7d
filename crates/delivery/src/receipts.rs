//! Delivery-receipt path. Runs concurrently with the drain and keys every
//! update by transport message id.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use chatflow_core::collaborators::{ConversationStore, ReceiptOutcome};
use chatflow_core::event_bus::{make_event, noop_sink, EventSink};
use chatflow_core::types::{DeliveryReceipt, EventType};
use chatflow_core::ChatflowResult;

/// Receipts waiting on one transport message id.
struct Parked {
    receipts: Vec<DeliveryReceipt>,
    since: DateTime<Utc>,
}

/// Applies receipts to the conversation store. A receipt for a send the
/// drain has not mirrored yet is parked and applied by [`Self::settle`]
/// once the record exists. Parked receipts that never find a record are
/// dropped by [`Self::evict_parked_before`].
pub struct ReceiptProcessor {
    conversations: Arc<dyn ConversationStore>,
    early: DashMap<String, Parked>,
    event_sink: Arc<dyn EventSink>,
}

impl ReceiptProcessor {
    pub fn new(conversations: Arc<dyn ConversationStore>) -> Self {
        Self {
            conversations,
            early: DashMap::new(),
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// Webhook entry point.
    pub fn process(&self, receipt: DeliveryReceipt) -> ChatflowResult<ReceiptOutcome> {
        self.process_at(receipt, Utc::now())
    }

    /// [`Self::process`] with an explicit clock for the parking timestamp.
    pub fn process_at(
        &self,
        receipt: DeliveryReceipt,
        now: DateTime<Utc>,
    ) -> ChatflowResult<ReceiptOutcome> {
        let outcome = self.conversations.apply_receipt(&receipt)?;
        if outcome != ReceiptOutcome::Missing {
            self.record(&receipt, outcome);
            return Ok(outcome);
        }

        // Re-check under the buffer's entry lock; `settle` drains the same
        // entry after the record is written, so one of the two sees it.
        let mut parked = self
            .early
            .entry(receipt.transport_message_id.clone())
            .or_insert_with(|| Parked {
                receipts: Vec::new(),
                since: now,
            });
        let outcome = self.conversations.apply_receipt(&receipt)?;
        if outcome == ReceiptOutcome::Missing {
            debug!(
                transport_message_id = %receipt.transport_message_id,
                status = ?receipt.status,
                "Parking receipt for unrecorded message"
            );
            parked.receipts.push(receipt);
        } else {
            drop(parked);
            self.early
                .remove_if(&receipt.transport_message_id, |_, p| p.receipts.is_empty());
            self.record(&receipt, outcome);
        }
        Ok(outcome)
    }

    /// Applies any receipts parked for `transport_message_id`. Called by the
    /// drain right after the conversation record is appended.
    pub fn settle(&self, transport_message_id: &str) -> ChatflowResult<usize> {
        let Some((_, parked)) = self.early.remove(transport_message_id) else {
            return Ok(0);
        };
        let mut applied = 0;
        for receipt in parked.receipts {
            let outcome = self.conversations.apply_receipt(&receipt)?;
            if matches!(outcome, ReceiptOutcome::Applied(_)) {
                applied += 1;
            }
            self.record(&receipt, outcome);
        }
        Ok(applied)
    }

    /// Receipts still waiting for their record.
    pub fn parked(&self) -> usize {
        self.early.iter().map(|e| e.value().receipts.len()).sum()
    }

    /// Drops receipts parked before `cutoff` and returns how many went.
    pub fn evict_parked_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        self.early.retain(|_, parked| {
            let keep = parked.since >= cutoff;
            if !keep {
                evicted += parked.receipts.len();
            }
            keep
        });
        if evicted > 0 {
            warn!(evicted, cutoff = %cutoff, "Dropped receipts that never matched a message");
            metrics::counter!("receipts.evicted").increment(evicted as u64);
        }
        evicted
    }

    fn record(&self, receipt: &DeliveryReceipt, outcome: ReceiptOutcome) {
        match outcome {
            ReceiptOutcome::Applied(status) => {
                info!(
                    transport_message_id = %receipt.transport_message_id,
                    status = ?status,
                    "Receipt applied"
                );
                metrics::counter!("receipts.applied", "status" => format!("{:?}", status))
                    .increment(1);
                let mut event = make_event(
                    EventType::ReceiptApplied,
                    None,
                    receipt.transport_message_id.clone(),
                    None,
                );
                event.timestamp = receipt.timestamp;
                self.event_sink.emit(event);
            }
            ReceiptOutcome::Stale(current) => {
                debug!(
                    transport_message_id = %receipt.transport_message_id,
                    incoming = ?receipt.status,
                    current = ?current,
                    "Ignoring stale receipt"
                );
                metrics::counter!("receipts.stale").increment(1);
            }
            ReceiptOutcome::Missing => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::collaborators::InMemoryConversations;
    use chatflow_core::event_bus::capture_sink;
    use chatflow_core::status::Status;
    use chatflow_core::types::{ConversationRecord, Correlation, OutboundPayload, ScheduledMessage, Tenant};
    use chrono::Duration;
    use serde_json::json;
    use uuid::Uuid;

    fn sent_record(tid: &str) -> ConversationRecord {
        let mut msg = ScheduledMessage::new(
            Tenant::new("acct", "dev"),
            Correlation::broadcast(Uuid::new_v4()),
            "5511999",
            OutboundPayload {
                message_type: "text".into(),
                body: json!({}),
            },
            Utc::now(),
        );
        msg.transition(Status::Processing).unwrap();
        msg.mark_sent(tid.to_string(), Utc::now()).unwrap();
        ConversationRecord::from_scheduled(&msg)
    }

    fn receipt(tid: &str, status: Status) -> DeliveryReceipt {
        DeliveryReceipt {
            transport_message_id: tid.into(),
            status,
            timestamp: Utc::now(),
            reason: None,
        }
    }

    #[test]
    fn test_applies_known_receipt() {
        let store = Arc::new(InMemoryConversations::new());
        let sink = capture_sink();
        let processor = ReceiptProcessor::new(store.clone()).with_event_sink(sink.clone());
        store.append_message("conv", sent_record("wamid.1")).unwrap();

        let outcome = processor.process(receipt("wamid.1", Status::Delivered)).unwrap();
        assert_eq!(outcome, ReceiptOutcome::Applied(Status::Delivered));
        let stale = processor.process(receipt("wamid.1", Status::Delivered)).unwrap();
        assert_eq!(stale, ReceiptOutcome::Stale(Status::Delivered));
        assert_eq!(sink.count_type(EventType::ReceiptApplied), 1);
    }

    #[test]
    fn test_early_receipt_applied_on_settle() {
        let store = Arc::new(InMemoryConversations::new());
        let processor = ReceiptProcessor::new(store.clone());

        let outcome = processor.process(receipt("wamid.2", Status::Read)).unwrap();
        assert_eq!(outcome, ReceiptOutcome::Missing);
        assert_eq!(processor.parked(), 1);

        store.append_message("conv", sent_record("wamid.2")).unwrap();
        assert_eq!(processor.settle("wamid.2").unwrap(), 1);
        assert_eq!(processor.parked(), 0);

        let stored = store.find_by_transport_message_id("wamid.2").unwrap().unwrap();
        assert_eq!(stored.record.status, Status::Read);
        assert_eq!(processor.settle("wamid.2").unwrap(), 0);
    }

    #[test]
    fn test_concurrent_receipts_and_settle_lose_nothing() {
        for round in 0..50 {
            let store = Arc::new(InMemoryConversations::new());
            let processor = ReceiptProcessor::new(store.clone());
            let tid = format!("wamid.race.{}", round);

            std::thread::scope(|s| {
                s.spawn(|| {
                    processor.process(receipt(&tid, Status::Delivered)).unwrap();
                });
                s.spawn(|| {
                    store.append_message("conv", sent_record(&tid)).unwrap();
                    processor.settle(&tid).unwrap();
                });
            });

            let stored = store.find_by_transport_message_id(&tid).unwrap().unwrap();
            assert_eq!(stored.record.status, Status::Delivered, "round {}", round);
            assert_eq!(processor.parked(), 0);
        }
    }

    #[test]
    fn test_unmatched_receipts_expire() {
        let store = Arc::new(InMemoryConversations::new());
        let processor = ReceiptProcessor::new(store.clone());
        let t0 = Utc::now();
        for i in 0..1_000 {
            processor
                .process_at(receipt(&format!("wamid.ghost.{}", i), Status::Delivered), t0)
                .unwrap();
        }
        processor
            .process_at(receipt("wamid.late", Status::Read), t0 + Duration::minutes(9))
            .unwrap();
        assert_eq!(processor.parked(), 1_001);

        assert_eq!(processor.evict_parked_before(t0), 0);
        assert_eq!(processor.evict_parked_before(t0 + Duration::minutes(5)), 1_000);
        assert_eq!(processor.parked(), 1);

        store.append_message("conv", sent_record("wamid.late")).unwrap();
        assert_eq!(processor.settle("wamid.late").unwrap(), 1);
        assert_eq!(processor.parked(), 0);
    }
}
