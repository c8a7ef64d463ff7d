//! Delivery scheduler — persists scheduled messages and drains due rows to
//! the transport.
//!
//! The drain claims rows by flipping them PENDING→PROCESSING in the store;
//! only rows this call flipped are delivered, so overlapping drains never
//! send the same row twice. After a successful send the row is deleted and
//! the conversation store becomes the record of the message. Each claimed
//! row is settled on its own: a row whose bookkeeping fails is released and
//! the rest of the batch carries on.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chatflow_core::collaborators::{
    AccountLedger, ConversationStore, MessageTransport, ReceiptOutcome, SendOutcome,
};
use chatflow_core::config::DeliveryConfig;
use chatflow_core::event_bus::{make_event, noop_sink, EventSink};
use chatflow_core::store::{CursorStore, MessageFilter, ScheduledMessageStore};
use chatflow_core::types::{
    ConversationRecord, Correlation, DeliveryReceipt, EventType, FlowExecutionCursor,
    OutboundPayload, ScheduledMessage, Tenant,
};
use chatflow_core::{ChatflowError, ChatflowResult, Status};

use crate::receipts::ReceiptProcessor;

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Rows whose delivery broke off on a store or ledger error.
    pub errored: usize,
}

impl DrainReport {
    fn merge(&mut self, status: Status) {
        match status {
            Status::Sent => self.sent += 1,
            Status::Failed => self.failed += 1,
            _ => {}
        }
    }
}

/// Where a delivery attempt broke off.
enum Fault {
    /// Nothing reached the transport.
    BeforeSend(ChatflowError),
    /// The transport took the message; recording it failed.
    AfterSend {
        transport_message_id: String,
        error: ChatflowError,
    },
}

pub struct DeliveryScheduler {
    messages: Arc<dyn ScheduledMessageStore>,
    cursors: Arc<dyn CursorStore>,
    transport: Arc<dyn MessageTransport>,
    conversations: Arc<dyn ConversationStore>,
    ledger: Arc<dyn AccountLedger>,
    receipts: Arc<ReceiptProcessor>,
    price_per_message: u64,
    batch_size: usize,
    parked_receipt_ttl_secs: u64,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for DeliveryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryScheduler")
            .field("price_per_message", &self.price_per_message)
            .field("batch_size", &self.batch_size)
            .field("parked_receipts", &self.receipts.parked())
            .finish()
    }
}

impl DeliveryScheduler {
    pub fn new(
        messages: Arc<dyn ScheduledMessageStore>,
        cursors: Arc<dyn CursorStore>,
        transport: Arc<dyn MessageTransport>,
        conversations: Arc<dyn ConversationStore>,
        ledger: Arc<dyn AccountLedger>,
    ) -> Self {
        let defaults = DeliveryConfig::default();
        Self {
            messages,
            cursors,
            transport,
            receipts: Arc::new(ReceiptProcessor::new(conversations.clone())),
            conversations,
            ledger,
            price_per_message: defaults.price_per_message,
            batch_size: defaults.drain_batch_size,
            parked_receipt_ttl_secs: defaults.parked_receipt_ttl_secs,
            event_sink: noop_sink(),
        }
    }

    pub fn with_config(mut self, config: &DeliveryConfig) -> Self {
        self.price_per_message = config.price_per_message;
        self.batch_size = config.drain_batch_size.max(1);
        self.parked_receipt_ttl_secs = config.parked_receipt_ttl_secs;
        self
    }

    /// Attach an event sink. The receipt path shares it.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.receipts = Arc::new(
            ReceiptProcessor::new(self.conversations.clone()).with_event_sink(sink.clone()),
        );
        self.event_sink = sink;
        self
    }

    pub fn messages(&self) -> &Arc<dyn ScheduledMessageStore> {
        &self.messages
    }

    /// Receipt processor shared with the webhook handler.
    pub fn receipts(&self) -> Arc<ReceiptProcessor> {
        self.receipts.clone()
    }

    // ─── Scheduling ─────────────────────────────────────────────────────

    /// Persists a PENDING message and returns its id.
    pub fn schedule(
        &self,
        tenant: &Tenant,
        correlation: Correlation,
        recipient: &str,
        payload: OutboundPayload,
        send_at: DateTime<Utc>,
    ) -> ChatflowResult<Uuid> {
        self.schedule_row(ScheduledMessage::new(
            tenant.clone(),
            correlation,
            recipient,
            payload,
            send_at,
        ))
    }

    /// Persists a prepared row, e.g. one tagged with its flow node.
    pub fn schedule_row(&self, msg: ScheduledMessage) -> ChatflowResult<Uuid> {
        if msg.status != Status::Pending {
            return Err(ChatflowError::InvalidTransition {
                from: msg.status,
                to: Status::Pending,
            });
        }
        let id = msg.id;
        debug!(
            message_id = %id,
            kind = msg.correlation.kind.as_str(),
            scheduler_id = %msg.correlation.scheduler_id,
            recipient = %msg.recipient,
            send_at = %msg.send_at,
            "Scheduling message"
        );
        let event = make_event(
            EventType::MessageScheduled,
            Some(&msg.tenant),
            id.to_string(),
            Some(&msg.recipient),
        );
        self.messages.insert(msg)?;
        self.event_sink.emit(event);
        Ok(id)
    }

    /// Deletes PENDING and PAUSED rows for `correlation`, optionally only
    /// those addressed to `recipient`. Rows already claimed by a drain are
    /// left alone.
    pub fn cancel(
        &self,
        tenant: &Tenant,
        correlation: Correlation,
        recipient: Option<&str>,
    ) -> ChatflowResult<usize> {
        let mut filter =
            MessageFilter::correlation(correlation).statuses(&[Status::Pending, Status::Paused]);
        if let Some(r) = recipient {
            filter = filter.recipient(r);
        }
        let removed = self.messages.delete_matching(tenant, &filter)?;
        if removed > 0 {
            info!(
                tenant = %tenant,
                kind = correlation.kind.as_str(),
                scheduler_id = %correlation.scheduler_id,
                removed,
                "Cancelled scheduled messages"
            );
            self.event_sink.emit(make_event(
                EventType::MessagesCancelled,
                Some(tenant),
                correlation.scheduler_id.to_string(),
                recipient,
            ));
        }
        Ok(removed)
    }

    // ─── Drain ──────────────────────────────────────────────────────────

    pub fn drain(&self) -> ChatflowResult<DrainReport> {
        self.drain_at(Utc::now())
    }

    /// Delivers every PENDING row due at `now`, up to the batch size, then
    /// drops parked receipts older than the receipt TTL.
    pub fn drain_at(&self, now: DateTime<Utc>) -> ChatflowResult<DrainReport> {
        if let Some(cutoff) = i64::try_from(self.parked_receipt_ttl_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| now.checked_sub_signed(ttl))
        {
            self.receipts.evict_parked_before(cutoff);
        }

        let due = self.messages.due(now, self.batch_size)?;
        if due.is_empty() {
            return Ok(DrainReport::default());
        }
        let started = std::time::Instant::now();
        let ids: Vec<Uuid> = due.iter().map(|m| m.id).collect();
        let claimed = self.messages.claim(&ids)?;
        metrics::counter!("delivery.claimed").increment(claimed.len() as u64);

        let mut report = DrainReport {
            claimed: claimed.len(),
            ..DrainReport::default()
        };
        for row in claimed {
            match self.deliver(row.clone(), now) {
                Ok(status) => report.merge(status),
                Err(fault) => {
                    self.recover(row, fault, now);
                    report.errored += 1;
                }
            }
        }
        metrics::histogram!("delivery.drain_latency_us").record(started.elapsed().as_micros() as f64);
        if report.claimed > 0 {
            info!(
                due = due.len(),
                claimed = report.claimed,
                sent = report.sent,
                failed = report.failed,
                errored = report.errored,
                "Drain pass complete"
            );
        }
        Ok(report)
    }

    /// Credit is reserved before the send and handed back if the transport
    /// rejects the message.
    fn deliver(&self, row: ScheduledMessage, now: DateTime<Utc>) -> Result<Status, Fault> {
        let conversation_id = self
            .conversations
            .resolve_conversation(&row.tenant, &row.recipient)
            .map_err(Fault::BeforeSend)?;

        let account_id = row.tenant.account_id.clone();
        if !self
            .ledger
            .try_deduct(&account_id, self.price_per_message)
            .map_err(Fault::BeforeSend)?
        {
            let reason = ChatflowError::InsufficientBalance.to_string();
            return self
                .finish_failed(row, &conversation_id, reason, now)
                .map_err(Fault::BeforeSend);
        }

        match self.transport.send(&row.tenant, &row.payload) {
            SendOutcome::Accepted {
                transport_message_id,
            } => self
                .finish_sent(row, &conversation_id, transport_message_id.clone(), now)
                .map_err(|error| Fault::AfterSend {
                    transport_message_id,
                    error,
                }),
            SendOutcome::Rejected { reason } => {
                self.ledger
                    .refund_credit(&account_id, self.price_per_message)
                    .map_err(Fault::BeforeSend)?;
                self.finish_failed(row, &conversation_id, reason, now)
                    .map_err(Fault::BeforeSend)
            }
        }
    }

    /// Releases a claimed row whose delivery broke off. A row that never
    /// went out is marked FAILED; one the transport already took is deleted
    /// so no later pass sends it again.
    fn recover(&self, mut row: ScheduledMessage, fault: Fault, now: DateTime<Utc>) {
        metrics::counter!("delivery.errored", "kind" => row.correlation.kind.as_str()).increment(1);
        match fault {
            Fault::BeforeSend(e) => {
                error!(message_id = %row.id, recipient = %row.recipient, error = %e, "Delivery aborted");
                let released = row
                    .mark_failed(format!("Delivery aborted: {}", e), now)
                    .and_then(|_| self.messages.update(&row));
                if let Err(e) = released {
                    error!(message_id = %row.id, error = %e, "Could not release claimed row");
                    return;
                }
                self.event_sink.emit(make_event(
                    EventType::MessageFailed,
                    Some(&row.tenant),
                    row.id.to_string(),
                    Some(&row.recipient),
                ));
            }
            Fault::AfterSend {
                transport_message_id,
                error: e,
            } => {
                error!(
                    message_id = %row.id,
                    transport_message_id = %transport_message_id,
                    recipient = %row.recipient,
                    error = %e,
                    "Message sent but not recorded"
                );
                if let Err(e) = self.messages.delete(&row.id) {
                    error!(message_id = %row.id, error = %e, "Could not release claimed row");
                }
            }
        }
    }

    fn finish_sent(
        &self,
        mut row: ScheduledMessage,
        conversation_id: &str,
        transport_message_id: String,
        now: DateTime<Utc>,
    ) -> ChatflowResult<Status> {
        row.mark_sent(transport_message_id.clone(), now)?;
        if let Some(node) = &row.flow_node {
            self.cursors.put(FlowExecutionCursor {
                transport_message_id: transport_message_id.clone(),
                tenant: row.tenant.clone(),
                flow_id: node.flow_id,
                recipient: row.recipient.clone(),
                last_dispatched_node_id: node.node_id.clone(),
                created_at: now,
            })?;
        }
        self.conversations
            .append_message(conversation_id, ConversationRecord::from_scheduled(&row))?;
        self.receipts.settle(&transport_message_id)?;
        self.messages.delete(&row.id)?;

        debug!(
            message_id = %row.id,
            transport_message_id = %transport_message_id,
            recipient = %row.recipient,
            "Message sent"
        );
        metrics::counter!("delivery.sent", "kind" => row.correlation.kind.as_str()).increment(1);
        self.event_sink.emit(make_event(
            EventType::MessageSent,
            Some(&row.tenant),
            row.id.to_string(),
            Some(&row.recipient),
        ));
        Ok(Status::Sent)
    }

    fn finish_failed(
        &self,
        mut row: ScheduledMessage,
        conversation_id: &str,
        reason: String,
        now: DateTime<Utc>,
    ) -> ChatflowResult<Status> {
        row.mark_failed(reason.clone(), now)?;
        if !self.messages.update(&row)? {
            warn!(message_id = %row.id, "Row removed while its delivery was in flight");
        }
        self.conversations
            .append_message(conversation_id, ConversationRecord::from_scheduled(&row))?;

        warn!(
            message_id = %row.id,
            recipient = %row.recipient,
            reason = %reason,
            "Message delivery failed"
        );
        metrics::counter!("delivery.failed", "kind" => row.correlation.kind.as_str()).increment(1);
        self.event_sink.emit(make_event(
            EventType::MessageFailed,
            Some(&row.tenant),
            row.id.to_string(),
            Some(&row.recipient),
        ));
        Ok(Status::Failed)
    }

    // ─── Receipts ───────────────────────────────────────────────────────

    pub fn apply_receipt(&self, receipt: DeliveryReceipt) -> ChatflowResult<ReceiptOutcome> {
        self.receipts.process(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatflow_core::collaborators::{InMemoryConversations, InMemoryLedger, RecordingTransport};
    use chatflow_core::event_bus::capture_sink;
    use chatflow_core::memory::MemoryBackend;
    use chatflow_core::types::StoredMessage;
    use serde_json::json;

    struct Harness {
        backend: MemoryBackend,
        transport: Arc<RecordingTransport>,
        conversations: Arc<InMemoryConversations>,
        ledger: Arc<InMemoryLedger>,
        scheduler: DeliveryScheduler,
    }

    fn tenant() -> Tenant {
        Tenant::new("acct", "dev")
    }

    fn harness(balance: u64) -> Harness {
        let backend = MemoryBackend::new();
        let transport = Arc::new(RecordingTransport::new());
        let conversations = Arc::new(InMemoryConversations::new());
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_balance("acct", balance);
        let scheduler = DeliveryScheduler::new(
            backend.messages.clone(),
            backend.cursors.clone(),
            transport.clone(),
            conversations.clone(),
            ledger.clone(),
        );
        Harness {
            backend,
            transport,
            conversations,
            ledger,
            scheduler,
        }
    }

    fn text(to: &str) -> OutboundPayload {
        OutboundPayload {
            message_type: "text".into(),
            body: json!({"messaging_product": "whatsapp", "to": to, "type": "text"}),
        }
    }

    #[test]
    fn test_drain_sends_due_rows_only() {
        let h = harness(10);
        let now = Utc::now();
        let corr = Correlation::broadcast(Uuid::new_v4());
        h.scheduler.schedule(&tenant(), corr, "111", text("111"), now).unwrap();
        let later = h
            .scheduler
            .schedule(&tenant(), corr, "222", text("222"), now + Duration::minutes(5))
            .unwrap();

        let report = h.scheduler.drain_at(now).unwrap();
        assert_eq!(report, DrainReport { claimed: 1, sent: 1, ..Default::default() });
        assert_eq!(h.transport.sent_count(), 1);
        assert_eq!(h.ledger.balance("acct"), 9);
        assert_eq!(h.backend.messages.len(), 1);
        assert!(h.backend.messages.get(&tenant(), &later).unwrap().is_some());
        assert_eq!(h.conversations.len(), 1);
    }

    #[test]
    fn test_transport_failure_keeps_row() {
        let h = harness(10);
        let sink = capture_sink();
        let scheduler = DeliveryScheduler::new(
            h.backend.messages.clone(),
            h.backend.cursors.clone(),
            h.transport.clone(),
            h.conversations.clone(),
            h.ledger.clone(),
        )
        .with_event_sink(sink.clone());
        h.transport.reject("333", "recipient not on WhatsApp");

        let now = Utc::now();
        let id = scheduler
            .schedule(&tenant(), Correlation::broadcast(Uuid::new_v4()), "333", text("333"), now)
            .unwrap();
        let report = scheduler.drain_at(now).unwrap();
        assert_eq!(report.failed, 1);

        let row = h.backend.messages.get(&tenant(), &id).unwrap().unwrap();
        assert_eq!(row.status, Status::Failed);
        assert_eq!(row.failed_reason.as_deref(), Some("recipient not on WhatsApp"));
        assert_eq!(h.ledger.balance("acct"), 10);
        assert_eq!(h.conversations.len(), 1);
        assert_eq!(sink.count_type(EventType::MessageFailed), 1);

        // Never retried on its own.
        assert_eq!(scheduler.drain_at(now + Duration::hours(1)).unwrap(), DrainReport::default());
    }

    #[test]
    fn test_insufficient_balance_skips_transport() {
        let h = harness(0);
        let now = Utc::now();
        let id = h
            .scheduler
            .schedule(&tenant(), Correlation::broadcast(Uuid::new_v4()), "111", text("111"), now)
            .unwrap();
        h.scheduler.drain_at(now).unwrap();

        assert_eq!(h.transport.sent_count(), 0);
        let row = h.backend.messages.get(&tenant(), &id).unwrap().unwrap();
        assert_eq!(row.status, Status::Failed);
        assert_eq!(row.failed_reason.as_deref(), Some("Insufficient balance"));
    }

    #[test]
    fn test_flow_node_rows_leave_cursor() {
        let h = harness(5);
        let now = Utc::now();
        let flow_id = Uuid::new_v4();
        let row = ScheduledMessage::new(tenant(), Correlation::flow(flow_id), "111", text("111"), now)
            .with_flow_node(flow_id, "menu");
        h.scheduler.schedule_row(row).unwrap();
        h.scheduler.drain_at(now).unwrap();

        let sent = h
            .conversations
            .messages_for(&h.conversations.resolve_conversation(&tenant(), "111").unwrap());
        let tid = sent[0].record.transport_message_id.clone().unwrap();
        let cursor = h.backend.cursors.get(&tenant(), &tid).unwrap().unwrap();
        assert_eq!(cursor.flow_id, flow_id);
        assert_eq!(cursor.last_dispatched_node_id, "menu");
    }

    #[test]
    fn test_cancel_spares_claimed_rows() {
        let h = harness(5);
        let now = Utc::now();
        let corr = Correlation::nurturing(Uuid::new_v4());
        let a = h.scheduler.schedule(&tenant(), corr, "111", text("111"), now).unwrap();
        h.scheduler.schedule(&tenant(), corr, "111", text("111"), now).unwrap();
        h.scheduler.schedule(&tenant(), corr, "222", text("222"), now).unwrap();
        h.backend.messages.claim(&[a]).unwrap();

        assert_eq!(h.scheduler.cancel(&tenant(), corr, Some("111")).unwrap(), 1);
        assert_eq!(h.backend.messages.len(), 2);
        assert_eq!(h.scheduler.cancel(&tenant(), corr, None).unwrap(), 1);
        let left = h.backend.messages.get(&tenant(), &a).unwrap().unwrap();
        assert_eq!(left.status, Status::Processing);
    }

    #[test]
    fn test_concurrent_drains_send_each_row_once() {
        let h = harness(10_000);
        let now = Utc::now();
        let corr = Correlation::broadcast(Uuid::new_v4());
        for i in 0..300 {
            let to = format!("55{:04}", i);
            h.scheduler.schedule(&tenant(), corr, &to, text(&to), now).unwrap();
        }

        let reports: Vec<DrainReport> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| h.scheduler.drain_at(now).unwrap()))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        let claimed: usize = reports.iter().map(|r| r.claimed).sum();
        let sent: usize = reports.iter().map(|r| r.sent).sum();
        assert_eq!(claimed, 300);
        assert_eq!(sent, 300);
        assert_eq!(h.transport.sent_count(), 300);
        assert_eq!(h.conversations.len(), 300);
        assert!(h.backend.messages.is_empty());
    }

    #[test]
    fn test_receipt_before_record_is_not_lost() {
        let h = harness(5);
        let now = Utc::now();
        h.scheduler
            .schedule(&tenant(), Correlation::broadcast(Uuid::new_v4()), "111", text("111"), now)
            .unwrap();

        // RecordingTransport numbers ids per device starting at 1.
        let early = DeliveryReceipt {
            transport_message_id: "wamid.dev.1".into(),
            status: Status::Delivered,
            timestamp: now,
            reason: None,
        };
        assert_eq!(h.scheduler.apply_receipt(early).unwrap(), ReceiptOutcome::Missing);
        h.scheduler.drain_at(now).unwrap();

        let stored = h
            .conversations
            .find_by_transport_message_id("wamid.dev.1")
            .unwrap()
            .unwrap();
        assert_eq!(stored.record.status, Status::Delivered);
    }

    /// Conversation store that breaks for chosen recipients.
    struct BrokenConversations {
        inner: InMemoryConversations,
        unresolvable: &'static str,
        unwritable: &'static str,
    }

    impl ConversationStore for BrokenConversations {
        fn resolve_conversation(&self, tenant: &Tenant, recipient: &str) -> ChatflowResult<String> {
            if recipient == self.unresolvable {
                return Err(ChatflowError::Persistence("conversation lookup timed out".into()));
            }
            self.inner.resolve_conversation(tenant, recipient)
        }

        fn append_message(
            &self,
            conversation_id: &str,
            record: ConversationRecord,
        ) -> ChatflowResult<StoredMessage> {
            if record.recipient == self.unwritable {
                return Err(ChatflowError::Persistence("conversation write rejected".into()));
            }
            self.inner.append_message(conversation_id, record)
        }

        fn find_by_transport_message_id(
            &self,
            transport_message_id: &str,
        ) -> ChatflowResult<Option<StoredMessage>> {
            self.inner.find_by_transport_message_id(transport_message_id)
        }

        fn apply_receipt(&self, receipt: &DeliveryReceipt) -> ChatflowResult<ReceiptOutcome> {
            self.inner.apply_receipt(receipt)
        }
    }

    #[test]
    fn test_broken_row_does_not_stall_batch() {
        let backend = MemoryBackend::new();
        let transport = Arc::new(RecordingTransport::new());
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.set_balance("acct", 10);
        let conversations = Arc::new(BrokenConversations {
            inner: InMemoryConversations::new(),
            unresolvable: "worse",
            unwritable: "bad",
        });
        let scheduler = DeliveryScheduler::new(
            backend.messages.clone(),
            backend.cursors.clone(),
            transport.clone(),
            conversations.clone(),
            ledger.clone(),
        );
        let now = Utc::now();
        let corr = Correlation::broadcast(Uuid::new_v4());
        let bad = scheduler
            .schedule(&tenant(), corr, "bad", text("bad"), now - Duration::seconds(3))
            .unwrap();
        let worse = scheduler
            .schedule(&tenant(), corr, "worse", text("worse"), now - Duration::seconds(2))
            .unwrap();
        scheduler.schedule(&tenant(), corr, "ok1", text("ok1"), now - Duration::seconds(1)).unwrap();
        scheduler.schedule(&tenant(), corr, "ok2", text("ok2"), now).unwrap();

        let report = scheduler.drain_at(now).unwrap();
        assert_eq!(report, DrainReport { claimed: 4, sent: 2, failed: 0, errored: 2 });
        assert_eq!(transport.sent_count(), 3);
        assert_eq!(conversations.inner.len(), 2);
        assert_eq!(ledger.balance("acct"), 7);

        // Already handed to the transport, so gone rather than resent.
        assert!(backend.messages.get(&tenant(), &bad).unwrap().is_none());
        let stuck = backend.messages.get(&tenant(), &worse).unwrap().unwrap();
        assert_eq!(stuck.status, Status::Failed);
        assert!(stuck.failed_reason.unwrap().starts_with("Delivery aborted"));

        assert_eq!(scheduler.drain_at(now + Duration::minutes(1)).unwrap(), DrainReport::default());
        assert_eq!(backend.messages.len(), 1);
    }

    #[test]
    fn test_concurrent_drains_never_overspend() {
        let h = harness(5);
        let now = Utc::now();
        let corr = Correlation::broadcast(Uuid::new_v4());
        for i in 0..20 {
            let to = format!("55{:04}", i);
            h.scheduler.schedule(&tenant(), corr, &to, text(&to), now).unwrap();
        }

        let reports: Vec<DrainReport> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| s.spawn(|| h.scheduler.drain_at(now).unwrap()))
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });

        let sent: usize = reports.iter().map(|r| r.sent).sum();
        let failed: usize = reports.iter().map(|r| r.failed).sum();
        assert_eq!(sent, 5);
        assert_eq!(failed, 15);
        assert_eq!(h.transport.sent_count(), 5);
        assert_eq!(h.ledger.balance("acct"), 0);
    }

    #[test]
    fn test_drain_expires_parked_receipts() {
        let h = harness(5);
        let now = Utc::now();
        let ghost = DeliveryReceipt {
            transport_message_id: "wamid.ghost".into(),
            status: Status::Delivered,
            timestamp: now,
            reason: None,
        };
        h.scheduler.receipts().process_at(ghost, now).unwrap();
        assert_eq!(h.scheduler.receipts().parked(), 1);

        h.scheduler.drain_at(now + Duration::minutes(5)).unwrap();
        assert_eq!(h.scheduler.receipts().parked(), 1);
        h.scheduler.drain_at(now + Duration::minutes(11)).unwrap();
        assert_eq!(h.scheduler.receipts().parked(), 0);
    }
}
