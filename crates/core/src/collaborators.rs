//! External collaborators the engine talks to, and in-memory
//! implementations used by the binary's dry-run mode and by tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::ChatflowResult;
use crate::status::Status;
use crate::types::{ConversationRecord, DeliveryReceipt, StoredMessage, Tenant};

/// Result of handing one payload to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted { transport_message_id: String },
    Rejected { reason: String },
}

/// Outbound messaging transport (WhatsApp Cloud style).
pub trait MessageTransport: Send + Sync {
    fn send(&self, tenant: &Tenant, payload: &serde_json::Value) -> SendOutcome;
}

/// What happened when a receipt was offered to the conversation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// No record carries this transport message id yet.
    Missing,
    /// Record already at or past the reported status.
    Stale(Status),
    Applied(Status),
}

/// Durable conversation history, the record of every send attempt.
pub trait ConversationStore: Send + Sync {
    /// Returns the conversation id for `recipient`, creating it if needed.
    fn resolve_conversation(&self, tenant: &Tenant, recipient: &str) -> ChatflowResult<String>;

    fn append_message(
        &self,
        conversation_id: &str,
        record: ConversationRecord,
    ) -> ChatflowResult<StoredMessage>;

    fn find_by_transport_message_id(
        &self,
        transport_message_id: &str,
    ) -> ChatflowResult<Option<StoredMessage>>;

    /// Applies `receipt` atomically if it moves the record forward.
    fn apply_receipt(&self, receipt: &DeliveryReceipt) -> ChatflowResult<ReceiptOutcome>;
}

pub trait AccountLedger: Send + Sync {
    /// Takes `amount` only if the balance covers it, as one step. Returns
    /// false and leaves the balance alone otherwise.
    fn try_deduct(&self, account_id: &str, amount: u64) -> ChatflowResult<bool>;
    /// Gives back credit taken by a send that did not go out.
    fn refund_credit(&self, account_id: &str, amount: u64) -> ChatflowResult<()>;
}

/// Contact fields keyed by phone number, used for `{{field}}` substitution.
pub trait PhonebookLookup: Send + Sync {
    fn find_by_phone(
        &self,
        tenant: &Tenant,
        phone: &str,
    ) -> ChatflowResult<Option<HashMap<String, String>>>;
}

/// Tenant media library and approved message templates.
pub trait AssetCatalog: Send + Sync {
    fn media_link(&self, tenant: &Tenant, asset_id: &str) -> ChatflowResult<Option<String>>;
    fn has_template(&self, tenant: &Tenant, name: &str, language: &str) -> ChatflowResult<bool>;
}

// ─── In-memory implementations ──────────────────────────────────────────────

/// Transport that accepts everything and remembers what it was given.
/// Recipients registered with [`RecordingTransport::reject`] are refused.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<(Tenant, serde_json::Value)>>,
    rejected: DashMap<String, String>,
    counter: AtomicU64,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject(&self, recipient: impl Into<String>, reason: impl Into<String>) {
        self.rejected.insert(recipient.into(), reason.into());
    }

    pub fn accept_all(&self) {
        self.rejected.clear();
    }

    pub fn sent(&self) -> Vec<serde_json::Value> {
        self.sent.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl MessageTransport for RecordingTransport {
    fn send(&self, tenant: &Tenant, payload: &serde_json::Value) -> SendOutcome {
        let to = payload.get("to").and_then(|v| v.as_str()).unwrap_or_default();
        if let Some(reason) = self.rejected.get(to) {
            return SendOutcome::Rejected {
                reason: reason.value().clone(),
            };
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let transport_message_id = format!("wamid.{}.{}", tenant.device_id, n);
        debug!(to = to, id = %transport_message_id, "Recorded outbound message");
        self.sent.lock().push((tenant.clone(), payload.clone()));
        SendOutcome::Accepted {
            transport_message_id,
        }
    }
}

#[derive(Default)]
pub struct InMemoryConversations {
    conversations: DashMap<(Tenant, String), String>,
    messages: DashMap<Uuid, StoredMessage>,
    by_transport_id: DashMap<String, Uuid>,
}

impl InMemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages_for(&self, conversation_id: &str) -> Vec<StoredMessage> {
        let mut out: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.value().clone())
            .collect();
        out.sort_by_key(|m| m.stored_at);
        out
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

impl ConversationStore for InMemoryConversations {
    fn resolve_conversation(&self, tenant: &Tenant, recipient: &str) -> ChatflowResult<String> {
        let id = self
            .conversations
            .entry((tenant.clone(), recipient.to_string()))
            .or_insert_with(|| Uuid::new_v4().to_string())
            .value()
            .clone();
        Ok(id)
    }

    fn append_message(
        &self,
        conversation_id: &str,
        record: ConversationRecord,
    ) -> ChatflowResult<StoredMessage> {
        let stored = StoredMessage {
            id: Uuid::new_v4(),
            conversation_id: conversation_id.to_string(),
            record,
            stored_at: Utc::now(),
        };
        self.messages.insert(stored.id, stored.clone());
        if let Some(tid) = &stored.record.transport_message_id {
            self.by_transport_id.insert(tid.clone(), stored.id);
        }
        Ok(stored)
    }

    fn find_by_transport_message_id(
        &self,
        transport_message_id: &str,
    ) -> ChatflowResult<Option<StoredMessage>> {
        let Some(id) = self.by_transport_id.get(transport_message_id).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.messages.get(&id).map(|m| m.value().clone()))
    }

    fn apply_receipt(&self, receipt: &DeliveryReceipt) -> ChatflowResult<ReceiptOutcome> {
        let Some(id) = self
            .by_transport_id
            .get(&receipt.transport_message_id)
            .map(|r| *r)
        else {
            return Ok(ReceiptOutcome::Missing);
        };
        let Some(mut stored) = self.messages.get_mut(&id) else {
            return Ok(ReceiptOutcome::Missing);
        };
        if stored.record.apply_receipt(receipt) {
            Ok(ReceiptOutcome::Applied(stored.record.status))
        } else {
            Ok(ReceiptOutcome::Stale(stored.record.status))
        }
    }
}

/// Credit balances per account.
#[derive(Default)]
pub struct InMemoryLedger {
    balances: DashMap<String, u64>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, account_id: impl Into<String>, credits: u64) {
        self.balances.insert(account_id.into(), credits);
    }

    pub fn balance(&self, account_id: &str) -> u64 {
        self.balances.get(account_id).map(|b| *b).unwrap_or(0)
    }
}

impl AccountLedger for InMemoryLedger {
    fn try_deduct(&self, account_id: &str, amount: u64) -> ChatflowResult<bool> {
        let Some(mut balance) = self.balances.get_mut(account_id) else {
            return Ok(amount == 0);
        };
        match balance.checked_sub(amount) {
            Some(left) => {
                *balance = left;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn refund_credit(&self, account_id: &str, amount: u64) -> ChatflowResult<()> {
        let mut entry = self.balances.entry(account_id.to_string()).or_insert(0);
        *entry = entry.saturating_add(amount);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryPhonebook {
    contacts: DashMap<(Tenant, String), HashMap<String, String>>,
}

impl InMemoryPhonebook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, tenant: &Tenant, phone: impl Into<String>, fields: HashMap<String, String>) {
        self.contacts.insert((tenant.clone(), phone.into()), fields);
    }
}

impl PhonebookLookup for InMemoryPhonebook {
    fn find_by_phone(
        &self,
        tenant: &Tenant,
        phone: &str,
    ) -> ChatflowResult<Option<HashMap<String, String>>> {
        Ok(self
            .contacts
            .get(&(tenant.clone(), phone.to_string()))
            .map(|c| c.value().clone()))
    }
}

#[derive(Default)]
pub struct InMemoryAssets {
    media: DashMap<(Tenant, String), String>,
    templates: DashMap<Tenant, HashSet<(String, String)>>,
}

impl InMemoryAssets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_media(&self, tenant: &Tenant, asset_id: impl Into<String>, link: impl Into<String>) {
        self.media.insert((tenant.clone(), asset_id.into()), link.into());
    }

    pub fn add_template(&self, tenant: &Tenant, name: impl Into<String>, language: impl Into<String>) {
        self.templates
            .entry(tenant.clone())
            .or_default()
            .insert((name.into(), language.into()));
    }
}

impl AssetCatalog for InMemoryAssets {
    fn media_link(&self, tenant: &Tenant, asset_id: &str) -> ChatflowResult<Option<String>> {
        Ok(self
            .media
            .get(&(tenant.clone(), asset_id.to_string()))
            .map(|l| l.value().clone()))
    }

    fn has_template(&self, tenant: &Tenant, name: &str, language: &str) -> ChatflowResult<bool> {
        Ok(self
            .templates
            .get(tenant)
            .map(|set| set.contains(&(name.to_string(), language.to_string())))
            .unwrap_or(false))
    }
}
