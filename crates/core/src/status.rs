//! Delivery-status lifecycle shared by scheduled messages, conversation
//! records and delivery receipts.

use serde::{Deserialize, Serialize};

use crate::error::{ChatflowError, ChatflowResult};

/// Status of a scheduled or delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    Processing,
    Sent,
    Delivered,
    Read,
    Failed,
    Paused,
}

impl Status {
    /// Statuses a drain or control operation can still act on.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, Status::Pending | Status::Paused)
    }

    /// Position along the delivery-receipt path. Only statuses past the
    /// claim step have a rank.
    fn receipt_rank(&self) -> Option<u8> {
        match self {
            Status::Sent => Some(1),
            Status::Delivered => Some(2),
            Status::Read => Some(3),
            _ => None,
        }
    }

    /// Whether a delivery receipt reporting `incoming` moves a record
    /// currently at `self` forward. Receipts may arrive out of order, so a
    /// READ may skip DELIVERED and a late DELIVERED after READ is stale.
    pub fn receipt_advances(&self, incoming: Status) -> bool {
        if *self == Status::Failed {
            return false;
        }
        if incoming == Status::Failed {
            return matches!(self, Status::Sent | Status::Delivered);
        }
        match (self.receipt_rank(), incoming.receipt_rank()) {
            (Some(current), Some(next)) => next > current,
            _ => false,
        }
    }
}

/// A single allowed edge in the status graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: Status,
    pub to: Status,
    pub trigger: &'static str,
}

const TRANSITIONS: &[StatusTransition] = &[
    // Pending ->
    StatusTransition {
        from: Status::Pending,
        to: Status::Processing,
        trigger: "drain_claim",
    },
    StatusTransition {
        from: Status::Pending,
        to: Status::Paused,
        trigger: "pause",
    },
    // Paused ->
    StatusTransition {
        from: Status::Paused,
        to: Status::Pending,
        trigger: "resume",
    },
    // Processing ->
    StatusTransition {
        from: Status::Processing,
        to: Status::Sent,
        trigger: "transport_accepted",
    },
    StatusTransition {
        from: Status::Processing,
        to: Status::Failed,
        trigger: "transport_rejected",
    },
    // Sent ->
    StatusTransition {
        from: Status::Sent,
        to: Status::Delivered,
        trigger: "receipt_delivered",
    },
    StatusTransition {
        from: Status::Sent,
        to: Status::Read,
        trigger: "receipt_read",
    },
    StatusTransition {
        from: Status::Sent,
        to: Status::Failed,
        trigger: "receipt_failed",
    },
    // Delivered ->
    StatusTransition {
        from: Status::Delivered,
        to: Status::Read,
        trigger: "receipt_read",
    },
    StatusTransition {
        from: Status::Delivered,
        to: Status::Failed,
        trigger: "receipt_failed",
    },
    // Failed ->
    StatusTransition {
        from: Status::Failed,
        to: Status::Pending,
        trigger: "resend",
    },
];

/// Guards the message lifecycle by enforcing the finite set of valid
/// status transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusMachine;

impl StatusMachine {
    pub fn transitions() -> &'static [StatusTransition] {
        TRANSITIONS
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(from: Status, to: Status) -> bool {
        TRANSITIONS.iter().any(|t| t.from == from && t.to == to)
    }

    /// Validates `from -> to`, returning the target status on success.
    pub fn check(from: Status, to: Status) -> ChatflowResult<Status> {
        if Self::can_transition(from, to) {
            Ok(to)
        } else {
            Err(ChatflowError::InvalidTransition { from, to })
        }
    }
}
