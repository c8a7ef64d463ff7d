//! Message delivery: time-paced scheduling, the drain that hands due
//! messages to the transport, delivery receipts and broadcast control.

pub mod broadcast;
pub mod pacing;
pub mod receipts;
pub mod scheduler;

pub use broadcast::{BroadcastController, BroadcastRequest};
pub use pacing::{after_secs, TimeDistributionGenerator};
pub use receipts::ReceiptProcessor;
pub use scheduler::{DeliveryScheduler, DrainReport};
