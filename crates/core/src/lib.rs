//! Shared domain model for the conversational flow engine and message
//! scheduler: flow definitions, scheduled messages and their status
//! lifecycle, transport payloads, collaborator traits and stores.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod flow;
pub mod memory;
pub mod payload;
pub mod status;
pub mod store;
pub mod types;

pub use config::AppConfig;
pub use error::{ChatflowError, ChatflowResult};
pub use status::{Status, StatusMachine};
