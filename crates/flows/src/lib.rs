//! Conversational flows: trigger matching, graph traversal with
//! suspend/resume on interactive nodes, nurturing follow-ups, and the
//! engine that ties them to inbound messages.

pub mod engine;
pub mod executor;
pub mod graph;
pub mod nurturing;
pub mod trigger;

pub use engine::{FlowEngine, InboundReport};
pub use executor::{FlowGraphExecutor, RunContext, Terminal, TraversalOutcome, TraversalReport};
pub use graph::FlowGraph;
pub use nurturing::NurturingScheduler;
pub use trigger::{phrase_matches, TriggerMatcher};
