//! Adjacency index over a flow's nodes and edges, built once per traversal.

use std::collections::HashMap;

use chatflow_core::flow::{FlowDefinition, FlowNode, NodePayload};
use chatflow_core::{ChatflowError, ChatflowResult};

/// Handle used by plain (non-branching) outgoing edges.
pub const DEFAULT_HANDLE: &str = "source";

#[derive(Debug)]
pub struct FlowGraph<'a> {
    nodes: HashMap<&'a str, &'a FlowNode>,
    /// source node -> source handle -> target node
    edges: HashMap<&'a str, HashMap<&'a str, &'a str>>,
    start: &'a str,
}

impl<'a> FlowGraph<'a> {
    /// Indexes `flow`. Fails unless node ids are unique and exactly one node
    /// is a start node.
    pub fn build(flow: &'a FlowDefinition) -> ChatflowResult<Self> {
        let mut nodes = HashMap::with_capacity(flow.nodes.len());
        for node in &flow.nodes {
            if nodes.insert(node.id.as_str(), node).is_some() {
                return Err(ChatflowError::validation(format!(
                    "flow {} has duplicate node id '{}'",
                    flow.id, node.id
                )));
            }
        }

        let starts: Vec<&str> = flow
            .nodes
            .iter()
            .filter(|n| matches!(n.payload, NodePayload::Start))
            .map(|n| n.id.as_str())
            .collect();
        let start = match starts.as_slice() {
            [only] => *only,
            [] => {
                return Err(ChatflowError::validation(format!(
                    "flow {} has no start node",
                    flow.id
                )))
            }
            many => {
                return Err(ChatflowError::validation(format!(
                    "flow {} has {} start nodes",
                    flow.id,
                    many.len()
                )))
            }
        };

        let mut edges: HashMap<&str, HashMap<&str, &str>> = HashMap::new();
        for e in &flow.edges {
            edges
                .entry(e.source.as_str())
                .or_default()
                .insert(e.source_handle.as_str(), e.target.as_str());
        }

        Ok(Self { nodes, edges, start })
    }

    /// Like [`Self::build`], and also rejects edges that point at missing
    /// nodes. Used when a flow is saved.
    pub fn validate(flow: &'a FlowDefinition) -> ChatflowResult<Self> {
        let graph = Self::build(flow)?;
        for edge in &flow.edges {
            for end in [&edge.source, &edge.target] {
                if !graph.nodes.contains_key(end.as_str()) {
                    return Err(ChatflowError::validation(format!(
                        "edge {} -> {} references unknown node '{}'",
                        edge.source, edge.target, end
                    )));
                }
            }
        }
        Ok(graph)
    }

    pub fn start(&self) -> &'a str {
        self.start
    }

    pub fn node(&self, id: &str) -> ChatflowResult<&'a FlowNode> {
        self.nodes
            .get(id)
            .copied()
            .ok_or_else(|| ChatflowError::validation(format!("node '{}' not found", id)))
    }

    /// The single outgoing edge of a non-branching node.
    pub fn next(&self, node_id: &str) -> Option<&'a str> {
        let out = self.edges.get(node_id)?;
        out.get(node_id).or_else(|| out.get(DEFAULT_HANDLE)).copied()
    }

    /// Target of the branch for `option_id` on an interactive node.
    pub fn branch(&self, node_id: &str, option_id: &str) -> Option<&'a str> {
        self.edges.get(node_id)?.get(option_id).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
