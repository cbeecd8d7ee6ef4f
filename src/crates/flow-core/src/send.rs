//! Dynamic fan-out values
//!
//! A [`Send`] is a first-class value emitted by a conditional edge: it names
//! a target node and carries the partial state that node will receive as its
//! input. A router returning several `Send`s seeds the next superstep with
//! one task per send, all executed concurrently. This is the mechanism behind
//! per-stage worker dispatch.
//!
//! `Send`s must survive a process restart mid fan-out, so they are plain
//! serializable data; the checkpointer stores them in `pending_sends` and
//! reconstructs them on resume.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Node identifier
pub type NodeId = String;

/// A task seed: run `node` with `arg` as its input state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Send {
    node: NodeId,
    arg: Value,
}

impl Send {
    pub fn new(node: impl Into<NodeId>, arg: Value) -> Self {
        Self {
            node: node.into(),
            arg,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn arg(&self) -> &Value {
        &self.arg
    }

    pub fn into_parts(self) -> (NodeId, Value) {
        (self.node, self.arg)
    }
}

/// Result of evaluating a conditional edge
#[derive(Debug, Clone)]
pub enum RouteResult {
    /// Route to a single node
    Node(NodeId),
    /// Fan out: one task per send, each with its own input state
    Sends(Vec<Send>),
    /// Terminate this branch of the run
    End,
}

impl From<&str> for RouteResult {
    fn from(node: &str) -> Self {
        RouteResult::Node(node.to_string())
    }
}

impl From<String> for RouteResult {
    fn from(node: String) -> Self {
        RouteResult::Node(node)
    }
}

impl From<Vec<Send>> for RouteResult {
    fn from(sends: Vec<Send>) -> Self {
        RouteResult::Sends(sends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_round_trip() {
        let send = Send::new("worker_sql", json!({"table": "order", "limit": 10}));
        let encoded = serde_json::to_string(&send).unwrap();
        let back: Send = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back.node(), "worker_sql");
        assert_eq!(back.arg()["limit"], 10);
    }

    #[test]
    fn test_route_result_conversions() {
        match RouteResult::from("aggregate") {
            RouteResult::Node(n) => assert_eq!(n, "aggregate"),
            _ => panic!("expected Node"),
        }
        match RouteResult::from(vec![Send::new("a", json!({})), Send::new("b", json!({}))]) {
            RouteResult::Sends(sends) => assert_eq!(sends.len(), 2),
            _ => panic!("expected Sends"),
        }
    }
}
