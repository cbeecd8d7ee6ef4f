//! Graph definition: nodes, edges, channels
//!
//! A [`Graph`] is a directed graph of async nodes over a JSON state object.
//! Nodes return *partial* states; the channel map decides how those partials
//! merge (see [`crate::channel`]). Static edges schedule their target
//! unconditionally; conditional edges run a pure router against the merged
//! state and may return a node name, a fan-out of [`Send`]s, or END.
//!
//! Compilation ([`Graph::compile`]) validates the structure and pairs the
//! graph with a checkpoint saver, producing a [`Runner`].

use crate::channel::ChannelKind;
use crate::error::{GraphError, Result};
use crate::runner::Runner;
use crate::send::{RouteResult, Send as SendValue};
use flow_checkpoint::CheckpointSaver;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use crate::send::NodeId;

/// Virtual entry node
pub const START: &str = "__start__";
/// Virtual terminal node
pub const END: &str = "__end__";

/// Async node body: partial state in, partial state out
pub type NodeExecutor =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + std::marker::Send + Sync>;

/// Pure routing function for conditional edges
pub type RouterFn = Arc<dyn Fn(&Value) -> RouteResult + std::marker::Send + Sync>;

/// A named node and its executor
#[derive(Clone)]
pub struct NodeSpec {
    pub name: NodeId,
    pub executor: NodeExecutor,
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec").field("name", &self.name).finish()
    }
}

/// Outgoing edge of a node
#[derive(Clone)]
pub enum Edge {
    Direct(NodeId),
    Conditional(RouterFn),
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Edge::Direct(to) => f.debug_tuple("Direct").field(to).finish(),
            Edge::Conditional(_) => f.debug_tuple("Conditional").field(&"<router>").finish(),
        }
    }
}

/// Graph under construction
#[derive(Default)]
pub struct Graph {
    pub(crate) nodes: HashMap<NodeId, NodeSpec>,
    pub(crate) edges: HashMap<NodeId, Edge>,
    pub(crate) entry: Option<NodeId>,
    pub(crate) channels: HashMap<String, ChannelKind>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. The closure receives the node's input state and
    /// returns a partial state merged through the channel reducers.
    pub fn add_node<F, Fut>(&mut self, name: impl Into<NodeId>, f: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + std::marker::Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value>> + std::marker::Send + 'static,
    {
        let name = name.into();
        let executor: NodeExecutor = Arc::new(move |state| Box::pin(f(state)));
        self.nodes.insert(
            name.clone(),
            NodeSpec {
                name,
                executor,
            },
        );
        self
    }

    /// Unconditional edge `from -> to`. `to` may be [`END`].
    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.edges.insert(from.into(), Edge::Direct(to.into()));
        self
    }

    /// Conditional edge: `router` runs against the merged state after `from`
    /// executed and decides what the next superstep schedules.
    pub fn add_conditional_edge<F>(&mut self, from: impl Into<NodeId>, router: F) -> &mut Self
    where
        F: Fn(&Value) -> RouteResult + std::marker::Send + Sync + 'static,
    {
        self.edges
            .insert(from.into(), Edge::Conditional(Arc::new(router)));
        self
    }

    /// Set the node scheduled by the first superstep.
    pub fn set_entry(&mut self, node: impl Into<NodeId>) -> &mut Self {
        self.entry = Some(node.into());
        self
    }

    /// Declare the merge semantics of a state field. Undeclared fields
    /// default to [`ChannelKind::LastValue`].
    pub fn add_channel(&mut self, field: impl Into<String>, kind: ChannelKind) -> &mut Self {
        self.channels.insert(field.into(), kind);
        self
    }

    pub(crate) fn channel_kind(&self, field: &str) -> ChannelKind {
        self.channels
            .get(field)
            .copied()
            .unwrap_or(ChannelKind::LastValue)
    }

    /// Structural validation: entry exists, static edges point at known
    /// nodes (or END).
    pub fn validate(&self) -> Result<()> {
        let entry = self
            .entry
            .as_deref()
            .ok_or_else(|| GraphError::Validation("no entry node set".into()))?;
        if !self.nodes.contains_key(entry) {
            return Err(GraphError::Validation(format!(
                "entry node '{entry}' is not defined"
            )));
        }
        for (from, edge) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(GraphError::Validation(format!(
                    "edge source '{from}' is not defined"
                )));
            }
            if let Edge::Direct(to) = edge {
                if to != END && !self.nodes.contains_key(to) {
                    return Err(GraphError::Validation(format!(
                        "edge target '{to}' is not defined"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate and pair with a checkpoint saver.
    pub fn compile(self, saver: Arc<dyn CheckpointSaver>) -> Result<Runner> {
        self.validate()?;
        Ok(Runner::new(self, saver))
    }

    /// Resolve a fan-out send's target, erroring on unknown nodes.
    pub(crate) fn resolve_send(&self, send: &SendValue) -> Result<()> {
        if self.nodes.contains_key(send.node()) {
            Ok(())
        } else {
            Err(GraphError::UnknownNode(send.node().to_string()))
        }
    }
}
