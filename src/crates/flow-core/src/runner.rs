//! Superstep execution loop
//!
//! The [`Runner`] executes a compiled graph under superstep semantics:
//!
//! 1. Determine the active task set from pending [`Send`]s and the edges of
//!    the previous step.
//! 2. Run every scheduled task concurrently; each returns a partial state.
//! 3. Apply the partials through the channel reducers in deterministic order
//!    (node name, alphabetical; ties keep dispatch order).
//! 4. Evaluate outgoing edges: static targets are de-duplicated (this is the
//!    fan-in barrier), conditional routers may emit `Send`s that seed the
//!    next superstep with per-task input states.
//! 5. Persist a checkpoint (channel values, versions, pending sends) after
//!    every superstep.
//!
//! A node failure aborts the run; retries exist only inside the checkpoint
//! saver. Resume restores channel values and pending sends from the latest
//! (or a named) checkpoint before step 1, so an interrupted fan-out
//! re-dispatches exactly the sends that were outstanding.

use crate::error::{GraphError, Result};
use crate::graph::{Edge, Graph, END};
use crate::send::{RouteResult, Send as SendValue};
use flow_checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-run configuration
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub thread_id: String,
    pub user_id: Option<String>,
    /// Resume from a specific checkpoint instead of the thread's latest
    pub checkpoint_id: Option<String>,
    /// Superstep limit; exceeded limits abort with `RecursionLimit`
    pub max_steps: usize,
}

impl RunConfig {
    pub fn new(thread_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            user_id,
            checkpoint_id: None,
            max_steps: 64,
        }
    }

    fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            thread_id: self.thread_id.clone(),
            checkpoint_id: self.checkpoint_id.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// Debug event emitted per superstep on the streaming execution path
#[derive(Debug, Clone)]
pub struct StepEvent {
    pub step: i64,
    pub nodes: Vec<String>,
    pub updated_channels: Vec<String>,
}

/// One scheduled unit of work
#[derive(Debug, Clone)]
struct Task {
    node: String,
    input: Value,
}

/// Compiled, executable graph
pub struct Runner {
    graph: Graph,
    saver: Arc<dyn CheckpointSaver>,
}

impl Runner {
    pub(crate) fn new(graph: Graph, saver: Arc<dyn CheckpointSaver>) -> Self {
        Self { graph, saver }
    }

    /// Execute to completion and return the final state.
    pub async fn invoke(&self, input: Value, config: &RunConfig) -> Result<Value> {
        self.run(input, config, None).await
    }

    /// Like [`invoke`](Self::invoke), additionally delivering a
    /// [`StepEvent`] per superstep (the debug execution path).
    pub async fn invoke_with_observer(
        &self,
        input: Value,
        config: &RunConfig,
        observer: mpsc::UnboundedSender<StepEvent>,
    ) -> Result<Value> {
        self.run(input, config, Some(observer)).await
    }

    /// Debug-mode execution: per-step events arrive on the returned stream
    /// while the run proceeds in a background task.
    pub fn stream(
        self: Arc<Self>,
        input: Value,
        config: RunConfig,
    ) -> tokio_stream::wrappers::UnboundedReceiverStream<StepEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            if let Err(err) = self.run(input, &config, Some(tx)).await {
                warn!(error = %err, "streamed graph run failed");
            }
        });
        tokio_stream::wrappers::UnboundedReceiverStream::new(rx)
    }

    async fn run(
        &self,
        input: Value,
        config: &RunConfig,
        observer: Option<mpsc::UnboundedSender<StepEvent>>,
    ) -> Result<Value> {
        let ckpt_config = config.checkpoint_config();

        let mut state: Map<String, Value> = Map::new();
        let mut versions: HashMap<String, i64> = HashMap::new();
        let mut versions_seen: HashMap<String, HashMap<String, i64>> = HashMap::new();
        let mut pending_sends: Vec<SendValue> = Vec::new();
        let mut parent_id: Option<String> = None;
        let mut step: i64 = 0;

        // Restore prior state for this thread, if any
        if let Some(tuple) = self.saver.get_tuple(&ckpt_config).await? {
            state = tuple.checkpoint.channel_values;
            versions = tuple.checkpoint.channel_versions;
            versions_seen = tuple.checkpoint.versions_seen;
            pending_sends = tuple
                .checkpoint
                .pending_sends
                .into_iter()
                .filter_map(|v| serde_json::from_value::<SendValue>(v).ok())
                .collect();
            parent_id = Some(tuple.checkpoint.id.clone());
            step = tuple.metadata.step.map(|s| s + 1).unwrap_or(0);
        }

        // Merge the caller's input through the reducers and persist the
        // input checkpoint, so the run is resumable from step -1 onward.
        let input_obj = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(GraphError::Validation(format!(
                    "graph input must be an object, got {other}"
                )))
            }
        };
        let mut input_updated = Vec::new();
        for (field, value) in input_obj {
            self.apply_update(&mut state, &field, value);
            input_updated.push(field);
        }
        bump_versions(&mut versions, &input_updated);
        parent_id = Some(
            self.write_checkpoint(
                &ckpt_config,
                &state,
                &versions,
                &versions_seen,
                &pending_sends,
                CheckpointSource::Input,
                step - 1,
                parent_id.as_deref(),
            )
            .await?,
        );

        // Seed the first superstep
        let mut tasks: Vec<Task> = if pending_sends.is_empty() {
            let entry = self
                .graph
                .entry
                .clone()
                .ok_or_else(|| GraphError::Validation("no entry node set".into()))?;
            vec![Task {
                node: entry,
                input: Value::Object(state.clone()),
            }]
        } else {
            pending_sends
                .drain(..)
                .map(|s| {
                    let (node, arg) = s.into_parts();
                    Task { node, input: arg }
                })
                .collect()
        };

        let start_step = step;
        while !tasks.is_empty() {
            if (step - start_step) as usize >= config.max_steps {
                return Err(GraphError::RecursionLimit(config.max_steps));
            }

            let node_names: Vec<String> = tasks.iter().map(|t| t.node.clone()).collect();
            debug!(step, nodes = ?node_names, "superstep");

            // Execute every scheduled task concurrently
            let task_futures = tasks
                .iter()
                .map(|task| {
                    let spec = self.graph.nodes.get(&task.node).ok_or_else(|| {
                        GraphError::UnknownNode(task.node.clone())
                    })?;
                    Ok((spec.executor)(task.input.clone()))
                })
                .collect::<Result<Vec<_>>>()?;
            let outputs = futures::future::join_all(task_futures).await;

            let mut partials: Vec<(String, Map<String, Value>)> = Vec::new();
            for (task, output) in tasks.iter().zip(outputs) {
                let value = output.map_err(|e| match e {
                    err @ GraphError::Node { .. } => err,
                    other => GraphError::node(&task.node, other),
                })?;
                match value {
                    Value::Object(map) => partials.push((task.node.clone(), map)),
                    Value::Null => partials.push((task.node.clone(), Map::new())),
                    other => {
                        return Err(GraphError::node(
                            &task.node,
                            format!("node must return an object, got {other}"),
                        ))
                    }
                }
            }

            // Record per-task pending writes before the merge; concurrent
            // calls on one thread serialize inside the saver.
            let write_futs = partials.iter().filter(|(_, p)| !p.is_empty()).map(
                |(node, partial)| {
                    let writes: Vec<(String, Value)> = partial
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    let task_id = format!("{step}:{node}");
                    self.saver.put_writes(&ckpt_config, writes, task_id)
                },
            );
            futures::future::try_join_all(write_futs).await?;

            // Deterministic merge order: node name, dispatch order on ties
            partials.sort_by(|a, b| a.0.cmp(&b.0));
            let mut updated: Vec<String> = Vec::new();
            for (node, partial) in &partials {
                let mut fields: Vec<&String> = partial.keys().collect();
                fields.sort();
                for field in fields {
                    self.apply_update(&mut state, field, partial[field.as_str()].clone());
                    if !updated.contains(field) {
                        updated.push(field.clone());
                    }
                }
                versions_seen.insert(node.clone(), versions.clone());
            }
            bump_versions(&mut versions, &updated);

            // Evaluate outgoing edges once per distinct executed node
            let mut executed: Vec<&String> = partials.iter().map(|(n, _)| n).collect();
            executed.dedup();
            let state_value = Value::Object(state.clone());
            let mut scheduled: Vec<String> = Vec::new();
            let mut next_sends: Vec<SendValue> = Vec::new();
            for node in executed {
                match self.graph.edges.get(node.as_str()) {
                    None => {}
                    Some(Edge::Direct(to)) => {
                        if to != END && !scheduled.contains(to) {
                            scheduled.push(to.clone());
                        }
                    }
                    Some(Edge::Conditional(router)) => match router(&state_value) {
                        RouteResult::End => {}
                        RouteResult::Node(to) => {
                            if to != END {
                                if !self.graph.nodes.contains_key(&to) {
                                    return Err(GraphError::UnknownNode(to));
                                }
                                if !scheduled.contains(&to) {
                                    scheduled.push(to);
                                }
                            }
                        }
                        RouteResult::Sends(sends) => {
                            for send in sends {
                                self.graph.resolve_send(&send)?;
                                next_sends.push(send);
                            }
                        }
                    },
                }
            }

            self.write_checkpoint(
                &ckpt_config,
                &state,
                &versions,
                &versions_seen,
                &next_sends,
                CheckpointSource::Loop,
                step,
                parent_id.as_deref(),
            )
            .await
            .map(|id| parent_id = Some(id))?;

            if let Some(tx) = &observer {
                let _ = tx.send(StepEvent {
                    step,
                    nodes: node_names,
                    updated_channels: updated,
                });
            }

            tasks = scheduled
                .into_iter()
                .map(|node| Task {
                    node,
                    input: Value::Object(state.clone()),
                })
                .chain(next_sends.into_iter().map(|s| {
                    let (node, arg) = s.into_parts();
                    Task { node, input: arg }
                }))
                .collect();
            step += 1;
        }

        Ok(Value::Object(state))
    }

    fn apply_update(&self, state: &mut Map<String, Value>, field: &str, update: Value) {
        let kind = self.graph.channel_kind(field);
        let merged = crate::channel::reduce(kind, state.get(field), update);
        state.insert(field.to_string(), merged);
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_checkpoint(
        &self,
        config: &CheckpointConfig,
        state: &Map<String, Value>,
        versions: &HashMap<String, i64>,
        versions_seen: &HashMap<String, HashMap<String, i64>>,
        pending_sends: &[SendValue],
        source: CheckpointSource,
        step: i64,
        parent_id: Option<&str>,
    ) -> Result<String> {
        let encoded_sends = pending_sends
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let checkpoint = Checkpoint {
            v: Checkpoint::CURRENT_VERSION,
            id: Uuid::new_v4().to_string(),
            ts: chrono::Utc::now(),
            channel_values: state.clone(),
            channel_versions: versions.clone(),
            versions_seen: versions_seen.clone(),
            pending_sends: encoded_sends,
        };
        let id = checkpoint.id.clone();
        let mut metadata = CheckpointMetadata::new(source, step);
        if let Some(parent) = parent_id {
            metadata.parents.insert(String::new(), parent.to_string());
        }
        self.saver
            .put(config, checkpoint, metadata, versions.clone())
            .await?;
        Ok(id)
    }
}

fn bump_versions(versions: &mut HashMap<String, i64>, updated: &[String]) {
    for field in updated {
        *versions.entry(field.clone()).or_insert(0) += 1;
    }
}
