//! Stage dispatch: barrier arming and worker fan-out
//!
//! Set-Barrier arms the `waiting` counter with the number of sends the
//! current stage will dispatch; every worker reports back with -1, so the
//! counter reads 0 once a stage has fully fanned in. The counter is a
//! tracing aid; fan-in correctness comes from the engine's superstep
//! semantics, never from polling `waiting`.
//!
//! The orchestrator node body is a no-op; the fan-out happens in its
//! conditional edge, which reads `plan.stages[stage_index]`, filters
//! `when = false` steps, and emits one `Send` per step (all of them when
//! the stage is parallel, only the first otherwise).

use crate::context::AppContext;
use crate::graph::planner::{Plan, WorkerCall};
use crate::state::{fields, TurnState};
use flow_core::{RouteResult, Send as SendValue};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

fn current_plan(state: &Value) -> Option<Plan> {
    state
        .get(fields::PLAN)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
}

pub fn worker_node_name(call: WorkerCall) -> &'static str {
    match call {
        WorkerCall::Sql => "worker_sql",
        WorkerCall::Vec => "worker_vec",
        WorkerCall::Kg => "worker_kg",
    }
}

/// Set-Barrier node: `waiting += n` for the sends about to go out.
pub async fn run_set_barrier(_ctx: Arc<AppContext>, state: Value) -> flow_core::Result<Value> {
    let turn = TurnState(&state);
    let count = current_plan(&state)
        .and_then(|plan| plan.stage(turn.stage_index()).map(|s| s.dispatch_count()))
        .unwrap_or(0);
    Ok(json!({ fields::WAITING: count }))
}

/// Orchestrator node: exists as the origin of the fan-out edge.
pub async fn run_orchestrate(ctx: Arc<AppContext>, state: Value) -> flow_core::Result<Value> {
    let turn = TurnState(&state);
    if let Some(thread_id) = turn.thread_id() {
        let count = current_plan(&state)
            .and_then(|plan| plan.stage(turn.stage_index()).map(|s| s.dispatch_count()))
            .unwrap_or(0);
        ctx.events.trace(
            thread_id,
            "dispatch",
            json!({"stage": turn.stage_index(), "steps": count}),
        );
    }
    Ok(json!({}))
}

/// Fan-out routing for the current stage.
pub fn route_stage(state: &Value) -> RouteResult {
    let turn = TurnState(state);
    let Some(plan) = current_plan(state) else {
        warn!("orchestrator reached without a plan");
        return RouteResult::Node("writer".into());
    };
    let stage_index = turn.stage_index();
    let Some(stage) = plan.stage(stage_index) else {
        return RouteResult::Node("writer".into());
    };

    let query = turn.last_user_text().unwrap_or_default();
    let base = json!({
        fields::THREAD_ID: turn.thread_id(),
        fields::USER_ID: turn.user_id(),
        fields::STAGE_INDEX: stage_index,
        "query": query,
    });

    let steps = stage.active_steps();
    let dispatch: Vec<&_> = if stage.parallel {
        steps
    } else {
        steps.into_iter().take(1).collect()
    };
    if dispatch.is_empty() {
        return RouteResult::Node("writer".into());
    }

    let sends = dispatch
        .into_iter()
        .map(|step| {
            let mut arg = base.clone();
            arg["step"] = serde_json::to_value(step).unwrap_or(Value::Null);
            SendValue::new(worker_node_name(step.call), arg)
        })
        .collect();
    RouteResult::Sends(sends)
}
