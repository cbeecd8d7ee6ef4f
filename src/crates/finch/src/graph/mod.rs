//! Graph assembly for one conversational turn
//!
//! ```text
//! intent_slot -> intent_detect -> collect_base
//!     collect_base -> (END | simple_response | planner)
//!     planner -> set_barrier -> orchestrate =[Sends]=> workers
//!     worker_sql / worker_vec / worker_kg -> aggregate
//!     aggregate -> (set_barrier | writer)
//!     writer, simple_response -> END
//! ```
//!
//! Workers fan in at `aggregate` through the de-duplicated static edge; the
//! `waiting` counter makes the barrier observable in traces.

pub mod aggregate;
pub mod intent;
pub mod orchestrate;
pub mod planner;
pub mod workers;
pub mod writer;

use crate::context::AppContext;
use crate::state::declare_channels;
use flow_core::{Graph, Result, Runner, END};
use std::sync::Arc;

/// Build and compile the turn graph against the context's checkpoint saver.
pub fn build_graph(ctx: Arc<AppContext>) -> Result<Arc<Runner>> {
    let mut graph = Graph::new();
    declare_channels(&mut graph);

    let c = ctx.clone();
    graph.add_node("intent_slot", move |state| {
        intent::run_intent_slot(c.clone(), state)
    });
    let c = ctx.clone();
    graph.add_node("intent_detect", move |state| {
        intent::run_intent_detect(c.clone(), state)
    });
    let c = ctx.clone();
    graph.add_node("collect_base", move |state| {
        intent::run_collect_base(c.clone(), state)
    });
    let c = ctx.clone();
    graph.add_node("planner", move |state| planner::run_planner(c.clone(), state));
    let c = ctx.clone();
    graph.add_node("set_barrier", move |state| {
        orchestrate::run_set_barrier(c.clone(), state)
    });
    let c = ctx.clone();
    graph.add_node("orchestrate", move |state| {
        orchestrate::run_orchestrate(c.clone(), state)
    });
    let c = ctx.clone();
    graph.add_node("worker_sql", move |state| {
        workers::run_sql_worker(c.clone(), state)
    });
    let c = ctx.clone();
    graph.add_node("worker_vec", move |state| {
        workers::run_vector_worker(c.clone(), state)
    });
    let c = ctx.clone();
    graph.add_node("worker_kg", move |state| {
        workers::run_kg_worker(c.clone(), state)
    });
    let c = ctx.clone();
    graph.add_node("aggregate", move |state| {
        aggregate::run_aggregate(c.clone(), state)
    });
    let c = ctx.clone();
    graph.add_node("writer", move |state| writer::run_writer(c.clone(), state));
    let c = ctx.clone();
    graph.add_node("simple_response", move |state| {
        writer::run_simple_response(c.clone(), state)
    });

    graph.set_entry("intent_slot");
    graph.add_edge("intent_slot", "intent_detect");
    graph.add_edge("intent_detect", "collect_base");
    graph.add_conditional_edge("collect_base", intent::route_after_collect);
    graph.add_edge("planner", "set_barrier");
    graph.add_edge("set_barrier", "orchestrate");
    graph.add_conditional_edge("orchestrate", orchestrate::route_stage);
    graph.add_edge("worker_sql", "aggregate");
    graph.add_edge("worker_vec", "aggregate");
    graph.add_edge("worker_kg", "aggregate");
    graph.add_conditional_edge("aggregate", aggregate::route_after_aggregate);
    graph.add_edge("writer", END);
    graph.add_edge("simple_response", END);

    Ok(Arc::new(graph.compile(ctx.saver.clone())?))
}
