//! Aggregator: fan-in, merge, and stage routing
//!
//! Runs in the superstep after every dispatched worker has committed; the
//! engine's fan-in guarantees that, so `waiting` is never polled. The
//! per-source lists concatenate into `merged` (sql, then vector, then kg),
//! de-duplicated against what earlier stages already merged, and the node
//! decides between the fast path, dispatching the next stage, and handing
//! off to the writer.

use crate::context::AppContext;
use crate::graph::planner::Plan;
use crate::state::{fields, EvidenceSource, TurnState};
use flow_core::RouteResult;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;

pub async fn run_aggregate(ctx: Arc<AppContext>, state: Value) -> flow_core::Result<Value> {
    let turn = TurnState(&state);
    let sql = turn.evidence(fields::SQL_RESULTS);
    let vec_hits = turn.evidence(fields::VEC_RESULTS);
    let kg = turn.evidence(fields::KG_RESULTS);
    let existing = turn.evidence(fields::MERGED);

    // sources that contributed at least one record this turn
    let mut present: HashSet<EvidenceSource> = HashSet::new();
    for (records, source) in [
        (&sql, EvidenceSource::Sql),
        (&vec_hits, EvidenceSource::Vector),
        (&kg, EvidenceSource::Kg),
    ] {
        if !records.is_empty() {
            present.insert(source);
        }
    }

    // concatenate, de-duplicating against earlier stages
    let mut seen: HashSet<String> = existing.iter().map(|r| r.dedup_key()).collect();
    let mut fresh = Vec::new();
    for record in sql.into_iter().chain(vec_hits).chain(kg) {
        if seen.insert(record.dedup_key()) {
            fresh.push(record);
        }
    }
    let merged_len = seen.len();

    let stage_index = turn.stage_index();
    let stage_count = state
        .get(fields::PLAN)
        .cloned()
        .and_then(|v| serde_json::from_value::<Plan>(v).ok())
        .map(|p| p.stages.len())
        .unwrap_or(0);

    // fast path: structured sources answered, no need for more stages
    let fast = merged_len > 0 && !present.contains(&EvidenceSource::Vector);
    let (route, next_stage) = if fast {
        ("fast", stage_index)
    } else if stage_index + 1 < stage_count {
        ("more", stage_index + 1)
    } else {
        ("done", stage_index)
    };

    if let Some(thread_id) = turn.thread_id() {
        ctx.events.trace(
            thread_id,
            "aggregate",
            json!({
                "route": route,
                "stage": stage_index,
                "merged": merged_len,
                "fresh": fresh.len(),
            }),
        );
    }

    Ok(json!({
        fields::MERGED: serde_json::to_value(fresh).map_err(flow_core::GraphError::Serde)?,
        fields::AGG_ROUTE: route,
        fields::STAGE_INDEX: next_stage,
    }))
}

/// Routing after the aggregator: loop for the next stage or write.
pub fn route_after_aggregate(state: &Value) -> RouteResult {
    match state.get(fields::AGG_ROUTE).and_then(Value::as_str) {
        Some("more") => RouteResult::Node("set_barrier".into()),
        _ => RouteResult::Node("writer".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::offline_context;
    use crate::state::EvidenceRecord;
    use serde_json::json;

    fn record(source: EvidenceSource, text: &str, id: Option<i64>) -> Value {
        let mut r = EvidenceRecord::new(source, text, 1.0);
        if let Some(id) = id {
            r = r.with_metadata("id", json!(id));
        }
        serde_json::to_value(r).unwrap()
    }

    fn base_state(plan_stages: usize) -> Value {
        let stages: Vec<Value> = (0..plan_stages)
            .map(|_| json!({"steps": [{"call": "sql"}]}))
            .collect();
        json!({
            "thread_id": "t1",
            "plan": {"stages": stages},
            "stage_index": 0,
            "sql_results": [],
            "vec_results": [],
            "kg_results": [],
            "merged": [],
        })
    }

    #[tokio::test]
    async fn test_fast_path_on_sql_only_evidence() {
        let mut state = base_state(2);
        state["sql_results"] = json!([record(EvidenceSource::Sql, "", Some(1))]);
        let partial = run_aggregate(offline_context(), state).await.unwrap();
        assert_eq!(partial[fields::AGG_ROUTE], "fast");
        assert_eq!(partial[fields::STAGE_INDEX], 0);
        assert_eq!(partial[fields::MERGED].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_vector_evidence_disables_fast_path() {
        let mut state = base_state(2);
        state["sql_results"] = json!([record(EvidenceSource::Sql, "", Some(1))]);
        state["vec_results"] = json!([record(EvidenceSource::Vector, "chunk", None)]);
        let partial = run_aggregate(offline_context(), state).await.unwrap();
        assert_eq!(partial[fields::AGG_ROUTE], "more");
        assert_eq!(partial[fields::STAGE_INDEX], 1);
    }

    #[tokio::test]
    async fn test_done_when_stages_exhausted() {
        let mut state = base_state(1);
        state["vec_results"] = json!([record(EvidenceSource::Vector, "chunk", None)]);
        let partial = run_aggregate(offline_context(), state).await.unwrap();
        assert_eq!(partial[fields::AGG_ROUTE], "done");
    }

    #[tokio::test]
    async fn test_empty_results_route_more_then_done() {
        let partial = run_aggregate(offline_context(), base_state(2)).await.unwrap();
        assert_eq!(partial[fields::AGG_ROUTE], "more");

        let partial = run_aggregate(offline_context(), base_state(1)).await.unwrap();
        assert_eq!(partial[fields::AGG_ROUTE], "done");
    }

    #[tokio::test]
    async fn test_dedup_against_prior_stages() {
        let mut state = base_state(2);
        state["merged"] = json!([record(EvidenceSource::Sql, "", Some(1))]);
        state["sql_results"] = json!([
            record(EvidenceSource::Sql, "", Some(1)),
            record(EvidenceSource::Sql, "", Some(2)),
        ]);
        let partial = run_aggregate(offline_context(), state).await.unwrap();
        let fresh = partial[fields::MERGED].as_array().unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0]["metadata"]["id"], 2);
    }

    #[tokio::test]
    async fn test_concatenation_order_sql_vec_kg() {
        let mut state = base_state(1);
        state["sql_results"] = json!([record(EvidenceSource::Sql, "", Some(1))]);
        state["vec_results"] = json!([record(EvidenceSource::Vector, "v", None)]);
        state["kg_results"] = json!([record(EvidenceSource::Kg, "k", None)]);
        let partial = run_aggregate(offline_context(), state).await.unwrap();
        let merged = partial[fields::MERGED].as_array().unwrap();
        let sources: Vec<&str> = merged
            .iter()
            .map(|r| r["source"].as_str().unwrap())
            .collect();
        assert_eq!(sources, ["sql", "vector", "kg"]);
    }

    #[test]
    fn test_route_after_aggregate() {
        assert!(matches!(
            route_after_aggregate(&json!({"agg_route": "more"})),
            RouteResult::Node(n) if n == "set_barrier"
        ));
        assert!(matches!(
            route_after_aggregate(&json!({"agg_route": "fast"})),
            RouteResult::Node(n) if n == "writer"
        ));
        assert!(matches!(
            route_after_aggregate(&json!({"agg_route": "done"})),
            RouteResult::Node(n) if n == "writer"
        ));
    }
}
