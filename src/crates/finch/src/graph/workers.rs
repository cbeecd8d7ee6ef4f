//! Retrieval workers: SQL, vector, knowledge graph
//!
//! Every worker obeys the same contract: it receives the `Send` arg built
//! by the orchestrator (`step`, `thread_id`, `user_id`, `query`), writes
//! only the evidence field it owns plus `waiting: -1`, and must release the
//! barrier no matter what: a timeout or backend failure degrades to an
//! empty result list, never a missing report.

use crate::context::AppContext;
use crate::retrieval::{KgCallType, KgRequest, SqlQueryInput, VectorQuery};
use crate::state::{fields, EvidenceRecord};
use flow_core::llm::ChatRequest;
use flow_core::{ListUpdate, Message};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

/// Partial state every worker returns: its evidence field and the barrier
/// decrement. An empty result is a no-op append, never a clear.
fn worker_partial(field: &str, records: Vec<EvidenceRecord>) -> flow_core::Result<Value> {
    let update = if records.is_empty() {
        ListUpdate::Noop
    } else {
        ListUpdate::Append(records)
    };
    Ok(json!({
        field: update.into_value(),
        fields::WAITING: -1,
    }))
}

fn input_str<'a>(input: &'a Value, key: &str) -> Option<&'a str> {
    input.get(key).and_then(Value::as_str)
}

fn step_args(input: &Value) -> Value {
    input
        .get("step")
        .and_then(|s| s.get("args"))
        .cloned()
        .unwrap_or_else(|| json!({}))
}

/// Run a worker body under the hard deadline, reporting through the event
/// sink. Failures and timeouts both resolve to an empty result list.
async fn guarded<F>(
    ctx: &AppContext,
    input: &Value,
    tool: &'static str,
    work: F,
) -> Vec<EvidenceRecord>
where
    F: std::future::Future<Output = crate::error::Result<Vec<EvidenceRecord>>>,
{
    let records = match tokio::time::timeout(ctx.settings.worker_timeout, work).await {
        Ok(Ok(records)) => records,
        Ok(Err(err)) => {
            warn!(tool, error = %err, "worker failed, releasing barrier with no results");
            vec![]
        }
        Err(_) => {
            warn!(
                tool,
                timeout_secs = ctx.settings.worker_timeout.as_secs(),
                "worker deadline expired, releasing barrier with no results"
            );
            vec![]
        }
    };
    if let Some(thread_id) = input_str(input, fields::THREAD_ID) {
        ctx.events.emit(
            thread_id,
            crate::streaming::SseEvent::OnToolEnd(json!({
                "tool": tool,
                "count": records.len(),
            })),
        );
    }
    records
}

/// SQL worker: structured relational lookups, never raw SQL strings.
pub async fn run_sql_worker(ctx: Arc<AppContext>, input: Value) -> flow_core::Result<Value> {
    let records = guarded(&ctx, &input, "sql", async {
        let args = step_args(&input);
        let mut query = SqlQueryInput::from_args(&args)
            .map_err(crate::error::AppError::Validation)?;
        if let Some(user_id) = input_str(&input, fields::USER_ID) {
            query.inject_user_id(user_id);
        }
        ctx.sql.query(&query).await
    })
    .await;
    worker_partial(fields::SQL_RESULTS, records)
}

fn top_score(hits: &[EvidenceRecord]) -> f64 {
    hits.iter().map(|h| h.score).fold(f64::MIN, f64::max)
}

fn low_confidence(hits: &[EvidenceRecord], min_score: f64) -> bool {
    hits.is_empty() || top_score(hits) < min_score
}

/// One LLM-assisted rewrite of a low-yield query.
async fn rewrite_query(ctx: &AppContext, query: &str) -> Option<String> {
    let request = ChatRequest::new(vec![
        Message::system(
            "Rewrite the search query to improve document retrieval. \
             Reply with only the rewritten query.",
        ),
        Message::human(query.to_string()),
    ])
    .with_temperature(0.0);
    match ctx.model.chat(request).await {
        Ok(response) => response
            .message
            .text()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        Err(err) => {
            warn!(error = %err, "query rewrite failed");
            None
        }
    }
}

/// Vector worker: prepare, fetch, assess, with one rewrite attempt before
/// falling back to no evidence.
pub async fn run_vector_worker(ctx: Arc<AppContext>, input: Value) -> flow_core::Result<Value> {
    let records = guarded(&ctx, &input, "vector", async {
        // prepare
        let args = step_args(&input);
        let mut query: VectorQuery = serde_json::from_value(args.clone()).unwrap_or_else(|_| {
            VectorQuery::new(input_str(&input, "query").unwrap_or_default())
        });
        if query.query.is_empty() {
            query.query = input_str(&input, "query").unwrap_or_default().to_string();
        }

        // fetch
        let mut hits = ctx.vector.search(&query).await?;

        // assess, with a single rewrite round
        let min_score = ctx.settings.vector_min_score;
        if low_confidence(&hits, min_score) {
            if let Some(thread_id) = input_str(&input, fields::THREAD_ID) {
                ctx.events.trace(
                    thread_id,
                    "phase",
                    json!({"phase": "vector_rewrite", "query": query.query}),
                );
            }
            if let Some(rewritten) = rewrite_query(&ctx, &query.query).await {
                query.query = rewritten;
                hits = ctx.vector.search(&query).await?;
            }
            if low_confidence(&hits, min_score) {
                // fallback: no evidence rather than low-quality evidence
                return Ok(vec![]);
            }
        }
        Ok(hits)
    })
    .await;
    worker_partial(fields::VEC_RESULTS, records)
}

/// KG worker: dispatch by `call_type`; mutations only run pre-approved.
pub async fn run_kg_worker(ctx: Arc<AppContext>, input: Value) -> flow_core::Result<Value> {
    let records = guarded(&ctx, &input, "kg", async {
        let args = step_args(&input);
        let call_name = args
            .get("call_type")
            .and_then(Value::as_str)
            .unwrap_or("graph.search");
        let Some(call_type) = KgCallType::parse(call_name) else {
            warn!(call = call_name, "unknown kg call type");
            return Ok(vec![]);
        };
        let approved = args.get("approved").and_then(Value::as_bool).unwrap_or(false);
        if call_type.requires_approval() && !approved {
            warn!(call = %call_type, "kg mutation without approval, skipping");
            return Ok(vec![]);
        }
        ctx.kg.call(&KgRequest { call_type, args }).await
    })
    .await;
    worker_partial(fields::KG_RESULTS, records)
}
