//! Response writer and simple response
//!
//! The writer composes a grounded prompt from the merged evidence and
//! streams the final answer. Evidence is enumerated as `[i] ...` under a
//! category header; the headers tell the model the data was retrieved
//! successfully, so it cannot hedge with "evidence insufficient" or claim
//! the database was unreachable when rows are right there.

use crate::context::AppContext;
use crate::state::{fields, EvidenceRecord, EvidenceSource, TurnState};
use crate::streaming::{split_token_into_chunks, SseEvent, MAX_CHUNK_CHARS};
use flow_core::llm::ChatRequest;
use flow_core::{GraphError, Message};
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;

/// Vector-bearing merges display at most this many records
const VECTOR_DISPLAY_LIMIT: usize = 20;

/// Metadata keys that mark a record as a relational row
const SQL_ROW_MARKERS: [&str; 4] = ["order_id", "pay_price", "create_time", "row"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EvidenceCategory {
    SqlOnly,
    VectorOnly,
    Mixed,
}

fn is_sql_record(record: &EvidenceRecord) -> bool {
    record.source == EvidenceSource::Sql
        || SQL_ROW_MARKERS
            .iter()
            .any(|key| record.metadata.contains_key(*key))
}

fn classify(records: &[EvidenceRecord]) -> EvidenceCategory {
    let has_sql = records.iter().any(is_sql_record);
    let has_text = records.iter().any(|r| !is_sql_record(r) && !r.text.is_empty());
    match (has_sql, has_text) {
        (true, false) => EvidenceCategory::SqlOnly,
        (false, _) => EvidenceCategory::VectorOnly,
        (true, true) => EvidenceCategory::Mixed,
    }
}

fn format_record(index: usize, record: &EvidenceRecord) -> String {
    if record.text.is_empty() {
        format!("[{}] {}", index, Value::Object(record.metadata.clone()))
    } else {
        format!("[{}] {}", index, record.text)
    }
}

/// Grounded system prompt over the merged evidence.
fn grounded_prompt(records: &[EvidenceRecord]) -> String {
    let category = classify(records);
    // SQL-only merges include every row (the planner already applied a
    // limit); vector-bearing merges are capped.
    let display_limit = match category {
        EvidenceCategory::SqlOnly => records.len(),
        _ => records.len().min(VECTOR_DISPLAY_LIMIT),
    };

    let mut prompt = String::new();
    match category {
        EvidenceCategory::SqlOnly => {
            prompt.push_str(&format!(
                "Database query results ({} rows), retrieved successfully:\n",
                records.len()
            ));
            for (i, record) in records.iter().take(display_limit).enumerate() {
                prompt.push_str(&format_record(i + 1, record));
                prompt.push('\n');
            }
            prompt.push_str(
                "\nAnswer the user's question directly from the rows above. \
                 Never say the database is unavailable, that you cannot access data, \
                 or that the evidence is insufficient: the rows above are the data.",
            );
        }
        EvidenceCategory::VectorOnly => {
            prompt.push_str("Retrieved documents:\n");
            for (i, record) in records.iter().take(display_limit).enumerate() {
                prompt.push_str(&format_record(i + 1, record));
                prompt.push('\n');
            }
            prompt.push_str(
                "\nAnswer directly from the documents above, citing them as [i]. \
                 Do not claim the evidence is insufficient when it is listed above.",
            );
        }
        EvidenceCategory::Mixed => {
            let (rows, docs): (Vec<_>, Vec<_>) =
                records.iter().take(display_limit).partition(|r| is_sql_record(r));
            prompt.push_str(&format!("Database query results ({} rows):\n", rows.len()));
            for (i, record) in rows.iter().enumerate() {
                prompt.push_str(&format_record(i + 1, record));
                prompt.push('\n');
            }
            prompt.push_str("\nRetrieved documents:\n");
            for (j, record) in docs.iter().enumerate() {
                prompt.push_str(&format_record(j + 1, record));
                prompt.push('\n');
            }
            prompt.push_str(
                "\nAnswer directly, combining both kinds of evidence; cite documents \
                 as [i][j]. The data above was retrieved successfully; never answer \
                 that the evidence is insufficient.",
            );
        }
    }
    prompt
}

/// Stream an answer through the thread's event sink, re-chunking oversized
/// deltas. Returns the complete accumulated text.
pub(crate) async fn stream_answer(
    ctx: &AppContext,
    thread_id: Option<&str>,
    messages: Vec<Message>,
) -> flow_core::Result<String> {
    let mut stream = ctx.model.stream(ChatRequest::new(messages)).await?;
    let mut content = String::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.delta.is_empty() {
            continue;
        }
        for piece in split_token_into_chunks(&chunk.delta, MAX_CHUNK_CHARS) {
            content.push_str(&piece);
            if let Some(thread_id) = thread_id {
                ctx.events.emit(
                    thread_id,
                    SseEvent::PartialAi {
                        content: content.clone(),
                        tool_calls: None,
                    },
                );
            }
        }
    }
    Ok(content)
}

/// Writer node: grounded prompt over `merged`, streamed final answer.
pub async fn run_writer(ctx: Arc<AppContext>, state: Value) -> flow_core::Result<Value> {
    let turn = TurnState(&state);
    let merged = turn.evidence(fields::MERGED);
    let thread_id = turn.thread_id().map(str::to_string);

    if let Some(thread_id) = &thread_id {
        ctx.events
            .trace(thread_id, "writer_start", json!({"evidence": merged.len()}));
    }

    let mut messages = Vec::new();
    if !merged.is_empty() {
        messages.push(Message::system(grounded_prompt(&merged)));
    }
    messages.extend(turn.messages());

    let answer = stream_answer(&ctx, thread_id.as_deref(), messages).await?;

    if let Some(thread_id) = &thread_id {
        ctx.events
            .trace(thread_id, "writer_done", json!({"chars": answer.len()}));
    }

    Ok(json!({
        fields::FINAL_ANSWER: answer.clone(),
        fields::MESSAGES: [serde_json::to_value(Message::assistant(answer))
            .map_err(GraphError::Serde)?],
    }))
}

/// Simple response node: stream over the conversation with no additional
/// system prompt. Taken when the tool probe proposed nothing.
pub async fn run_simple_response(ctx: Arc<AppContext>, state: Value) -> flow_core::Result<Value> {
    let turn = TurnState(&state);
    let thread_id = turn.thread_id().map(str::to_string);
    let answer = stream_answer(&ctx, thread_id.as_deref(), turn.messages()).await?;
    Ok(json!({
        fields::FINAL_ANSWER: answer.clone(),
        fields::MESSAGES: [serde_json::to_value(Message::assistant(answer))
            .map_err(GraphError::Serde)?],
    }))
}
