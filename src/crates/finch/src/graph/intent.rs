//! Intent pipeline: slot enrichment, intent detection, turn initialization
//!
//! Three nodes open every turn. Intent-Slot runs the external slot
//! extractor. Intent-Detect applies a signal rule before asking the model:
//! datetime/location/range signals are a strong "needs tools" tell, so the
//! LLM only sees the ambiguous cases. Collect-Base resets the evidence
//! channels for the turn (the `null` clear signal, distinct from an empty
//! append), then either streams the answer right here (regular branch) or
//! probes for tool candidates (tool branch). A proposed tool on the
//! approval list stops the run with an `approval_required` event.

use crate::context::AppContext;
use crate::retrieval::APPROVAL_NEEDED_TOOLS;
use crate::state::{fields, EvidenceRecord, TurnState};
use crate::streaming::SseEvent;
use flow_core::llm::{ChatRequest, ToolDefinition};
use flow_core::{GraphError, ListUpdate, Message, RouteResult};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Signals that force the tool intent without consulting the model
const TOOL_SIGNALS: [&str; 3] = ["has_datetime", "has_location", "has_from_to"];

/// Intent-Slot node: enrich state with the extractor's slot bundle.
pub async fn run_intent_slot(ctx: Arc<AppContext>, state: Value) -> flow_core::Result<Value> {
    let turn = TurnState(&state);
    let utterance = turn.last_user_text().unwrap_or_default();
    let bundle = match ctx.slots.extract(&utterance).await {
        Ok(bundle) => bundle,
        Err(err) => {
            // slot extraction is advisory; a failed extractor never kills a turn
            warn!(error = %err, "slot extraction failed, continuing without slots");
            Default::default()
        }
    };
    Ok(json!({
        fields::INTENT_SLOTS: bundle.slots,
        fields::INTENT_ANALYSIS: {"signals": bundle.signals},
        fields::INTENT_COMPOSED: bundle.composed,
    }))
}

/// Intent-Detect node: rule first, then a binary LLM classification.
pub async fn run_intent_detect(ctx: Arc<AppContext>, state: Value) -> flow_core::Result<Value> {
    let turn = TurnState(&state);
    let signals = turn.intent_signals();
    if signals.iter().any(|s| TOOL_SIGNALS.contains(&s.as_str())) {
        debug!(?signals, "tool intent from signals");
        return Ok(json!({ fields::INTENT: "tool" }));
    }

    let mut messages = vec![Message::system(
        "Classify the user's latest message. Reply with exactly one word: \
         'tool' if answering needs data retrieval, database access, or an \
         action; 'regular' for plain conversation.",
    )];
    messages.extend(turn.messages());
    let response = ctx
        .model
        .chat(ChatRequest::new(messages).with_temperature(0.0))
        .await?;
    let intent = if response
        .message
        .text()
        .map(|t| t.to_lowercase().contains("tool"))
        .unwrap_or(false)
    {
        "tool"
    } else {
        "regular"
    };
    Ok(json!({ fields::INTENT: intent }))
}

/// Tools offered to the turn-level probe: the retrieval surface plus the
/// approval-listed knowledge-graph ingest tools.
fn probe_tools() -> Vec<ToolDefinition> {
    let free_args = json!({
        "type": "object",
        "properties": {
            "query": {"type": "string"}
        }
    });
    vec![
        ToolDefinition {
            name: "sql_query".into(),
            description: "Query business records (orders, payments, customers)".into(),
            parameters: free_args.clone(),
        },
        ToolDefinition {
            name: "vector_search".into(),
            description: "Search documents and reports".into(),
            parameters: free_args.clone(),
        },
        ToolDefinition {
            name: "graph_search".into(),
            description: "Search the knowledge graph for entities and relationships".into(),
            parameters: free_args.clone(),
        },
        ToolDefinition {
            name: "graph_ingest_detect".into(),
            description: "Detect entities and relationships in the conversation for \
                          knowledge-graph ingestion"
                .into(),
            parameters: free_args.clone(),
        },
        ToolDefinition {
            name: "graph_ingest_commit".into(),
            description: "Commit previously detected entities and relationships to the \
                          knowledge graph"
                .into(),
            parameters: free_args,
        },
    ]
}

/// Collect-Base node: the state initializer for a turn.
pub async fn run_collect_base(ctx: Arc<AppContext>, state: Value) -> flow_core::Result<Value> {
    let turn = TurnState(&state);
    let thread_id = turn.thread_id().map(str::to_string);

    // reset the evidence channels: the clear signal, not an empty append
    let clear = || ListUpdate::<EvidenceRecord>::Clear.into_value();
    let mut partial = json!({
        fields::SQL_RESULTS: clear(),
        fields::VEC_RESULTS: clear(),
        fields::KG_RESULTS: clear(),
        fields::MERGED: clear(),
        fields::STAGE_INDEX: 0,
        fields::AGG_ROUTE: "",
        fields::CANDIDATE_TOOL_CALLS: false,
        fields::APPROVAL_PENDING: false,
        fields::ALREADY_STREAMED: false,
    });

    if turn.intent() != Some("tool") {
        // regular branch: the full answer streams from here
        let answer =
            super::writer::stream_answer(&ctx, thread_id.as_deref(), turn.messages()).await?;
        partial[fields::ALREADY_STREAMED] = json!(true);
        partial[fields::FINAL_ANSWER] = json!(answer);
        partial[fields::MESSAGES] = json!([serde_json::to_value(Message::assistant(answer))
            .map_err(GraphError::Serde)?]);
        return Ok(partial);
    }

    // tool branch: one-shot probe for candidate tool calls
    let mut messages = turn.messages();
    messages.insert(
        0,
        Message::system(
            "Decide whether any of the available tools should run for the \
             user's request. Call a tool if so; otherwise reply normally.",
        ),
    );
    let probe = ctx
        .model
        .chat(ChatRequest::new(messages).with_tools(probe_tools()))
        .await?;

    let tool_calls = probe.message.tool_calls.clone().unwrap_or_default();
    partial[fields::CANDIDATE_TOOL_CALLS] = json!(!tool_calls.is_empty());

    let approval_calls: Vec<_> = tool_calls
        .iter()
        .filter(|call| APPROVAL_NEEDED_TOOLS.contains(&call.name.as_str()))
        .collect();
    if !approval_calls.is_empty() {
        if let Some(thread_id) = &thread_id {
            ctx.events.emit(
                thread_id,
                SseEvent::ApprovalRequired {
                    thread_id: thread_id.clone(),
                    tool_calls: serde_json::to_value(&approval_calls)
                        .map_err(GraphError::Serde)?,
                },
            );
        }
        partial[fields::APPROVAL_PENDING] = json!(true);
    }

    Ok(partial)
}

/// Routing after Collect-Base: stop on approval or an already-streamed
/// answer, plan when the probe found candidates, otherwise answer plainly.
pub fn route_after_collect(state: &Value) -> RouteResult {
    let turn = TurnState(state);
    if turn.bool_field(fields::APPROVAL_PENDING) || turn.bool_field(fields::ALREADY_STREAMED) {
        return RouteResult::End;
    }
    if turn.bool_field(fields::CANDIDATE_TOOL_CALLS) {
        RouteResult::Node("planner".into())
    } else {
        RouteResult::Node("simple_response".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_stops_on_approval() {
        let state = json!({"approval_pending": true, "candidate_tool_calls": true});
        assert!(matches!(route_after_collect(&state), RouteResult::End));
    }

    #[test]
    fn test_route_stops_after_streamed_regular_answer() {
        let state = json!({"already_streamed": true});
        assert!(matches!(route_after_collect(&state), RouteResult::End));
    }

    #[test]
    fn test_route_plans_on_candidates() {
        let state = json!({"intent": "tool", "candidate_tool_calls": true});
        match route_after_collect(&state) {
            RouteResult::Node(n) => assert_eq!(n, "planner"),
            _ => panic!("expected planner"),
        }
    }

    #[test]
    fn test_route_simple_response_without_candidates() {
        let state = json!({"intent": "tool", "candidate_tool_calls": false});
        match route_after_collect(&state) {
            RouteResult::Node(n) => assert_eq!(n, "simple_response"),
            _ => panic!("expected simple_response"),
        }
    }

    #[test]
    fn test_probe_offers_approval_tools() {
        let names: Vec<String> = probe_tools().into_iter().map(|t| t.name).collect();
        for tool in APPROVAL_NEEDED_TOOLS {
            assert!(names.iter().any(|n| n == tool), "{tool} missing from probe");
        }
        // the probe surface is wider than the approval list
        assert!(names.iter().any(|n| n == "sql_query"));
    }
}
