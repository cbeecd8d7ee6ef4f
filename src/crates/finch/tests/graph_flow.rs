//! End-to-end turn scenarios over the compiled graph with mock backends

use async_trait::async_trait;
use finch::config::{Provider, Settings};
use finch::context::AppContext;
use finch::graph::build_graph;
use finch::retrieval::{
    GraphService, KgRequest, SlotBundle, SlotExtractor, SqlQueryInput, SqlQueryService,
    Unconfigured, VectorQuery, VectorSearchService,
};
use finch::state::{fields, EvidenceRecord, EvidenceSource};
use finch::store::MemoryThreadStore;
use finch::streaming::{EventRegistry, EventSink, SseEvent};
use flow_checkpoint::{CheckpointSaver, InMemorySaver};
use flow_core::llm::{ChatChunk, ChatModel, ChatRequest, ChatResponse, ChatStream};
use flow_core::{Message, Result as GraphResult, RunConfig, ToolCall};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Chat model replaying scripted replies in order, then a default.
#[derive(Clone, Default)]
struct ScriptedModel {
    responses: Arc<Mutex<VecDeque<Message>>>,
    chat_calls: Arc<Mutex<usize>>,
}

impl ScriptedModel {
    fn script(responses: Vec<Message>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            chat_calls: Arc::new(Mutex::new(0)),
        }
    }

    fn next(&self) -> Message {
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Message::assistant("default scripted answer"))
    }

    fn chat_call_count(&self) -> usize {
        *self.chat_calls.lock()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn chat(&self, _request: ChatRequest) -> GraphResult<ChatResponse> {
        *self.chat_calls.lock() += 1;
        Ok(ChatResponse {
            message: self.next(),
            usage: None,
            metadata: HashMap::new(),
        })
    }

    async fn stream(&self, _request: ChatRequest) -> GraphResult<ChatStream> {
        let text = self.next().text().unwrap_or_default().to_string();
        let mid = text.len() / 2;
        let mid = (0..=mid).rev().find(|i| text.is_char_boundary(*i)).unwrap_or(0);
        let (a, b) = text.split_at(mid);
        let chunks = vec![
            ChatChunk {
                delta: a.to_string(),
                content: a.to_string(),
                tool_calls: None,
                finished: false,
            },
            ChatChunk {
                delta: b.to_string(),
                content: text.clone(),
                tool_calls: None,
                finished: true,
            },
        ];
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }

    fn clone_box(&self) -> Box<dyn ChatModel> {
        Box::new(self.clone())
    }
}

#[derive(Clone)]
struct CountingSql {
    rows: Vec<EvidenceRecord>,
    calls: Arc<Mutex<usize>>,
}

#[async_trait]
impl SqlQueryService for CountingSql {
    async fn query(&self, _input: &SqlQueryInput) -> finch::Result<Vec<EvidenceRecord>> {
        *self.calls.lock() += 1;
        Ok(self.rows.clone())
    }
}

#[derive(Clone)]
struct CountingVector {
    hits: Vec<EvidenceRecord>,
    calls: Arc<Mutex<usize>>,
}

#[async_trait]
impl VectorSearchService for CountingVector {
    async fn search(&self, _query: &VectorQuery) -> finch::Result<Vec<EvidenceRecord>> {
        *self.calls.lock() += 1;
        Ok(self.hits.clone())
    }
}

#[derive(Clone)]
struct CountingKg {
    calls: Arc<Mutex<usize>>,
}

#[async_trait]
impl GraphService for CountingKg {
    async fn call(&self, _request: &KgRequest) -> finch::Result<Vec<EvidenceRecord>> {
        *self.calls.lock() += 1;
        Ok(vec![])
    }
}

struct FixedSlots(SlotBundle);

#[async_trait]
impl SlotExtractor for FixedSlots {
    async fn extract(&self, _utterance: &str) -> finch::Result<SlotBundle> {
        Ok(self.0.clone())
    }
}

struct Harness {
    ctx: Arc<AppContext>,
    events: mpsc::Receiver<SseEvent>,
}

fn harness(model: ScriptedModel, ctx_tweak: impl FnOnce(&mut AppContext)) -> Harness {
    let mut ctx = AppContext {
        settings: Settings::offline(Provider::Deepseek),
        model: Arc::new(model),
        saver: Arc::new(InMemorySaver::new()),
        threads: Arc::new(MemoryThreadStore::new()),
        sql: Arc::new(Unconfigured),
        vector: Arc::new(Unconfigured),
        kg: Arc::new(Unconfigured),
        slots: Arc::new(Unconfigured),
        events: EventRegistry::new(),
    };
    ctx_tweak(&mut ctx);
    let ctx = Arc::new(ctx);

    let (tx, rx) = mpsc::channel(256);
    ctx.events
        .register("thread-1", EventSink::new(tx, true));
    Harness { ctx, events: rx }
}

fn input_state(text: &str) -> Value {
    json!({
        "messages": [{"id": "m1", "role": "human", "content": text}],
        "thread_id": "thread-1",
        "user_id": "user-1",
    })
}

fn run_config() -> RunConfig {
    RunConfig::new("thread-1", Some("user-1".into()))
}

fn drain_events(rx: &mut mpsc::Receiver<SseEvent>) -> Vec<SseEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn sql_row(id: i64) -> EvidenceRecord {
    EvidenceRecord::new(EvidenceSource::Sql, "", 1.0)
        .with_metadata("id", json!(id))
        .with_metadata("order_id", json!(id))
        .with_metadata("pay_price", json!(42.5))
}

fn vec_hit(text: &str) -> EvidenceRecord {
    EvidenceRecord::new(EvidenceSource::Vector, text, 0.9)
}

fn tool_call(name: &str) -> ToolCall {
    ToolCall {
        id: format!("call-{name}"),
        name: name.to_string(),
        args: json!({}),
    }
}

/// A plan the "planner" reply carries as plain JSON content
fn plan_reply(plan: Value) -> Message {
    Message::assistant(plan.to_string())
}

// Scenario: pure conversation. Regular intent streams from collect_base,
// the planner never runs, and the partial_ai contents grow monotonically.
#[tokio::test]
async fn test_pure_conversation() {
    let model = ScriptedModel::script(vec![
        Message::assistant("regular"),            // intent_detect
        Message::assistant("Hello! How can I help?"), // collect_base stream
    ]);
    let mut h = harness(model.clone(), |_| {});
    let runner = build_graph(h.ctx.clone()).unwrap();

    let out = runner.invoke(input_state("hello"), &run_config()).await.unwrap();

    assert_eq!(out[fields::INTENT], "regular");
    assert_eq!(out[fields::ALREADY_STREAMED], true);
    assert_eq!(out[fields::FINAL_ANSWER], "Hello! How can I help?");
    assert!(out.get(fields::PLAN).is_none() || out[fields::PLAN].is_null());
    // only the intent classification used chat; the answer streamed
    assert_eq!(model.chat_call_count(), 1);

    let events = drain_events(&mut h.events);
    let partials: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            SseEvent::PartialAi { content, .. } => Some(content.clone()),
            _ => None,
        })
        .collect();
    assert!(!partials.is_empty());
    for pair in partials.windows(2) {
        assert!(pair[1].starts_with(&pair[0]), "partial_ai content must be monotonic");
    }
    assert_eq!(partials.last().unwrap(), "Hello! How can I help?");
}

// Scenario: SQL-only order query. One stage, one sql step; the fast path
// skips the second stage and the writer answers from the rows.
#[tokio::test]
async fn test_sql_only_order_query() {
    let sql = CountingSql {
        rows: (1..=10).map(sql_row).collect(),
        calls: Arc::new(Mutex::new(0)),
    };
    let vector = CountingVector {
        hits: vec![],
        calls: Arc::new(Mutex::new(0)),
    };
    let model = ScriptedModel::script(vec![
        Message::assistant("tool"), // intent_detect
        Message::assistant("").with_tool_calls(vec![tool_call("sql_query")]), // probe
        plan_reply(json!({
            "stages": [
                {"parallel": false, "steps": [{"call": "sql", "args": {
                    "table": "order", "fields": ["*"],
                    "order_by": [{"field": "create_time", "direction": "DESC"}],
                    "limit": 10
                }}]},
                {"parallel": false, "steps": [{"call": "vec", "args": {"query": "orders"}}]}
            ]
        })),
        Message::assistant("Here are your latest 10 orders."), // writer stream
    ]);
    let sql_clone = sql.clone();
    let vector_clone = vector.clone();
    let mut h = harness(model, move |ctx| {
        ctx.sql = Arc::new(sql_clone);
        ctx.vector = Arc::new(vector_clone);
    });
    let runner = build_graph(h.ctx.clone()).unwrap();

    let out = runner
        .invoke(input_state("Show me the latest 10 orders."), &run_config())
        .await
        .unwrap();

    assert_eq!(out[fields::AGG_ROUTE], "fast");
    assert_eq!(out[fields::WAITING], 0);
    assert_eq!(out[fields::SQL_RESULTS].as_array().unwrap().len(), 10);
    assert_eq!(out[fields::MERGED].as_array().unwrap().len(), 10);
    assert_eq!(out[fields::FINAL_ANSWER], "Here are your latest 10 orders.");
    assert_eq!(*sql.calls.lock(), 1);
    // fast path: the second stage never dispatched
    assert_eq!(*vector.calls.lock(), 0);

    let events = drain_events(&mut h.events);
    assert!(events.iter().any(|e| e.name() == "plan_ready"));
    assert!(events.iter().any(|e| e.name() == "on_tool_end"));
}

// Scenario: parallel SQL + vector stage. Both workers run, the barrier
// returns to zero, merged is the concatenation, and the writer sees mixed
// evidence.
#[tokio::test]
async fn test_parallel_sql_and_vector() {
    let sql = CountingSql {
        rows: vec![sql_row(1), sql_row(2)],
        calls: Arc::new(Mutex::new(0)),
    };
    let vector = CountingVector {
        hits: vec![vec_hit("quarterly report chunk")],
        calls: Arc::new(Mutex::new(0)),
    };
    let model = ScriptedModel::script(vec![
        Message::assistant("tool"),
        Message::assistant("").with_tool_calls(vec![tool_call("sql_query")]),
        plan_reply(json!({
            "stages": [{"parallel": true, "steps": [
                {"call": "sql", "args": {"table": "order", "fields": ["*"], "limit": 10}},
                {"call": "vec", "args": {"query": "quarterly report"}}
            ]}]
        })),
        Message::assistant("Orders and documents combined."), // writer
    ]);
    let sql_clone = sql.clone();
    let vector_clone = vector.clone();
    let mut h = harness(model, move |ctx| {
        ctx.sql = Arc::new(sql_clone);
        ctx.vector = Arc::new(vector_clone);
    });
    let runner = build_graph(h.ctx.clone()).unwrap();

    let out = runner
        .invoke(
            input_state("Compare my recent orders with the quarterly report"),
            &run_config(),
        )
        .await
        .unwrap();

    assert_eq!(*sql.calls.lock(), 1);
    assert_eq!(*vector.calls.lock(), 1);
    assert_eq!(out[fields::WAITING], 0);
    let merged = out[fields::MERGED].as_array().unwrap();
    assert_eq!(merged.len(), 3);
    assert_eq!(out[fields::AGG_ROUTE], "done");
    assert_eq!(out[fields::FINAL_ANSWER], "Orders and documents combined.");

    let events = drain_events(&mut h.events);
    let dispatch = events.iter().find(|e| e.name() == "dispatch").unwrap();
    assert_eq!(dispatch.data()["steps"], 2);
}

// Scenario: a knowledge-graph ingest proposal stops the run for approval.
#[tokio::test]
async fn test_kg_write_requires_approval() {
    let kg = CountingKg {
        calls: Arc::new(Mutex::new(0)),
    };
    let model = ScriptedModel::script(vec![
        Message::assistant("tool"),
        Message::assistant("").with_tool_calls(vec![tool_call("graph_ingest_commit")]),
    ]);
    let kg_clone = kg.clone();
    let mut h = harness(model, move |ctx| {
        ctx.kg = Arc::new(kg_clone);
    });
    let runner = build_graph(h.ctx.clone()).unwrap();

    let out = runner
        .invoke(
            input_state("Remember that ACME acquired Initech in 2024"),
            &run_config(),
        )
        .await
        .unwrap();

    assert_eq!(out[fields::APPROVAL_PENDING], true);
    assert!(out.get(fields::FINAL_ANSWER).is_none() || out[fields::FINAL_ANSWER].is_null());
    // the write never executed
    assert_eq!(*kg.calls.lock(), 0);

    let events = drain_events(&mut h.events);
    let approval = events
        .iter()
        .find(|e| e.name() == "approval_required")
        .expect("approval_required event");
    assert_eq!(approval.data()["thread_id"], "thread-1");
    assert_eq!(
        approval.data()["tool_calls"][0]["name"],
        "graph_ingest_commit"
    );
}

// Scenario: tool intent but the probe proposes nothing; the simple
// response path streams over the conversation.
#[tokio::test]
async fn test_simple_response_without_candidates() {
    let model = ScriptedModel::script(vec![
        Message::assistant("tool"),
        Message::assistant("no tools needed"), // probe, no tool calls
        Message::assistant("Just a plain answer."), // simple_response stream
    ]);
    let h = harness(model, |_| {});
    let runner = build_graph(h.ctx.clone()).unwrap();

    let out = runner
        .invoke(input_state("what do you think?"), &run_config())
        .await
        .unwrap();

    assert_eq!(out[fields::CANDIDATE_TOOL_CALLS], false);
    assert_eq!(out[fields::FINAL_ANSWER], "Just a plain answer.");
}

// The planner falls back to the keyword router when the model emits junk,
// and the run still completes end to end.
#[tokio::test]
async fn test_planner_fallback_keeps_run_alive() {
    let sql = CountingSql {
        rows: vec![sql_row(9)],
        calls: Arc::new(Mutex::new(0)),
    };
    let model = ScriptedModel::script(vec![
        Message::assistant("tool"),
        Message::assistant("").with_tool_calls(vec![tool_call("sql_query")]),
        Message::assistant("I refuse to emit JSON"), // planner junk
        Message::assistant("Fallback answered from orders."),
    ]);
    let sql_clone = sql.clone();
    let h = harness(model, move |ctx| {
        ctx.sql = Arc::new(sql_clone);
    });
    let runner = build_graph(h.ctx.clone()).unwrap();

    let out = runner
        .invoke(input_state("show my recent orders"), &run_config())
        .await
        .unwrap();

    // keyword fallback routed the order lexicon to sql
    assert_eq!(*sql.calls.lock(), 1);
    assert_eq!(out[fields::FINAL_ANSWER], "Fallback answered from orders.");
}

// Signals force the tool intent without consulting the model.
#[tokio::test]
async fn test_signal_rule_skips_llm_classification() {
    let model = ScriptedModel::script(vec![
        // first chat call is the probe, not intent classification
        Message::assistant("no tools"),
        Message::assistant("answered"),
    ]);
    let h = harness(model.clone(), |ctx| {
        ctx.slots = Arc::new(FixedSlots(SlotBundle {
            slots: serde_json::Map::new(),
            signals: vec!["has_datetime".into()],
            composed: None,
        }));
    });
    let runner = build_graph(h.ctx.clone()).unwrap();

    let out = runner
        .invoke(input_state("orders from last week"), &run_config())
        .await
        .unwrap();

    assert_eq!(out[fields::INTENT], "tool");
    // probe + simple_response stream only; no classification chat
    assert_eq!(model.chat_call_count(), 1);
}

// Checkpoints land for every superstep and the final state is recoverable
// from the saver alone.
#[tokio::test]
async fn test_final_state_is_checkpointed() {
    let saver = Arc::new(InMemorySaver::new());
    let model = ScriptedModel::script(vec![
        Message::assistant("regular"),
        Message::assistant("checkpointed!"),
    ]);
    let saver_clone = saver.clone();
    let h = harness(model, move |ctx| {
        ctx.saver = saver_clone;
    });
    let runner = build_graph(h.ctx.clone()).unwrap();
    runner.invoke(input_state("hello"), &run_config()).await.unwrap();

    let tuple = saver
        .get_tuple(&flow_checkpoint::CheckpointConfig::new("thread-1"))
        .await
        .unwrap()
        .expect("latest checkpoint");
    assert_eq!(tuple.checkpoint.channel_values["final_answer"], "checkpointed!");
    assert!(saver.checkpoint_count("thread-1") >= 2);
}
