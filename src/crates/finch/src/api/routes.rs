//! Route handlers

use crate::api::auth::{auth_middleware, AuthUser};
use crate::api::AppState;
use crate::error::{AppError, Result};
use crate::retrieval::{kg_call_for_tool, KgRequest};
use crate::state::fields;
use crate::streaming::{finish_chunk, role_chunk, EventSink, SseEvent, EVENT_QUEUE_DEPTH};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method};
use axum::middleware;
use axum::response::sse::Sse;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use flow_core::{ContentPart, Message, MessageContent, RunConfig, StepEvent};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.ctx.settings.cors_origins);
    Router::new()
        .route("/api/threads", post(create_thread))
        .route("/api/threads/:thread_id/runs/stream", post(run_stream))
        .route("/api/threads/:thread_id/messages", get(get_messages))
        .route("/api/threads/:thread_id", delete(remove_thread))
        .route("/api/threads/:thread_id/tools/approval", post(approve_tool))
        .route("/health", get(health))
        .route("/", get(root))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    role: String,
    content: Value,
}

#[derive(Debug, Default, Deserialize)]
struct StreamInput {
    #[serde(default)]
    messages: Vec<IncomingMessage>,
    #[serde(default)]
    file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamRequest {
    input: StreamInput,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalRequest {
    tool_name: String,
    #[serde(default)]
    args: Value,
    approve: bool,
    #[serde(default)]
    tool_call_id: Option<String>,
}

async fn create_thread(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>> {
    let user = user.ok_or(AppError::Auth)?;
    let thread_id = Uuid::new_v4().to_string();
    state
        .ctx
        .threads
        .ensure_thread(&thread_id, Some(&user))
        .await?;
    Ok(Json(json!({ "thread_id": thread_id })))
}

async fn run_stream(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<StreamRequest>,
) -> impl IntoResponse {
    let (tx, rx) = mpsc::channel::<SseEvent>(EVENT_QUEUE_DEPTH);
    tokio::spawn(run_producer(state, thread_id, user, request.input, tx));

    let stream = ReceiverStream::new(rx).map(|event| {
        Ok::<_, Infallible>(
            axum::response::sse::Event::default()
                .event(event.name().to_string())
                .data(event.data().to_string()),
        )
    });
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("X-Accel-Buffering", HeaderValue::from_static("no"));
    response
}

fn convert_incoming(message: &IncomingMessage) -> Message {
    let content = match &message.content {
        Value::String(text) => MessageContent::Text(text.clone()),
        Value::Array(parts) => {
            let converted: Vec<ContentPart> = parts
                .iter()
                .filter_map(|part| match part.get("type").and_then(Value::as_str) {
                    Some("text") => part
                        .get("text")
                        .and_then(Value::as_str)
                        .map(ContentPart::text),
                    Some("image_url") => part
                        .get("url")
                        .or_else(|| part.pointer("/image_url/url"))
                        .and_then(Value::as_str)
                        .map(ContentPart::image_url),
                    _ => None,
                })
                .collect();
            MessageContent::Parts(converted)
        }
        other => MessageContent::Text(other.to_string()),
    };
    match message.role.as_str() {
        "system" => Message::system(content),
        "assistant" | "ai" => Message::assistant(content),
        _ => Message::human(content),
    }
}

/// Producer task: ownership check, graph run, persistence, event delivery.
/// All errors end the stream with a single `error` event.
async fn run_producer(
    state: Arc<AppState>,
    thread_id: String,
    user: Option<String>,
    input: StreamInput,
    tx: mpsc::Sender<SseEvent>,
) {
    let ctx = &state.ctx;
    let sink = EventSink::new(tx, ctx.settings.trace_events);

    // ownership: an owned thread streams only for its owner
    match ctx.threads.get_thread_owner(&thread_id).await {
        Ok(Some(owner)) if Some(&owner) != user.as_ref() => {
            sink.send(SseEvent::Error {
                error: "Thread not found".into(),
                kind: "HTTPException".into(),
            });
            return;
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            if let Err(err) = ctx.threads.ensure_thread(&thread_id, user.as_deref()).await {
                error!(error = %err, "failed to ensure thread");
                sink.send(SseEvent::Error {
                    error: "internal error".into(),
                    kind: "Storage".into(),
                });
                return;
            }
        }
        Err(err) => {
            error!(error = %err, "ownership check failed");
            sink.send(SseEvent::Error {
                error: "internal error".into(),
                kind: "Storage".into(),
            });
            return;
        }
    }

    let messages: Vec<Message> = input.messages.iter().map(convert_incoming).collect();

    // persist the incoming user turn before running
    if let Some(last_user) = messages
        .iter()
        .rev()
        .find(|m| m.role == flow_core::MessageRole::Human)
    {
        let content = json!({"content": last_user.text().unwrap_or_default()});
        if let Err(err) = ctx
            .threads
            .insert_message(&thread_id, "user", &content, user.as_deref())
            .await
        {
            error!(error = %err, "failed to persist user message");
        }
    }

    ctx.events.register(&thread_id, sink.clone());
    sink.send(role_chunk());

    let mut input_state = json!({
        fields::MESSAGES: messages,
        fields::THREAD_ID: thread_id,
        fields::USER_ID: user,
    });
    if let Some(file_id) = &input.file_id {
        input_state[fields::FILE_ID] = json!(file_id);
    }

    let config = RunConfig::new(thread_id.clone(), user.clone());
    let outcome = if ctx.settings.debug_graph_events {
        // debug execution path: superstep events surface on the stream
        let (step_tx, mut step_rx) = mpsc::unbounded_channel::<StepEvent>();
        let debug_sink = sink.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = step_rx.recv().await {
                debug_sink.trace(
                    "debug",
                    json!({
                        "step": event.step,
                        "nodes": event.nodes,
                        "updated_channels": event.updated_channels,
                    }),
                );
            }
        });
        let outcome = state
            .runner
            .invoke_with_observer(input_state, &config, step_tx)
            .await;
        let _ = forwarder.await;
        outcome
    } else {
        state.runner.invoke(input_state, &config).await
    };

    match outcome {
        Ok(final_state) => {
            let final_answer = final_state
                .get(fields::FINAL_ANSWER)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let message_id = if final_answer.is_empty() {
                String::new()
            } else {
                ctx.threads
                    .insert_message(
                        &thread_id,
                        "assistant",
                        &json!({"content": final_answer}),
                        user.as_deref(),
                    )
                    .await
                    .unwrap_or_else(|err| {
                        error!(error = %err, "failed to persist assistant message");
                        String::new()
                    })
            };
            sink.send(finish_chunk());
            sink.send(SseEvent::Complete { message_id });
            info!(thread_id, "run complete");
        }
        Err(err) => {
            error!(thread_id, error = %err, "graph run failed");
            sink.send(SseEvent::Error {
                error: err.to_string(),
                kind: "GraphError".into(),
            });
        }
    }

    ctx.events.remove(&thread_id);
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>> {
    let messages = state
        .ctx
        .threads
        .load_messages(&thread_id, user.as_deref())
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(json!({ "thread_id": thread_id, "messages": messages })))
}

async fn remove_thread(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Value>> {
    let owner = state.ctx.threads.get_thread_owner(&thread_id).await?;
    if owner.is_none() || owner.as_deref() != user.as_deref() {
        return Err(AppError::NotFound);
    }
    state
        .ctx
        .threads
        .delete_thread(&thread_id, user.as_deref())
        .await?;
    state.ctx.saver.delete_thread(&thread_id).await?;
    Ok(Json(json!({ "message": "thread deleted" })))
}

async fn approve_tool(
    State(state): State<Arc<AppState>>,
    Path(thread_id): Path<String>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(request): Json<ApprovalRequest>,
) -> Result<Json<Value>> {
    let ctx = &state.ctx;
    let owner = ctx.threads.get_thread_owner(&thread_id).await?;
    if owner.is_none() || owner.as_deref() != user.as_deref() {
        return Err(AppError::NotFound);
    }

    let call_type = kg_call_for_tool(&request.tool_name)
        .ok_or_else(|| AppError::Validation(format!("unknown tool '{}'", request.tool_name)))?;

    // the decision itself is part of the conversation record
    ctx.threads
        .insert_message(
            &thread_id,
            "tool",
            &json!({
                "type": "approval_result",
                "tool_name": request.tool_name,
                "approve": request.approve,
                "tool_call_id": request.tool_call_id,
            }),
            user.as_deref(),
        )
        .await?;

    if !request.approve {
        return Ok(Json(json!({ "ok": true })));
    }

    let mut args = request.args.clone();
    if !args.is_object() {
        args = json!({});
    }
    args["approved"] = json!(true);
    let records = tokio::time::timeout(
        ctx.settings.worker_timeout,
        ctx.kg.call(&KgRequest { call_type, args }),
    )
    .await
    .map_err(|_| AppError::Validation("tool execution timed out".into()))??;

    let result = serde_json::to_value(&records)
        .map_err(|e| AppError::Storage(e.to_string()))?;
    ctx.threads
        .insert_message(
            &thread_id,
            "tool",
            &json!({
                "type": "tool_result",
                "tool_name": request.tool_name,
                "result": result,
            }),
            user.as_deref(),
        )
        .await?;
    ctx.events.emit(
        &thread_id,
        SseEvent::ToolResult(json!({
            "tool_name": request.tool_name,
            "result": result,
        })),
    );

    Ok(Json(json!({ "ok": true, "result": result })))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn root() -> Json<Value> {
    Json(json!({
        "service": "finch",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
    }))
}
