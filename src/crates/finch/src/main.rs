use anyhow::Context;
use finch::api::AppState;
use finch::config::{Provider, Settings};
use finch::context::AppContext;
use finch::retrieval::Unconfigured;
use finch::store::{MemoryThreadStore, PgThreadStore, ThreadStore};
use finch::streaming::EventRegistry;
use flow_checkpoint::{CheckpointSaver, InMemorySaver, PostgresSaver};
use flow_core::llm::ChatModel;
use llm::{DeepseekClient, OpenAiClient};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Settings::from_env().context("invalid configuration")?;

    let model: Arc<dyn ChatModel> = match settings.provider {
        Provider::Deepseek => Arc::new(DeepseekClient::new(settings.llm.clone())?),
        Provider::OpenAi => Arc::new(OpenAiClient::new(settings.llm.clone())?),
    };

    let (saver, threads): (Arc<dyn CheckpointSaver>, Arc<dyn ThreadStore>) =
        match &settings.pg_dsn {
            Some(dsn) => {
                let saver = PostgresSaver::new(dsn.clone())
                    .with_connection_max_age(settings.connection_max_age);
                let threads = PgThreadStore::connect(dsn)
                    .await
                    .context("failed to connect thread store")?;
                info!("durable persistence enabled");
                (Arc::new(saver), Arc::new(threads))
            }
            None => {
                warn!(
                    "PG_DSN is not set: falling back to in-memory checkpoints and threads. \
                     Runs will NOT survive a restart; do not use this in production."
                );
                (
                    Arc::new(InMemorySaver::new()),
                    Arc::new(MemoryThreadStore::new()),
                )
            }
        };

    let ctx = Arc::new(AppContext {
        settings: settings.clone(),
        model,
        saver,
        threads,
        sql: Arc::new(Unconfigured),
        vector: Arc::new(Unconfigured),
        kg: Arc::new(Unconfigured),
        slots: Arc::new(Unconfigured),
        events: EventRegistry::new(),
    });

    let runner = finch::graph::build_graph(ctx.clone()).context("failed to build graph")?;
    let app = finch::api::router(AppState::new(ctx, runner));

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "finch listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
