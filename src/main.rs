//! Service entrypoint: wires the core against in-memory capability
//! implementations and serves the HTTP surface.
//!
//! Production deployments replace the store/bus bindings with managed
//! engines; everything above those traits is identical.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenvy::dotenv;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use sherpa::bus::MemoryBus;
use sherpa::clock::{SharedClock, SystemClock};
use sherpa::config::Config;
use sherpa::delivery::DeliveryGateway;
use sherpa::engine::ExecutionEngine;
use sherpa::intake::{AppState, IntakeService, router};
use sherpa::jobs::{DurationEstimator, JobRegistry, Reaper};
use sherpa::llm::default_registry;
use sherpa::resolver::ConfigResolver;
use sherpa::session::SessionService;
use sherpa::store::{MemoryBlobStore, MemoryStore};
use sherpa::templates::TemplateService;
use sherpa::topics::TopicRegistry;
use sherpa::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "sherpa", about = "AI coaching backend core")]
struct Args {
    /// Bind host; overrides SHERPA_HOST.
    #[arg(long)]
    host: Option<String>,

    /// Bind port; overrides SHERPA_PORT.
    #[arg(long)]
    port: Option<u16>,

    /// Seed a demo topic, templates, and configuration on startup.
    #[arg(long)]
    seed_demo: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let clock: SharedClock = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let bus = Arc::new(MemoryBus::new());

    let templates = Arc::new(TemplateService::new(store.clone(), blobs.clone()));
    let models = Arc::new(default_registry(&config.llm));
    let resolver = Arc::new(ConfigResolver::new(
        store.clone(),
        clock.clone(),
        models.clone(),
        templates.clone(),
    ));
    let topics = Arc::new(TopicRegistry::new(store.clone()));
    let engine = Arc::new(ExecutionEngine::new(
        resolver.clone(),
        templates.clone(),
        models.clone(),
        config.llm.deadline,
    ));

    if args.seed_demo {
        seed_demo(&topics, &resolver, &blobs, store.as_ref()).await?;
    }

    let registry = Arc::new(JobRegistry::new(
        store.clone(),
        clock.clone(),
        config.jobs.clone(),
    ));
    let sessions = Arc::new(SessionService::new(
        store.clone(),
        clock.clone(),
        config.session.clone(),
    ));
    let estimator = Arc::new(DurationEstimator::new());

    let intake = Arc::new(IntakeService::new(
        sessions.clone(),
        registry.clone(),
        topics.clone(),
        bus.clone(),
        estimator.clone(),
    ));
    let delivery = Arc::new(DeliveryGateway::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = Arc::new(Worker::new(
        registry.clone(),
        sessions,
        topics,
        engine,
        bus.clone(),
        estimator,
        config.worker.clone(),
    ));
    let worker_task = worker
        .start(shutdown_rx.clone())
        .await
        .map_err(|e| anyhow::anyhow!("worker failed to subscribe: {e}"))?;

    let reaper = Reaper::new(registry, config.jobs.clone());
    let reaper_rx = shutdown_rx.clone();
    let reaper_task = tokio::spawn(async move { reaper.run(reaper_rx).await });

    let delivery_task = delivery
        .clone()
        .start(bus.clone(), shutdown_rx.clone())
        .await
        .map_err(|e| anyhow::anyhow!("delivery failed to subscribe: {e}"))?;

    let app = router(AppState { intake, delivery });
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "sherpa listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Stop the background loops and give them a moment to drain.
    let _ = shutdown_tx.send(true);
    let drain = async {
        let _ = worker_task.await;
        let _ = reaper_task.await;
        let _ = delivery_task.await;
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tracing::warn!("background tasks did not drain in time");
    }

    Ok(())
}

/// Seed one coaching topic with its templates and default configuration so a
/// fresh process has something to serve.
async fn seed_demo(
    topics: &TopicRegistry,
    resolver: &ConfigResolver,
    blobs: &MemoryBlobStore,
    store: &dyn sherpa::store::KVStore,
) -> anyhow::Result<()> {
    use sherpa::jobs::JobKind;
    use sherpa::resolver::Configuration;
    use sherpa::store::tables;
    use sherpa::templates::TemplateRecord;
    use sherpa::topics::{ParamSchema, PromptRefs, Topic};

    blobs
        .put_text(
            "prompts/goal-setting-system",
            "You are a supportive goal-setting coach. Keep replies short and \
             end the conversation with [SESSION_COMPLETE] once the user has a \
             concrete goal.",
        )
        .await;
    blobs.put_text("prompts/goal-setting-user", "{{ message }}").await;

    for (id, blob_ref) in [
        ("goal-setting-system", "prompts/goal-setting-system"),
        ("goal-setting-user", "prompts/goal-setting-user"),
    ] {
        let record = TemplateRecord {
            template_id: id.into(),
            template_code: id.replace('-', "_").to_uppercase(),
            interaction_code: "goal-setting".into(),
            version: 1,
            blob_ref: blob_ref.into(),
            required_parameters: vec![],
            is_active: true,
        };
        store
            .put(tables::TEMPLATES, id, serde_json::to_value(&record)?)
            .await?;
    }

    topics
        .put(&Topic {
            topic_id: "goal-setting".into(),
            kind: JobKind::CoachingMessage,
            interaction_code: "goal-setting".into(),
            model_code: "gpt-4o".into(),
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            prompt_refs: PromptRefs {
                system: "goal-setting-system".into(),
                user: "goal-setting-user".into(),
                extraction: None,
            },
            param_schema: ParamSchema {
                required: vec!["message".into()],
                optional: vec![],
            },
            result_schema: Some(serde_json::json!({
                "type": "object",
                "required": ["goal"],
                "properties": {
                    "goal": {"type": "string"},
                    "first_step": {"type": "string"}
                }
            })),
            default_max_turns: 5,
            end_marker: None,
            aggregation_period_count: None,
            is_active: true,
        })
        .await?;

    resolver
        .put(&Configuration {
            config_id: "goal-setting-default".into(),
            interaction_code: "goal-setting".into(),
            tier: None,
            model_code: "gpt-4o".into(),
            template_id: "goal-setting-user".into(),
            temperature: 0.7,
            max_tokens: 1024,
            is_active: true,
            effective_from: None,
            effective_until: None,
        })
        .await?;

    tracing::info!("seeded demo topic 'goal-setting'");
    Ok(())
}
