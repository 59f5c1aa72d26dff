//! End-to-end scenarios: intake → bus → worker → terminal envelope.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::watch;

use sherpa::bus::{BusTopic, Envelope, EnvelopeStream, EventBus, MemoryBus};
use sherpa::clock::{ManualClock, SharedClock};
use sherpa::config::{JobsConfig, SessionConfig, WorkerConfig};
use sherpa::engine::ExecutionEngine;
use sherpa::error::{ErrorCode, IntakeError, JobError};
use sherpa::intake::{AuthContext, IntakeService};
use sherpa::jobs::{DurationEstimator, JobKind, JobRegistry, JobStatus, Reaper};
use sherpa::llm::{ModelCapabilities, ModelRegistry, ScriptedProvider};
use sherpa::resolver::{ConfigResolver, Configuration};
use sherpa::session::{SessionService, SessionStatus};
use sherpa::store::{KVStore, MemoryBlobStore, MemoryStore, tables};
use sherpa::templates::{TemplateRecord, TemplateService};
use sherpa::topics::{ParamSchema, PromptRefs, Topic, TopicRegistry};
use sherpa::worker::Worker;

const TOPIC: &str = "goal-setting";

struct Harness {
    intake: IntakeService,
    sessions: Arc<SessionService>,
    registry: Arc<JobRegistry>,
    reaper: Reaper,
    clock: ManualClock,
    terminal: EnvelopeStream,
    _shutdown: watch::Sender<bool>,
}

struct HarnessOptions {
    replies: Vec<&'static str>,
    result_schema: Option<Value>,
    provider_delay: Option<Duration>,
    deadline: Duration,
    duplicate_deliveries: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            replies: Vec::new(),
            result_schema: None,
            provider_delay: None,
            deadline: Duration::from_secs(5),
            duplicate_deliveries: false,
        }
    }
}

async fn harness(options: HarnessOptions) -> Harness {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let clock = ManualClock::default();
    let shared_clock: SharedClock = Arc::new(clock.clone());
    let bus = Arc::new(if options.duplicate_deliveries {
        MemoryBus::with_duplicate_deliveries()
    } else {
        MemoryBus::new()
    });

    // Prompt content and metadata.
    blobs
        .put_text("prompts/system", "You are a goal coach.")
        .await;
    blobs.put_text("prompts/user", "{{ message }}").await;
    for (id, blob_ref) in [
        ("tmpl-system", "prompts/system"),
        ("tmpl-user", "prompts/user"),
    ] {
        let record = TemplateRecord {
            template_id: id.into(),
            template_code: id.to_uppercase(),
            interaction_code: TOPIC.into(),
            version: 1,
            blob_ref: blob_ref.into(),
            required_parameters: vec![],
            is_active: true,
        };
        store
            .put(tables::TEMPLATES, id, serde_json::to_value(&record).unwrap())
            .await
            .unwrap();
    }

    let templates = Arc::new(TemplateService::new(store.clone(), blobs));

    let mut provider = ScriptedProvider::with_replies(options.replies);
    if let Some(delay) = options.provider_delay {
        provider = provider.with_delay(delay);
    }
    let mut models = ModelRegistry::new();
    models.register(
        "gpt-4o",
        ModelCapabilities {
            streaming: false,
            max_context_tokens: 128_000,
        },
        Arc::new(provider),
    );
    let models = Arc::new(models);

    let resolver = Arc::new(ConfigResolver::new(
        store.clone(),
        shared_clock.clone(),
        models.clone(),
        templates.clone(),
    ));
    resolver
        .put(&Configuration {
            config_id: "cfg-default".into(),
            interaction_code: TOPIC.into(),
            tier: None,
            model_code: "gpt-4o".into(),
            template_id: "tmpl-user".into(),
            temperature: 0.5,
            max_tokens: 800,
            is_active: true,
            effective_from: None,
            effective_until: None,
        })
        .await
        .unwrap();

    let topics = Arc::new(TopicRegistry::new(store.clone()));
    topics
        .put(&Topic {
            topic_id: TOPIC.into(),
            kind: JobKind::CoachingMessage,
            interaction_code: TOPIC.into(),
            model_code: "gpt-4o".into(),
            temperature: 0.7,
            max_tokens: 1024,
            top_p: 1.0,
            prompt_refs: PromptRefs {
                system: "tmpl-system".into(),
                user: "tmpl-user".into(),
                extraction: None,
            },
            param_schema: ParamSchema {
                required: vec!["message".into()],
                optional: vec![],
            },
            result_schema: options.result_schema,
            default_max_turns: 3,
            end_marker: None,
            aggregation_period_count: None,
            is_active: true,
        })
        .await
        .unwrap();

    let registry = Arc::new(JobRegistry::new(
        store.clone(),
        shared_clock.clone(),
        JobsConfig::default(),
    ));
    let sessions = Arc::new(SessionService::new(
        store.clone(),
        shared_clock.clone(),
        SessionConfig::default(),
    ));
    let estimator = Arc::new(DurationEstimator::new());
    let engine = Arc::new(ExecutionEngine::new(
        resolver,
        templates,
        models,
        options.deadline,
    ));

    let intake = IntakeService::new(
        sessions.clone(),
        registry.clone(),
        topics.clone(),
        bus.clone(),
        estimator.clone(),
    );

    let terminal = bus.subscribe(BusTopic::Terminal).await.unwrap();

    let worker = Arc::new(Worker::new(
        registry.clone(),
        sessions.clone(),
        topics,
        engine,
        bus.clone(),
        estimator,
        WorkerConfig::default(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    worker.start(shutdown_rx).await.unwrap();

    let reaper = Reaper::new(registry.clone(), JobsConfig::default());

    Harness {
        intake,
        sessions,
        registry,
        reaper,
        clock,
        terminal,
        _shutdown: shutdown_tx,
    }
}

fn auth() -> AuthContext {
    AuthContext {
        tenant_id: "acme".into(),
        user_id: "u-1".into(),
        tier: None,
    }
}

async fn next_terminal(harness: &mut Harness) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), harness.terminal.next())
        .await
        .expect("terminal envelope within deadline")
        .expect("stream open")
}

async fn no_terminal_within(harness: &mut Harness, window: Duration) {
    assert!(
        tokio::time::timeout(window, harness.terminal.next())
            .await
            .is_err(),
        "unexpected extra terminal envelope"
    );
}

#[tokio::test]
async fn happy_multi_turn_conversation() {
    let mut harness = harness(HarnessOptions {
        replies: vec!["Welcome!", "Good progress.", "Farewell."],
        ..Default::default()
    })
    .await;

    let session = harness
        .intake
        .start_session(&auth(), TOPIC, Some(3))
        .await
        .unwrap();

    for (i, message) in ["hi", "ok", "thanks"].iter().enumerate() {
        let turn = (i + 1) as u32;

        let accepted = harness
            .intake
            .submit_message(&auth(), session.session_id, message)
            .await
            .unwrap();
        assert_eq!(accepted.status, JobStatus::Pending);

        match next_terminal(&mut harness).await {
            Envelope::MessageCompleted(done) => {
                assert_eq!(done.job_id, accepted.job_id);
                assert_eq!(done.turn, turn);
                assert_eq!(done.max_turns, 3);
                // Budget exhaustion makes the third turn final.
                assert_eq!(done.is_final, turn == 3);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    let ended = harness
        .intake
        .get_session(&auth(), session.session_id)
        .await
        .unwrap();
    assert_eq!(ended.status, SessionStatus::Completed);
    assert_eq!(ended.turn, 3);
    assert_eq!(ended.message_count, 6);

    // A fourth submission bounces off the completed session.
    let err = harness
        .intake
        .submit_message(&auth(), session.session_id, "one more")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::SessionNotActive);
}

#[tokio::test]
async fn idle_timeout_flips_session_to_paused() {
    let mut harness = harness(HarnessOptions {
        replies: vec!["Hello there.", "Welcome back."],
        ..Default::default()
    })
    .await;

    let session = harness
        .intake
        .start_session(&auth(), TOPIC, Some(5))
        .await
        .unwrap();

    harness
        .intake
        .submit_message(&auth(), session.session_id, "hello")
        .await
        .unwrap();
    assert!(matches!(
        next_terminal(&mut harness).await,
        Envelope::MessageCompleted(_)
    ));

    harness.clock.advance(chrono::Duration::minutes(31));

    let err = harness
        .intake
        .submit_message(&auth(), session.session_id, "still there?")
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::SessionIdleTimeout);

    let paused = harness
        .intake
        .get_session(&auth(), session.session_id)
        .await
        .unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);

    // Explicit resume makes the session accept again.
    harness
        .intake
        .resume_session(&auth(), session.session_id)
        .await
        .unwrap();
    harness
        .intake
        .submit_message(&auth(), session.session_id, "back now")
        .await
        .unwrap();
    assert!(matches!(
        next_terminal(&mut harness).await,
        Envelope::MessageCompleted(_)
    ));
}

#[tokio::test]
async fn duplicate_delivery_yields_single_terminal() {
    // Every publish is delivered twice; the job CAS must absorb it.
    let mut harness = harness(HarnessOptions {
        replies: vec!["Only once."],
        duplicate_deliveries: true,
        ..Default::default()
    })
    .await;

    let session = harness
        .intake
        .start_session(&auth(), TOPIC, Some(3))
        .await
        .unwrap();
    harness
        .intake
        .submit_message(&auth(), session.session_id, "hi")
        .await
        .unwrap();

    match next_terminal(&mut harness).await {
        Envelope::MessageCompleted(done) => assert_eq!(done.turn, 1),
        other => panic!("expected completion, got {other:?}"),
    }

    // The duplicate-delivery bus would also double the terminal envelope;
    // one extra copy of the same jobId is fine (clients de-dup), but there
    // must be no second distinct terminal.
    let follow_up = tokio::time::timeout(Duration::from_millis(300), harness.terminal.next()).await;
    if let Ok(Some(envelope)) = follow_up {
        match envelope {
            Envelope::MessageCompleted(done) => assert_eq!(done.turn, 1),
            other => panic!("unexpected distinct terminal: {other:?}"),
        }
    }

    let updated = harness.sessions.get(session.session_id).await.unwrap();
    assert_eq!(updated.turn, 1);
    assert_eq!(updated.message_count, 2);
}

#[tokio::test]
async fn provider_timeout_fails_job_keeps_session_active() {
    let mut harness = harness(HarnessOptions {
        replies: vec!["too late"],
        provider_delay: Some(Duration::from_secs(3)),
        deadline: Duration::from_millis(200),
        ..Default::default()
    })
    .await;

    let session = harness
        .intake
        .start_session(&auth(), TOPIC, Some(3))
        .await
        .unwrap();
    let accepted = harness
        .intake
        .submit_message(&auth(), session.session_id, "hi")
        .await
        .unwrap();

    match next_terminal(&mut harness).await {
        Envelope::MessageFailed(failed) => {
            assert_eq!(failed.job_id, accepted.job_id);
            assert_eq!(failed.error_code, ErrorCode::LlmTimeout);
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let job = harness
        .intake
        .poll_job(&auth(), accepted.job_id)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code, Some(ErrorCode::LlmTimeout));

    let updated = harness.sessions.get(session.session_id).await.unwrap();
    assert_eq!(updated.status, SessionStatus::Active);
    assert_eq!(updated.in_flight_job_id, None);

    no_terminal_within(&mut harness, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn extraction_failure_still_completes() {
    let mut harness = harness(HarnessOptions {
        replies: vec![
            "We are done here. [SESSION_COMPLETE]",
            "Sorry, I cannot produce JSON right now.",
        ],
        result_schema: Some(json!({"type": "object", "required": ["goal"]})),
        ..Default::default()
    })
    .await;

    let session = harness
        .intake
        .start_session(&auth(), TOPIC, Some(5))
        .await
        .unwrap();
    let accepted = harness
        .intake
        .submit_message(&auth(), session.session_id, "wrap up")
        .await
        .unwrap();

    match next_terminal(&mut harness).await {
        Envelope::MessageCompleted(done) => {
            assert!(done.is_final);
            assert_eq!(done.message, "We are done here.");
            let result = done.result.unwrap();
            assert!(result["parse_error"].is_string());
            assert_eq!(
                result["raw_response"],
                "Sorry, I cannot produce JSON right now."
            );
        }
        other => panic!("expected completion, got {other:?}"),
    }

    let job = harness
        .intake
        .poll_job(&auth(), accepted.job_id)
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.is_final, Some(true));

    let ended = harness.sessions.get(session.session_id).await.unwrap();
    assert_eq!(ended.status, SessionStatus::Completed);
}

#[tokio::test]
async fn enterprise_tier_falls_back_to_default_configuration() {
    let mut harness = harness(HarnessOptions {
        replies: vec!["Configured reply."],
        ..Default::default()
    })
    .await;

    let enterprise = AuthContext {
        tenant_id: "acme".into(),
        user_id: "u-1".into(),
        tier: Some("enterprise".into()),
    };

    let session = harness
        .intake
        .start_session(&enterprise, TOPIC, Some(3))
        .await
        .unwrap();
    harness
        .intake
        .submit_message(&enterprise, session.session_id, "hi")
        .await
        .unwrap();

    match next_terminal(&mut harness).await {
        Envelope::MessageCompleted(done) => assert_eq!(done.message, "Configured reply."),
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn job_expires_after_ttl() {
    let mut harness = harness(HarnessOptions {
        replies: vec!["Hello."],
        ..Default::default()
    })
    .await;

    let session = harness
        .intake
        .start_session(&auth(), TOPIC, Some(3))
        .await
        .unwrap();
    let accepted = harness
        .intake
        .submit_message(&auth(), session.session_id, "hi")
        .await
        .unwrap();
    assert!(matches!(
        next_terminal(&mut harness).await,
        Envelope::MessageCompleted(_)
    ));

    harness.clock.advance(chrono::Duration::hours(25));

    let err = harness
        .intake
        .poll_job(&auth(), accepted.job_id)
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::JobNotFound);
    assert!(matches!(
        err,
        IntakeError::Job(JobError::NotFound { id }) if id == accepted.job_id
    ));

    // The physical record goes with the next sweep.
    harness.reaper.sweep_once().await;
    let err = harness.registry.get(accepted.job_id).await.unwrap_err();
    assert!(matches!(err, JobError::NotFound { .. }));
}

#[tokio::test]
async fn new_session_abandons_previous_one() {
    let harness = harness(HarnessOptions::default()).await;

    let first = harness
        .intake
        .start_session(&auth(), TOPIC, Some(3))
        .await
        .unwrap();
    let second = harness
        .intake
        .start_session(&auth(), TOPIC, Some(3))
        .await
        .unwrap();

    let first = harness
        .intake
        .get_session(&auth(), first.session_id)
        .await
        .unwrap();
    assert_eq!(first.status, SessionStatus::Abandoned);

    let listed = harness.intake.list_sessions(&auth()).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(
        listed
            .iter()
            .any(|s| s.session_id == second.session_id && s.status == SessionStatus::Active)
    );
}
