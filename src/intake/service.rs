//! Intake operations: submit, poll, and session management.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::bus::{AnalysisCreated, Envelope, EventBus, MessageCreated};
use crate::error::{ErrorCode, IntakeError, JobError};
use crate::jobs::{DurationEstimator, JobKind, JobRegistry, JobStatus, NewJob};
use crate::session::{Session, SessionService, SessionStatus};
use crate::topics::TopicRegistry;

/// Caller identity, established by the gateway in front of this service.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: String,
    pub user_id: String,
    /// Subscription tier; `None` resolves to default configurations.
    pub tier: Option<String>,
}

/// Acceptance response for a submitted job.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedJob {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub status: JobStatus,
    pub estimated_duration_ms: u64,
}

/// Poll projection of a job.
///
/// Turn counters are deliberately absent; their canonical location is the
/// terminal bus envelope.
#[derive(Debug, Clone, Serialize)]
pub struct JobProjection {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub status: JobStatus,
    pub message: Option<String>,
    pub is_final: Option<bool>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub processing_time_ms: Option<u64>,
}

/// Session summary for listings and reads.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub topic_id: String,
    pub status: SessionStatus,
    pub turn: u32,
    pub max_turns: u32,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl From<Session> for SessionView {
    fn from(session: Session) -> Self {
        Self {
            session_id: session.session_id,
            topic_id: session.topic_id,
            status: session.status,
            turn: session.turn,
            max_turns: session.max_turns,
            message_count: session.message_count,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
        }
    }
}

/// Accepts jobs and serves polls.
pub struct IntakeService {
    sessions: Arc<SessionService>,
    registry: Arc<JobRegistry>,
    topics: Arc<TopicRegistry>,
    bus: Arc<dyn EventBus>,
    estimator: Arc<DurationEstimator>,
}

impl IntakeService {
    pub fn new(
        sessions: Arc<SessionService>,
        registry: Arc<JobRegistry>,
        topics: Arc<TopicRegistry>,
        bus: Arc<dyn EventBus>,
        estimator: Arc<DurationEstimator>,
    ) -> Self {
        Self {
            sessions,
            registry,
            topics,
            bus,
            estimator,
        }
    }

    /// Accept a coaching message.
    ///
    /// Gates run in order: ownership, existence, state, freshness, capacity,
    /// payload, then the single-in-flight claim. Acceptance appends the user
    /// message, creates the pending job, and publishes `message.created`.
    pub async fn submit_message(
        &self,
        auth: &AuthContext,
        session_id: Uuid,
        message: &str,
    ) -> Result<AcceptedJob, IntakeError> {
        let session = self
            .sessions
            .get_owned(session_id, &auth.tenant_id, &auth.user_id)
            .await?;
        self.sessions.ensure_accepting(session_id).await?;

        let message = message.trim();
        if message.is_empty() {
            return Err(IntakeError::Validation {
                reason: "message must not be empty".to_string(),
            });
        }

        // Claim the in-flight slot before any visible side effect, so a
        // losing racer rejects without creating anything.
        let job_id = Uuid::new_v4();
        self.sessions.mark_in_flight(session_id, job_id).await?;

        let accepted = self
            .accept_message_job(auth, &session, job_id, message)
            .await;
        if accepted.is_err() {
            let _ = self.sessions.clear_in_flight(session_id, job_id).await;
        }
        accepted
    }

    async fn accept_message_job(
        &self,
        auth: &AuthContext,
        session: &Session,
        job_id: Uuid,
        message: &str,
    ) -> Result<AcceptedJob, IntakeError> {
        self.sessions
            .append_user_message(session.session_id, message)
            .await?;

        let job = self
            .registry
            .create(NewJob {
                job_id: Some(job_id),
                tenant_id: auth.tenant_id.clone(),
                user_id: auth.user_id.clone(),
                tier: auth.tier.clone(),
                kind: JobKind::CoachingMessage,
                topic_id: session.topic_id.clone(),
                session_id: Some(session.session_id),
                input: json!({ "message": message }),
            })
            .await?;

        self.bus
            .publish(Envelope::MessageCreated(MessageCreated {
                job_id: job.job_id,
                tenant_id: auth.tenant_id.clone(),
                user_id: auth.user_id.clone(),
                topic_id: session.topic_id.clone(),
                session_id: session.session_id,
                user_message: message.to_string(),
                stage: "created".to_string(),
            }))
            .await?;

        tracing::info!(
            job_id = %job.job_id,
            session_id = %session.session_id,
            "accepted coaching message"
        );

        Ok(AcceptedJob {
            job_id: job.job_id,
            session_id: Some(session.session_id),
            status: JobStatus::Pending,
            estimated_duration_ms: self.estimator.estimate_ms(&session.topic_id),
        })
    }

    /// Accept a single-shot analysis.
    pub async fn submit_analysis(
        &self,
        auth: &AuthContext,
        topic_id: &str,
        params: Value,
    ) -> Result<AcceptedJob, IntakeError> {
        let topic = self.topics.get(topic_id).await?;
        topic.validate_params(&params)?;

        let job = self
            .registry
            .create(NewJob {
                job_id: None,
                tenant_id: auth.tenant_id.clone(),
                user_id: auth.user_id.clone(),
                tier: auth.tier.clone(),
                kind: JobKind::SingleShotAnalysis,
                topic_id: topic_id.to_string(),
                session_id: None,
                input: params.clone(),
            })
            .await?;

        self.bus
            .publish(Envelope::AnalysisCreated(AnalysisCreated {
                job_id: job.job_id,
                tenant_id: auth.tenant_id.clone(),
                user_id: auth.user_id.clone(),
                topic_id: topic_id.to_string(),
                params,
                stage: "created".to_string(),
            }))
            .await?;

        tracing::info!(job_id = %job.job_id, topic_id, "accepted analysis");

        Ok(AcceptedJob {
            job_id: job.job_id,
            session_id: None,
            status: JobStatus::Pending,
            estimated_duration_ms: self.estimator.estimate_ms(topic_id),
        })
    }

    /// Current job projection. Never waits.
    pub async fn poll_job(
        &self,
        auth: &AuthContext,
        job_id: Uuid,
    ) -> Result<JobProjection, IntakeError> {
        let job = self.registry.get(job_id).await?;

        // A foreign job reads as absent rather than forbidden.
        if job.tenant_id != auth.tenant_id || job.user_id != auth.user_id {
            return Err(IntakeError::Job(JobError::NotFound { id: job_id }));
        }

        Ok(JobProjection {
            job_id: job.job_id,
            session_id: job.session_id,
            status: job.status,
            message: job.output_message,
            is_final: job.is_final,
            result: job.result,
            error: job.error,
            error_code: job.error_code,
            processing_time_ms: job.processing_time_ms,
        })
    }

    /// Start a session, superseding any active one for the same topic.
    pub async fn start_session(
        &self,
        auth: &AuthContext,
        topic_id: &str,
        max_turns: Option<u32>,
    ) -> Result<SessionView, IntakeError> {
        let topic = self.topics.get(topic_id).await?;
        let max_turns = max_turns.unwrap_or(topic.default_max_turns);

        let session = self
            .sessions
            .start_new(&auth.tenant_id, &auth.user_id, topic_id, max_turns)
            .await?;
        Ok(session.into())
    }

    pub async fn pause_session(
        &self,
        auth: &AuthContext,
        session_id: Uuid,
    ) -> Result<SessionView, IntakeError> {
        self.sessions
            .get_owned(session_id, &auth.tenant_id, &auth.user_id)
            .await?;
        Ok(self.sessions.pause(session_id).await?.into())
    }

    pub async fn resume_session(
        &self,
        auth: &AuthContext,
        session_id: Uuid,
    ) -> Result<SessionView, IntakeError> {
        self.sessions
            .get_owned(session_id, &auth.tenant_id, &auth.user_id)
            .await?;
        Ok(self.sessions.resume(session_id).await?.into())
    }

    pub async fn cancel_session(
        &self,
        auth: &AuthContext,
        session_id: Uuid,
    ) -> Result<SessionView, IntakeError> {
        self.sessions
            .get_owned(session_id, &auth.tenant_id, &auth.user_id)
            .await?;
        Ok(self.sessions.cancel(session_id).await?.into())
    }

    pub async fn get_session(
        &self,
        auth: &AuthContext,
        session_id: Uuid,
    ) -> Result<SessionView, IntakeError> {
        Ok(self
            .sessions
            .get_owned(session_id, &auth.tenant_id, &auth.user_id)
            .await?
            .into())
    }

    pub async fn list_sessions(&self, auth: &AuthContext) -> Result<Vec<SessionView>, IntakeError> {
        Ok(self
            .sessions
            .list_for_user(&auth.tenant_id, &auth.user_id)
            .await?
            .into_iter()
            .map(SessionView::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusTopic, MemoryBus};
    use crate::clock::ManualClock;
    use crate::config::{JobsConfig, SessionConfig};
    use crate::error::SessionError;
    use crate::store::MemoryStore;
    use crate::topics::{ParamSchema, PromptRefs, Topic};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    struct Fixture {
        intake: IntakeService,
        sessions: Arc<SessionService>,
        bus: Arc<MemoryBus>,
        clock: ManualClock,
    }

    fn auth() -> AuthContext {
        AuthContext {
            tenant_id: "acme".into(),
            user_id: "u-1".into(),
            tier: Some("professional".into()),
        }
    }

    async fn fixture() -> Fixture {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let clock = ManualClock::default();
        let shared: crate::clock::SharedClock = Arc::new(clock.clone());
        let bus = Arc::new(MemoryBus::new());

        let topics = TopicRegistry::new(store.clone());
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
                    system: "tmpl-system".into(),
                    user: "tmpl-user".into(),
                    extraction: None,
                },
                param_schema: ParamSchema {
                    required: vec!["message".into()],
                    optional: vec![],
                },
                result_schema: None,
                default_max_turns: 3,
                end_marker: None,
                aggregation_period_count: None,
                is_active: true,
            })
            .await
            .unwrap();

        let sessions = Arc::new(SessionService::new(
            store.clone(),
            shared.clone(),
            SessionConfig::default(),
        ));
        let registry = Arc::new(JobRegistry::new(
            store.clone(),
            shared.clone(),
            JobsConfig::default(),
        ));

        Fixture {
            intake: IntakeService::new(
                sessions.clone(),
                registry,
                Arc::new(TopicRegistry::new(store.clone())),
                bus.clone(),
                Arc::new(DurationEstimator::new()),
            ),
            sessions,
            bus,
            clock,
        }
    }

    #[tokio::test]
    async fn submit_accepts_and_publishes_created() {
        let fix = fixture().await;
        let mut created = fix.bus.subscribe(BusTopic::Created).await.unwrap();

        let view = fix
            .intake
            .start_session(&auth(), "goal-setting", None)
            .await
            .unwrap();
        assert_eq!(view.max_turns, 3);

        let accepted = fix
            .intake
            .submit_message(&auth(), view.session_id, "hi coach")
            .await
            .unwrap();
        assert_eq!(accepted.status, JobStatus::Pending);
        assert!(accepted.estimated_duration_ms > 0);

        match created.next().await.unwrap() {
            Envelope::MessageCreated(evt) => {
                assert_eq!(evt.job_id, accepted.job_id);
                assert_eq!(evt.user_message, "hi coach");
            }
            other => panic!("expected created envelope, got {other:?}"),
        }

        // The poll projection reflects the pending job, no assistant message.
        let projection = fix.intake.poll_job(&auth(), accepted.job_id).await.unwrap();
        assert_eq!(projection.status, JobStatus::Pending);
        assert_eq!(projection.message, None);
    }

    #[tokio::test]
    async fn empty_message_creates_nothing() {
        let fix = fixture().await;
        let view = fix
            .intake
            .start_session(&auth(), "goal-setting", None)
            .await
            .unwrap();

        let err = fix
            .intake
            .submit_message(&auth(), view.session_id, "   ")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::JobValidationError);

        // Neither a history entry nor an in-flight claim survives.
        let session = fix.sessions.get(view.session_id).await.unwrap();
        assert_eq!(session.message_count, 0);
        assert_eq!(session.in_flight_job_id, None);
    }

    #[tokio::test]
    async fn foreign_session_is_denied() {
        let fix = fixture().await;
        let view = fix
            .intake
            .start_session(&auth(), "goal-setting", None)
            .await
            .unwrap();

        let stranger = AuthContext {
            tenant_id: "acme".into(),
            user_id: "u-2".into(),
            tier: None,
        };
        let err = fix
            .intake
            .submit_message(&stranger, view.session_id, "hi")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::SessionAccessDenied);
    }

    #[tokio::test]
    async fn busy_session_rejects_second_submit() {
        let fix = fixture().await;
        let view = fix
            .intake
            .start_session(&auth(), "goal-setting", None)
            .await
            .unwrap();

        fix.intake
            .submit_message(&auth(), view.session_id, "first")
            .await
            .unwrap();

        let err = fix
            .intake
            .submit_message(&auth(), view.session_id, "second")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::SessionBusy);
        assert!(matches!(err, IntakeError::Session(SessionError::Busy { .. })));
    }

    #[tokio::test]
    async fn idle_session_rejects_and_pauses() {
        let fix = fixture().await;
        let view = fix
            .intake
            .start_session(&auth(), "goal-setting", None)
            .await
            .unwrap();

        fix.clock.advance(chrono::Duration::minutes(31));
        let err = fix
            .intake
            .submit_message(&auth(), view.session_id, "still there?")
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::SessionIdleTimeout);

        let session = fix.intake.get_session(&auth(), view.session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Paused);

        // Resume and submit again.
        fix.intake.resume_session(&auth(), view.session_id).await.unwrap();
        fix.intake
            .submit_message(&auth(), view.session_id, "back")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn poll_hides_foreign_jobs() {
        let fix = fixture().await;
        let view = fix
            .intake
            .start_session(&auth(), "goal-setting", None)
            .await
            .unwrap();
        let accepted = fix
            .intake
            .submit_message(&auth(), view.session_id, "hi")
            .await
            .unwrap();

        let stranger = AuthContext {
            tenant_id: "other".into(),
            user_id: "u-9".into(),
            tier: None,
        };
        let err = fix.intake.poll_job(&stranger, accepted.job_id).await.unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn analysis_submit_validates_params() {
        let fix = fixture().await;
        let mut created = fix.bus.subscribe(BusTopic::Created).await.unwrap();

        let err = fix
            .intake
            .submit_analysis(&auth(), "goal-setting", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::JobValidationError);

        let accepted = fix
            .intake
            .submit_analysis(&auth(), "goal-setting", json!({"message": "my week"}))
            .await
            .unwrap();
        assert_eq!(accepted.session_id, None);

        match created.next().await.unwrap() {
            Envelope::AnalysisCreated(evt) => assert_eq!(evt.job_id, accepted.job_id),
            other => panic!("expected analysis envelope, got {other:?}"),
        }
    }
}
