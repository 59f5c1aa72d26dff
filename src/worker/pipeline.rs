//! The dispatch pipeline.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Semaphore, watch};
use tracing::Instrument;

use crate::bus::{
    AnalysisCreated, BusTopic, Envelope, EventBus, MessageCompleted, MessageCreated, MessageFailed,
};
use crate::config::WorkerConfig;
use crate::engine::{EngineError, ExecutionEngine};
use crate::error::{BusError, ErrorCode, JobError, TopicError};
use crate::jobs::{CompletionOutcome, DurationEstimator, JobRegistry};
use crate::llm::ChatMessage;
use crate::session::{MessageRole, Session, SessionService};
use crate::topics::TopicRegistry;

/// Consumes created envelopes and executes jobs.
pub struct Worker {
    registry: Arc<JobRegistry>,
    sessions: Arc<SessionService>,
    topics: Arc<TopicRegistry>,
    engine: Arc<ExecutionEngine>,
    bus: Arc<dyn EventBus>,
    estimator: Arc<DurationEstimator>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        registry: Arc<JobRegistry>,
        sessions: Arc<SessionService>,
        topics: Arc<TopicRegistry>,
        engine: Arc<ExecutionEngine>,
        bus: Arc<dyn EventBus>,
        estimator: Arc<DurationEstimator>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            sessions,
            topics,
            engine,
            bus,
            estimator,
            config,
        }
    }

    /// Subscribe and spawn the consume loop.
    ///
    /// The subscription is registered before this returns, so envelopes
    /// published immediately afterwards cannot be missed.
    pub async fn start(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<tokio::task::JoinHandle<()>, BusError> {
        let stream = self.bus.subscribe(BusTopic::Created).await?;
        tracing::info!(concurrency = self.config.concurrency, "worker started");
        Ok(tokio::spawn(self.consume(stream, shutdown)))
    }

    /// Consume the created-envelope stream until shutdown.
    ///
    /// Each envelope runs as its own task; the semaphore bounds concurrency
    /// and supplies back-pressure through the bus channel.
    async fn consume(
        self: Arc<Self>,
        mut stream: crate::bus::EnvelopeStream,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let permits = Arc::new(Semaphore::new(self.config.concurrency));

        loop {
            tokio::select! {
                envelope = stream.next() => {
                    let Some(envelope) = envelope else {
                        tracing::info!("bus subscription closed; worker exiting");
                        return;
                    };
                    let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                        return;
                    };
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.handle(envelope).await;
                        drop(permit);
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// Process one envelope to a terminal state.
    pub async fn handle(&self, envelope: Envelope) {
        match envelope {
            Envelope::MessageCreated(evt) => {
                let span = tracing::info_span!(
                    "coaching_message",
                    job_id = %evt.job_id,
                    session_id = %evt.session_id,
                    topic_id = %evt.topic_id,
                );
                self.handle_message(evt).instrument(span).await
            }
            Envelope::AnalysisCreated(evt) => {
                let span = tracing::info_span!(
                    "single_shot_analysis",
                    job_id = %evt.job_id,
                    topic_id = %evt.topic_id,
                );
                self.handle_analysis(evt).instrument(span).await
            }
            // Terminal envelopes are not ours; the subscription filter
            // normally keeps them away.
            other => {
                tracing::debug!(job_id = %other.job_id(), "ignoring terminal envelope");
            }
        }
    }

    async fn handle_message(&self, evt: MessageCreated) {
        // Step 1: claim the job. Losing means a duplicate delivery.
        let job = match self.registry.start(evt.job_id).await {
            Ok(job) => job,
            Err(JobError::Conflict { actual, .. }) => {
                tracing::debug!(%actual, "duplicate delivery dropped");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "job not startable");
                return;
            }
        };

        // Step 2: re-validate session gates.
        let session = match self.sessions.ensure_accepting(evt.session_id).await {
            Ok(session) => session,
            Err(e) => {
                let code = e.error_code();
                self.fail_job(&evt, e.to_string(), code).await;
                return;
            }
        };

        // Steps 3–6 live in the engine.
        let topic = match self.topics.get(&evt.topic_id).await {
            Ok(topic) => topic,
            Err(e) => {
                let code = topic_error_code(&e);
                self.fail_job(&evt, e.to_string(), code).await;
                return;
            }
        };

        let history = history_before_current_turn(&session, &evt.user_message);
        let outcome = self
            .engine
            .execute_turn(
                &topic,
                job.tier.as_deref(),
                &job.input,
                history,
                session.turn + 1,
                session.max_turns,
            )
            .await;

        match outcome {
            Ok(outcome) => {
                let updated = match self
                    .sessions
                    .append_assistant_turn(evt.session_id, &outcome.message)
                    .await
                {
                    Ok(updated) => updated,
                    Err(e) => {
                        self.fail_job(&evt, e.to_string(), ErrorCode::InternalError)
                            .await;
                        return;
                    }
                };

                let completed = match self
                    .registry
                    .complete(
                        evt.job_id,
                        CompletionOutcome {
                            output_message: outcome.message.clone(),
                            is_final: outcome.is_final,
                            result: outcome.result.clone(),
                        },
                    )
                    .await
                {
                    Ok(record) => record,
                    Err(JobError::Conflict { actual, .. }) => {
                        // The watchdog or a duplicate got there first; their
                        // terminal stands.
                        tracing::warn!(%actual, "lost terminal transition");
                        let _ = self
                            .sessions
                            .clear_in_flight(evt.session_id, evt.job_id)
                            .await;
                        return;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to persist completion");
                        let _ = self
                            .sessions
                            .clear_in_flight(evt.session_id, evt.job_id)
                            .await;
                        return;
                    }
                };

                if let Some(ms) = completed.processing_time_ms {
                    self.estimator.record(&evt.topic_id, ms);
                }

                // Settle the session before the envelope goes out: clients
                // may resubmit the moment they see the terminal event.
                if outcome.is_final {
                    if let Err(e) = self.sessions.complete(evt.session_id).await {
                        tracing::warn!(error = %e, "failed to complete session");
                    }
                } else if let Err(e) = self
                    .sessions
                    .clear_in_flight(evt.session_id, evt.job_id)
                    .await
                {
                    tracing::warn!(error = %e, "failed to clear in-flight job");
                }

                self.publish(Envelope::MessageCompleted(MessageCompleted {
                    job_id: evt.job_id,
                    tenant_id: evt.tenant_id.clone(),
                    user_id: evt.user_id.clone(),
                    session_id: Some(evt.session_id),
                    topic_id: evt.topic_id.clone(),
                    message: outcome.message,
                    is_final: outcome.is_final,
                    turn: updated.turn,
                    max_turns: updated.max_turns,
                    message_count: updated.message_count,
                    result: outcome.result,
                }))
                .await;

                tracing::info!(turn = updated.turn, "turn completed");
            }
            Err(e) => {
                let code = e.error_code();
                self.fail_job(&evt, engine_error_message(&e), code).await;
            }
        }
    }

    async fn handle_analysis(&self, evt: AnalysisCreated) {
        let job = match self.registry.start(evt.job_id).await {
            Ok(job) => job,
            Err(JobError::Conflict { actual, .. }) => {
                tracing::debug!(%actual, "duplicate delivery dropped");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "job not startable");
                return;
            }
        };

        let topic = match self.topics.get(&evt.topic_id).await {
            Ok(topic) => topic,
            Err(e) => {
                let code = topic_error_code(&e);
                self.fail_analysis(&evt, e.to_string(), code).await;
                return;
            }
        };

        match self
            .engine
            .execute_analysis(&topic, job.tier.as_deref(), &job.input)
            .await
        {
            Ok(outcome) => {
                let completed = match self
                    .registry
                    .complete(
                        evt.job_id,
                        CompletionOutcome {
                            output_message: outcome.message.clone(),
                            is_final: true,
                            result: outcome.result.clone(),
                        },
                    )
                    .await
                {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(error = %e, "lost terminal transition");
                        return;
                    }
                };

                if let Some(ms) = completed.processing_time_ms {
                    self.estimator.record(&evt.topic_id, ms);
                }

                self.publish(Envelope::MessageCompleted(MessageCompleted {
                    job_id: evt.job_id,
                    tenant_id: evt.tenant_id.clone(),
                    user_id: evt.user_id.clone(),
                    session_id: None,
                    topic_id: evt.topic_id.clone(),
                    message: outcome.message,
                    is_final: true,
                    turn: 0,
                    max_turns: 0,
                    message_count: 0,
                    result: outcome.result,
                }))
                .await;
            }
            Err(e) => {
                let code = e.error_code();
                self.fail_analysis(&evt, engine_error_message(&e), code).await;
            }
        }
    }

    /// Terminal failure for a coaching message: release the session's
    /// in-flight slot, CAS the job, publish.
    async fn fail_job(&self, evt: &MessageCreated, error: String, code: ErrorCode) {
        // Released before the envelope goes out so a client retrying on the
        // failure event is not bounced as busy.
        if let Err(e) = self
            .sessions
            .clear_in_flight(evt.session_id, evt.job_id)
            .await
        {
            tracing::warn!(error = %e, "failed to clear in-flight job");
        }

        match self.registry.fail(evt.job_id, error.clone(), code).await {
            Ok(_) => {
                self.publish(Envelope::MessageFailed(MessageFailed {
                    job_id: evt.job_id,
                    tenant_id: evt.tenant_id.clone(),
                    user_id: evt.user_id.clone(),
                    session_id: Some(evt.session_id),
                    topic_id: evt.topic_id.clone(),
                    error,
                    error_code: code,
                }))
                .await;
            }
            Err(JobError::Conflict { actual, .. }) => {
                tracing::warn!(%actual, "lost terminal transition");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to persist job failure");
            }
        }
    }

    async fn fail_analysis(&self, evt: &AnalysisCreated, error: String, code: ErrorCode) {
        match self.registry.fail(evt.job_id, error.clone(), code).await {
            Ok(_) => {
                self.publish(Envelope::MessageFailed(MessageFailed {
                    job_id: evt.job_id,
                    tenant_id: evt.tenant_id.clone(),
                    user_id: evt.user_id.clone(),
                    session_id: None,
                    topic_id: evt.topic_id.clone(),
                    error,
                    error_code: code,
                }))
                .await;
            }
            Err(JobError::Conflict { actual, .. }) => {
                tracing::warn!(%actual, "lost terminal transition");
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to persist job failure");
            }
        }
    }

    async fn publish(&self, envelope: Envelope) {
        if let Err(e) = self.bus.publish(envelope).await {
            tracing::error!(error = %e, "failed to publish terminal envelope");
        }
    }
}

/// Conversation context for the provider call: everything before the user
/// message currently being processed (that one arrives through the rendered
/// user template).
fn history_before_current_turn(session: &Session, user_message: &str) -> Vec<ChatMessage> {
    let mut history: Vec<ChatMessage> = session
        .history
        .iter()
        .map(|m| match m.role {
            MessageRole::User => ChatMessage::user(&m.content),
            MessageRole::Assistant => ChatMessage::assistant(&m.content),
        })
        .collect();

    if history
        .last()
        .is_some_and(|m| m.content == user_message)
    {
        history.pop();
    }
    history
}

fn topic_error_code(error: &TopicError) -> ErrorCode {
    match error {
        TopicError::MissingParam { .. } => ErrorCode::ParameterValidation,
        _ => ErrorCode::InternalError,
    }
}

/// Human-readable message for the failed envelope; never a stack trace.
fn engine_error_message(error: &EngineError) -> String {
    error.to_string()
}
