//! Session service: all reads and CAS-guarded mutations of session state.

use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::SessionConfig;
use crate::error::{SessionError, StoreError};
use crate::session::{MessageRole, Session, SessionMessage, SessionStatus};
use crate::store::{KVStore, Precondition, tables};

/// How many times a mutation reloads and retries after losing the version CAS.
const MAX_CAS_RETRIES: usize = 4;

/// Owns every session mutation.
///
/// Writes are optimistic: each successful write bumps `version`, and writers
/// condition on the version they read. Losers reload fresh state and retry;
/// after [`MAX_CAS_RETRIES`] they surface [`SessionError::VersionConflict`].
pub struct SessionService {
    store: Arc<dyn KVStore>,
    clock: SharedClock,
    idle_ttl: Duration,
}

impl SessionService {
    pub fn new(store: Arc<dyn KVStore>, clock: SharedClock, config: SessionConfig) -> Self {
        Self {
            store,
            clock,
            idle_ttl: Duration::from_std(config.idle_ttl).unwrap_or(Duration::minutes(30)),
        }
    }

    /// Start a new active session for (tenant, user, topic).
    ///
    /// Any existing active session for the same triple is abandoned first, so
    /// the one-active-session invariant holds.
    pub async fn start_new(
        &self,
        tenant_id: &str,
        user_id: &str,
        topic_id: &str,
        max_turns: u32,
    ) -> Result<Session, SessionError> {
        if let Some(existing) = self.find_active(tenant_id, user_id, topic_id).await? {
            self.transition(existing.session_id, SessionStatus::Abandoned)
                .await?;
            tracing::info!(
                session_id = %existing.session_id,
                "abandoned prior active session superseded by start_new"
            );
        }

        let session = Session::new(tenant_id, user_id, topic_id, max_turns, self.clock.now());
        let doc = serde_json::to_value(&session).map_err(StoreError::from)?;
        self.store
            .put_if(
                tables::SESSIONS,
                &session.session_id.to_string(),
                doc,
                Precondition::Absent,
            )
            .await?;
        Ok(session)
    }

    pub async fn get(&self, session_id: Uuid) -> Result<Session, SessionError> {
        let doc = self
            .store
            .get(tables::SESSIONS, &session_id.to_string())
            .await?
            .ok_or(SessionError::NotFound { id: session_id })?;
        Ok(serde_json::from_value(doc).map_err(StoreError::from)?)
    }

    /// Load a session and verify the caller owns it.
    pub async fn get_owned(
        &self,
        session_id: Uuid,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Session, SessionError> {
        let session = self.get(session_id).await?;
        if !session.is_owned_by(tenant_id, user_id) {
            return Err(SessionError::AccessDenied { id: session_id });
        }
        Ok(session)
    }

    /// All sessions belonging to (tenant, user), newest first.
    pub async fn list_for_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Vec<Session>, SessionError> {
        let mut sessions: Vec<Session> = self
            .store
            .scan(tables::SESSIONS)
            .await?
            .into_iter()
            .filter_map(|(_, doc)| serde_json::from_value::<Session>(doc).ok())
            .filter(|s| s.is_owned_by(tenant_id, user_id))
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    /// The active session for (tenant, user, topic), if one exists.
    pub async fn find_active(
        &self,
        tenant_id: &str,
        user_id: &str,
        topic_id: &str,
    ) -> Result<Option<Session>, SessionError> {
        Ok(self
            .store
            .scan(tables::SESSIONS)
            .await?
            .into_iter()
            .filter_map(|(_, doc)| serde_json::from_value::<Session>(doc).ok())
            .find(|s| {
                s.is_owned_by(tenant_id, user_id)
                    && s.topic_id == topic_id
                    && s.status == SessionStatus::Active
            }))
    }

    /// active → paused.
    pub async fn pause(&self, session_id: Uuid) -> Result<Session, SessionError> {
        self.transition(session_id, SessionStatus::Paused).await
    }

    /// paused → active. Resuming an already-active session is a no-op, so
    /// repeated resumes are equivalent to one.
    pub async fn resume(&self, session_id: Uuid) -> Result<Session, SessionError> {
        let now = self.clock.now();
        self.mutate(session_id, |session| {
            match session.status {
                SessionStatus::Active => Ok(false),
                SessionStatus::Paused => {
                    session.status = SessionStatus::Active;
                    session.last_activity_at = now;
                    Ok(true)
                }
                other => Err(SessionError::InvalidTransition {
                    id: session.session_id,
                    from: other,
                    to: SessionStatus::Active,
                }),
            }
        })
        .await
    }

    /// active | paused → cancelled.
    pub async fn cancel(&self, session_id: Uuid) -> Result<Session, SessionError> {
        self.transition(session_id, SessionStatus::Cancelled).await
    }

    /// active → completed. Called by the worker on a final assistant turn.
    pub async fn complete(&self, session_id: Uuid) -> Result<Session, SessionError> {
        self.transition(session_id, SessionStatus::Completed).await
    }

    /// Gates 3–5 of message acceptance: state, freshness, capacity.
    ///
    /// A stale active session is flipped to paused as a side effect of the
    /// freshness check, per the idle-timeout rule.
    pub async fn ensure_accepting(&self, session_id: Uuid) -> Result<Session, SessionError> {
        let now = self.clock.now();
        let session = self.get(session_id).await?;

        if session.status != SessionStatus::Active {
            return Err(SessionError::NotActive {
                id: session_id,
                status: session.status,
            });
        }

        if session.is_idle_expired(now, self.idle_ttl) {
            // Best effort: a CAS loss means someone else already moved it.
            let _ = self.transition(session_id, SessionStatus::Paused).await;
            return Err(SessionError::IdleTimeout { id: session_id });
        }

        if !session.has_turn_capacity() {
            return Err(SessionError::MaxTurnsReached {
                id: session_id,
                max_turns: session.max_turns,
            });
        }

        Ok(session)
    }

    /// Append the user's message and touch activity.
    pub async fn append_user_message(
        &self,
        session_id: Uuid,
        content: &str,
    ) -> Result<Session, SessionError> {
        let now = self.clock.now();
        self.mutate(session_id, |session| {
            if session.status != SessionStatus::Active {
                return Err(SessionError::NotActive {
                    id: session.session_id,
                    status: session.status,
                });
            }
            session.history.push(SessionMessage {
                role: MessageRole::User,
                content: content.to_string(),
                at: now,
            });
            session.message_count += 1;
            session.last_activity_at = now;
            Ok(true)
        })
        .await
    }

    /// Append the assistant's reply, advancing the turn counter.
    pub async fn append_assistant_turn(
        &self,
        session_id: Uuid,
        content: &str,
    ) -> Result<Session, SessionError> {
        let now = self.clock.now();
        self.mutate(session_id, |session| {
            if session.status != SessionStatus::Active {
                return Err(SessionError::NotActive {
                    id: session.session_id,
                    status: session.status,
                });
            }
            session.history.push(SessionMessage {
                role: MessageRole::Assistant,
                content: content.to_string(),
                at: now,
            });
            session.turn += 1;
            session.message_count += 1;
            session.last_activity_at = now;
            Ok(true)
        })
        .await
    }

    /// Claim the single in-flight slot for a job. Set-only-if-empty: losing
    /// this CAS is how `SESSION_BUSY` is enforced server-side.
    pub async fn mark_in_flight(
        &self,
        session_id: Uuid,
        job_id: Uuid,
    ) -> Result<Session, SessionError> {
        self.mutate(session_id, |session| {
            match session.in_flight_job_id {
                None => {
                    session.in_flight_job_id = Some(job_id);
                    Ok(true)
                }
                Some(existing) if existing == job_id => Ok(false),
                Some(existing) => Err(SessionError::Busy {
                    id: session.session_id,
                    job_id: existing,
                }),
            }
        })
        .await
    }

    /// Release the in-flight slot if this job holds it.
    pub async fn clear_in_flight(
        &self,
        session_id: Uuid,
        job_id: Uuid,
    ) -> Result<Session, SessionError> {
        self.mutate(session_id, |session| {
            if session.in_flight_job_id == Some(job_id) {
                session.in_flight_job_id = None;
                Ok(true)
            } else {
                Ok(false)
            }
        })
        .await
    }

    /// Validated state transition. Clears the in-flight slot on every exit
    /// from active, keeping the no-in-flight invariant for settled states.
    async fn transition(
        &self,
        session_id: Uuid,
        to: SessionStatus,
    ) -> Result<Session, SessionError> {
        self.mutate(session_id, |session| {
            if session.status == to {
                return Ok(false);
            }
            if !session.status.can_transition_to(to) {
                return Err(SessionError::InvalidTransition {
                    id: session.session_id,
                    from: session.status,
                    to,
                });
            }
            session.status = to;
            session.in_flight_job_id = None;
            Ok(true)
        })
        .await
    }

    /// Load-mutate-write loop. The closure returns whether anything changed;
    /// unchanged sessions skip the write (and the version bump).
    async fn mutate<F>(&self, session_id: Uuid, f: F) -> Result<Session, SessionError>
    where
        F: Fn(&mut Session) -> Result<bool, SessionError>,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let mut session = self.get(session_id).await?;
            let expected = session.version;

            if !f(&mut session)? {
                return Ok(session);
            }

            session.version = expected + 1;
            let doc = serde_json::to_value(&session).map_err(StoreError::from)?;
            let won = self
                .store
                .put_if(
                    tables::SESSIONS,
                    &session_id.to_string(),
                    doc,
                    Precondition::field_equals("version", expected),
                )
                .await?;
            if won {
                return Ok(session);
            }
        }
        Err(SessionError::VersionConflict { id: session_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;

    fn service() -> (SessionService, ManualClock) {
        let clock = ManualClock::default();
        let service = SessionService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
            SessionConfig::default(),
        );
        (service, clock)
    }

    #[tokio::test]
    async fn start_new_abandons_prior_active() {
        let (service, _) = service();
        let first = service.start_new("acme", "u-1", "goal-setting", 3).await.unwrap();
        let second = service.start_new("acme", "u-1", "goal-setting", 3).await.unwrap();

        assert_ne!(first.session_id, second.session_id);
        let first = service.get(first.session_id).await.unwrap();
        assert_eq!(first.status, SessionStatus::Abandoned);

        let active = service
            .find_active("acme", "u-1", "goal-setting")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.session_id, second.session_id);
    }

    #[tokio::test]
    async fn ownership_is_checked() {
        let (service, _) = service();
        let session = service.start_new("acme", "u-1", "goal-setting", 3).await.unwrap();

        let err = service
            .get_owned(session.session_id, "acme", "u-2")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn idle_timeout_flips_to_paused() {
        let (service, clock) = service();
        let session = service.start_new("acme", "u-1", "goal-setting", 3).await.unwrap();

        // One second inside the window: fine.
        clock.advance(Duration::minutes(30) - Duration::seconds(1));
        service.ensure_accepting(session.session_id).await.unwrap();

        // Past the window: rejected and paused.
        clock.advance(Duration::seconds(2));
        let err = service.ensure_accepting(session.session_id).await.unwrap_err();
        assert!(matches!(err, SessionError::IdleTimeout { .. }));

        let paused = service.get(session.session_id).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);

        // Resume then accept again.
        service.resume(session.session_id).await.unwrap();
        service.ensure_accepting(session.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn resume_is_idempotent() {
        let (service, _) = service();
        let session = service.start_new("acme", "u-1", "goal-setting", 3).await.unwrap();
        service.pause(session.session_id).await.unwrap();

        let once = service.resume(session.session_id).await.unwrap();
        let twice = service.resume(session.session_id).await.unwrap();
        let thrice = service.resume(session.session_id).await.unwrap();

        assert_eq!(once.status, SessionStatus::Active);
        assert_eq!(twice.version, once.version);
        assert_eq!(thrice.version, once.version);
    }

    #[tokio::test]
    async fn max_turns_gate() {
        let (service, _) = service();
        let session = service.start_new("acme", "u-1", "goal-setting", 2).await.unwrap();

        service
            .append_assistant_turn(session.session_id, "turn 1")
            .await
            .unwrap();
        service.ensure_accepting(session.session_id).await.unwrap();

        service
            .append_assistant_turn(session.session_id, "turn 2")
            .await
            .unwrap();
        let err = service.ensure_accepting(session.session_id).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::MaxTurnsReached { max_turns: 2, .. }
        ));
    }

    #[tokio::test]
    async fn in_flight_slot_is_exclusive() {
        let (service, _) = service();
        let session = service.start_new("acme", "u-1", "goal-setting", 3).await.unwrap();
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();

        service.mark_in_flight(session.session_id, job_a).await.unwrap();

        // Same job re-marking is a no-op, a different job is busy.
        service.mark_in_flight(session.session_id, job_a).await.unwrap();
        let err = service
            .mark_in_flight(session.session_id, job_b)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Busy { job_id, .. } if job_id == job_a));

        service.clear_in_flight(session.session_id, job_a).await.unwrap();
        service.mark_in_flight(session.session_id, job_b).await.unwrap();
    }

    #[tokio::test]
    async fn settled_states_have_no_in_flight_job() {
        let (service, _) = service();
        let session = service.start_new("acme", "u-1", "goal-setting", 3).await.unwrap();
        service
            .mark_in_flight(session.session_id, Uuid::new_v4())
            .await
            .unwrap();

        let paused = service.pause(session.session_id).await.unwrap();
        assert_eq!(paused.in_flight_job_id, None);

        service.resume(session.session_id).await.unwrap();
        service
            .mark_in_flight(session.session_id, Uuid::new_v4())
            .await
            .unwrap();
        let completed = service.complete(session.session_id).await.unwrap();
        assert_eq!(completed.in_flight_job_id, None);
    }

    #[tokio::test]
    async fn history_counts_stay_consistent() {
        let (service, _) = service();
        let session = service.start_new("acme", "u-1", "goal-setting", 3).await.unwrap();

        service.append_user_message(session.session_id, "hi").await.unwrap();
        let after = service
            .append_assistant_turn(session.session_id, "hello")
            .await
            .unwrap();

        assert_eq!(after.message_count, 2);
        assert_eq!(after.history.len(), 2);
        assert_eq!(after.turn, 1);
        assert_eq!(after.history[0].role, MessageRole::User);
        assert_eq!(after.history[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn cancel_from_paused() {
        let (service, _) = service();
        let session = service.start_new("acme", "u-1", "goal-setting", 3).await.unwrap();
        service.pause(session.session_id).await.unwrap();
        let cancelled = service.cancel(session.session_id).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);

        // Terminal states refuse further transitions.
        let err = service.resume(session.session_id).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }
}
