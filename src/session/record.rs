//! Session record and state machine rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Paused => "paused",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Abandoned => "abandoned",
        }
    }

    /// Whether the state machine permits `self → to`.
    ///
    /// Only `active` expires; the other states are stable until an explicit
    /// operation moves them.
    pub fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (Active, Paused)
                | (Active, Completed)
                | (Active, Cancelled)
                | (Active, Abandoned)
                | (Paused, Active)
                | (Paused, Cancelled)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One entry in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// A coaching conversation bound to a (tenant, user, topic) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub topic_id: String,
    pub status: SessionStatus,
    /// Completed assistant turns.
    pub turn: u32,
    /// 0 means unlimited.
    pub max_turns: u32,
    pub message_count: u32,
    pub history: Vec<SessionMessage>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// The job currently being processed for this session, if any.
    pub in_flight_job_id: Option<Uuid>,
    /// Optimistic concurrency token; bumped on every successful write.
    pub version: u64,
}

impl Session {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        topic_id: impl Into<String>,
        max_turns: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            topic_id: topic_id.into(),
            status: SessionStatus::Active,
            turn: 0,
            max_turns,
            message_count: 0,
            history: Vec::new(),
            created_at: now,
            last_activity_at: now,
            in_flight_job_id: None,
            version: 0,
        }
    }

    /// Whether the turn budget still has room.
    pub fn has_turn_capacity(&self) -> bool {
        self.max_turns == 0 || self.turn < self.max_turns
    }

    /// Whether the session has been idle past `idle_ttl` at `now`.
    pub fn is_idle_expired(&self, now: DateTime<Utc>, idle_ttl: chrono::Duration) -> bool {
        self.status == SessionStatus::Active && now - self.last_activity_at > idle_ttl
    }

    pub fn is_owned_by(&self, tenant_id: &str, user_id: &str) -> bool {
        self.tenant_id == tenant_id && self.user_id == user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use SessionStatus::*;
        assert!(Active.can_transition_to(Paused));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Abandoned));
        assert!(Paused.can_transition_to(Active));
        assert!(Paused.can_transition_to(Cancelled));

        assert!(!Completed.can_transition_to(Active));
        assert!(!Cancelled.can_transition_to(Active));
        assert!(!Abandoned.can_transition_to(Active));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn turn_capacity_with_zero_means_unlimited() {
        let now = Utc::now();
        let mut session = Session::new("acme", "u-1", "goal-setting", 0, now);
        session.turn = 10_000;
        assert!(session.has_turn_capacity());

        session.max_turns = 3;
        session.turn = 2;
        assert!(session.has_turn_capacity());
        session.turn = 3;
        assert!(!session.has_turn_capacity());
    }

    #[test]
    fn idle_expiry_only_applies_to_active() {
        let now = Utc::now();
        let mut session = Session::new("acme", "u-1", "goal-setting", 3, now);
        let ttl = chrono::Duration::minutes(30);

        assert!(!session.is_idle_expired(now + chrono::Duration::minutes(29), ttl));
        assert!(session.is_idle_expired(now + chrono::Duration::minutes(31), ttl));

        session.status = SessionStatus::Paused;
        assert!(!session.is_idle_expired(now + chrono::Duration::hours(5), ttl));
    }
}
