//! Job record types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// What kind of work the job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A turn in a coaching conversation.
    CoachingMessage,
    /// A one-off analysis with no session.
    SingleShotAnalysis,
}

/// Lifecycle status. Monotonic along pending → processing → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Explicit ID; generated when absent.
    pub job_id: Option<Uuid>,
    pub tenant_id: String,
    pub user_id: String,
    /// Subscription tier at submission time, denormalized for the worker's
    /// configuration lookup.
    pub tier: Option<String>,
    pub kind: JobKind,
    pub topic_id: String,
    pub session_id: Option<Uuid>,
    pub input: Value,
}

/// Durable record of one asynchronous unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub tier: Option<String>,
    pub kind: JobKind,
    pub topic_id: String,
    pub session_id: Option<Uuid>,
    pub input: Value,
    pub status: JobStatus,
    pub output_message: Option<String>,
    pub is_final: Option<bool>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<u64>,
    pub ttl_at: DateTime<Utc>,
}

impl JobRecord {
    /// Build a fresh pending record. `ttl` is measured from `now`.
    pub fn new(spec: NewJob, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            job_id: spec.job_id.unwrap_or_else(Uuid::new_v4),
            tenant_id: spec.tenant_id,
            user_id: spec.user_id,
            tier: spec.tier,
            kind: spec.kind,
            topic_id: spec.topic_id,
            session_id: spec.session_id,
            input: spec.input,
            status: JobStatus::Pending,
            output_message: None,
            is_final: None,
            result: None,
            error: None,
            error_code: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            processing_time_ms: None,
            ttl_at: now + ttl,
        }
    }

    /// Whether the record has outlived its TTL at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.ttl_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> NewJob {
        NewJob {
            job_id: None,
            tenant_id: "acme".into(),
            user_id: "u-1".into(),
            tier: None,
            kind: JobKind::CoachingMessage,
            topic_id: "goal-setting".into(),
            session_id: Some(Uuid::new_v4()),
            input: json!({"message": "hi"}),
        }
    }

    #[test]
    fn new_record_is_pending_with_24h_ttl() {
        let now = Utc::now();
        let record = JobRecord::new(spec(), now, Duration::hours(24));

        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.ttl_at - record.created_at, Duration::hours(24));
        assert!(!record.is_expired(now));
        assert!(record.is_expired(now + Duration::hours(24)));
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::to_string(&JobKind::SingleShotAnalysis).unwrap(),
            "\"single_shot_analysis\""
        );
    }
}
