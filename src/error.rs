//! Error types for the coaching core.
//!
//! Each subsystem has its own error enum; the closed [`ErrorCode`] set is the
//! only error shape that crosses the process boundary (HTTP responses and bus
//! envelopes). Stack traces and source chains stay inside.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::jobs::JobStatus;
use crate::session::SessionStatus;

/// Machine-readable error codes surfaced to clients.
///
/// This set is closed: intake and the worker map every failure onto one of
/// these tags before it leaves the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    JobValidationError,
    JobNotFound,
    SessionNotFound,
    SessionNotActive,
    SessionAccessDenied,
    SessionIdleTimeout,
    SessionBusy,
    MaxTurnsReached,
    ParameterValidation,
    ConfigurationNotFound,
    LlmTimeout,
    LlmError,
    InternalError,
}

impl ErrorCode {
    /// Wire representation, shared by HTTP bodies and bus envelopes.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::JobValidationError => "JOB_VALIDATION_ERROR",
            ErrorCode::JobNotFound => "JOB_NOT_FOUND",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionNotActive => "SESSION_NOT_ACTIVE",
            ErrorCode::SessionAccessDenied => "SESSION_ACCESS_DENIED",
            ErrorCode::SessionIdleTimeout => "SESSION_IDLE_TIMEOUT",
            ErrorCode::SessionBusy => "SESSION_BUSY",
            ErrorCode::MaxTurnsReached => "MAX_TURNS_REACHED",
            ErrorCode::ParameterValidation => "PARAMETER_VALIDATION",
            ErrorCode::ConfigurationNotFound => "CONFIGURATION_NOT_FOUND",
            ErrorCode::LlmTimeout => "LLM_TIMEOUT",
            ErrorCode::LlmError => "LLM_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Suggested client-side retry delay, if the failure is retryable at all.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ErrorCode::LlmTimeout => Some(0),
            ErrorCode::LlmError => Some(10_000),
            ErrorCode::InternalError => Some(30_000),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the key-value and blob store capabilities.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Document failed to serialize or deserialize.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend rejected or lost the operation.
    #[error("store backend error: {reason}")]
    Backend { reason: String },
}

/// Errors from the event bus capability.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Envelope could not be published.
    #[error("publish failed: {reason}")]
    Publish { reason: String },

    /// Subscription is no longer receiving.
    #[error("subscription closed")]
    SubscriptionClosed,

    /// Envelope failed to encode or decode.
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Errors from the job registry.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A job with this ID already exists.
    #[error("job {id} already exists")]
    DuplicateId { id: Uuid },

    /// No live record for this ID (missing, or past its TTL).
    #[error("job {id} not found")]
    NotFound { id: Uuid },

    /// Compare-and-set lost: the job is no longer in the expected status.
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: Uuid,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// Request payload failed validation before a job was created.
    #[error("invalid job input: {reason}")]
    Validation { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the session state machine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session with this ID.
    #[error("session {id} not found")]
    NotFound { id: Uuid },

    /// Caller is not the session owner.
    #[error("session {id} does not belong to caller")]
    AccessDenied { id: Uuid },

    /// Operation requires an active session.
    #[error("session {id} is {status}, not active")]
    NotActive { id: Uuid, status: SessionStatus },

    /// Session sat idle past the timeout and has been paused.
    #[error("session {id} idle-timed out and was paused")]
    IdleTimeout { id: Uuid },

    /// Turn budget exhausted.
    #[error("session {id} reached its turn limit of {max_turns}")]
    MaxTurnsReached { id: Uuid, max_turns: u32 },

    /// Another job is already in flight for this session.
    #[error("session {id} already has job {job_id} in flight")]
    Busy { id: Uuid, job_id: Uuid },

    /// Optimistic write lost; caller should reload and retry.
    #[error("session {id} was modified concurrently")]
    VersionConflict { id: Uuid },

    /// Transition not permitted from the current state.
    #[error("session {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: SessionStatus,
        to: SessionStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    /// Wire code for surfacing this failure to clients.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound { .. } => ErrorCode::SessionNotFound,
            SessionError::AccessDenied { .. } => ErrorCode::SessionAccessDenied,
            SessionError::NotActive { .. } | SessionError::InvalidTransition { .. } => {
                ErrorCode::SessionNotActive
            }
            SessionError::IdleTimeout { .. } => ErrorCode::SessionIdleTimeout,
            SessionError::MaxTurnsReached { .. } => ErrorCode::MaxTurnsReached,
            SessionError::Busy { .. } => ErrorCode::SessionBusy,
            SessionError::VersionConflict { .. } | SessionError::Store(_) => {
                ErrorCode::InternalError
            }
        }
    }
}

/// Errors from topic lookup and parameter validation.
#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    /// No topic under this ID.
    #[error("topic '{id}' not found")]
    NotFound { id: String },

    /// Topic exists but is disabled.
    #[error("topic '{id}' is not active")]
    Inactive { id: String },

    /// Input is missing a parameter the topic requires.
    #[error("topic '{id}' requires parameter '{name}'")]
    MissingParam { id: String, name: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from template lookup and rendering.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    /// No template metadata under this ID.
    #[error("template {id} not found")]
    NotFound { id: String },

    /// Template content missing from the blob store.
    #[error("template content missing at {blob_ref}")]
    ContentMissing { blob_ref: String },

    /// A required parameter was not supplied.
    #[error("missing required parameter '{name}' for template {id}")]
    MissingParameter { id: String, name: String },

    /// Template source failed to parse.
    #[error("template {id} has invalid syntax: {reason}")]
    Syntax { id: String, reason: String },

    /// Substitution failed at render time.
    #[error("template {id} failed to render: {reason}")]
    Render { id: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from configuration resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// Neither a tier-specific nor a default record exists.
    #[error("no active configuration for {interaction_code} (tier {tier:?})")]
    NotFound {
        interaction_code: String,
        tier: Option<String>,
    },

    /// The record references a model or template that does not validate.
    #[error("configuration {config_id} has invalid reference: {reason}")]
    InvalidReference { config_id: String, reason: String },

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from model providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Call exceeded its deadline.
    #[error("provider {provider} timed out after {elapsed_ms}ms")]
    Timeout { provider: String, elapsed_ms: u64 },

    /// Provider rejected the credentials.
    #[error("authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    /// Provider throttled the request.
    #[error("provider {provider} rate limited the request")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    /// Transport or server-side failure.
    #[error("provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    /// Response did not match the expected shape.
    #[error("provider {provider} returned an invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },

    /// No provider registered for this model code.
    #[error("unknown model code '{model_code}'")]
    UnknownModel { model_code: String },

    /// Structured output did not parse as JSON.
    #[error("structured output parse error: {reason}")]
    StructuredParse { reason: String, raw: String },

    /// Structured output parsed but failed schema validation.
    #[error("structured output schema violation: {reason}")]
    StructuredValidation { reason: String, raw: String },
}

impl LlmError {
    /// Terminal error code for a failed generation.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            LlmError::Timeout { .. } => ErrorCode::LlmTimeout,
            LlmError::AuthFailed { .. }
            | LlmError::RateLimited { .. }
            | LlmError::RequestFailed { .. }
            | LlmError::InvalidResponse { .. }
            | LlmError::StructuredParse { .. }
            | LlmError::StructuredValidation { .. } => ErrorCode::LlmError,
            LlmError::UnknownModel { .. } => ErrorCode::InternalError,
        }
    }
}

/// Errors surfaced by the intake API.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    /// Request payload failed validation; no job was created.
    #[error("invalid request: {reason}")]
    Validation { reason: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Topic(#[from] TopicError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl IntakeError {
    /// Wire code for the HTTP error body.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            IntakeError::Validation { .. } => ErrorCode::JobValidationError,
            IntakeError::Session(e) => e.error_code(),
            IntakeError::Job(JobError::NotFound { .. }) => ErrorCode::JobNotFound,
            IntakeError::Job(JobError::Validation { .. }) => ErrorCode::JobValidationError,
            IntakeError::Job(_) => ErrorCode::InternalError,
            IntakeError::Topic(TopicError::MissingParam { .. }) => ErrorCode::JobValidationError,
            IntakeError::Topic(TopicError::NotFound { .. })
            | IntakeError::Topic(TopicError::Inactive { .. }) => ErrorCode::JobValidationError,
            IntakeError::Topic(TopicError::Store(_)) => ErrorCode::InternalError,
            IntakeError::Bus(_) => ErrorCode::InternalError,
        }
    }
}
