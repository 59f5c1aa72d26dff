//! Bus envelope types.
//!
//! Envelopes use camel-cased field names on the wire; HTTP DTOs use
//! underscored names. Translation happens at the edges, never in the core.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ErrorCode;

/// A message on the event bus.
///
/// `message.created` and `analysis.created` trigger the worker;
/// `message.completed` and `message.failed` are terminal and flow to the
/// delivery gateway. Exactly one terminal envelope is emitted per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    #[serde(rename = "message.created")]
    MessageCreated(MessageCreated),
    #[serde(rename = "analysis.created")]
    AnalysisCreated(AnalysisCreated),
    #[serde(rename = "message.completed")]
    MessageCompleted(MessageCompleted),
    #[serde(rename = "message.failed")]
    MessageFailed(MessageFailed),
}

impl Envelope {
    /// Job this envelope belongs to; consumers de-duplicate on it.
    pub fn job_id(&self) -> Uuid {
        match self {
            Envelope::MessageCreated(e) => e.job_id,
            Envelope::AnalysisCreated(e) => e.job_id,
            Envelope::MessageCompleted(e) => e.job_id,
            Envelope::MessageFailed(e) => e.job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Envelope::MessageCompleted(_) | Envelope::MessageFailed(_)
        )
    }

    /// (tenant, user) routing key for delivery.
    pub fn routing(&self) -> (&str, &str) {
        match self {
            Envelope::MessageCreated(e) => (&e.tenant_id, &e.user_id),
            Envelope::AnalysisCreated(e) => (&e.tenant_id, &e.user_id),
            Envelope::MessageCompleted(e) => (&e.tenant_id, &e.user_id),
            Envelope::MessageFailed(e) => (&e.tenant_id, &e.user_id),
        }
    }
}

/// Triggers the worker for a coaching message job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCreated {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub topic_id: String,
    pub session_id: Uuid,
    pub user_message: String,
    /// Pipeline stage marker, forwarded untouched.
    pub stage: String,
}

/// Triggers the worker for a single-shot analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisCreated {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub topic_id: String,
    pub params: Value,
    pub stage: String,
}

/// Terminal success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCompleted {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub topic_id: String,
    pub message: String,
    pub is_final: bool,
    pub turn: u32,
    pub max_turns: u32,
    pub message_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

/// Terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFailed {
    pub job_id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    pub topic_id: String,
    pub error: String,
    pub error_code: ErrorCode,
}
