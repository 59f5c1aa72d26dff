//! Intake surface: accepts work over HTTP, never waits for the LLM.
//!
//! Acceptance is always asynchronous: a successful submit returns a pending
//! job reference and the assistant message arrives later over the delivery
//! gateway (or via polling).

mod http;
mod service;

pub use http::{ApiError, AppState, router};
pub use service::{AcceptedJob, AuthContext, IntakeService, JobProjection, SessionView};
