//! Coaching sessions: one conversation per (user, topic) with a state
//! machine, turn accounting, and idle timeout.

mod record;
mod service;

pub use record::{MessageRole, Session, SessionMessage, SessionStatus};
pub use service::SessionService;
