//! Sherpa: asynchronous job orchestration core for an AI coaching backend.
//!
//! The shape of the system: the intake API accepts work and returns
//! immediately; a `message.created` envelope crosses the event bus; the
//! worker resolves topic configuration, renders prompts, and runs the model
//! under a deadline; exactly one terminal envelope per job flows back out to
//! clients through the delivery gateway, with polling as the fallback.
//!
//! Storage, blob content, caching, and the bus are capability traits —
//! production deployments bind managed engines, tests bind the in-memory
//! implementations.

pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod intake;
pub mod jobs;
pub mod llm;
pub mod resolver;
pub mod session;
pub mod store;
pub mod templates;
pub mod topics;
pub mod worker;

pub use config::Config;
pub use error::ErrorCode;
