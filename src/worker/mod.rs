//! Worker: drives jobs from `created` envelopes to terminal state.
//!
//! Handlers are idempotent by construction: the first step is a CAS from
//! pending to processing, so a redelivered envelope observes the conflict and
//! drops. Exactly one terminal envelope is published per job, by the same
//! CAS argument.

mod pipeline;

pub use pipeline::Worker;
