//! Job records, registry, and TTL reaping.
//!
//! A job is the unit of asynchronous work. The registry is the single source
//! of truth for status polling; all mutations are compare-and-set on the
//! status field so concurrent actors serialize without locks.

mod estimate;
mod reaper;
mod record;
mod registry;

pub use estimate::DurationEstimator;
pub use reaper::Reaper;
pub use record::{JobKind, JobRecord, JobStatus, NewJob};
pub use registry::{CompletionOutcome, JobRegistry};
