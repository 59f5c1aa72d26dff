//! Durable job registry with compare-and-set lifecycle transitions.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::JobsConfig;
use crate::error::{ErrorCode, JobError};
use crate::jobs::{JobRecord, JobStatus, NewJob};
use crate::store::{KVStore, Precondition, tables};

/// Output fields applied on the processing → completed transition.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub output_message: String,
    pub is_final: bool,
    pub result: Option<Value>,
}

/// Single source of truth for job status.
///
/// Every mutation is a conditional write keyed on the current status, so a
/// losing writer observes [`JobError::Conflict`] and must treat the job as
/// already progressed. That property is what makes duplicate bus deliveries
/// harmless.
pub struct JobRegistry {
    store: Arc<dyn KVStore>,
    clock: SharedClock,
    config: JobsConfig,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn KVStore>, clock: SharedClock, config: JobsConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Create a pending record. Rejects an explicit ID that already exists.
    pub async fn create(&self, spec: NewJob) -> Result<JobRecord, JobError> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(self.config.ttl).unwrap_or(chrono::Duration::hours(24));
        let record = JobRecord::new(spec, now, ttl);

        let doc = serde_json::to_value(&record).map_err(crate::error::StoreError::from)?;
        let created = self
            .store
            .put_if(tables::JOBS, &record.job_id.to_string(), doc, Precondition::Absent)
            .await?;

        if !created {
            return Err(JobError::DuplicateId { id: record.job_id });
        }

        tracing::debug!(job_id = %record.job_id, topic_id = %record.topic_id, "job created");
        Ok(record)
    }

    /// Fetch a live record. Records past their TTL read as not found even
    /// before the reaper physically removes them.
    pub async fn get(&self, job_id: Uuid) -> Result<JobRecord, JobError> {
        let doc = self
            .store
            .get(tables::JOBS, &job_id.to_string())
            .await?
            .ok_or(JobError::NotFound { id: job_id })?;

        let record: JobRecord =
            serde_json::from_value(doc).map_err(crate::error::StoreError::from)?;

        if record.is_expired(self.clock.now()) {
            return Err(JobError::NotFound { id: job_id });
        }
        Ok(record)
    }

    /// pending → processing. Stamps `started_at`.
    pub async fn start(&self, job_id: Uuid) -> Result<JobRecord, JobError> {
        let now = self.clock.now();
        self.transition(job_id, JobStatus::Pending, |record| {
            record.status = JobStatus::Processing;
            record.started_at = Some(now);
        })
        .await
    }

    /// processing → completed. Freezes the output fields.
    pub async fn complete(
        &self,
        job_id: Uuid,
        outcome: CompletionOutcome,
    ) -> Result<JobRecord, JobError> {
        let now = self.clock.now();
        self.transition(job_id, JobStatus::Processing, |record| {
            record.status = JobStatus::Completed;
            record.output_message = Some(outcome.output_message);
            record.is_final = Some(outcome.is_final);
            record.result = outcome.result;
            record.finished_at = Some(now);
            record.processing_time_ms = record
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64);
        })
        .await
    }

    /// processing → failed.
    pub async fn fail(
        &self,
        job_id: Uuid,
        error: String,
        error_code: ErrorCode,
    ) -> Result<JobRecord, JobError> {
        let now = self.clock.now();
        self.transition(job_id, JobStatus::Processing, |record| {
            record.status = JobStatus::Failed;
            record.error = Some(error);
            record.error_code = Some(error_code);
            record.finished_at = Some(now);
            record.processing_time_ms = record
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64);
        })
        .await
    }

    /// Remove records whose TTL has passed. Returns how many were removed.
    pub async fn reap_expired(&self) -> Result<usize, JobError> {
        let now = self.clock.now();
        let mut reaped = 0;

        for (key, doc) in self.store.scan(tables::JOBS).await? {
            let Ok(record) = serde_json::from_value::<JobRecord>(doc) else {
                continue;
            };
            if record.is_expired(now) && self.store.delete(tables::JOBS, &key).await? {
                reaped += 1;
            }
        }

        if reaped > 0 {
            tracing::info!(reaped, "reaped expired job records");
        }
        Ok(reaped)
    }

    /// Fail `processing` jobs whose worker evidently died.
    ///
    /// Bounded staleness: a crashed worker leaves a stuck record, and waiting
    /// the full TTL to clear it starves pollers. Idempotent under races via
    /// the status CAS.
    pub async fn watchdog_sweep(&self) -> Result<usize, JobError> {
        let now = self.clock.now();
        let stuck_after =
            chrono::Duration::from_std(self.config.stuck_after).unwrap_or(chrono::Duration::minutes(10));
        let mut failed = 0;

        for (_, doc) in self.store.scan(tables::JOBS).await? {
            let Ok(record) = serde_json::from_value::<JobRecord>(doc) else {
                continue;
            };
            let stuck = record.status == JobStatus::Processing
                && record
                    .started_at
                    .is_some_and(|started| now - started > stuck_after);
            if !stuck {
                continue;
            }

            match self
                .fail(
                    record.job_id,
                    "worker made no progress within the deadline".to_string(),
                    ErrorCode::InternalError,
                )
                .await
            {
                Ok(_) => {
                    tracing::warn!(job_id = %record.job_id, "watchdog failed stuck job");
                    failed += 1;
                }
                // Lost the race to a worker that finished after all.
                Err(JobError::Conflict { .. }) | Err(JobError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(failed)
    }

    async fn transition<F>(
        &self,
        job_id: Uuid,
        from: JobStatus,
        mutate: F,
    ) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let record = self.get(job_id).await?;
        if record.status != from {
            return Err(JobError::Conflict {
                id: job_id,
                expected: from,
                actual: record.status,
            });
        }

        let mut updated = record;
        mutate(&mut updated);

        let doc = serde_json::to_value(&updated).map_err(crate::error::StoreError::from)?;
        let won = self
            .store
            .put_if(
                tables::JOBS,
                &job_id.to_string(),
                doc,
                Precondition::field_equals("status", from.as_str()),
            )
            .await?;

        if !won {
            let actual = self
                .get(job_id)
                .await
                .map(|r| r.status)
                .unwrap_or(JobStatus::Failed);
            return Err(JobError::Conflict {
                id: job_id,
                expected: from,
                actual,
            });
        }
        Ok(updated)
    }
}
