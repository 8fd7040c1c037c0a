#![deny(clippy::print_stdout, clippy::print_stderr)]

//! Named-job registry with background execution and historical run
//! records. A mutex guards only the registry's register/lookup step,
//! never job execution itself — each run is a detached background
//! task, so `run_job` never blocks the caller on the job's own work.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use ledger_core::Ledger;
use ledger_core::NoopEventPublisher;
use ledger_store::Store;
use sqlx::Row;
use thiserror::Error;
use uuid::Uuid;

pub type BatchResult<T> = Result<T, BatchError>;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("job {0} is not registered")]
    UnknownJob(String),
    #[error("job failed: {0}")]
    JobFailed(String),
    #[error("store unavailable: {0}")]
    Transient(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Running => "RUNNING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "COMPLETED" => BatchStatus::Completed,
            "FAILED" => BatchStatus::Failed,
            _ => BatchStatus::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRecord {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: BatchStatus,
    pub error: Option<String>,
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> BatchResult<BatchRecord> {
    Ok(BatchRecord {
        id: row.try_get("id")?,
        job_name: row.try_get("job_name")?,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        status: BatchStatus::parse(row.try_get::<String, _>("status")?.as_str()),
        error: row.try_get("error")?,
    })
}

/// A named unit of background work. `run` is owned by the registry, not
/// by the caller of `BatchEngine::run_job` — the caller only observes
/// the RUNNING record and later history, never the task's join handle.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> BatchResult<()>;
}

pub struct DailyAccrualJob {
    store: Store,
    ledger: Ledger<NoopEventPublisher>,
}

impl DailyAccrualJob {
    #[must_use]
    pub fn new(store: Store, ledger: Ledger<NoopEventPublisher>) -> Self {
        Self { store, ledger }
    }
}

#[async_trait]
impl Job for DailyAccrualJob {
    fn name(&self) -> &str {
        "Daily Accrual"
    }

    async fn run(&self) -> BatchResult<()> {
        let summary = ledger_accrual::run_daily_accrual(&self.store, &self.ledger)
            .await
            .map_err(|err| BatchError::JobFailed(err.to_string()))?;
        tracing::info!(
            accounts_scanned = summary.accounts_scanned,
            postings_made = summary.postings_made,
            errors = summary.errors,
            "accrual job finished"
        );
        Ok(())
    }
}

/// Stub: real semantics (move accrued interest from a payable account
/// into the customer's principal) are deferred; this job only logs.
pub struct CapitalizationJob;

#[async_trait]
impl Job for CapitalizationJob {
    fn name(&self) -> &str {
        "Capitalization"
    }

    async fn run(&self) -> BatchResult<()> {
        tracing::info!("running capitalization job (mock)");
        Ok(())
    }
}

/// Stub: real semantics (find accounts with periodic fees due and post
/// a fee transaction) are deferred; this job only logs.
pub struct FeeSweeperJob;

#[async_trait]
impl Job for FeeSweeperJob {
    fn name(&self) -> &str {
        "Fee Sweeper"
    }

    async fn run(&self) -> BatchResult<()> {
        tracing::info!("running fee sweeper job (mock)");
        Ok(())
    }
}

type JobMap = Arc<Mutex<HashMap<String, Arc<dyn Job>>>>;

pub struct BatchEngine {
    store: Store,
    jobs: JobMap,
}

impl BatchEngine {
    /// Registers the three default jobs over `store`'s ledger.
    #[must_use]
    pub fn new(store: Store) -> Self {
        let ledger = Ledger::new(store.clone());
        let engine = Self {
            store,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        };
        engine.register_job(Arc::new(DailyAccrualJob::new(engine.store.clone(), ledger)));
        engine.register_job(Arc::new(CapitalizationJob));
        engine.register_job(Arc::new(FeeSweeperJob));
        engine
    }

    pub fn register_job(&self, job: Arc<dyn Job>) {
        let mut jobs = match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        jobs.insert(job.name().to_string(), job);
    }

    /// Looks up `name` under the registry mutex, inserts a RUNNING
    /// record, then spawns the job body as a detached task — the
    /// returned record reflects the RUNNING state, not the eventual
    /// outcome.
    pub async fn run_job(&self, name: &str) -> BatchResult<BatchRecord> {
        let job = {
            let jobs = match self.jobs.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            jobs.get(name).cloned()
        }
        .ok_or_else(|| BatchError::UnknownJob(name.to_string()))?;

        let row = sqlx::query(
            "INSERT INTO batches (job_name, status) VALUES ($1, $2)
             RETURNING id, job_name, started_at, ended_at, status, error",
        )
        .bind(name)
        .bind(BatchStatus::Running.as_str())
        .fetch_one(self.store.pool())
        .await?;
        let record = row_to_record(&row)?;

        let pool = self.store.pool().clone();
        let record_id = record.id;
        let job_name = name.to_string();
        tokio::spawn(async move {
            let outcome = job.run().await;
            let (status, error) = match outcome {
                Ok(()) => {
                    tracing::info!(job = %job_name, "batch job completed successfully");
                    (BatchStatus::Completed, None)
                }
                Err(err) => {
                    tracing::warn!(job = %job_name, error = %err, "batch job failed");
                    (BatchStatus::Failed, Some(err.to_string()))
                }
            };
            if let Err(err) = sqlx::query(
                "UPDATE batches SET ended_at = now(), status = $1, error = $2 WHERE id = $3",
            )
            .bind(status.as_str())
            .bind(error)
            .bind(record_id)
            .execute(&pool)
            .await
            {
                tracing::error!(job = %job_name, error = %err, "failed to record batch job outcome");
            }
        });

        Ok(record)
    }

    /// The 50 most recent batch records, newest first.
    pub async fn get_history(&self) -> BatchResult<Vec<BatchRecord>> {
        let rows = sqlx::query(
            "SELECT id, job_name, started_at, ended_at, status, error
             FROM batches ORDER BY started_at DESC LIMIT 50",
        )
        .fetch_all(self.store.pool())
        .await?;
        rows.iter().map(row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_status_round_trips_through_strings() {
        for variant in [BatchStatus::Running, BatchStatus::Completed, BatchStatus::Failed] {
            assert_eq!(BatchStatus::parse(variant.as_str()), variant);
        }
    }

    #[test]
    fn unknown_status_string_defaults_to_running() {
        assert_eq!(BatchStatus::parse("SOMETHING_ELSE"), BatchStatus::Running);
    }
}
