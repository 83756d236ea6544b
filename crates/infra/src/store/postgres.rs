//! Postgres-backed store implementation.
//!
//! One `PostgresStore` implements the watermark, job and execution stores on
//! top of the `producer_config`, `jobs` and `job_executions` tables created by
//! the provisioning script (`deploy/provision.sql`). Every conditional write is
//! a single `UPDATE ... WHERE <guard>` statement, so the database row is the
//! only serialization point between scheduler replicas.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) on `job_executions_one_running` | `23505` | `Conflict` | A second Running execution for the same job |
//! | Database (unique violation) | `23505` | `Duplicate` | Primary key collision (job id / execution id) |
//! | Database (foreign key violation) | `23503` | `NotFound` | Execution for a job that does not exist |
//! | Database (check constraint violation) | `23514` | `Invariant` | Invalid data rejected by the schema |
//! | Database (other) | Any other | `Unavailable` | Other database errors |
//! | PoolTimedOut / PoolClosed / Io / Tls / Protocol | N/A | `Unavailable` | Transient connectivity failures |
//! | Other | N/A | `Unavailable` | Anything else |
//!
//! ## Threading
//!
//! The store traits are synchronous. Calls are driven through a captured
//! `tokio::runtime::Handle` with `block_on`, so they must be made from plain
//! OS threads (the scheduler's service and worker threads), never from inside
//! an async task.

use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::{debug, instrument};

use cadence_core::{
    ConfigId, DeliveryGuarantee, EpochMillis, Execution, ExecutionId, ExecutionResult, Job, JobId, JobStats,
    JobStatus, ProducerConfig, WorkerId,
};

use super::r#trait::{
    ExecutionStore, ExecutionUpdate, JobStore, JobTransition, StoreError, UpdateOutcome,
    WatermarkStore,
};

/// Name of the partial unique index that allows one Running execution per job.
const ONE_RUNNING_INDEX: &str = "job_executions_one_running";

const JOB_COLUMNS: &str = "job_id, config_id, work_key, payload, scheduled_for, status, guarantee, attempts, available_at, created_at, updated_at";

const EXECUTION_COLUMNS: &str =
    "execution_id, job_id, worker_id, started_at, finished_at, result, attempt, error";

/// Postgres-backed watermark, job and execution store.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresStore {
    /// Wrap an existing pool. `handle` must belong to the runtime the pool was
    /// created on.
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    /// Connect a pool and capture the current runtime handle.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self::new(pool, Handle::current()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn block_on<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        self.handle.block_on(fut)
    }

    async fn fetch_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn fetch_execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE execution_id = $1"
        ))
        .bind(execution_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_execution", e))?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn fetch_watermark(&self, config_id: &ConfigId) -> Result<Option<ProducerConfig>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT config_id, last_produced_timestamp
            FROM producer_config
            WHERE config_id = $1
            "#,
        )
        .bind(config_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_watermark", e))?;

        row.map(|row| {
            Ok(ProducerConfig::new(
                ConfigId::from_raw(get::<String>(&row, "config_id")?),
                get::<i64>(&row, "last_produced_timestamp")?,
            ))
        })
        .transpose()
    }
}

impl WatermarkStore for PostgresStore {
    fn get_watermark(&self, config_id: &ConfigId) -> Result<ProducerConfig, StoreError> {
        self.block_on(self.fetch_watermark(config_id))?
            .ok_or_else(|| StoreError::NotFound(format!("producer config {config_id}")))
    }

    #[instrument(skip(self, config_id), fields(config_id = %config_id), err)]
    fn advance_watermark(
        &self,
        config_id: &ConfigId,
        expected_old: EpochMillis,
        new_value: EpochMillis,
    ) -> Result<ProducerConfig, StoreError> {
        ProducerConfig::check_advance(expected_old, new_value)?;

        self.block_on(async {
            let result = sqlx::query(
                r#"
                UPDATE producer_config
                SET last_produced_timestamp = $3
                WHERE config_id = $1 AND last_produced_timestamp = $2
                "#,
            )
            .bind(config_id.as_str())
            .bind(expected_old)
            .bind(new_value)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("advance_watermark", e))?;

            if result.rows_affected() == 1 {
                return Ok(ProducerConfig::new(config_id.clone(), new_value));
            }

            match self.fetch_watermark(config_id).await? {
                Some(current) => Err(StoreError::Conflict(format!(
                    "watermark for {config_id}: expected {expected_old}, found {}",
                    current.last_produced_timestamp
                ))),
                None => Err(StoreError::NotFound(format!("producer config {config_id}"))),
            }
        })
    }
}

impl JobStore for PostgresStore {
    #[instrument(skip(self, job), fields(job_id = %job.job_id), err)]
    fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    job_id,
                    config_id,
                    work_key,
                    payload,
                    scheduled_for,
                    status,
                    guarantee,
                    attempts,
                    available_at,
                    created_at,
                    updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(job.job_id.as_str())
            .bind(job.config_id.as_str())
            .bind(&job.work_key)
            .bind(&job.payload)
            .bind(job.scheduled_for)
            .bind(job.status.as_str())
            .bind(job.guarantee.as_str())
            .bind(attempts_to_db(job.attempts))
            .bind(job.available_at)
            .bind(job.created_at)
            .bind(job.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_job", e))?;

            Ok(())
        })
    }

    fn get_job(&self, job_id: &JobId) -> Result<Option<Job>, StoreError> {
        self.block_on(self.fetch_job(job_id))
    }

    fn list_pending(&self, now: EpochMillis, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {JOB_COLUMNS}
                FROM jobs
                WHERE status = 'pending' AND available_at <= $1
                ORDER BY scheduled_for ASC, job_id ASC
                LIMIT $2
                "#
            ))
            .bind(now)
            .bind(limit_to_db(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_pending", e))?;

            rows.iter().map(job_from_row).collect()
        })
    }

    fn list_retryable(&self, max_attempts: u32, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {JOB_COLUMNS}
                FROM jobs
                WHERE status = 'failed' AND guarantee = 'at_least_once' AND attempts < $1
                ORDER BY updated_at ASC, job_id ASC
                LIMIT $2
                "#
            ))
            .bind(attempts_to_db(max_attempts))
            .bind(limit_to_db(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_retryable", e))?;

            rows.iter().map(job_from_row).collect()
        })
    }

    fn list_stale_dispatched(
        &self,
        updated_before: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {JOB_COLUMNS}
                FROM jobs
                WHERE status = 'dispatched' AND updated_at < $1
                ORDER BY updated_at ASC, job_id ASC
                LIMIT $2
                "#
            ))
            .bind(updated_before)
            .bind(limit_to_db(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_stale_dispatched", e))?;

            rows.iter().map(job_from_row).collect()
        })
    }

    #[instrument(skip(self, job_id, transition), fields(job_id = %job_id, from = %transition.from, to = %transition.to))]
    fn transition_job(&self, job_id: &JobId, transition: &JobTransition) -> Result<Job, StoreError> {
        transition.from.check_transition(transition.to)?;

        self.block_on(async {
            let row = sqlx::query(&format!(
                r#"
                UPDATE jobs
                SET status = $3,
                    attempts = COALESCE($4, attempts),
                    available_at = COALESCE($5, available_at),
                    updated_at = $6
                WHERE job_id = $1
                  AND status = $2
                  AND ($7::INTEGER IS NULL OR attempts = $7)
                  AND ($8::BIGINT IS NULL OR available_at <= $8)
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(job_id.as_str())
            .bind(transition.from.as_str())
            .bind(transition.to.as_str())
            .bind(transition.attempts.map(attempts_to_db))
            .bind(transition.available_at)
            .bind(transition.at)
            .bind(transition.expected_attempts.map(attempts_to_db))
            .bind(transition.available_by)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("transition_job", e))?;

            if let Some(row) = row {
                return job_from_row(&row);
            }

            match self.fetch_job(job_id).await? {
                Some(current) => {
                    debug!(job_id = %job_id, found = %current.status, "job transition lost");
                    // report whichever guard failed on the row as it is now
                    Err(transition
                        .check_guards(&current)
                        .err()
                        .unwrap_or_else(|| {
                            StoreError::Conflict(format!("job {job_id}: changed during transition"))
                        }))
                }
                None => Err(StoreError::NotFound(format!("job {job_id}"))),
            }
        })
    }

    fn stats(&self) -> Result<JobStats, StoreError> {
        self.block_on(async {
            let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("stats", e))?;

            let mut stats = JobStats::default();
            for row in rows {
                let status = parse_status(&get::<String>(&row, "status")?)?;
                let total = get::<i64>(&row, "total")?;
                match status {
                    JobStatus::Pending => stats.pending = total as usize,
                    JobStatus::Dispatched => stats.dispatched = total as usize,
                    JobStatus::Completed => stats.completed = total as usize,
                    JobStatus::Failed => stats.failed = total as usize,
                }
            }
            Ok(stats)
        })
    }
}

impl ExecutionStore for PostgresStore {
    #[instrument(skip(self, execution), fields(execution_id = %execution.execution_id), err)]
    fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        self.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO job_executions (
                    execution_id,
                    job_id,
                    worker_id,
                    started_at,
                    finished_at,
                    result,
                    attempt,
                    error
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(execution.execution_id.as_str())
            .bind(execution.job_id.as_str())
            .bind(execution.worker_id.as_str())
            .bind(execution.started_at)
            .bind(execution.finished_at)
            .bind(execution.result.as_str())
            .bind(attempts_to_db(execution.attempt))
            .bind(execution.error.as_deref())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_execution", e))?;

            Ok(())
        })
    }

    fn get_execution(&self, execution_id: &ExecutionId) -> Result<Option<Execution>, StoreError> {
        self.block_on(self.fetch_execution(execution_id))
    }

    #[instrument(skip(self, execution_id, update), fields(execution_id = %execution_id, result = %update.result))]
    fn update_execution(
        &self,
        execution_id: &ExecutionId,
        update: &ExecutionUpdate,
    ) -> Result<UpdateOutcome, StoreError> {
        if !update.result.is_finished() {
            return Err(StoreError::Invariant(format!(
                "execution {execution_id} can only be finished, not set to {}",
                update.result
            )));
        }

        self.block_on(async {
            let row = sqlx::query(&format!(
                r#"
                UPDATE job_executions
                SET result = $2, finished_at = $3, error = $4
                WHERE execution_id = $1 AND result = 'running'
                RETURNING {EXECUTION_COLUMNS}
                "#
            ))
            .bind(execution_id.as_str())
            .bind(update.result.as_str())
            .bind(update.finished_at)
            .bind(update.error.as_deref())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_execution", e))?;

            if let Some(row) = row {
                return Ok(UpdateOutcome::Applied(execution_from_row(&row)?));
            }

            match self.fetch_execution(execution_id).await? {
                Some(current) if current.result == update.result => {
                    Ok(UpdateOutcome::AlreadyApplied(current))
                }
                Some(current) => Err(StoreError::Conflict(format!(
                    "execution {execution_id} already finished as {}",
                    current.result
                ))),
                None => Err(StoreError::NotFound(format!("execution {execution_id}"))),
            }
        })
    }

    fn list_executions(&self, job_id: &JobId) -> Result<Vec<Execution>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {EXECUTION_COLUMNS}
                FROM job_executions
                WHERE job_id = $1
                ORDER BY attempt ASC
                "#
            ))
            .bind(job_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_executions", e))?;

            rows.iter().map(execution_from_row).collect()
        })
    }

    fn list_stale_running(
        &self,
        started_before: EpochMillis,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        self.block_on(async {
            let rows = sqlx::query(&format!(
                r#"
                SELECT {EXECUTION_COLUMNS}
                FROM job_executions
                WHERE result = 'running' AND started_at < $1
                ORDER BY started_at ASC, execution_id ASC
                LIMIT $2
                "#
            ))
            .bind(started_before)
            .bind(limit_to_db(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_stale_running", e))?;

            rows.iter().map(execution_from_row).collect()
        })
    }
}

fn get<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get::<T, _>(column)
        .map_err(|e| StoreError::Invariant(format!("failed to read column {column}: {e}")))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    Ok(Job {
        job_id: JobId::from_raw(get::<String>(row, "job_id")?),
        config_id: ConfigId::from_raw(get::<String>(row, "config_id")?),
        work_key: get(row, "work_key")?,
        payload: get(row, "payload")?,
        scheduled_for: get(row, "scheduled_for")?,
        status: parse_status(&get::<String>(row, "status")?)?,
        guarantee: parse_guarantee(&get::<String>(row, "guarantee")?)?,
        attempts: attempts_from_db(get(row, "attempts")?),
        available_at: get(row, "available_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    Ok(Execution {
        execution_id: ExecutionId::from_raw(get::<String>(row, "execution_id")?),
        job_id: JobId::from_raw(get::<String>(row, "job_id")?),
        worker_id: WorkerId::from_raw(get::<String>(row, "worker_id")?),
        started_at: get(row, "started_at")?,
        finished_at: get(row, "finished_at")?,
        result: parse_result(&get::<String>(row, "result")?)?,
        attempt: attempts_from_db(get(row, "attempt")?),
        error: get(row, "error")?,
    })
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    raw.parse::<JobStatus>().map_err(StoreError::from)
}

fn parse_guarantee(raw: &str) -> Result<DeliveryGuarantee, StoreError> {
    raw.parse::<DeliveryGuarantee>().map_err(StoreError::from)
}

fn parse_result(raw: &str) -> Result<ExecutionResult, StoreError> {
    raw.parse::<ExecutionResult>().map_err(StoreError::from)
}

fn attempts_to_db(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

fn attempts_from_db(attempts: i32) -> u32 {
    u32::try_from(attempts).unwrap_or(0)
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());

            match db_err.code().as_deref() {
                Some("23505") if db_err.constraint() == Some(ONE_RUNNING_INDEX) => {
                    StoreError::Conflict(msg)
                }
                Some("23505") => StoreError::Duplicate(msg),
                Some("23503") => StoreError::NotFound(msg),
                Some("23514") => StoreError::Invariant(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {}", operation))
        }
        sqlx::Error::RowNotFound => {
            // Not expected: every query uses fetch_optional/fetch_all.
            StoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attempt_conversion_saturates() {
        assert_eq!(attempts_to_db(3), 3);
        assert_eq!(attempts_to_db(u32::MAX), i32::MAX);
        assert_eq!(attempts_from_db(-1), 0);
        assert_eq!(attempts_from_db(7), 7);
    }

    #[test]
    fn unknown_status_text_is_an_invariant_error() {
        assert!(matches!(parse_status("queued"), Err(StoreError::Invariant(_))));
        assert_eq!(parse_status("dispatched").unwrap(), JobStatus::Dispatched);
        assert_eq!(parse_result("running").unwrap(), ExecutionResult::Running);
        assert_eq!(parse_guarantee("at_most_once").unwrap(), DeliveryGuarantee::AtMostOnce);
        assert!(matches!(parse_guarantee("once"), Err(StoreError::Invariant(_))));
    }

    #[test]
    fn pool_errors_are_transient() {
        assert!(map_sqlx_error("op", sqlx::Error::PoolTimedOut).is_transient());
        assert!(map_sqlx_error("op", sqlx::Error::PoolClosed).is_transient());
        assert!(matches!(
            map_sqlx_error("op", sqlx::Error::RowNotFound),
            StoreError::NotFound(_)
        ));
    }
}
