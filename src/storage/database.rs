//! PostgreSQL client for the event warehouse.
//!
//! Wraps a read-write pool and an optional read-only pool, classifies
//! transient connection failures for the shared retry policy, and exposes
//! the small operational-state surface (computed markers, advisory lock
//! rows, DB-backed operator log).

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::info;

use crate::config::Ctx;
use crate::retry::RetryPolicy;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A lock owned by another run is still held.
    #[error("Lock '{0}' is held")]
    LockHeld(String),
}

/// Postgres error codes that never resolve on retry, even under the
/// "durable" connection option.
const NON_RETRYABLE_CODES: &[&str] = &[
    "54000", // program_limit_exceeded
    "42703", // undefined_column
    "3D000", // invalid_catalog_name
    "22021", // character_not_in_repertoire
];

/// Postgres error codes for capacity conditions that clear on their own.
const RETRYABLE_CODES: &[&str] = &[
    "53300", // too_many_connections
    "57P03", // cannot_connect_now
];

/// Classifies a sqlx error as transient (worth retrying) or permanent.
pub fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            if let Some(code) = db.code() {
                if NON_RETRYABLE_CODES.contains(&code.as_ref()) {
                    return false;
                }
                if RETRYABLE_CODES.contains(&code.as_ref()) {
                    return true;
                }
            }
            let msg = db.message();
            msg.contains("bad connection") || msg.contains("cannot assign requested address")
        }
        _ => false,
    }
}

/// Warehouse database client. Cloning shares the underlying pools.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    ro_pool: Option<PgPool>,
}

impl Database {
    /// Connects the read-write pool and, when configured, the read-only
    /// pool, retrying transient failures.
    pub async fn connect(ctx: &Ctx) -> Result<Self, DatabaseError> {
        let policy = RetryPolicy::new(6).with_initial_delay(Duration::from_secs(1));
        let url = ctx.connect_url();
        let pool = policy
            .run("db-connect", is_transient, || {
                PgPoolOptions::new()
                    .max_connections(20)
                    .min_connections(1)
                    .acquire_timeout(Duration::from_secs(30))
                    .connect(&url)
            })
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        let ro_pool = match ctx.connect_url_ro() {
            Some(ro_url) => Some(
                policy
                    .run("db-connect-ro", is_transient, || {
                        PgPoolOptions::new()
                            .max_connections(20)
                            .acquire_timeout(Duration::from_secs(30))
                            .connect(&ro_url)
                    })
                    .await
                    .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?,
            ),
            None => None,
        };

        Ok(Self { pool, ro_pool })
    }

    /// Creates a client from an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, ro_pool: None }
    }

    /// The read-write pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The pool to use for analytical SELECTs: read-only when available.
    pub fn read_pool(&self) -> &PgPool {
        self.ro_pool.as_ref().unwrap_or(&self.pool)
    }

    /// Executes a statement with retry on transient failures.
    pub async fn exec(&self, sql: &str) -> Result<u64, DatabaseError> {
        let policy = RetryPolicy::new(4).with_initial_delay(Duration::from_millis(500));
        let result = policy
            .run("db-exec", is_transient, || {
                sqlx::query(sql).execute(&self.pool)
            })
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Computed markers and locks (gha_computed)
    // =========================================================================

    /// Records that a named computation ran at `dt`.
    pub async fn set_computed(&self, metric: &str, dt: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO gha_computed(metric, dt) VALUES ($1, $2)")
            .bind(metric)
            .bind(dt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Last time a named computation ran, if ever.
    pub async fn last_computed(
        &self,
        metric: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let row = sqlx::query("SELECT max(dt) AS dt FROM gha_computed WHERE metric = $1")
            .bind(metric)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("dt").ok().flatten())
    }

    /// Attempts to take a named lock row. Returns `LockHeld` when another
    /// run owns it.
    pub async fn acquire_lock(&self, name: &str) -> Result<(), DatabaseError> {
        let held: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT dt FROM gha_computed WHERE metric = $1 LIMIT 1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        if held.is_some() {
            return Err(DatabaseError::LockHeld(name.to_string()));
        }
        sqlx::query("INSERT INTO gha_computed(metric, dt) VALUES ($1, now())")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Releases a named lock row.
    pub async fn release_lock(&self, name: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM gha_computed WHERE metric = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Clears lock rows older than `age`; orphans from crashed runs.
    pub async fn clear_stale_locks(
        &self,
        prefix: &str,
        age: Duration,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM gha_computed WHERE metric LIKE $1 AND dt < now() - $2::interval",
        )
        .bind(format!("{prefix}%"))
        .bind(format!("{} seconds", age.as_secs()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Operator-facing log handle.
///
/// Tees every line to `tracing` and, unless disabled, to the `gha_logs`
/// table that dashboards and operators read.
pub struct Logger {
    pool: Option<PgPool>,
    prog: String,
    proj: String,
    run_dt: DateTime<Utc>,
}

impl Logger {
    /// Creates a logger for one program run.
    pub fn new(db: Option<&Database>, prog: &str, proj: &str) -> Self {
        Self {
            pool: db.map(|d| d.pool().clone()),
            prog: prog.to_string(),
            proj: proj.to_string(),
            run_dt: Utc::now(),
        }
    }

    /// Logs one operator-visible line.
    pub async fn log(&self, msg: &str) {
        info!(prog = %self.prog, proj = %self.proj, "{msg}");
        if let Some(pool) = &self.pool {
            let result = sqlx::query(
                "INSERT INTO gha_logs(run_dt, prog, proj, msg) VALUES ($1, $2, $3, $4)",
            )
            .bind(self.run_dt)
            .bind(&self.prog)
            .bind(&self.proj)
            .bind(msg)
            .execute(pool)
            .await;
            if let Err(err) = result {
                // The log table is best-effort; losing a line must not fail a run.
                tracing::debug!(error = %err, "db log write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification_io() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(is_transient(&err));
        assert!(is_transient(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_non_transient_classification() {
        assert!(!is_transient(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn test_error_display() {
        let err = DatabaseError::LockHeld("giant_lock:kubernetes".to_string());
        assert!(err.to_string().contains("giant_lock:kubernetes"));
    }
}
