//! Sqlite-backed store for step records.
//!
//! This module provides the durable table of steps plus the companion
//! tag -> velocity table. All state-mutating callers are serialized
//! through the hub's execution queue; reads may run concurrently.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use super::migrations::MigrationRunner;
use super::step::{Step, StepStatus};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Referenced step id does not exist.
    #[error("Step not found: {0}")]
    NotFound(String),

    /// Serialization/deserialization of step fields failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored status string is not a valid status.
    #[error("Corrupt status column: {0}")]
    CorruptStatus(#[from] super::step::UnknownStatus),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] super::migrations::MigrationError),
}

/// One candidate row from the dispatch query.
///
/// Only the fields the scheduler needs; workers fetch full step bodies
/// by id after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchRow {
    pub id: String,
    pub priority: i64,
    pub scope: String,
    pub velocity: Option<f64>,
    pub tag: String,
}

/// Result of an error-report query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Number of error rows matching the exclusion filter.
    pub total: i64,
    /// Number of rows returned in `table` (<= requested limit).
    pub count: i64,
    /// Full step payloads for the returned rows.
    pub table: Vec<Step>,
}

/// Sqlite-backed step store.
pub struct StepStore {
    pool: SqlitePool,
}

impl StepStore {
    /// Connects to the database and returns a new store.
    ///
    /// # Arguments
    ///
    /// * `database_url` - sqlite connection string (e.g. "sqlite://hub.db")
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // WAL lets read queries proceed while the execution queue writes.
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Creates a store from an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs database migrations.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        let runner = MigrationRunner::new(self.pool.clone());
        runner.run_migrations().await?;
        Ok(())
    }

    /// Idempotent upsert keyed by step id; sets epoch to now.
    ///
    /// When the step carries a velocity, the tag -> velocity mapping is
    /// upserted alongside it so the scheduler sees the cap.
    pub async fn insert_or_replace(&self, step: &Step, status: StepStatus) -> Result<(), StoreError> {
        let parents = serde_json::to_string(&step.parents)?;
        let children = serde_json::to_string(&step.children)?;
        let epoch = now_epoch();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO steps (
                id, priority, scope, tag, velocity, status, epoch, msg, trace, parents, children
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                priority = excluded.priority,
                scope = excluded.scope,
                tag = excluded.tag,
                velocity = excluded.velocity,
                status = excluded.status,
                epoch = excluded.epoch,
                msg = excluded.msg,
                trace = excluded.trace,
                parents = excluded.parents,
                children = excluded.children
            "#,
        )
        .bind(&step.id)
        .bind(step.priority)
        .bind(&step.scope)
        .bind(&step.tag)
        .bind(step.velocity)
        .bind(status.as_str())
        .bind(epoch)
        .bind(&step.msg)
        .bind(&step.trace)
        .bind(&parents)
        .bind(&children)
        .execute(&mut *tx)
        .await?;

        if let Some(velocity) = step.velocity {
            sqlx::query(
                r#"
                INSERT INTO tags (tag, velocity) VALUES (?, ?)
                ON CONFLICT (tag) DO UPDATE SET velocity = excluded.velocity
                "#,
            )
            .bind(&step.tag)
            .bind(velocity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Retrieves a step by id.
    pub async fn get_by_id(&self, id: &str) -> Result<Step, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, priority, scope, tag, velocity, status, epoch, msg, trace, parents, children
            FROM steps
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => step_from_row(&row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    /// Updates status and epoch, and optionally msg/trace.
    ///
    /// Fails with `StoreError::NotFound` if the id is unknown.
    pub async fn set_status(
        &self,
        id: &str,
        status: StepStatus,
        msg: Option<&str>,
        trace: Option<&str>,
    ) -> Result<(), StoreError> {
        let epoch = now_epoch();

        let result = if msg.is_some() || trace.is_some() {
            sqlx::query("UPDATE steps SET status = ?, epoch = ?, msg = ?, trace = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(epoch)
                .bind(msg)
                .bind(trace)
                .bind(id)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("UPDATE steps SET status = ?, epoch = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(epoch)
                .bind(id)
                .execute(&self.pool)
                .await?
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(())
    }

    /// Counts steps grouped by status.
    ///
    /// Terminal statuses (success, cancel) are excluded unless
    /// `wildcard` is set.
    pub async fn count_by_status(
        &self,
        wildcard: bool,
    ) -> Result<BTreeMap<StepStatus, i64>, StoreError> {
        let sql = if wildcard {
            "SELECT status, COUNT(*) AS n FROM steps GROUP BY status"
        } else {
            "SELECT status, COUNT(*) AS n FROM steps \
             WHERE status NOT IN ('success', 'cancel') GROUP BY status"
        };

        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            counts.insert(status.parse::<StepStatus>()?, n);
        }

        Ok(counts)
    }

    /// Selects candidate rows for dispatch.
    ///
    /// Candidates are pending steps, plus working steps whose epoch is
    /// older than `stale_before` (presumed abandoned). Rows are ordered
    /// by priority descending then epoch ascending, restricted to the
    /// given scopes, and paginated by `chunk`/`offset`.
    ///
    /// An empty scope set yields an empty result without querying.
    pub async fn select_dispatchable(
        &self,
        scopes: &[String],
        stale_before: i64,
        chunk: i64,
        offset: i64,
    ) -> Result<Vec<DispatchRow>, StoreError> {
        if scopes.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; scopes.len()].join(", ");
        let sql = format!(
            "SELECT id, priority, scope, velocity, tag FROM steps \
             WHERE (status = 'pending' OR (status = 'working' AND epoch < ?)) \
             AND scope IN ({placeholders}) \
             ORDER BY priority DESC, epoch ASC \
             LIMIT ? OFFSET ?"
        );

        let mut query = sqlx::query(&sql).bind(stale_before);
        for scope in scopes {
            query = query.bind(scope);
        }
        query = query.bind(chunk).bind(offset);

        let rows = query.fetch_all(&self.pool).await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            candidates.push(DispatchRow {
                id: row.get("id"),
                priority: row.get("priority"),
                scope: row.get("scope"),
                velocity: row.get("velocity"),
                tag: row.get("tag"),
            });
        }

        Ok(candidates)
    }

    /// Marks the given ids as working with a fresh epoch, in a single
    /// statement. The scheduler calls this exactly once per pass with
    /// the final id set.
    pub async fn claim(&self, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE steps SET status = 'working', epoch = ? WHERE id IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql).bind(now_epoch());
        for id in ids {
            query = query.bind(id);
        }
        query.execute(&self.pool).await?;

        Ok(())
    }

    /// Returns an error report: up to `limit` error rows plus totals.
    ///
    /// Rows whose msg or trace contains any of the `exclude` values
    /// (case-insensitively) are filtered out. Exclusion values are bound
    /// as parameters, never concatenated into the SQL text.
    pub async fn fetch_errors(
        &self,
        limit: i64,
        exclude: &[String],
    ) -> Result<ErrorReport, StoreError> {
        let mut filter = String::from("status = 'error'");
        for _ in exclude {
            filter.push_str(
                " AND NOT (instr(lower(COALESCE(msg, '')), lower(?)) > 0 \
                 OR instr(lower(COALESCE(trace, '')), lower(?)) > 0)",
            );
        }

        let count_sql = format!("SELECT COUNT(*) AS n FROM steps WHERE {filter}");
        let mut count_query = sqlx::query(&count_sql);
        for value in exclude {
            count_query = count_query.bind(value).bind(value);
        }
        let total: i64 = count_query.fetch_one(&self.pool).await?.get("n");

        let rows_sql = format!(
            "SELECT id, priority, scope, tag, velocity, status, epoch, msg, trace, parents, children \
             FROM steps WHERE {filter} ORDER BY epoch ASC LIMIT ?"
        );
        let mut rows_query = sqlx::query(&rows_sql);
        for value in exclude {
            rows_query = rows_query.bind(value).bind(value);
        }
        rows_query = rows_query.bind(limit);

        let rows = rows_query.fetch_all(&self.pool).await?;

        let mut table = Vec::with_capacity(rows.len());
        for row in &rows {
            table.push(step_from_row(row)?);
        }

        Ok(ErrorReport {
            total,
            count: table.len() as i64,
            table,
        })
    }

    /// Returns the current tag -> velocity mapping.
    ///
    /// Tags absent from the mapping are unlimited.
    pub async fn tag_velocities(&self) -> Result<HashMap<String, f64>, StoreError> {
        let rows = sqlx::query("SELECT tag, velocity FROM tags")
            .fetch_all(&self.pool)
            .await?;

        let mut velocities = HashMap::with_capacity(rows.len());
        for row in rows {
            velocities.insert(row.get("tag"), row.get("velocity"));
        }

        Ok(velocities)
    }

    /// Hard-clears all step and tag rows.
    ///
    /// **Warning**: destructive maintenance operation.
    pub async fn delete_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM steps").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM tags").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Bulk-transitions error rows (and, if requested, working rows)
    /// back to pending, clearing error info. Returns the number of rows
    /// changed.
    pub async fn reset_errors(&self, include_working: bool) -> Result<u64, StoreError> {
        let sql = if include_working {
            "UPDATE steps SET status = 'pending', epoch = ?, msg = NULL, trace = NULL \
             WHERE status IN ('error', 'working')"
        } else {
            "UPDATE steps SET status = 'pending', epoch = ?, msg = NULL, trace = NULL \
             WHERE status = 'error'"
        };

        let result = sqlx::query(sql)
            .bind(now_epoch())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Current unix timestamp in seconds.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Maps a full steps row to a `Step`.
fn step_from_row(row: &SqliteRow) -> Result<Step, StoreError> {
    let status: String = row.get("status");
    let parents: String = row.get("parents");
    let children: String = row.get("children");

    Ok(Step {
        id: row.get("id"),
        priority: row.get("priority"),
        scope: row.get("scope"),
        tag: row.get("tag"),
        velocity: row.get("velocity"),
        status: status.parse::<StepStatus>()?,
        epoch: row.get("epoch"),
        msg: row.get("msg"),
        trace: row.get("trace"),
        parents: serde_json::from_str::<BTreeSet<String>>(&parents)?,
        children: serde_json::from_str::<BTreeSet<String>>(&children)?,
    })
}
