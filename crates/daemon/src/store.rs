//! PulseStore — durable pulse persistence and the authoritative source of
//! status transitions.
//!
//! Every other component mutates pulses only through these operations.
//! The dispatch guard is `mark_processing`: a single conditional UPDATE,
//! so two concurrent claimers can never both observe success.
//!
//! Timestamps are stored as integer Unix milliseconds (always UTC);
//! `sticky_notes` and `tags` as JSON text; enums as lowercase text.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use reeve_domain::pulse::{NewPulse, Pulse, PulseStatus, StatusFilter};

/// Store-level failure. A conditional transition that finds the pulse in
/// the wrong state is a normal `false`/`None` result, not an error.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),

    #[error("corrupt record {id}: {detail}")]
    Corrupt { id: i64, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pulses (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    scheduled_at          INTEGER NOT NULL,
    prompt                TEXT    NOT NULL,
    priority              TEXT    NOT NULL DEFAULT 'normal',
    status                TEXT    NOT NULL DEFAULT 'pending',
    session_id            TEXT,
    sticky_notes          TEXT,
    tags                  TEXT,
    created_at            INTEGER NOT NULL,
    created_by            TEXT    NOT NULL DEFAULT 'system',
    executed_at           INTEGER,
    execution_duration_ms INTEGER,
    error_message         TEXT,
    retry_count           INTEGER NOT NULL DEFAULT 0,
    max_retries           INTEGER NOT NULL DEFAULT 3
);
CREATE INDEX IF NOT EXISTS idx_pulse_execution ON pulses (status, scheduled_at, priority);
CREATE INDEX IF NOT EXISTS idx_pulse_upcoming  ON pulses (scheduled_at, status);
"#;

/// Priority sort key for dispatch ordering, mirroring
/// [`PulsePriority::rank`](reeve_domain::pulse::PulsePriority::rank).
const PRIORITY_RANK_SQL: &str = "CASE priority \
    WHEN 'critical' THEN 1 \
    WHEN 'high' THEN 2 \
    WHEN 'normal' THEN 3 \
    WHEN 'low' THEN 4 \
    WHEN 'deferred' THEN 5 \
    ELSE 6 END";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stats types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Queue counters for operator introspection (`GET /api/pulse/stats`).
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub overdue: i64,
    pub failed: i64,
    pub completed_today: i64,
    pub processing: i64,
}

/// Rolling 7-day execution stats (`GET /api/stats`).
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStats {
    pub total_completed_7d: i64,
    pub total_failed_7d: i64,
    /// completed / (completed + failed) over the window; 1.0 when idle.
    pub success_rate: f64,
    pub avg_duration_ms: Option<f64>,
    pub recent_failures: Vec<RecentFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentFailure {
    pub id: i64,
    pub prompt: String,
    pub error_message: Option<String>,
    pub executed_at: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PulseStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct PulseStore {
    pool: SqlitePool,
}

impl PulseStore {
    /// Open (creating if needed) the SQLite file at `path` and ensure the
    /// schema exists.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    /// In-memory store for tests. Single connection: each SQLite `:memory:`
    /// connection is its own database.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.initialize().await?;
        Ok(store)
    }

    async fn initialize(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a PENDING pulse. Prompt validation is the caller's job.
    pub async fn schedule(&self, pulse: NewPulse) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO pulses \
             (scheduled_at, prompt, priority, status, session_id, sticky_notes, tags, \
              created_at, created_by, retry_count, max_retries) \
             VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?, 0, ?)",
        )
        .bind(pulse.scheduled_at.timestamp_millis())
        .bind(&pulse.prompt)
        .bind(pulse.priority.as_str())
        .bind(&pulse.session_id)
        .bind(to_json(&pulse.sticky_notes)?)
        .bind(to_json(&pulse.tags)?)
        .bind(Utc::now().timestamp_millis())
        .bind(&pulse.created_by)
        .bind(pulse.max_retries)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<Pulse>> {
        let row = sqlx::query("SELECT * FROM pulses WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| map_pulse(&r)).transpose()
    }

    /// PENDING pulses whose instant has arrived, in dispatch order:
    /// priority rank, then scheduled_at, then id (FIFO within priority).
    pub async fn get_due(&self, limit: i64) -> StoreResult<Vec<Pulse>> {
        let sql = format!(
            "SELECT * FROM pulses \
             WHERE status = 'pending' AND scheduled_at <= ? \
             ORDER BY {PRIORITY_RANK_SQL}, scheduled_at ASC, id ASC \
             LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(Utc::now().timestamp_millis())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(map_pulse).collect()
    }

    /// Pulses in any of `statuses` (default PENDING), soonest first.
    pub async fn get_upcoming(
        &self,
        limit: i64,
        statuses: &[PulseStatus],
    ) -> StoreResult<Vec<Pulse>> {
        let statuses = if statuses.is_empty() {
            &[PulseStatus::Pending][..]
        } else {
            statuses
        };
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM pulses WHERE status IN ({placeholders}) \
             ORDER BY scheduled_at ASC LIMIT ?"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(map_pulse).collect()
    }

    /// Filtered listing for operators, most recently scheduled first.
    pub async fn get_by_status(
        &self,
        filter: StatusFilter,
        limit: i64,
    ) -> StoreResult<Vec<Pulse>> {
        let (condition, bind_now) = match filter {
            StatusFilter::All => ("1 = 1".to_string(), false),
            StatusFilter::Overdue => ("status = 'pending' AND scheduled_at < ?".to_string(), true),
            StatusFilter::Status(s) => (format!("status = '{}'", s.as_str()), false),
        };
        let sql = format!(
            "SELECT * FROM pulses WHERE {condition} ORDER BY scheduled_at DESC LIMIT ?"
        );
        let mut query = sqlx::query(&sql);
        if bind_now {
            query = query.bind(Utc::now().timestamp_millis());
        }
        let rows = query.bind(limit).fetch_all(&self.pool).await?;
        rows.iter().map(map_pulse).collect()
    }

    /// Atomic dispatch guard: PENDING → PROCESSING. Returns `false` when
    /// the pulse is missing or not PENDING; two claimers can never both
    /// see `true` for the same pulse.
    pub async fn mark_processing(&self, id: i64) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE pulses SET status = 'processing' WHERE id = ? AND status = 'pending'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_completed(&self, id: i64, duration_ms: i64) -> StoreResult<()> {
        sqlx::query(
            "UPDATE pulses SET status = 'completed', executed_at = ?, execution_duration_ms = ? \
             WHERE id = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(duration_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fail the pulse; when retry budget remains and `should_retry`, insert
    /// a retry pulse with exponential backoff (2^retry_count minutes) and
    /// return its id. The parent stays FAILED either way.
    pub async fn mark_failed(
        &self,
        id: i64,
        error_message: &str,
        should_retry: bool,
    ) -> StoreResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM pulses WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let parent = match row {
            Some(r) => map_pulse(&r)?,
            None => return Ok(None),
        };

        let now = Utc::now();
        sqlx::query(
            "UPDATE pulses SET status = 'failed', error_message = ?, executed_at = ? WHERE id = ?",
        )
        .bind(error_message)
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let mut retry_id = None;
        if should_retry && parent.retry_count < parent.max_retries {
            let backoff = Duration::minutes(2i64.saturating_pow(parent.retry_count.max(0) as u32));
            let retry_at = now + backoff;
            let result = sqlx::query(
                "INSERT INTO pulses \
                 (scheduled_at, prompt, priority, status, session_id, sticky_notes, tags, \
                  created_at, created_by, retry_count, max_retries) \
                 VALUES (?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(retry_at.timestamp_millis())
            .bind(&parent.prompt)
            .bind(parent.priority.as_str())
            .bind(&parent.session_id)
            .bind(to_json(&parent.sticky_notes)?)
            .bind(to_json(&parent.tags)?)
            .bind(now.timestamp_millis())
            .bind(format!("retry_{}", parent.created_by))
            .bind(parent.retry_count + 1)
            .bind(parent.max_retries)
            .execute(&mut *tx)
            .await?;
            retry_id = Some(result.last_insert_rowid());
        }

        tx.commit().await?;
        Ok(retry_id)
    }

    /// PENDING → CANCELLED. `false` when not PENDING.
    pub async fn cancel(&self, id: i64) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE pulses SET status = 'cancelled' WHERE id = ? AND status = 'pending'")
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move a PENDING pulse to a new instant. `false` when not PENDING.
    pub async fn reschedule(&self, id: i64, new_scheduled_at: DateTime<Utc>) -> StoreResult<bool> {
        let result =
            sqlx::query("UPDATE pulses SET scheduled_at = ? WHERE id = ? AND status = 'pending'")
                .bind(new_scheduled_at.timestamp_millis())
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn stats(&self) -> StoreResult<QueueStats> {
        let now = Utc::now();
        let day_ago = (now - Duration::hours(24)).timestamp_millis();
        let row = sqlx::query(
            "SELECT \
             SUM(status = 'pending') AS pending, \
             SUM(status = 'pending' AND scheduled_at < ?) AS overdue, \
             SUM(status = 'failed') AS failed, \
             SUM(status = 'completed' AND executed_at >= ?) AS completed_today, \
             SUM(status = 'processing') AS processing \
             FROM pulses",
        )
        .bind(now.timestamp_millis())
        .bind(day_ago)
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            pending: sum_col(&row, "pending"),
            overdue: sum_col(&row, "overdue"),
            failed: sum_col(&row, "failed"),
            completed_today: sum_col(&row, "completed_today"),
            processing: sum_col(&row, "processing"),
        })
    }

    pub async fn execution_stats(&self) -> StoreResult<ExecutionStats> {
        let week_ago = (Utc::now() - Duration::days(7)).timestamp_millis();

        let row = sqlx::query(
            "SELECT \
             SUM(status = 'completed') AS completed, \
             SUM(status = 'failed') AS failed, \
             AVG(CASE WHEN status = 'completed' THEN execution_duration_ms END) AS avg_ms \
             FROM pulses WHERE executed_at >= ?",
        )
        .bind(week_ago)
        .fetch_one(&self.pool)
        .await?;

        let completed = sum_col(&row, "completed");
        let failed = sum_col(&row, "failed");
        let avg_duration_ms: Option<f64> = row.try_get("avg_ms").unwrap_or(None);
        let total = completed + failed;
        let success_rate = if total == 0 {
            1.0
        } else {
            completed as f64 / total as f64
        };

        let failures = sqlx::query(
            "SELECT id, prompt, error_message, executed_at FROM pulses \
             WHERE status = 'failed' AND executed_at >= ? \
             ORDER BY executed_at DESC LIMIT 5",
        )
        .bind(week_ago)
        .fetch_all(&self.pool)
        .await?;

        let recent_failures = failures
            .iter()
            .map(|r| {
                Ok(RecentFailure {
                    id: r.try_get("id")?,
                    prompt: reeve_domain::pulse::truncate(&r.try_get::<String, _>("prompt")?, 100),
                    error_message: r.try_get("error_message")?,
                    executed_at: r
                        .try_get::<Option<i64>, _>("executed_at")?
                        .and_then(from_millis)
                        .map(|t| reeve_domain::pulse::rfc3339(&t)),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(ExecutionStats {
            total_completed_7d: completed,
            total_failed_7d: failed,
            success_rate,
            avg_duration_ms,
            recent_failures,
        })
    }

    /// Release the backing pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row mapping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn map_pulse(row: &SqliteRow) -> StoreResult<Pulse> {
    let id: i64 = row.try_get("id").map_err(StoreError::Db)?;
    let corrupt = |detail: String| StoreError::Corrupt { id, detail };

    let scheduled_at = from_millis(row.try_get("scheduled_at")?)
        .ok_or_else(|| corrupt("scheduled_at out of range".into()))?;
    let created_at = from_millis(row.try_get("created_at")?)
        .ok_or_else(|| corrupt("created_at out of range".into()))?;
    let executed_at = row
        .try_get::<Option<i64>, _>("executed_at")?
        .and_then(from_millis);

    let priority = row
        .try_get::<String, _>("priority")?
        .parse()
        .map_err(|e| corrupt(format!("{e}")))?;
    let status = row
        .try_get::<String, _>("status")?
        .parse()
        .map_err(|e| corrupt(format!("{e}")))?;

    Ok(Pulse {
        id,
        scheduled_at,
        prompt: row.try_get("prompt")?,
        priority,
        status,
        session_id: row.try_get("session_id")?,
        sticky_notes: from_json(row.try_get("sticky_notes")?)
            .map_err(|e| corrupt(format!("sticky_notes: {e}")))?,
        tags: from_json(row.try_get("tags")?).map_err(|e| corrupt(format!("tags: {e}")))?,
        created_at,
        created_by: row.try_get("created_by")?,
        executed_at,
        execution_duration_ms: row.try_get("execution_duration_ms")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
    })
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

fn to_json(value: &Option<Vec<String>>) -> StoreResult<Option<String>> {
    match value {
        Some(list) => serde_json::to_string(list)
            .map(Some)
            .map_err(|e| StoreError::Corrupt { id: 0, detail: e.to_string() }),
        None => Ok(None),
    }
}

fn from_json(raw: Option<String>) -> Result<Option<Vec<String>>, serde_json::Error> {
    raw.map(|s| serde_json::from_str(&s)).transpose()
}

fn sum_col(row: &SqliteRow, name: &str) -> i64 {
    // SUM over an empty table is NULL.
    row.try_get::<Option<i64>, _>(name).ok().flatten().unwrap_or(0)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
