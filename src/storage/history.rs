//! SQLite history store
//!
//! Append-only log of every proxied exchange plus the persisted tier
//! selections. A single connection behind a mutex keeps writes serialized;
//! async callers hop through `spawn_blocking` so disk I/O never stalls the
//! runtime.

use crate::models::history::{HistoryRecord, ModelUsageSummary};
use crate::utils::error::{AppError, AppResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Thread-safe history database handle
#[derive(Clone)]
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

/// Terminal status written by `finish`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Completed,
    Partial,
    Error,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Completed => "completed",
            RecordStatus::Partial => "partial",
            RecordStatus::Error => "error",
        }
    }
}

impl HistoryStore {
    /// Open (or create) the database at `path` and ensure the schema
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        info!("History database ready at {}", path);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts TEXT NOT NULL,
                claimed_model TEXT NOT NULL,
                concrete_model TEXT NOT NULL DEFAULT '',
                provider TEXT NOT NULL DEFAULT '',
                is_streaming INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                stop_reason TEXT,
                request_json TEXT NOT NULL,
                openai_request_json TEXT,
                response_json TEXT,
                error TEXT,
                request_length INTEGER NOT NULL DEFAULT 0,
                response_length INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_ts ON history(ts DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_history_model ON history(concrete_model)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    /// Run a closure against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> AppResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().expect("history connection poisoned");
            f(&guard)
        })
        .await
        .map_err(|e| AppError::Internal(format!("History task failed: {}", e)))?
        .map_err(|e| AppError::Internal(format!("History query failed: {}", e)))
    }

    /// Insert a pending row at request entry; returns the row id
    pub async fn insert_pending(
        &self,
        claimed_model: &str,
        is_streaming: bool,
        request: &serde_json::Value,
    ) -> AppResult<i64> {
        let claimed_model = claimed_model.to_string();
        let request_json = request.to_string();
        let ts = now_iso();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO history (ts, claimed_model, is_streaming, status, request_json, request_length)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                params![ts, claimed_model, is_streaming as i32, request_json, request_json.len() as i64],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Record the routing outcome and translated request (first of the two
    /// in-flight updates a row receives)
    pub async fn record_translation(
        &self,
        id: i64,
        provider: &str,
        concrete_model: &str,
        openai_request: Option<&serde_json::Value>,
    ) -> AppResult<()> {
        let provider = provider.to_string();
        let concrete_model = concrete_model.to_string();
        let openai_json = openai_request.map(|r| r.to_string());

        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE history SET provider = ?1, concrete_model = ?2, openai_request_json = ?3
                 WHERE id = ?4",
                params![provider, concrete_model, openai_json, id],
            )?;
            Ok(())
        })
        .await
    }

    /// Terminal update: assembled response, token counters and final status
    #[allow(clippy::too_many_arguments)]
    pub async fn finish(
        &self,
        id: i64,
        status: RecordStatus,
        response: Option<&serde_json::Value>,
        stop_reason: Option<&str>,
        input_tokens: u32,
        output_tokens: u32,
        error: Option<&str>,
    ) -> AppResult<()> {
        let response_json = response.map(|r| r.to_string());
        let response_length = response_json.as_ref().map(|r| r.len()).unwrap_or(0) as i64;
        let stop_reason = stop_reason.map(|s| s.to_string());
        let error = error.map(|e| e.to_string());
        let total_tokens = input_tokens as i64 + output_tokens as i64;
        let status = status.as_str();

        debug!(id, status, "Finalizing history row");

        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE history SET
                    status = ?1, response_json = ?2, response_length = ?3, stop_reason = ?4,
                    input_tokens = ?5, output_tokens = ?6, total_tokens = ?7, error = ?8
                 WHERE id = ?9",
                params![
                    status,
                    response_json,
                    response_length,
                    stop_reason,
                    input_tokens as i64,
                    output_tokens as i64,
                    total_tokens,
                    error,
                    id
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Newest-first page, optionally narrowed to one day or one hour of it
    pub async fn recent(
        &self,
        limit: u32,
        date: Option<&str>,
        hour: Option<u32>,
    ) -> AppResult<Vec<HistoryRecord>> {
        let mut lower: Option<String> = None;
        let mut upper: Option<String> = None;

        if let Some(date) = date {
            match hour {
                Some(h) if h < 24 => {
                    lower = Some(format!("{}T{:02}:00:00", date, h));
                    upper = Some(if h == 23 {
                        format!("{}T23:59:59.999999", date)
                    } else {
                        format!("{}T{:02}:00:00", date, h + 1)
                    });
                }
                _ => {
                    lower = Some(format!("{}T00:00:00", date));
                    upper = Some(format!("{}T23:59:59.999999", date));
                }
            }
        }

        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT id, ts, claimed_model, concrete_model, provider, is_streaming, status,
                        input_tokens, output_tokens, total_tokens, stop_reason,
                        request_json, openai_request_json, response_json, error,
                        request_length, response_length
                 FROM history WHERE 1=1",
            );
            let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(lower) = lower {
                sql.push_str(" AND ts >= ?");
                bind.push(Box::new(lower));
            }
            if let Some(upper) = upper {
                sql.push_str(" AND ts <= ?");
                bind.push(Box::new(upper));
            }
            sql.push_str(" ORDER BY ts DESC, id DESC LIMIT ?");
            bind.push(Box::new(limit as i64));

            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(bind.iter().map(|b| b.as_ref()));
            let rows = stmt.query_map(params, row_to_record)?;
            rows.collect()
        })
        .await
    }

    /// Single record by id
    pub async fn get(&self, id: i64) -> AppResult<Option<HistoryRecord>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, ts, claimed_model, concrete_model, provider, is_streaming, status,
                        input_tokens, output_tokens, total_tokens, stop_reason,
                        request_json, openai_request_json, response_json, error,
                        request_length, response_length
                 FROM history WHERE id = ?1",
                params![id],
                row_to_record,
            )
            .optional()
        })
        .await
    }

    /// Aggregate usage per concrete model, optionally bounded by dates
    pub async fn summary(
        &self,
        start_date: Option<&str>,
        end_date: Option<&str>,
    ) -> AppResult<Vec<ModelUsageSummary>> {
        let lower = start_date.map(|d| format!("{}T00:00:00", d));
        let upper = end_date.map(|d| format!("{}T23:59:59.999999", d));

        self.with_conn(move |conn| {
            let mut sql = String::from(
                "SELECT
                    concrete_model,
                    COUNT(*) as request_count,
                    SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) as completed_requests,
                    SUM(CASE WHEN status = 'partial' THEN 1 ELSE 0 END) as partial_requests,
                    SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END) as pending_requests,
                    SUM(input_tokens) as total_input_tokens,
                    SUM(output_tokens) as total_output_tokens,
                    SUM(total_tokens) as total_tokens,
                    MIN(ts) as first_request,
                    MAX(ts) as last_request
                 FROM history WHERE concrete_model != ''",
            );
            let mut bind: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(lower) = lower {
                sql.push_str(" AND ts >= ?");
                bind.push(Box::new(lower));
            }
            if let Some(upper) = upper {
                sql.push_str(" AND ts <= ?");
                bind.push(Box::new(upper));
            }
            sql.push_str(" GROUP BY concrete_model ORDER BY total_tokens DESC");

            let mut stmt = conn.prepare(&sql)?;
            let params = rusqlite::params_from_iter(bind.iter().map(|b| b.as_ref()));
            let rows = stmt.query_map(params, |row| {
                let request_count: u64 = row.get("request_count")?;
                let completed: u64 = row.get("completed_requests")?;
                Ok(ModelUsageSummary {
                    model: row.get("concrete_model")?,
                    request_count,
                    completed_requests: completed,
                    partial_requests: row.get("partial_requests")?,
                    pending_requests: row.get("pending_requests")?,
                    total_input_tokens: row.get("total_input_tokens")?,
                    total_output_tokens: row.get("total_output_tokens")?,
                    total_tokens: row.get("total_tokens")?,
                    success_rate: (completed as f64 / request_count.max(1) as f64 * 10000.0)
                        .round()
                        / 100.0,
                    first_request: row.get("first_request")?,
                    last_request: row.get("last_request")?,
                })
            })?;
            rows.collect()
        })
        .await
    }

    /// Persist one tier selection into the config table
    pub async fn save_selection(&self, key: &str, value: &str) -> AppResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        let ts = now_iso();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, ts],
            )?;
            Ok(())
        })
        .await
    }

    /// Load all persisted selections
    pub async fn load_selections(&self) -> AppResult<HashMap<String, String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM config")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
        .await
    }
}

/// Current timestamp, ISO 8601 with microseconds (lexicographically sortable)
fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

fn row_to_record(row: &Row<'_>) -> Result<HistoryRecord, rusqlite::Error> {
    let parse = |raw: Option<String>| -> serde_json::Value {
        raw.and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(serde_json::Value::Null)
    };

    Ok(HistoryRecord {
        id: row.get("id")?,
        timestamp: row.get("ts")?,
        claimed_model: row.get("claimed_model")?,
        concrete_model: row.get("concrete_model")?,
        provider: row.get("provider")?,
        is_streaming: row.get::<_, i64>("is_streaming")? != 0,
        status: row.get("status")?,
        input_tokens: row.get::<_, i64>("input_tokens")? as u32,
        output_tokens: row.get::<_, i64>("output_tokens")? as u32,
        total_tokens: row.get::<_, i64>("total_tokens")? as u32,
        stop_reason: row.get("stop_reason")?,
        request: parse(row.get("request_json")?),
        openai_request: parse(row.get("openai_request_json")?),
        response: parse(row.get("response_json")?),
        error: row.get("error")?,
        request_length: row.get::<_, i64>("request_length")? as u32,
        response_length: row.get::<_, i64>("response_length")? as u32,
    })
}
