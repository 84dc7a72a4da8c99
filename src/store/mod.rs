//! Durable store: the append-only audit log and the pending-approvals
//! table, both backed by a single sqlite file.
//!
//! Every action gets an audit row, even allowed ones — the log is the
//! thing an operator reaches for after the fact. Pending approvals are
//! durable too, so an approval a human resolves while the gateway process
//! is down is still recorded correctly on restart (the stale sweep just
//! expires it instead).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    tool TEXT NOT NULL,
    args TEXT NOT NULL,
    signature TEXT NOT NULL,
    decision TEXT NOT NULL,
    resolution TEXT,
    execution_result TEXT,
    delivered INTEGER NOT NULL DEFAULT 0,
    client_request_id TEXT,
    resolved_by TEXT,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log (timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_tool ON audit_log (tool);

CREATE TABLE IF NOT EXISTS pending_requests (
    request_id TEXT PRIMARY KEY,
    agent_id TEXT NOT NULL,
    tool TEXT NOT NULL,
    args TEXT NOT NULL,
    signature TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    message_handle TEXT
);
CREATE INDEX IF NOT EXISTS idx_pending_expires ON pending_requests (expires_at);
"#;

#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub agent_id: String,
    pub tool: String,
    pub args: serde_json::Value,
    pub signature: String,
    pub decision: String,
    pub resolution: Option<String>,
    pub execution_result: Option<serde_json::Value>,
    /// The wire-level request id the client used for this call, so a
    /// reconnecting client can match a replayed result back to the local
    /// future it's still holding.
    pub client_request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub tool: String,
    pub args: serde_json::Value,
    pub signature: String,
    pub decision: String,
    pub resolution: Option<String>,
    pub execution_result: Option<serde_json::Value>,
    pub delivered: bool,
    pub client_request_id: Option<String>,
    /// Who resolved an `ask` decision: a Telegram username/user id for a
    /// human approval, or `"shutdown"` if the gateway drained it. `None`
    /// for decisions that never went through approval.
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct PendingRow {
    pub request_id: Uuid,
    pub agent_id: String,
    pub tool: String,
    pub args: serde_json::Value,
    pub signature: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub message_handle: Option<String>,
}

/// Thin, synchronous wrapper around a single sqlite connection. Calls lock
/// the connection, run their statements, and release it — never held
/// across an `.await`.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("opening store at {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        set_owner_only_permissions(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store mutex poisoned")
    }

    pub fn append_audit(&self, entry: &AuditEntry) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO audit_log (timestamp, agent_id, tool, args, signature, decision, resolution, execution_result, client_request_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Utc::now().to_rfc3339(),
                entry.agent_id,
                entry.tool,
                entry.args.to_string(),
                entry.signature,
                entry.decision,
                entry.resolution,
                entry.execution_result.as_ref().map(|v| v.to_string()),
                entry.client_request_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn record_resolution(
        &self,
        id: i64,
        resolution: &str,
        execution_result: Option<&serde_json::Value>,
        resolved_by: Option<&str>,
    ) -> Result<()> {
        self.lock().execute(
            "UPDATE audit_log SET resolution = ?1, execution_result = ?2, resolved_by = ?3, resolved_at = ?4 WHERE id = ?5",
            params![
                resolution,
                execution_result.map(|v| v.to_string()),
                resolved_by,
                Utc::now().to_rfc3339(),
                id,
            ],
        )?;
        Ok(())
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, agent_id, tool, args, signature, decision, resolution, execution_result, delivered, client_request_id, resolved_by, resolved_at
             FROM audit_log ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], row_to_audit)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Rows whose approval has been resolved but not yet delivered to the
    /// client that asked for them. Marks them delivered in the same
    /// transaction it reads them in, so a crash between read and use never
    /// double-delivers.
    pub fn take_undelivered(&self, agent_id: &str) -> Result<Vec<AuditRow>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare(
                "SELECT id, timestamp, agent_id, tool, args, signature, decision, resolution, execution_result, delivered, client_request_id, resolved_by, resolved_at
                 FROM audit_log WHERE agent_id = ?1 AND resolution IS NOT NULL AND delivered = 0",
            )?;
            stmt.query_map(params![agent_id], row_to_audit)?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };
        tx.execute(
            "UPDATE audit_log SET delivered = 1 WHERE agent_id = ?1 AND resolution IS NOT NULL AND delivered = 0",
            params![agent_id],
        )?;
        tx.commit()?;
        Ok(rows)
    }

    pub fn insert_pending(&self, row: &PendingRow) -> Result<()> {
        self.lock().execute(
            "INSERT INTO pending_requests (request_id, agent_id, tool, args, signature, created_at, expires_at, message_handle)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.request_id.to_string(),
                row.agent_id,
                row.tool,
                row.args.to_string(),
                row.signature,
                row.created_at.to_rfc3339(),
                row.expires_at.to_rfc3339(),
                row.message_handle,
            ],
        )?;
        Ok(())
    }

    pub fn get_pending(&self, request_id: Uuid) -> Result<Option<PendingRow>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT request_id, agent_id, tool, args, signature, created_at, expires_at, message_handle
             FROM pending_requests WHERE request_id = ?1",
            params![request_id.to_string()],
            row_to_pending,
        )
        .optional()
        .context("querying pending request")
    }

    pub fn delete_pending(&self, request_id: Uuid) -> Result<()> {
        self.lock().execute(
            "DELETE FROM pending_requests WHERE request_id = ?1",
            params![request_id.to_string()],
        )?;
        Ok(())
    }

    /// Removes every pending row whose `expires_at` has passed. Called once
    /// at startup and returns what it removed, so the caller can resolve
    /// the matching in-memory futures as timeouts.
    pub fn cleanup_stale_requests(&self) -> Result<Vec<PendingRow>> {
        let conn = self.lock();
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT request_id, agent_id, tool, args, signature, created_at, expires_at, message_handle
             FROM pending_requests WHERE expires_at < ?1",
        )?;
        let stale = stmt
            .query_map(params![now], row_to_pending)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        conn.execute(
            "DELETE FROM pending_requests WHERE expires_at < ?1",
            params![now],
        )?;
        Ok(stale)
    }
}

fn row_to_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
    let timestamp: String = row.get(1)?;
    let args: String = row.get(4)?;
    let execution_result: Option<String> = row.get(8)?;
    let resolved_at: Option<String> = row.get(12)?;
    Ok(AuditRow {
        id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        agent_id: row.get(2)?,
        tool: row.get(3)?,
        args: serde_json::from_str(&args).unwrap_or(serde_json::Value::Null),
        signature: row.get(5)?,
        decision: row.get(6)?,
        resolution: row.get(7)?,
        execution_result: execution_result
            .and_then(|s| serde_json::from_str(&s).ok()),
        delivered: row.get::<_, i64>(9)? != 0,
        client_request_id: row.get(10)?,
        resolved_by: row.get(11)?,
        resolved_at: resolved_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
    })
}

fn row_to_pending(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingRow> {
    let request_id: String = row.get(0)?;
    let args: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    let expires_at: String = row.get(6)?;
    Ok(PendingRow {
        request_id: Uuid::parse_str(&request_id).unwrap_or_default(),
        agent_id: row.get(1)?,
        tool: row.get(2)?,
        args: serde_json::from_str(&args).unwrap_or(serde_json::Value::Null),
        signature: row.get(4)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        expires_at: DateTime::parse_from_rfc3339(&expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        message_handle: row.get(7)?,
    })
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
