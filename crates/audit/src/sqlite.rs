use crate::{enum_name, parse_enum, AuditError, AuditRecord, AuditTrail};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, Row};
use serde_json::Value;
use std::path::Path;
use tracing::info;

pub struct SqliteAuditTrail {
    conn: Mutex<Connection>,
}

impl SqliteAuditTrail {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, AuditError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        let trail = Self::init(conn)?;
        info!("Initialized audit database at {}", db_path.display());
        Ok(trail)
    }

    pub fn in_memory() -> Result<Self, AuditError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AuditError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                session_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                tool_name TEXT,
                tier TEXT,
                action TEXT NOT NULL,
                details TEXT,
                result TEXT,
                user_confirmed INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_log(session_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_tool ON audit_log(tool_name)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn json_text(value: &Option<Value>) -> Result<Option<String>, AuditError> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(AuditError::from)
}

fn parse_json(text: Option<String>) -> Result<Option<Value>, AuditError> {
    text.map(|t| serde_json::from_str(&t))
        .transpose()
        .map_err(AuditError::from)
}

struct RawRow {
    timestamp: String,
    session_id: String,
    request_id: String,
    event_type: String,
    tool_name: Option<String>,
    tier: Option<String>,
    action: String,
    details: Option<String>,
    result: Option<String>,
    user_confirmed: bool,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            timestamp: row.get(0)?,
            session_id: row.get(1)?,
            request_id: row.get(2)?,
            event_type: row.get(3)?,
            tool_name: row.get(4)?,
            tier: row.get(5)?,
            action: row.get(6)?,
            details: row.get(7)?,
            result: row.get(8)?,
            user_confirmed: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<AuditRecord, AuditError> {
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| AuditError::Corrupt(format!("timestamp '{}': {}", self.timestamp, e)))?
            .with_timezone(&Utc);

        Ok(AuditRecord {
            timestamp,
            session_id: self.session_id,
            request_id: self.request_id,
            event_type: parse_enum(&self.event_type)?,
            tool_name: self.tool_name,
            tier: self.tier.as_deref().map(parse_enum).transpose()?,
            action: parse_enum(&self.action)?,
            details: parse_json(self.details)?,
            result: parse_json(self.result)?,
            user_confirmed: self.user_confirmed,
        })
    }
}

impl AuditTrail for SqliteAuditTrail {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let details = json_text(&record.details)?;
        let result = json_text(&record.result)?;
        let tier = record.tier.as_ref().map(enum_name);

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO audit_log
             (timestamp, session_id, request_id, event_type, tool_name, tier, action, details, result, user_confirmed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.timestamp.to_rfc3339(),
                record.session_id,
                record.request_id,
                enum_name(&record.event_type),
                record.tool_name,
                tier,
                enum_name(&record.action),
                details,
                result,
                record.user_confirmed,
            ],
        )?;
        Ok(())
    }

    fn recent(&self, limit: usize, offset: usize) -> Result<Vec<AuditRecord>, AuditError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT timestamp, session_id, request_id, event_type, tool_name, tier, action, details, result, user_confirmed
             FROM audit_log
             ORDER BY id DESC
             LIMIT ?1 OFFSET ?2",
        )?;

        let rows = stmt.query_map(params![limit as i64, offset as i64], RawRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}
