//! Append-only record of tool invocations and security decisions.

pub mod chained;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tiergate_policy::Tier;

pub use chained::JsonlAuditTrail;
pub use sqlite::SqliteAuditTrail;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("Corrupt audit record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    ToolExecution,
    AccessDenied,
    PolicyDenied,
    PlanCancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    DryRun,
    Execute,
    ExecuteConfirmed,
    Cancel,
    Deny,
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&enum_name(self))
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&enum_name(self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub request_id: String,
    pub event_type: AuditEvent,
    pub tool_name: Option<String>,
    pub tier: Option<Tier>,
    pub action: AuditAction,
    pub details: Option<Value>,
    pub result: Option<Value>,
    pub user_confirmed: bool,
}

impl AuditRecord {
    pub fn new(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        event_type: AuditEvent,
        action: AuditAction,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            request_id: request_id.into(),
            event_type,
            tool_name: None,
            tier: None,
            action,
            details: None,
            result: None,
            user_confirmed: false,
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>, tier: Tier) -> Self {
        self.tool_name = Some(name.into());
        self.tier = Some(tier);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn confirmed(mut self, confirmed: bool) -> Self {
        self.user_confirmed = confirmed;
        self
    }
}

/// Durable audit sink shared by concurrent requests. Implementations must
/// write each record atomically.
pub trait AuditTrail: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Newest first.
    fn recent(&self, limit: usize, offset: usize) -> Result<Vec<AuditRecord>, AuditError>;
}

/// snake_case name of a unit enum variant.
fn enum_name<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(name)) => name,
        _ => String::new(),
    }
}

fn parse_enum<T: DeserializeOwned>(name: &str) -> Result<T, AuditError> {
    serde_json::from_value(Value::String(name.to_string()))
        .map_err(|_| AuditError::Corrupt(format!("unknown value '{name}'")))
}
