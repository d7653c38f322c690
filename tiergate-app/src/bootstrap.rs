//! Builds the router and its collaborators from a [`Config`].

use crate::config::{AuditBackend, Config, LoggingConfig};
use anyhow::{Context, Result};
use std::sync::Arc;
use tiergate_audit::{AuditTrail, JsonlAuditTrail, SqliteAuditTrail};
use tiergate_core::{PlanStore, ToolRouter};
use tiergate_executor::{sandbox_for, CommandInvoker};
use tiergate_policy::AccessValidator;
use tiergate_tools::{register_builtin_tools, ToolRegistry};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Logs go to stderr so stdout stays machine-readable.
pub fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = if config.json {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };
}

pub fn open_audit(config: &Config) -> Result<Arc<dyn AuditTrail>> {
    let path = config.audit_path();
    let trail: Arc<dyn AuditTrail> = match config.audit.backend {
        AuditBackend::Sqlite => Arc::new(
            SqliteAuditTrail::new(&path)
                .with_context(|| format!("Failed to open audit database {}", path.display()))?,
        ),
        AuditBackend::Jsonl => Arc::new(
            JsonlAuditTrail::new(&path)
                .with_context(|| format!("Failed to open audit log {}", path.display()))?,
        ),
    };
    Ok(trail)
}

pub fn build_registry(config: &Config) -> Result<ToolRegistry> {
    let access = Arc::new(AccessValidator::new(config.access_roots()));
    let sandbox = sandbox_for(config.sandbox.backend, config.resource_limits());
    let invoker = Arc::new(
        CommandInvoker::new(access, sandbox).with_network(config.sandbox.allow_network),
    );

    let mut registry = ToolRegistry::new();
    register_builtin_tools(&mut registry, invoker, config.tool_defaults())
        .context("Failed to register built-in tools")?;
    Ok(registry)
}

pub fn build_router(config: &Config) -> Result<ToolRouter> {
    let registry = build_registry(config)?;
    let audit = open_audit(config)?;
    let plans = PlanStore::new(config.plan_ttl(), config.policy.max_plans);

    info!(
        tools = registry.len(),
        backend = %config.sandbox.backend,
        max_tier = %config.policy.max_tier,
        "Tool router ready"
    );

    Ok(ToolRouter::new(
        Arc::new(registry),
        Arc::new(plans),
        audit,
        config.tier_policy(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir, backend: AuditBackend, file: &str) -> Config {
        let mut config = Config::default();
        config.audit.backend = backend;
        config.audit.path = dir.path().join(file);
        config
    }

    #[test]
    fn test_build_router_registers_catalog() {
        let dir = TempDir::new().unwrap();
        let router = build_router(&config_in(&dir, AuditBackend::Sqlite, "a/audit.db")).unwrap();
        assert!(router.registry().lookup("disk_free").is_some());
        assert!(router.registry().lookup("apt_install").is_some());
        assert!(dir.path().join("a/audit.db").exists());
    }

    #[test]
    fn test_jsonl_backend() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir, AuditBackend::Jsonl, "audit.jsonl");
        let audit = open_audit(&config).unwrap();
        assert!(audit.recent(10, 0).unwrap().is_empty());
    }

    #[test]
    fn test_tampered_jsonl_fails_startup() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("audit.jsonl"), "not json\n").unwrap();
        let config = config_in(&dir, AuditBackend::Jsonl, "audit.jsonl");
        assert!(open_audit(&config).is_err());
    }
}
