use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tiergate_executor::{ResourceLimits, SandboxBackend};
use tiergate_policy::{AccessRoots, Tier, TierPolicy};
use tiergate_tools::ToolDefaults;

pub const DEFAULT_CONFIG_PATH: &str = "tiergate.toml";
pub const CONFIG_ENV: &str = "TIERGATE_CONFIG";

/// Process-wide settings, read once at startup. Every section has defaults,
/// so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub access: AccessConfig,
    pub sandbox: SandboxConfig,
    pub policy: PolicyConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    pub read_roots: Vec<String>,
    pub write_roots: Vec<String>,
    /// Appended to the built-in deny list, never replaces it.
    pub extra_deny_roots: Vec<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            read_roots: vec![
                "~".to_string(),
                "/mnt/local".to_string(),
                "/mnt/server".to_string(),
            ],
            write_roots: vec![
                "~/Pictures/Inbox".to_string(),
                "~/Pictures/Organized".to_string(),
            ],
            extra_deny_roots: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Global switch, ANDed with each tool's own network flag.
    pub allow_network: bool,
    pub memory_max: String,
    pub cpu_quota: String,
    pub default_timeout_secs: u64,
    pub default_max_output_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        let defaults = ToolDefaults::default();
        Self {
            backend: SandboxBackend::Direct,
            allow_network: false,
            memory_max: limits.memory_max,
            cpu_quota: limits.cpu_quota,
            default_timeout_secs: defaults.timeout_secs,
            default_max_output_bytes: defaults.max_output_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_tier: Tier,
    pub confirm_from_tier: Tier,
    pub plan_ttl_secs: u64,
    pub max_plans: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let policy = TierPolicy::default();
        Self {
            max_tier: policy.max_tier,
            confirm_from_tier: policy.confirm_from_tier,
            plan_ttl_secs: 900,
            max_plans: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditBackend {
    Sqlite,
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub backend: AuditBackend,
    pub path: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            backend: AuditBackend::Sqlite,
            path: PathBuf::from("./data/tiergate-audit.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Loads from `explicit`, then `$TIERGATE_CONFIG`, then `./tiergate.toml`.
    /// Only the last one may be missing, in which case defaults apply.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if !path.trim().is_empty() {
                return Self::load(Path::new(&path));
            }
        }
        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            return Self::load(fallback);
        }
        Ok(Self::default())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// `${VAR}` references are expanded before parsing.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = shellexpand::env(content).context("Failed to expand environment variables")?;
        let config: Config = toml::from_str(&expanded).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sandbox.default_timeout_secs == 0 {
            bail!("sandbox.default_timeout_secs must be greater than zero");
        }
        if self.sandbox.default_max_output_bytes == 0 {
            bail!("sandbox.default_max_output_bytes must be greater than zero");
        }
        if self.policy.max_plans == 0 {
            bail!("policy.max_plans must be greater than zero");
        }
        if self.policy.plan_ttl_secs == 0 {
            bail!("policy.plan_ttl_secs must be greater than zero");
        }
        if self.audit.path.as_os_str().is_empty() {
            bail!("audit.path must not be empty");
        }
        Ok(())
    }

    pub fn access_roots(&self) -> AccessRoots {
        AccessRoots::new(&self.access.read_roots, &self.access.write_roots)
            .with_extra_deny_roots(&self.access.extra_deny_roots)
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits::new(&self.sandbox.memory_max, &self.sandbox.cpu_quota)
    }

    pub fn tool_defaults(&self) -> ToolDefaults {
        ToolDefaults {
            timeout_secs: self.sandbox.default_timeout_secs,
            max_output_bytes: self.sandbox.default_max_output_bytes,
        }
    }

    pub fn tier_policy(&self) -> TierPolicy {
        TierPolicy::new(self.policy.max_tier, self.policy.confirm_from_tier)
    }

    pub fn plan_ttl(&self) -> Duration {
        Duration::from_secs(self.policy.plan_ttl_secs)
    }

    /// Audit path with `~` expanded.
    pub fn audit_path(&self) -> PathBuf {
        let raw = self.audit.path.to_string_lossy();
        PathBuf::from(shellexpand::tilde(&raw).as_ref())
    }
}
