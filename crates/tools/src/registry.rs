use crate::traits::{SpecError, Tool, ToolSpec};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Short or common names a model tends to use, mapped to registered names.
static TOOL_ALIASES: &[(&str, &str)] = &[
    // storage
    ("df", "df_command"),
    ("du", "du_command"),
    ("disk", "disk_free"),
    ("disk_usage", "disk_free"),
    // performance
    ("ps", "ps_command"),
    ("free", "free_command"),
    ("processes", "ps_command"),
    ("memory", "free_command"),
    ("snapshot", "system_snapshot"),
    ("system_info", "system_snapshot"),
    // logs
    ("journalctl", "journalctl_command"),
    ("logs", "journalctl_command"),
    // system info
    ("uname", "uname_command"),
    // system management
    ("systemctl", "systemctl_status"),
    ("service_status", "systemctl_status"),
    ("restart_service", "systemctl_restart"),
    ("apt", "apt_install"),
    ("install", "apt_install"),
    ("download_package", "apt_download"),
    // files
    ("photos", "organize_photos"),
    ("sort_photos", "organize_photos"),
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid tool spec: {0}")]
    InvalidSpec(#[from] SpecError),
}

/// Built once at startup; read-only afterwards.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Inserts by spec name. A later registration of the same name replaces
    /// the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), RegistryError> {
        let spec = tool.spec();
        spec.validate()?;
        let name = spec.name.clone();
        info!(tool = %name, tier = %spec.tier, "Registered tool");
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Tool registered twice, keeping the latest");
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self.tools.get(name) {
            return Some(tool.clone());
        }

        let canonical = resolve_alias(name)?;
        let tool = self.tools.get(canonical)?;
        info!("Resolved tool alias '{}' to '{}'", name, canonical);
        Some(tool.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Full catalog, sorted by name.
    pub fn list_specs(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(|t| t.spec().clone()).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Compact listing for capability prompts.
    pub fn capabilities(&self) -> Vec<Value> {
        self.list_specs()
            .into_iter()
            .map(|spec| {
                json!({
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.args_schema,
                    "tier": spec.tier,
                    "requires_confirmation": spec.requires_confirmation,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub fn resolve_alias(name: &str) -> Option<&'static str> {
    TOOL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| *canonical)
}
