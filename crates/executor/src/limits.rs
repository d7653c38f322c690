use serde::{Deserialize, Serialize};

const MEMORY_MAX: &str = "512M";
const CPU_QUOTA: &str = "50%";

/// Resource ceilings handed to the service-scope backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in systemd notation (`512M`, `2G`).
    pub memory_max: String,
    /// CPU quota as a percentage of one core (`50%`).
    pub cpu_quota: String,
}

impl ResourceLimits {
    pub fn new(memory_max: impl Into<String>, cpu_quota: impl Into<String>) -> Self {
        Self {
            memory_max: memory_max.into(),
            cpu_quota: cpu_quota.into(),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(MEMORY_MAX, CPU_QUOTA)
    }
}
