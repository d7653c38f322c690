use serde::{Deserialize, Serialize};
use std::fmt;

/// Risk classification of a tool. Ordering follows risk: a higher tier is
/// always at least as dangerous as a lower one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    ReadOnly = 0,
    WriteSafe = 1,
    SystemChange = 2,
}

impl Tier {
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::ReadOnly => "read_only",
            Tier::WriteSafe => "write_safe",
            Tier::SystemChange => "system_change",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierDecision {
    Allowed,
    RequiresConfirmation,
    Denied(Tier),
}

/// Process-wide tier gate applied by the router before any tool runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierPolicy {
    /// Tools above this tier are refused outright.
    pub max_tier: Tier,
    /// Tools at or above this tier always go through confirmation.
    pub confirm_from_tier: Tier,
}

impl TierPolicy {
    pub fn new(max_tier: Tier, confirm_from_tier: Tier) -> Self {
        Self {
            max_tier,
            confirm_from_tier,
        }
    }

    pub fn check(&self, tier: Tier, requires_confirmation: bool) -> TierDecision {
        if tier > self.max_tier {
            return TierDecision::Denied(self.max_tier);
        }

        if requires_confirmation || tier >= self.confirm_from_tier {
            return TierDecision::RequiresConfirmation;
        }

        TierDecision::Allowed
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(Tier::SystemChange, Tier::SystemChange)
    }
}
