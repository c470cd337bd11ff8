//! The `FeatureFlags` port (SPEC_FULL.md §6.6): gates optional behaviors
//! (tier caps, new flows) without the core depending on a specific flag
//! backend.

use std::collections::HashSet;

pub trait FeatureFlags: Send + Sync {
    fn is_enabled(&self, flag: &str, context: &str) -> bool;
}

/// Production adapter: a static allow-list read once at startup. `context`
/// is ignored — flags are global, not per-tenant, in this default adapter.
pub struct StaticFeatureFlags {
    enabled: HashSet<String>,
}

impl StaticFeatureFlags {
    pub fn new(enabled: impl IntoIterator<Item = String>) -> Self {
        Self {
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn none() -> Self {
        Self {
            enabled: HashSet::new(),
        }
    }
}

impl FeatureFlags for StaticFeatureFlags {
    fn is_enabled(&self, flag: &str, _context: &str) -> bool {
        self.enabled.contains(flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_gates_flags() {
        let flags = StaticFeatureFlags::new(["tier_caps".to_string()]);
        assert!(flags.is_enabled("tier_caps", "group-1"));
        assert!(!flags.is_enabled("new_flow", "group-1"));
        assert!(!StaticFeatureFlags::none().is_enabled("tier_caps", "group-1"));
    }
}
