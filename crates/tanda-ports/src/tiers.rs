//! Static group-tier configuration. `create_group`'s `tier` input (SPEC_FULL.md
//! §6 command table) selects one of these, capping `member_limit` without the
//! engine crates needing to know about tiers at all.

use std::collections::HashMap;

use tanda_core::constants::DEFAULT_MAX_GROUP_MEMBERS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupTier {
    Basic,
    Plus,
    Premium,
}

impl GroupTier {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Some(Self::Basic),
            "plus" => Some(Self::Plus),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

pub struct GroupTierConfig {
    max_members: HashMap<GroupTier, i32>,
}

impl GroupTierConfig {
    pub fn default_tiers() -> Self {
        let mut max_members = HashMap::new();
        max_members.insert(GroupTier::Basic, 10);
        max_members.insert(GroupTier::Plus, 25);
        max_members.insert(GroupTier::Premium, DEFAULT_MAX_GROUP_MEMBERS);
        Self { max_members }
    }

    pub fn max_members(&self, tier: GroupTier) -> i32 {
        self.max_members.get(&tier).copied().unwrap_or(DEFAULT_MAX_GROUP_MEMBERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_cap_member_limit_progressively() {
        let tiers = GroupTierConfig::default_tiers();
        assert!(tiers.max_members(GroupTier::Basic) < tiers.max_members(GroupTier::Plus));
        assert!(tiers.max_members(GroupTier::Plus) < tiers.max_members(GroupTier::Premium));
    }

    #[test]
    fn unknown_tier_name_does_not_parse() {
        assert!(GroupTier::parse("enterprise").is_none());
        assert_eq!(GroupTier::parse("Plus"), Some(GroupTier::Plus));
    }
}
