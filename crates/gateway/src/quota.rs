//! Plan tiers and the quota table.

use std::collections::HashMap;

use serde::Deserialize;

pub const FREE: &str = "free";
pub const PRO_MONTHLY: &str = "pro_monthly";
pub const PRO_ANNUAL: &str = "pro_annual";

/// Resolved ceiling for a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ceiling {
    /// Maximum allowed requests per key per window.
    pub limit: u64,
    /// True when the plan was not in the table and the restrictive default was used.
    pub fallback: bool,
}

/// Static mapping from plan tier to a per-day request ceiling.
///
/// Unknown tiers never resolve to "unlimited": they get the `free` ceiling,
/// or the smallest ceiling in the table when `free` is not listed.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "HashMap<String, u64>")]
pub struct QuotaPolicy {
    ceilings: HashMap<String, u64>,
    fallback: u64,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::new(HashMap::from([
            (FREE.to_string(), 100),
            (PRO_MONTHLY.to_string(), 1_000_000),
            (PRO_ANNUAL.to_string(), 1_000_000),
        ]))
    }
}

impl From<HashMap<String, u64>> for QuotaPolicy {
    fn from(ceilings: HashMap<String, u64>) -> Self {
        Self::new(ceilings)
    }
}

impl QuotaPolicy {
    pub fn new(ceilings: HashMap<String, u64>) -> Self {
        // An empty table denies everything rather than allowing everything.
        let fallback = ceilings
            .get(FREE)
            .copied()
            .or_else(|| ceilings.values().copied().min())
            .unwrap_or(0);
        Self { ceilings, fallback }
    }

    /// This table with the tiers in `overrides` replaced or added.
    pub fn with_overrides(self, overrides: &QuotaPolicy) -> Self {
        let mut ceilings = self.ceilings;
        ceilings.extend(overrides.ceilings.iter().map(|(k, v)| (k.clone(), *v)));
        Self::new(ceilings)
    }

    /// Resolve the ceiling for `plan`, falling back to the most restrictive one.
    pub fn ceiling_for(&self, plan: &str) -> Ceiling {
        match self.ceilings.get(plan) {
            Some(&limit) => Ceiling {
                limit,
                fallback: false,
            },
            None => Ceiling {
                limit: self.fallback,
                fallback: true,
            },
        }
    }

    /// Whether `plan` is one of the known tiers.
    pub fn is_known(&self, plan: &str) -> bool {
        self.ceilings.contains_key(plan)
    }

    /// Known tier names, sorted.
    pub fn plans(&self) -> Vec<&str> {
        let mut plans: Vec<&str> = self.ceilings.keys().map(String::as_str).collect();
        plans.sort_unstable();
        plans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_matches_published_plans() {
        let policy = QuotaPolicy::default();
        assert_eq!(policy.ceiling_for(FREE).limit, 100);
        assert_eq!(policy.ceiling_for(PRO_MONTHLY).limit, 1_000_000);
        assert_eq!(policy.ceiling_for(PRO_ANNUAL).limit, 1_000_000);
        assert!(!policy.ceiling_for(FREE).fallback);
    }

    #[test]
    fn unknown_plan_gets_free_ceiling() {
        let policy = QuotaPolicy::default();
        let ceiling = policy.ceiling_for("enterprise");
        assert_eq!(ceiling.limit, 100);
        assert!(ceiling.fallback);
    }

    #[test]
    fn smaller_tier_does_not_lower_unknown_plan_ceiling() {
        let policy = QuotaPolicy::new(HashMap::from([
            (FREE.to_string(), 100),
            ("trial".to_string(), 10),
        ]));
        assert_eq!(policy.ceiling_for("enterprise").limit, 100);
    }

    #[test]
    fn without_free_tier_falls_back_to_smallest() {
        let policy = QuotaPolicy::new(HashMap::from([
            (PRO_MONTHLY.to_string(), 500),
            (PRO_ANNUAL.to_string(), 50),
        ]));
        assert_eq!(policy.ceiling_for(FREE).limit, 50);
        assert!(policy.ceiling_for(FREE).fallback);
    }

    #[test]
    fn overrides_keep_unlisted_tiers() {
        let overrides: QuotaPolicy = serde_yaml::from_str("free: 3\n").unwrap();
        let policy = QuotaPolicy::default().with_overrides(&overrides);
        assert_eq!(policy.ceiling_for(FREE).limit, 3);
        assert_eq!(policy.ceiling_for(PRO_ANNUAL).limit, 1_000_000);
        assert!(!policy.ceiling_for(PRO_ANNUAL).fallback);
        assert_eq!(policy.ceiling_for("enterprise").limit, 3);
    }

    #[test]
    fn empty_table_fails_closed() {
        let policy = QuotaPolicy::new(HashMap::new());
        assert_eq!(policy.ceiling_for(FREE).limit, 0);
    }

    #[test]
    fn deserializes_from_yaml_map() {
        let policy: QuotaPolicy = serde_yaml::from_str("free: 3\npro_monthly: 50\n").unwrap();
        assert_eq!(policy.ceiling_for(FREE).limit, 3);
        assert_eq!(policy.ceiling_for("pro_annual").limit, 3);
        assert_eq!(policy.plans(), vec!["free", "pro_monthly"]);
        assert!(policy.is_known("pro_monthly"));
        assert!(!policy.is_known("pro_annual"));
    }
}
