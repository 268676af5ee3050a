//! Risk scoring for proposed permission sets.
//!
//! The score is a deterministic weighted sum: every flagged category present in
//! the permission set contributes its weight once, and any SoD conflict adds a
//! fixed penalty. Thresholds map the sum onto [`RiskLevel`].

use serde::{Deserialize, Serialize};

use crate::types::RiskLevel;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskReason {
    pub code: String,
    pub description: String,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskScore {
    pub value: u32,
    pub level: RiskLevel,
    pub reasons: Vec<RiskReason>,
}

/// A class of capability that raises the sensitivity of a change.
///
/// A slug belongs to the category when its final dot segment is one of
/// `verbs` (`users.impersonate` -> `impersonate`).
#[derive(Debug, Clone)]
pub struct RiskCategory {
    pub code: &'static str,
    pub description: &'static str,
    pub weight: u32,
    pub verbs: &'static [&'static str],
}

impl RiskCategory {
    fn flags(&self, slug: &str) -> bool {
        let verb = slug.rsplit('.').next().unwrap_or(slug);
        self.verbs.contains(&verb)
    }
}

pub const DEFAULT_CATEGORIES: &[RiskCategory] = &[
    RiskCategory {
        code: "DESTRUCTIVE_ACTION",
        description: "Grants irreversible delete or purge capability",
        weight: 25,
        verbs: &["delete", "purge", "destroy"],
    },
    RiskCategory {
        code: "IMPERSONATION",
        description: "Allows acting as another user",
        weight: 40,
        verbs: &["impersonate"],
    },
    RiskCategory {
        code: "APPROVAL_BYPASS",
        description: "Grants approval or override authority over governed changes",
        weight: 35,
        verbs: &["approve", "bypass", "override"],
    },
    RiskCategory {
        code: "DATA_EXFILTRATION",
        description: "Allows bulk data export",
        weight: 20,
        verbs: &["export"],
    },
    RiskCategory {
        code: "PRIVILEGE_ADMINISTRATION",
        description: "Grants administrative management rights",
        weight: 15,
        verbs: &["manage", "admin"],
    },
    RiskCategory {
        code: "FINANCIAL_MOVEMENT",
        description: "Moves money on behalf of the tenant",
        weight: 10,
        verbs: &["refund", "charge"],
    },
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Added once when the permission set carries any SoD conflict.
    #[serde(default = "default_sod_penalty")]
    pub sod_penalty: u32,
    /// Lowest score classified MEDIUM.
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: u32,
    /// Lowest score classified HIGH.
    #[serde(default = "default_high_threshold")]
    pub high_threshold: u32,
    /// Lowest level that must go through the approval workflow.
    #[serde(default = "default_approval_level")]
    pub approval_level: RiskLevel,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            sod_penalty: default_sod_penalty(),
            medium_threshold: default_medium_threshold(),
            high_threshold: default_high_threshold(),
            approval_level: default_approval_level(),
        }
    }
}

fn default_sod_penalty() -> u32 {
    30
}

fn default_medium_threshold() -> u32 {
    30
}

fn default_high_threshold() -> u32 {
    60
}

fn default_approval_level() -> RiskLevel {
    RiskLevel::Medium
}

#[derive(Debug, Clone)]
pub struct RiskScorer {
    config: RiskConfig,
    categories: &'static [RiskCategory],
}

impl Default for RiskScorer {
    fn default() -> Self {
        Self::new(RiskConfig::default())
    }
}

impl RiskScorer {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            categories: DEFAULT_CATEGORIES,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn score<I, S>(&self, permission_slugs: I, has_sod_conflicts: bool) -> RiskScore
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let slugs: Vec<S> = permission_slugs.into_iter().collect();

        let mut reasons: Vec<RiskReason> = self
            .categories
            .iter()
            .filter(|category| slugs.iter().any(|slug| category.flags(slug.as_ref())))
            .map(|category| RiskReason {
                code: category.code.to_owned(),
                description: category.description.to_owned(),
                weight: category.weight,
            })
            .collect();

        if has_sod_conflicts {
            reasons.push(RiskReason {
                code: "SOD_CONFLICT".to_owned(),
                description: "Permission set contains segregation-of-duties conflicts".to_owned(),
                weight: self.config.sod_penalty,
            });
        }

        let value = reasons.iter().map(|r| r.weight).sum();

        RiskScore {
            value,
            level: self.level_for(value),
            reasons,
        }
    }

    /// A score declared by the caller rather than derived from permissions.
    pub fn declared(&self, value: u32) -> RiskScore {
        RiskScore {
            value,
            level: self.level_for(value),
            reasons: vec![RiskReason {
                code: "DECLARED".to_owned(),
                description: "Score supplied with the request".to_owned(),
                weight: value,
            }],
        }
    }

    pub fn level_for(&self, value: u32) -> RiskLevel {
        if value >= self.config.high_threshold {
            RiskLevel::High
        } else if value >= self.config.medium_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn requires_approval(&self, score: &RiskScore) -> bool {
        score.level >= self.config.approval_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_read_permissions_are_low() {
        let scorer = RiskScorer::default();
        let score = scorer.score(["users.read", "roles.read"], false);

        assert_eq!(score.value, 0);
        assert_eq!(score.level, RiskLevel::Low);
        assert!(score.reasons.is_empty());
        assert!(!scorer.requires_approval(&score));
    }

    #[test]
    fn category_weight_counts_once() {
        let scorer = RiskScorer::default();
        let score = scorer.score(["users.delete", "roles.delete", "invoices.delete"], false);

        assert_eq!(score.value, 25);
        assert_eq!(score.reasons.len(), 1);
        assert_eq!(score.level, RiskLevel::Low);
    }

    #[test]
    fn sod_penalty_lifts_level() {
        let scorer = RiskScorer::default();
        let without = scorer.score(["users.read"], false);
        let with = scorer.score(["users.read"], true);

        assert_eq!(with.value, without.value + 30);
        assert_eq!(with.level, RiskLevel::Medium);
        assert!(scorer.requires_approval(&with));
        assert_eq!(with.reasons.last().unwrap().code, "SOD_CONFLICT");
    }

    #[test]
    fn stacked_categories_reach_high() {
        let scorer = RiskScorer::default();
        let score = scorer.score(["users.impersonate", "workflow.approve"], false);

        assert_eq!(score.value, 75);
        assert_eq!(score.level, RiskLevel::High);
    }

    #[test]
    fn approval_level_is_configurable() {
        let scorer = RiskScorer::new(RiskConfig {
            approval_level: RiskLevel::High,
            ..RiskConfig::default()
        });
        let medium = scorer.score(["data.export", "audit.logs.manage"], false);

        assert_eq!(medium.level, RiskLevel::Medium);
        assert!(!scorer.requires_approval(&medium));
    }
}
