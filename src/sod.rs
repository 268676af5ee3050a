//! Segregation-of-Duties rule set.
//!
//! A rule names two permission slugs that must never be held together. Matching
//! is exact string equality: `roles.update` never matches `roles.update.self`
//! or `roles.*`. Widening a rule means adding a rule.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SodRiskTier {
    Critical,
    High,
    Medium,
}

/// A forbidden pair of permission slugs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SodRule {
    pub id: String,
    pub name: String,
    pub risk_tier: SodRiskTier,
    pub conflict_pair: (String, String),
    pub recommendation: String,
    pub compliance_refs: Vec<String>,
}

impl SodRule {
    pub fn new(
        id: &str,
        name: &str,
        risk_tier: SodRiskTier,
        pair: (&str, &str),
        recommendation: &str,
        compliance_refs: &[&str],
    ) -> Self {
        Self {
            id: id.to_owned(),
            name: name.to_owned(),
            risk_tier,
            conflict_pair: (pair.0.to_owned(), pair.1.to_owned()),
            recommendation: recommendation.to_owned(),
            compliance_refs: compliance_refs.iter().map(|r| (*r).to_owned()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SodConflict {
    pub rule: SodRule,
    pub found_slugs: [String; 2],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SodEvaluation {
    pub conflicts: Vec<SodConflict>,
    /// False when any CRITICAL rule fired. HIGH and MEDIUM are advisory.
    pub is_valid: bool,
    pub critical_count: usize,
    pub high_count: usize,
    pub medium_count: usize,
}

impl SodEvaluation {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    /// Names of the CRITICAL rules that fired, for error messages.
    pub fn blocking_rules(&self) -> Vec<&str> {
        self.conflicts
            .iter()
            .filter(|c| c.rule.risk_tier == SodRiskTier::Critical)
            .map(|c| c.rule.name.as_str())
            .collect()
    }
}

/// Immutable rule table, built once at startup and shared freely.
#[derive(Debug, Clone)]
pub struct SodRuleSet {
    rules: Vec<SodRule>,
}

impl Default for SodRuleSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SodRuleSet {
    pub fn new(rules: Vec<SodRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[SodRule] {
        &self.rules
    }

    pub fn evaluate<I, S>(&self, permission_slugs: I) -> SodEvaluation
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let held: HashSet<String> = permission_slugs
            .into_iter()
            .map(|slug| slug.as_ref().to_owned())
            .collect();

        let conflicts: Vec<SodConflict> = self
            .rules
            .iter()
            .filter(|rule| held.contains(&rule.conflict_pair.0) && held.contains(&rule.conflict_pair.1))
            .map(|rule| SodConflict {
                rule: rule.clone(),
                found_slugs: [rule.conflict_pair.0.clone(), rule.conflict_pair.1.clone()],
            })
            .collect();

        let count = |tier: SodRiskTier| conflicts.iter().filter(|c| c.rule.risk_tier == tier).count();
        let critical_count = count(SodRiskTier::Critical);

        SodEvaluation {
            is_valid: critical_count == 0,
            critical_count,
            high_count: count(SodRiskTier::High),
            medium_count: count(SodRiskTier::Medium),
            conflicts,
        }
    }

    /// The platform's standing catalog of toxic combinations.
    pub fn builtin() -> Self {
        use SodRiskTier::*;

        Self::new(vec![
            SodRule::new(
                "SOD-001",
                "Invoice creation and approval",
                Critical,
                ("billing.invoices.create", "billing.invoices.approve"),
                "Split invoice authoring and invoice approval across different roles.",
                &["SOX 404", "COSO Control Activities"],
            ),
            SodRule::new(
                "SOD-002",
                "Role editing and change approval",
                Critical,
                ("roles.update", "workflow.approve"),
                "Role editors must not approve governed changes; route approvals to a security officer role.",
                &["SOX 404", "ISO 27001 A.5.3"],
            ),
            SodRule::new(
                "SOD-003",
                "Data export and audit log purge",
                Critical,
                ("data.export", "audit.logs.delete"),
                "Nobody who can export data may also erase the trail of that export.",
                &["GDPR Art. 32", "ISO 27001 A.8.15"],
            ),
            SodRule::new(
                "SOD-004",
                "User impersonation and user management",
                High,
                ("users.impersonate", "users.update"),
                "Restrict impersonation to support roles without account management rights.",
                &["ISO 27001 A.5.18"],
            ),
            SodRule::new(
                "SOD-005",
                "User provisioning and audit review",
                High,
                ("users.create", "audit.logs.manage"),
                "Provisioning staff should not curate the logs that review their own work.",
                &["SOX 404"],
            ),
            SodRule::new(
                "SOD-006",
                "Subscription edits and payment refunds",
                Medium,
                ("billing.subscriptions.update", "billing.payments.refund"),
                "Review refunds issued by staff who also change subscription terms.",
                &["PCI DSS 7.2"],
            ),
            SodRule::new(
                "SOD-007",
                "Workflow design and approval",
                Medium,
                ("workflow.definitions.manage", "workflow.approve"),
                "Workflow designers should not sit in the approver sets they configure.",
                &["ISO 27001 A.5.3"],
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_rule() -> SodRuleSet {
        SodRuleSet::new(vec![SodRule::new(
            "R1",
            "x and y",
            SodRiskTier::Critical,
            ("a.x", "a.y"),
            "split",
            &[],
        )])
    }

    #[test]
    fn fires_only_when_both_slugs_present() {
        let rules = single_rule();

        let both = rules.evaluate(["a.x", "a.y"]);
        assert_eq!(both.conflicts.len(), 1);
        assert_eq!(both.conflicts[0].found_slugs, ["a.x".to_string(), "a.y".to_string()]);
        assert!(!both.is_valid);

        let one = rules.evaluate(["a.x"]);
        assert!(one.conflicts.is_empty());
        assert!(one.is_valid);
    }

    #[test]
    fn never_matches_prefix_or_wildcard() {
        let rules = single_rule();

        assert!(rules.evaluate(["a.x.sub", "a.y"]).conflicts.is_empty());
        assert!(rules.evaluate(["a", "a.y"]).conflicts.is_empty());
        assert!(rules.evaluate(["a.*"]).conflicts.is_empty());
        assert!(rules.evaluate(["A.X", "a.y"]).conflicts.is_empty());
    }

    #[test]
    fn advisory_tiers_do_not_invalidate() {
        let eval = SodRuleSet::builtin().evaluate([
            "users.impersonate",
            "users.update",
            "billing.subscriptions.update",
            "billing.payments.refund",
        ]);

        assert_eq!(eval.high_count, 1);
        assert_eq!(eval.medium_count, 1);
        assert_eq!(eval.critical_count, 0);
        assert!(eval.is_valid);
        assert!(eval.blocking_rules().is_empty());
    }

    #[test]
    fn builtin_ids_are_unique() {
        let rules = SodRuleSet::builtin();
        let ids: HashSet<&str> = rules.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), rules.rules().len());
    }
}
