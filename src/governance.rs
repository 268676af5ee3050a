//! Pure pre-flight check of a permission set: SoD conflicts plus risk.

use serde::Serialize;

use crate::risk::{RiskScore, RiskScorer};
use crate::sod::{SodEvaluation, SodRuleSet};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub sod_result: SodEvaluation,
    pub risk_score: RiskScore,
    pub requires_approval: bool,
    pub can_proceed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct GovernanceValidator {
    sod: SodRuleSet,
    risk: RiskScorer,
}

impl GovernanceValidator {
    pub fn new(sod: SodRuleSet, risk: RiskScorer) -> Self {
        Self { sod, risk }
    }

    pub fn sod_rules(&self) -> &SodRuleSet {
        &self.sod
    }

    pub fn risk_scorer(&self) -> &RiskScorer {
        &self.risk
    }

    pub fn validate<S: AsRef<str>>(&self, permission_slugs: &[S]) -> ValidationReport {
        let sod_result = self.sod.evaluate(permission_slugs.iter().map(AsRef::as_ref));
        let risk_score = self
            .risk
            .score(permission_slugs.iter().map(AsRef::as_ref), sod_result.has_conflicts());
        let requires_approval = self.risk.requires_approval(&risk_score);

        let blocked_reason = (!sod_result.is_valid).then(|| {
            format!(
                "Critical segregation-of-duties conflict: {}",
                sod_result.blocking_rules().join(", ")
            )
        });

        ValidationReport {
            can_proceed: sod_result.is_valid,
            requires_approval,
            blocked_reason,
            sod_result,
            risk_score,
        }
    }
}
