//! Rule-based scoring: claims in, score and findings out.
//!
//! The deduction table is plain data so it can be versioned, loaded from
//! YAML and audited without touching the gathering pipeline.

use crate::claims::{ClaimType, Finding, RiskLevel, TrustClaim};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

pub const DEFAULT_RULESET_VERSION: &str = "2024.1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductionRule {
    pub claim_type: ClaimType,
    pub deduction: u32,
    /// Used when a claim arrives without a usable confidence
    #[serde(default = "default_confidence")]
    pub default_confidence: f64,
    #[serde(default)]
    pub description: String,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeductionTable {
    pub version: String,
    pub rules: Vec<DeductionRule>,
}

impl Default for DeductionTable {
    fn default() -> Self {
        let rule = |claim_type, deduction, description: &str| DeductionRule {
            claim_type,
            deduction,
            default_confidence: 1.0,
            description: description.to_string(),
        };

        Self {
            version: DEFAULT_RULESET_VERSION.to_string(),
            rules: vec![
                rule(ClaimType::MissingDmarc, 10, "Sender domain publishes no DMARC policy"),
                rule(ClaimType::SpfFail, 20, "SPF check failed"),
                rule(ClaimType::DkimFail, 20, "DKIM signature failed verification"),
                rule(ClaimType::DmarcFail, 20, "DMARC evaluation failed"),
                rule(ClaimType::DomainMisalignment, 15, "DKIM signing domain does not match sender"),
                rule(ClaimType::MissingDnsRecords, 10, "Sender domain lacks mail DNS records"),
                rule(ClaimType::DomainYoung, 25, "Sender domain was registered recently"),
                rule(ClaimType::LookalikeDomain, 30, "Sender domain imitates a trusted domain"),
                rule(ClaimType::PayToPitch, 35, "Asks for payment to be considered"),
                rule(ClaimType::BudgetAnchoring, 10, "Anchors on a budget or fee up front"),
                rule(ClaimType::UrgencyLanguage, 15, "Applies time pressure"),
                rule(ClaimType::AuthorityGarnish, 10, "Name-drops authorities to borrow credibility"),
                rule(ClaimType::FlaggedUrl, 25, "Links to a URL flagged by a reputation service"),
                rule(ClaimType::SuspiciousAttachment, 15, "Carries an executable or disguised attachment"),
                rule(ClaimType::IdentityVerified, 0, "Sender identity confirmed by an identity provider"),
            ],
        }
    }
}

impl DeductionTable {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ruleset {}", path.display()))?;
        let table: DeductionTable = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse ruleset {}", path.display()))?;
        table.validate()?;
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(anyhow!("ruleset version must not be empty"));
        }
        let mut seen = HashMap::new();
        for rule in &self.rules {
            if seen.insert(rule.claim_type, ()).is_some() {
                return Err(anyhow!("duplicate rule for claim type {}", rule.claim_type));
            }
            if rule.deduction > 100 {
                return Err(anyhow!(
                    "deduction for {} exceeds 100: {}",
                    rule.claim_type,
                    rule.deduction
                ));
            }
            if !(0.0..=1.0).contains(&rule.default_confidence) {
                return Err(anyhow!(
                    "default confidence for {} out of range: {}",
                    rule.claim_type,
                    rule.default_confidence
                ));
            }
        }
        Ok(())
    }

    pub fn rule_for(&self, claim_type: ClaimType) -> Option<&DeductionRule> {
        self.rules.iter().find(|r| r.claim_type == claim_type)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub score: u8,
    pub risk_level: RiskLevel,
    pub findings: Vec<Finding>,
}

/// Score a claim set against `table`.
///
/// One finding per distinct claim type; when a type fires more than once
/// the highest-confidence claim wins (earliest on ties). Deductions are
/// `round(deduction * confidence)` and the running score is clamped to
/// 0..=100 after every step. Findings keep the order in which their claim
/// type first appeared.
pub fn score_claims(claims: &[TrustClaim], table: &DeductionTable) -> ScoreOutcome {
    let mut order: Vec<ClaimType> = Vec::new();
    let mut strongest: HashMap<ClaimType, &TrustClaim> = HashMap::new();

    for claim in claims {
        match strongest.get(&claim.claim_type) {
            Some(existing)
                if effective_confidence(existing, None) >= effective_confidence(claim, None) => {}
            Some(_) => {
                strongest.insert(claim.claim_type, claim);
            }
            None => {
                order.push(claim.claim_type);
                strongest.insert(claim.claim_type, claim);
            }
        }
    }

    let mut score: i64 = 100;
    let mut findings = Vec::new();

    for claim_type in order {
        let Some(rule) = table.rule_for(claim_type) else {
            log::debug!("No rule for claim type {claim_type} in ruleset {}", table.version);
            continue;
        };
        let claim = strongest[&claim_type];
        let confidence = effective_confidence(claim, Some(rule));
        let deduction = (rule.deduction as f64 * confidence).round() as u32;

        score = (score - deduction as i64).clamp(0, 100);
        findings.push(Finding {
            claim: claim.clone(),
            deduction,
            ruleset_version: table.version.clone(),
        });
    }

    let score = score as u8;
    ScoreOutcome {
        score,
        risk_level: RiskLevel::from_score(score),
        findings,
    }
}

fn effective_confidence(claim: &TrustClaim, rule: Option<&DeductionRule>) -> f64 {
    if claim.confidence.is_finite() {
        claim.confidence.clamp(0.0, 1.0)
    } else {
        rule.map(|r| r.default_confidence).unwrap_or(0.0)
    }
}
