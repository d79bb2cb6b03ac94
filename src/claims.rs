use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Every kind of fact a verifier can assert about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    MissingDmarc,
    SpfFail,
    DkimFail,
    DmarcFail,
    DomainMisalignment,
    MissingDnsRecords,
    DomainYoung,
    LookalikeDomain,
    PayToPitch,
    BudgetAnchoring,
    UrgencyLanguage,
    AuthorityGarnish,
    FlaggedUrl,
    SuspiciousAttachment,
    IdentityVerified,
}

impl ClaimType {
    pub const ALL: [ClaimType; 15] = [
        ClaimType::MissingDmarc,
        ClaimType::SpfFail,
        ClaimType::DkimFail,
        ClaimType::DmarcFail,
        ClaimType::DomainMisalignment,
        ClaimType::MissingDnsRecords,
        ClaimType::DomainYoung,
        ClaimType::LookalikeDomain,
        ClaimType::PayToPitch,
        ClaimType::BudgetAnchoring,
        ClaimType::UrgencyLanguage,
        ClaimType::AuthorityGarnish,
        ClaimType::FlaggedUrl,
        ClaimType::SuspiciousAttachment,
        ClaimType::IdentityVerified,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimType::MissingDmarc => "missing_dmarc",
            ClaimType::SpfFail => "spf_fail",
            ClaimType::DkimFail => "dkim_fail",
            ClaimType::DmarcFail => "dmarc_fail",
            ClaimType::DomainMisalignment => "domain_misalignment",
            ClaimType::MissingDnsRecords => "missing_dns_records",
            ClaimType::DomainYoung => "domain_young",
            ClaimType::LookalikeDomain => "lookalike_domain",
            ClaimType::PayToPitch => "pay_to_pitch",
            ClaimType::BudgetAnchoring => "budget_anchoring",
            ClaimType::UrgencyLanguage => "urgency_language",
            ClaimType::AuthorityGarnish => "authority_garnish",
            ClaimType::FlaggedUrl => "flagged_url",
            ClaimType::SuspiciousAttachment => "suspicious_attachment",
            ClaimType::IdentityVerified => "identity_verified",
        }
    }
}

impl fmt::Display for ClaimType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw fact asserted by one verifier. Never mutated once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustClaim {
    pub provider: String,
    pub claim_type: ClaimType,
    pub subject: String,
    pub confidence: f64,
    pub evidence: Option<String>,
}

impl TrustClaim {
    pub fn new(
        provider: impl Into<String>,
        claim_type: ClaimType,
        subject: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            provider: provider.into(),
            claim_type,
            subject: subject.into(),
            confidence,
            evidence: None,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }
}

/// A claim after it matched a scoring rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub claim: TrustClaim,
    pub deduction: u32,
    pub ruleset_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    LikelyOk,
    Caution,
    HighRisk,
}

impl RiskLevel {
    /// ≥80 likely_ok, 55..=79 caution, below that high_risk
    pub fn from_score(score: u8) -> Self {
        match score {
            80.. => RiskLevel::LikelyOk,
            55..=79 => RiskLevel::Caution,
            _ => RiskLevel::HighRisk,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::LikelyOk => "likely_ok",
            RiskLevel::Caution => "caution",
            RiskLevel::HighRisk => "high_risk",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scored output of one evaluation run. Reports are never rewritten:
/// re-scoring a thread produces a new report with a new id.
///
/// The risk level is not stored; it is derived from the score on read and
/// emitted alongside it when serialized.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustReport {
    pub report_id: String,
    pub thread_id: String,
    pub message_id: String,
    score: u8,
    pub findings: Vec<Finding>,
    pub ruleset_version: String,
    pub generated_at: DateTime<Utc>,
}

impl TrustReport {
    pub fn new(
        report_id: String,
        thread_id: String,
        message_id: String,
        score: u8,
        findings: Vec<Finding>,
        ruleset_version: String,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            report_id,
            thread_id,
            message_id,
            score: score.min(100),
            findings,
            ruleset_version,
            generated_at,
        }
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub fn risk_level(&self) -> RiskLevel {
        RiskLevel::from_score(self.score)
    }
}

#[derive(Serialize, Deserialize)]
struct TrustReportRepr {
    report_id: String,
    thread_id: String,
    message_id: String,
    score: u8,
    risk_level: RiskLevel,
    findings: Vec<Finding>,
    ruleset_version: String,
    generated_at: DateTime<Utc>,
}

impl Serialize for TrustReport {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        TrustReportRepr {
            report_id: self.report_id.clone(),
            thread_id: self.thread_id.clone(),
            message_id: self.message_id.clone(),
            score: self.score,
            risk_level: self.risk_level(),
            findings: self.findings.clone(),
            ruleset_version: self.ruleset_version.clone(),
            generated_at: self.generated_at,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TrustReport {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = TrustReportRepr::deserialize(deserializer)?;
        if repr.score > 100 {
            return Err(serde::de::Error::custom(format!(
                "score {} out of range",
                repr.score
            )));
        }
        // the stored tier is advisory; the score is authoritative
        Ok(TrustReport::new(
            repr.report_id,
            repr.thread_id,
            repr.message_id,
            repr.score,
            repr.findings,
            repr.ruleset_version,
            repr.generated_at,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_thresholds() {
        assert_eq!(RiskLevel::from_score(100), RiskLevel::LikelyOk);
        assert_eq!(RiskLevel::from_score(80), RiskLevel::LikelyOk);
        assert_eq!(RiskLevel::from_score(79), RiskLevel::Caution);
        assert_eq!(RiskLevel::from_score(55), RiskLevel::Caution);
        assert_eq!(RiskLevel::from_score(54), RiskLevel::HighRisk);
        assert_eq!(RiskLevel::from_score(0), RiskLevel::HighRisk);
    }

    #[test]
    fn test_claim_type_names_match_serde() {
        for claim_type in ClaimType::ALL {
            let json = serde_json::to_string(&claim_type).unwrap();
            assert_eq!(json, format!("\"{}\"", claim_type.as_str()));
        }
    }

    #[test]
    fn test_report_serializes_derived_risk_level() {
        let report = TrustReport::new(
            "r1".into(),
            "t1".into(),
            "m1".into(),
            65,
            Vec::new(),
            "2024.1".into(),
            Utc::now(),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["risk_level"], "caution");
        assert_eq!(value["score"], 65);

        let back: TrustReport = serde_json::from_value(value).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn test_report_ignores_disagreeing_stored_tier() {
        let json = serde_json::json!({
            "report_id": "r1",
            "thread_id": "t1",
            "message_id": "m1",
            "score": 90,
            "risk_level": "high_risk",
            "findings": [],
            "ruleset_version": "2024.1",
            "generated_at": "2024-10-10T12:00:00Z"
        });
        let report: TrustReport = serde_json::from_value(json).unwrap();
        assert_eq!(report.risk_level(), RiskLevel::LikelyOk);
    }
}
