use crate::claims::{ClaimType, TrustClaim};
use crate::context::VerificationContext;
use crate::domain_utils::DomainUtils;
use crate::plugins::VerifierPlugin;
use async_trait::async_trait;

pub const NAME: &str = "email-auth";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    Pass,
    Fail,
    SoftFail,
    Neutral,
    None,
    TempError,
    PermError,
}

impl AuthVerdict {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "pass" => Some(Self::Pass),
            "fail" | "hardfail" => Some(Self::Fail),
            "softfail" => Some(Self::SoftFail),
            "neutral" | "policy" => Some(Self::Neutral),
            "none" => Some(Self::None),
            "temperror" => Some(Self::TempError),
            "permerror" => Some(Self::PermError),
            _ => None,
        }
    }
}

/// Authentication results as recorded by the receiving MTA
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthResults {
    pub spf: Option<AuthVerdict>,
    pub dkim: Option<AuthVerdict>,
    pub dmarc: Option<AuthVerdict>,
    /// `d=` domains of DKIM signatures plus `header.d=` from results
    pub dkim_domains: Vec<String>,
    pub header_from: Option<String>,
}

impl AuthResults {
    pub fn from_context(context: &VerificationContext) -> Self {
        let headers = context.headers();
        let mut results = AuthResults::default();

        // the topmost header is the one added by our own MTA
        for value in headers.get_all("authentication-results") {
            results.absorb_authentication_results(value);
        }

        if results.spf.is_none() {
            if let Some(received_spf) = headers.get("received-spf") {
                results.spf = received_spf
                    .split_whitespace()
                    .next()
                    .and_then(AuthVerdict::parse);
            }
        }

        for signature in headers.get_all("dkim-signature") {
            if let Some(domain) = tag_value(signature, "d") {
                push_unique(&mut results.dkim_domains, domain.to_lowercase());
            }
        }

        results
    }

    fn absorb_authentication_results(&mut self, value: &str) {
        // first segment is the authserv-id
        for segment in value.split(';').skip(1) {
            let mut tokens = segment.split_whitespace();
            let Some((method, verdict)) = tokens.next().and_then(|t| t.split_once('=')) else {
                continue;
            };
            let Some(verdict) = AuthVerdict::parse(verdict) else {
                continue;
            };

            match method.to_lowercase().as_str() {
                "spf" if self.spf.is_none() => self.spf = Some(verdict),
                "dkim" => {
                    // any passing signature wins over a failing one
                    if self.dkim.is_none() || verdict == AuthVerdict::Pass {
                        self.dkim = Some(verdict);
                    }
                    for token in tokens {
                        if let Some(domain) = token.strip_prefix("header.d=") {
                            push_unique(&mut self.dkim_domains, domain.to_lowercase());
                        }
                    }
                }
                "dmarc" if self.dmarc.is_none() => {
                    self.dmarc = Some(verdict);
                    for token in tokens {
                        if let Some(domain) = token.strip_prefix("header.from=") {
                            self.header_from = Some(domain.to_lowercase());
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

fn tag_value<'a>(signature: &'a str, tag: &str) -> Option<&'a str> {
    signature.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name.trim() == tag).then(|| value.trim())
    })
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

/// Reads SPF, DKIM and DMARC outcomes from the message headers
#[derive(Debug, Default)]
pub struct EmailAuthPlugin;

impl EmailAuthPlugin {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, context: &VerificationContext) -> Vec<TrustClaim> {
        let results = AuthResults::from_context(context);
        let from_domain = context
            .headers()
            .get("from")
            .and_then(DomainUtils::extract_email_from_header)
            .and_then(|addr| DomainUtils::extract_domain(&addr))
            .or_else(|| results.header_from.clone())
            .unwrap_or_else(|| context.sender_domain().to_string());

        let mut claims = Vec::new();
        let claim = |claim_type, confidence, evidence: String| {
            TrustClaim::new(NAME, claim_type, from_domain.clone(), confidence)
                .with_evidence(evidence)
        };

        match results.dmarc {
            Some(AuthVerdict::Fail) => claims.push(claim(
                ClaimType::DmarcFail,
                1.0,
                "DMARC evaluation failed".to_string(),
            )),
            Some(AuthVerdict::None) | None => claims.push(claim(
                ClaimType::MissingDmarc,
                1.0,
                "No DMARC result recorded for the sender domain".to_string(),
            )),
            Some(AuthVerdict::PermError) => claims.push(claim(
                ClaimType::MissingDmarc,
                0.5,
                "DMARC record could not be evaluated (permerror)".to_string(),
            )),
            _ => {}
        }

        match results.spf {
            Some(AuthVerdict::Fail) => claims.push(claim(
                ClaimType::SpfFail,
                1.0,
                "SPF authentication failed".to_string(),
            )),
            Some(AuthVerdict::SoftFail) => claims.push(claim(
                ClaimType::SpfFail,
                0.5,
                "SPF soft fail".to_string(),
            )),
            _ => {}
        }

        if results.dkim == Some(AuthVerdict::Fail) {
            claims.push(claim(
                ClaimType::DkimFail,
                1.0,
                "DKIM signature verification failed".to_string(),
            ));
        }

        if !results.dkim_domains.is_empty()
            && !results
                .dkim_domains
                .iter()
                .any(|d| DomainUtils::is_aligned(d, &from_domain))
        {
            claims.push(claim(
                ClaimType::DomainMisalignment,
                1.0,
                format!(
                    "DKIM domain misaligned: {} vs {}",
                    results.dkim_domains.join(", "),
                    from_domain
                ),
            ));
        }

        claims
    }
}

#[async_trait]
impl VerifierPlugin for EmailAuthPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "SPF, DKIM and DMARC results and sender/DKIM domain alignment"
    }

    async fn gather(&self, context: &VerificationContext) -> anyhow::Result<Vec<TrustClaim>> {
        Ok(self.evaluate(context))
    }
}
