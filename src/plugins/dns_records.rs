use crate::claims::{ClaimType, TrustClaim};
use crate::context::VerificationContext;
use crate::domain_utils::DomainUtils;
use crate::plugins::VerifierPlugin;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const NAME: &str = "dns-records";

/// DNS queries the plugin needs. `Ok(vec![])` means the name answered with
/// no records; `Err` means we could not find out.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    async fn mx(&self, domain: &str) -> Result<Vec<String>>;
    async fn txt(&self, name: &str) -> Result<Vec<String>>;
}

pub struct HickoryDns {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl HickoryDns {
    pub fn from_system_conf(timeout: Duration) -> Result<Self> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
        Ok(Self { resolver, timeout })
    }
}

fn is_no_records(kind: &ResolveErrorKind) -> bool {
    matches!(kind, ResolveErrorKind::NoRecordsFound { .. })
}

#[async_trait]
impl DnsLookup for HickoryDns {
    async fn mx(&self, domain: &str) -> Result<Vec<String>> {
        match tokio::time::timeout(self.timeout, self.resolver.mx_lookup(domain)).await {
            Ok(Ok(response)) => Ok(response
                .iter()
                .map(|mx| mx.exchange().to_utf8())
                .collect()),
            Ok(Err(e)) if is_no_records(e.kind()) => Ok(Vec::new()),
            Ok(Err(e)) => Err(anyhow!("MX lookup failed for {domain}: {e}")),
            Err(_) => Err(anyhow!("MX lookup timed out for {domain}")),
        }
    }

    async fn txt(&self, name: &str) -> Result<Vec<String>> {
        match tokio::time::timeout(self.timeout, self.resolver.txt_lookup(name)).await {
            Ok(Ok(response)) => Ok(response
                .iter()
                .map(|txt| {
                    txt.txt_data()
                        .iter()
                        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                        .collect::<String>()
                })
                .collect()),
            Ok(Err(e)) if is_no_records(e.kind()) => Ok(Vec::new()),
            Ok(Err(e)) => Err(anyhow!("TXT lookup failed for {name}: {e}")),
            Err(_) => Err(anyhow!("TXT lookup timed out for {name}")),
        }
    }
}

/// Canned answers for offline runs and tests. Unknown names answer empty.
#[derive(Debug, Default, Clone)]
pub struct StaticDns {
    pub mx: HashMap<String, Vec<String>>,
    pub txt: HashMap<String, Vec<String>>,
    pub failing: Vec<String>,
}

impl StaticDns {
    /// A domain with MX, SPF, DMARC and MTA-STS all published
    pub fn with_complete_domain(mut self, domain: &str) -> Self {
        self.mx
            .insert(domain.to_string(), vec![format!("mx1.{domain}.")]);
        self.txt.insert(
            domain.to_string(),
            vec!["v=spf1 include:_spf.example.net ~all".to_string()],
        );
        self.txt.insert(
            format!("_dmarc.{domain}"),
            vec!["v=DMARC1; p=reject".to_string()],
        );
        self.txt.insert(
            format!("_mta-sts.{domain}"),
            vec!["v=STSv1; id=2024010101".to_string()],
        );
        self
    }

    /// Mock data in the spirit of the domain-age mock table
    pub fn mock() -> Self {
        let mut dns = Self::default()
            .with_complete_domain("example.com")
            .with_complete_domain("google.com")
            .with_complete_domain("established.org");
        dns.mx
            .insert("psybook.info".to_string(), vec!["mx.psybook.info.".to_string()]);
        dns
    }

    fn check(&self, name: &str) -> Result<()> {
        if self.failing.iter().any(|f| f == name) {
            Err(anyhow!("SERVFAIL for {name}"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DnsLookup for StaticDns {
    async fn mx(&self, domain: &str) -> Result<Vec<String>> {
        self.check(domain)?;
        Ok(self.mx.get(domain).cloned().unwrap_or_default())
    }

    async fn txt(&self, name: &str) -> Result<Vec<String>> {
        self.check(name)?;
        Ok(self.txt.get(name).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DnsPosture {
    pub has_mx: bool,
    pub has_spf: bool,
    pub has_dmarc: bool,
    pub has_mta_sts: bool,
}

/// Queries MX, SPF, DMARC and MTA-STS records for the sender domain
pub struct DnsRecordsPlugin {
    dns: Arc<dyn DnsLookup>,
}

impl DnsRecordsPlugin {
    pub fn new(dns: Arc<dyn DnsLookup>) -> Self {
        Self { dns }
    }

    /// Look a record up on `domain`, then on its organizational domain
    async fn mx_with_fallback(&self, domain: &str, root: &str) -> Result<bool> {
        if !self.dns.mx(domain).await?.is_empty() {
            return Ok(true);
        }
        if root != domain {
            return Ok(!self.dns.mx(root).await?.is_empty());
        }
        Ok(false)
    }

    async fn txt_with_prefix(
        &self,
        name: &str,
        root: Option<&str>,
        prefix: &str,
    ) -> Result<bool> {
        let matches = |records: Vec<String>| {
            records
                .iter()
                .any(|r| r.trim().to_lowercase().starts_with(prefix))
        };
        if matches(self.dns.txt(name).await?) {
            return Ok(true);
        }
        match root {
            Some(root) if root != name => Ok(matches(self.dns.txt(root).await?)),
            _ => Ok(false),
        }
    }

    pub async fn posture(&self, domain: &str) -> Result<DnsPosture> {
        let root = DomainUtils::root_domain(domain);
        let dmarc_name = format!("_dmarc.{domain}");
        let dmarc_root = format!("_dmarc.{root}");
        let sts_name = format!("_mta-sts.{root}");

        let (has_mx, has_spf, has_dmarc, has_mta_sts) = tokio::join!(
            self.mx_with_fallback(domain, &root),
            self.txt_with_prefix(domain, None, "v=spf1"),
            self.txt_with_prefix(&dmarc_name, Some(&dmarc_root), "v=dmarc1"),
            self.txt_with_prefix(&sts_name, None, "v=stsv1"),
        );

        Ok(DnsPosture {
            has_mx: has_mx?,
            has_spf: has_spf?,
            has_dmarc: has_dmarc?,
            // MTA-STS is advisory; a failed lookup just reads as absent
            has_mta_sts: has_mta_sts.unwrap_or(false),
        })
    }
}

#[async_trait]
impl VerifierPlugin for DnsRecordsPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "MX, SPF, DMARC and MTA-STS records published by the sender domain"
    }

    async fn gather(&self, context: &VerificationContext) -> Result<Vec<TrustClaim>> {
        let domain = context.sender_domain();
        let posture = self.posture(domain).await?;
        log::debug!("DNS posture for {domain}: {posture:?}");

        let mut claims = Vec::new();
        let mut missing = Vec::new();
        if !posture.has_mx {
            missing.push("MX");
        }
        if !posture.has_spf {
            missing.push("SPF");
        }

        if !missing.is_empty() {
            let mut evidence = format!("{domain} publishes no {} record(s)", missing.join("/"));
            if !posture.has_mta_sts {
                evidence.push_str("; no MTA-STS policy");
            }
            claims.push(
                TrustClaim::new(NAME, ClaimType::MissingDnsRecords, domain, 1.0)
                    .with_evidence(evidence),
            );
        }
        if !posture.has_dmarc {
            claims.push(
                TrustClaim::new(NAME, ClaimType::MissingDmarc, domain, 1.0)
                    .with_evidence(format!("No _dmarc TXT record for {domain}")),
            );
        }

        Ok(claims)
    }
}
