use crate::claims::{ClaimType, TrustClaim};
use crate::context::VerificationContext;
use crate::domain_utils::DomainUtils;
use crate::plugins::VerifierPlugin;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::RwLock;

pub const NAME: &str = "domain-whois";
pub const DEFAULT_MAX_AGE_DAYS: i64 = 540;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainInfo {
    pub domain: String,
    pub creation_date: Option<DateTime<Utc>>,
    pub age_days: Option<i64>,
    pub cached_at: DateTime<Utc>,
}

/// WHOIS-backed registration date lookup with a 24h cache
#[derive(Debug, Clone)]
pub struct DomainAgeChecker {
    cache: Arc<RwLock<HashMap<String, DomainInfo>>>,
    cache_ttl: chrono::Duration,
    timeout: Duration,
    mock_ages: Option<HashMap<String, i64>>,
}

impl DomainAgeChecker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            cache_ttl: chrono::Duration::hours(24),
            timeout,
            mock_ages: None,
        }
    }

    /// Never touches the network; ages come from `ages` (root domain -> days)
    pub fn with_mock_ages(timeout: Duration, ages: HashMap<String, i64>) -> Self {
        Self {
            mock_ages: Some(ages),
            ..Self::new(timeout)
        }
    }

    pub fn default_mock_ages() -> HashMap<String, i64> {
        HashMap::from([
            ("psybook.info".to_string(), 90),
            ("example.com".to_string(), 8000),
            ("google.com".to_string(), 9000),
            ("suspicious.tk".to_string(), 30),
            ("newdomain.info".to_string(), 45),
            ("established.org".to_string(), 3650),
        ])
    }

    /// Age in days of the registrable domain behind `domain`, if known
    pub async fn age_days(&self, domain: &str) -> Result<Option<i64>> {
        let root = DomainUtils::root_domain(domain);
        if root.is_empty() || !root.contains('.') {
            log::warn!("Invalid domain format: {root} (from: {domain})");
            return Ok(None);
        }
        Ok(self.get_domain_info(&root).await?.age_days)
    }

    async fn get_domain_info(&self, domain: &str) -> Result<DomainInfo> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(domain) {
                if Utc::now() - cached.cached_at < self.cache_ttl {
                    log::debug!("Using cached domain info for: {domain}");
                    return Ok(cached.clone());
                }
            }
        }

        let info = match &self.mock_ages {
            Some(ages) => Self::mock_domain_info(ages, domain),
            None => self.fetch_domain_info(domain).await?,
        };

        let mut cache = self.cache.write().await;
        let now = Utc::now();
        let before = cache.len();
        cache.retain(|_, cached| now - cached.cached_at < self.cache_ttl);
        if cache.len() < before {
            log::debug!("Pruned {} expired WHOIS cache entries", before - cache.len());
        }
        cache.insert(domain.to_string(), info.clone());
        Ok(info)
    }

    fn mock_domain_info(ages: &HashMap<String, i64>, domain: &str) -> DomainInfo {
        log::debug!("Using mock data for domain: {domain}");
        let age_days = ages.get(domain).copied();
        DomainInfo {
            domain: domain.to_string(),
            creation_date: age_days.map(|days| Utc::now() - chrono::Duration::days(days)),
            age_days,
            cached_at: Utc::now(),
        }
    }

    async fn fetch_domain_info(&self, domain: &str) -> Result<DomainInfo> {
        let server = whois_server_for(domain);
        log::debug!("Using WHOIS server: {server} for domain: {domain}");

        let mut servers = vec![server.to_string()];
        servers.extend(["whois.iana.org", "whois.internic.net"].map(String::from));
        servers.dedup();

        let mut last_error = anyhow!("no WHOIS server answered for {domain}");
        for server in servers {
            match self.query_with_referral(&server, domain).await {
                Ok(text) => match parse_whois_creation(&text) {
                    Some(created) => {
                        let age_days = (Utc::now() - created).num_days();
                        log::info!("WHOIS creation date for {domain}: {created} ({age_days} days old)");
                        return Ok(DomainInfo {
                            domain: domain.to_string(),
                            creation_date: Some(created),
                            age_days: Some(age_days),
                            cached_at: Utc::now(),
                        });
                    }
                    None => {
                        log::debug!("No creation date in response from {server} for {domain}");
                        last_error = anyhow!("no creation date for {domain} from {server}");
                    }
                },
                Err(e) => {
                    log::debug!("WHOIS server {server} failed for {domain}: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// Thin registries (IANA, Verisign) point at the registrar with a
    /// `refer:` / `Registrar WHOIS Server:` line; follow it once.
    async fn query_with_referral(&self, server: &str, domain: &str) -> Result<String> {
        let text = self.query_whois_server(server, domain).await?;
        if parse_whois_creation(&text).is_some() {
            return Ok(text);
        }
        match referral_server(&text) {
            Some(referral) if referral != server => {
                log::debug!("Following WHOIS referral {server} -> {referral}");
                self.query_whois_server(&referral, domain).await
            }
            _ => Ok(text),
        }
    }

    async fn query_whois_server(&self, server: &str, domain: &str) -> Result<String> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;
        use tokio::time::timeout;

        let mut stream = timeout(self.timeout, TcpStream::connect(format!("{server}:43"))).await??;
        stream.write_all(format!("{domain}\r\n").as_bytes()).await?;

        let mut response = Vec::new();
        timeout(self.timeout, stream.read_to_end(&mut response)).await??;
        if response.is_empty() {
            return Err(anyhow!("Empty WHOIS response from {server}"));
        }
        Ok(String::from_utf8_lossy(&response).into_owned())
    }
}

fn whois_server_for(domain: &str) -> &'static str {
    let tld = domain.rsplit('.').next().unwrap_or(domain);
    match tld {
        "com" | "net" => "whois.verisign-grs.com",
        "org" => "whois.pir.org",
        "info" => "whois.afilias.net",
        "biz" => "whois.neulevel.biz",
        "us" => "whois.nic.us",
        "uk" => "whois.nic.uk",
        "de" => "whois.denic.de",
        "fr" => "whois.afnic.fr",
        "it" => "whois.nic.it",
        "nl" => "whois.domain-registry.nl",
        "au" => "whois.auda.org.au",
        "ca" => "whois.cira.ca",
        "jp" => "whois.jprs.jp",
        "io" => "whois.nic.io",
        "co" => "whois.nic.co",
        _ => "whois.iana.org",
    }
}

fn referral_server(text: &str) -> Option<String> {
    static REFERRAL: OnceLock<Regex> = OnceLock::new();
    let re = REFERRAL.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:refer|whois|registrar whois server)\s*:\s*([a-z0-9.\-]+)\s*$")
            .expect("static referral regex")
    });
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .filter(|s| s.contains('.'))
}

fn creation_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?im)^\s*creation\s*date\s*:\s*(.+)$",
            r"(?im)^\s*created(?:\s*on)?\s*:\s*(.+)$",
            r"(?im)^\s*registered(?:\s*on)?\s*:\s*(.+)$",
            r"(?im)^\s*domain\s*(?:record\s*activated|created)\s*:\s*(.+)$",
            r"(?im)^\s*registration\s*(?:date|time)\s*:\s*(.+)$",
            r"(?im)^\s*(?:domain_date_created|create_date|created_date)\s*:\s*(.+)$",
            r"(?im)^\s*fecha\s*de\s*creaci[oó]n\s*:\s*(.+)$",
            r"(?im)^\s*date\s*de\s*cr[eé]ation\s*:\s*(.+)$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Creation date from a free-form WHOIS response
pub fn parse_whois_creation(text: &str) -> Option<DateTime<Utc>> {
    creation_patterns().iter().find_map(|re| {
        re.captures_iter(text)
            .filter_map(|c| c.get(1))
            .find_map(|m| parse_date_string(m.as_str()))
    })
}

pub fn parse_date_string(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    let first = value.split_whitespace().next()?;
    for format in ["%Y-%m-%d", "%d-%b-%Y", "%d.%m.%Y", "%Y.%m.%d", "%Y/%m/%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(first, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }

    static ISO_DATE: OnceLock<Regex> = OnceLock::new();
    let re = ISO_DATE.get_or_init(|| Regex::new(r"(\d{4})-(\d{2})-(\d{2})").expect("static date regex"));
    let caps = re.captures(value)?;
    NaiveDate::parse_from_str(caps.get(0)?.as_str(), "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|naive| naive.and_utc())
}

/// Fold characters commonly swapped in typosquats onto their lookalikes
fn skeleton(domain: &str) -> String {
    domain
        .to_lowercase()
        .replace("rn", "m")
        .replace("vv", "w")
        .chars()
        .map(|c| match c {
            '0' => 'o',
            '1' | 'i' => 'l',
            '3' => 'e',
            '4' => 'a',
            '5' => 's',
            '7' => 't',
            'а' => 'a',
            'е' => 'e',
            'о' => 'o',
            'р' => 'p',
            'с' => 'c',
            _ => c,
        })
        .collect()
}

/// The trusted domain `domain` imitates, if any: same skeleton or an edit
/// distance of one or two, but not the trusted domain itself (or one of
/// its subdomains).
pub fn lookalike_of<'a>(domain: &str, trusted: &'a [String]) -> Option<&'a str> {
    let root = DomainUtils::root_domain(domain);
    if DomainUtils::matches_domain_list(domain, trusted) {
        return None;
    }
    trusted.iter().map(String::as_str).find(|candidate| {
        let candidate = candidate.to_lowercase();
        if candidate.len() < 5 || candidate == root {
            return false;
        }
        skeleton(&root) == skeleton(&candidate)
            || (1..=2).contains(&strsim::damerau_levenshtein(&root, &candidate))
    })
}

/// Flags recently registered sender domains and lookalikes of trusted ones
pub struct DomainWhoisPlugin {
    checker: DomainAgeChecker,
    max_age_days: i64,
    trusted_domains: Vec<String>,
}

impl DomainWhoisPlugin {
    pub fn new(checker: DomainAgeChecker, max_age_days: i64, trusted_domains: Vec<String>) -> Self {
        Self {
            checker,
            max_age_days,
            trusted_domains,
        }
    }
}

#[async_trait]
impl VerifierPlugin for DomainWhoisPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Domain registration age and lookalikes of trusted domains"
    }

    async fn gather(&self, context: &VerificationContext) -> Result<Vec<TrustClaim>> {
        let domain = context.sender_domain();
        let root = DomainUtils::root_domain(domain);
        let mut claims = Vec::new();

        if let Some(imitated) = lookalike_of(domain, &self.trusted_domains) {
            claims.push(
                TrustClaim::new(NAME, ClaimType::LookalikeDomain, &root, 1.0)
                    .with_evidence(format!("{root} imitates trusted domain {imitated}")),
            );
        }

        // a WHOIS outage must not cost us the lookalike claim
        match self.checker.age_days(domain).await {
            Ok(Some(age)) if age < self.max_age_days => {
                log::debug!("Domain {root} is {age} days old (threshold: {})", self.max_age_days);
                claims.push(
                    TrustClaim::new(NAME, ClaimType::DomainYoung, &root, 1.0).with_evidence(format!(
                        "{root} was registered {age} days ago (threshold {} days)",
                        self.max_age_days
                    )),
                );
            }
            Ok(Some(_)) => {}
            Ok(None) => log::debug!("Could not determine age for domain: {root}"),
            Err(e) => log::warn!("WHOIS lookup for {root} failed: {e}"),
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted() -> Vec<String> {
        vec!["paypal.com".to_string(), "linkedin.com".to_string(), "google.com".to_string()]
    }

    fn plugin() -> DomainWhoisPlugin {
        let checker = DomainAgeChecker::with_mock_ages(
            Duration::from_secs(1),
            DomainAgeChecker::default_mock_ages(),
        );
        DomainWhoisPlugin::new(checker, DEFAULT_MAX_AGE_DAYS, trusted())
    }

    fn context(sender: &str) -> VerificationContext {
        VerificationContext::builder("m1", "t1")
            .sender(sender)
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_whois_creation_formats() {
        let verisign = "   Domain Name: EXAMPLE.COM\n   Creation Date: 1995-08-14T04:00:00Z\n";
        let created = parse_whois_creation(verisign).unwrap();
        assert_eq!(created.format("%Y-%m-%d").to_string(), "1995-08-14");

        let nominet = "Domain name:\n    example.co.uk\nRegistered on: 26-Nov-1996\n";
        assert_eq!(
            parse_whois_creation(nominet).unwrap().format("%Y-%m-%d").to_string(),
            "1996-11-26"
        );

        let denic = "created: 2024-10-10 12:00:00\n";
        assert!(parse_whois_creation(denic).is_some());

        assert!(parse_whois_creation("No match for domain").is_none());
    }

    #[tokio::test]
    async fn test_cache_prunes_expired_entries_on_insert() {
        let checker = DomainAgeChecker::with_mock_ages(
            Duration::from_secs(1),
            DomainAgeChecker::default_mock_ages(),
        );
        checker.cache.write().await.insert(
            "stale.example".to_string(),
            DomainInfo {
                domain: "stale.example".to_string(),
                creation_date: None,
                age_days: None,
                cached_at: Utc::now() - chrono::Duration::hours(25),
            },
        );

        assert_eq!(checker.age_days("psybook.info").await.unwrap(), Some(90));
        let cache = checker.cache.read().await;
        assert!(cache.contains_key("psybook.info"));
        assert!(!cache.contains_key("stale.example"));
    }

    #[test]
    fn test_referral_server() {
        let iana = "% IANA WHOIS server\nrefer:        whois.verisign-grs.com\n\ndomain: COM\n";
        assert_eq!(referral_server(iana).as_deref(), Some("whois.verisign-grs.com"));
        assert_eq!(referral_server("nothing here"), None);
    }

    #[test]
    fn test_lookalike_detection() {
        let trusted = trusted();
        assert_eq!(lookalike_of("paypa1.com", &trusted), Some("paypal.com"));
        assert_eq!(lookalike_of("mail.linkedln.com", &trusted), Some("linkedin.com"));
        assert_eq!(lookalike_of("g00gle.com", &trusted), Some("google.com"));
        assert_eq!(lookalike_of("paypal.com", &trusted), None);
        assert_eq!(lookalike_of("mail.google.com", &trusted), None);
        assert_eq!(lookalike_of("example.org", &trusted), None);
    }

    #[tokio::test]
    async fn test_young_domain_is_claimed() {
        let claims = plugin().gather(&context("x@psybook.info")).await.unwrap();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].claim_type, ClaimType::DomainYoung);
        assert_eq!(claims[0].confidence, 1.0);
    }

    #[tokio::test]
    async fn test_old_and_unknown_domains_are_not_claimed() {
        assert!(plugin().gather(&context("a@example.com")).await.unwrap().is_empty());
        assert!(plugin().gather(&context("a@unknown-domain.net")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookalike_and_age_combine() {
        let mut ages = DomainAgeChecker::default_mock_ages();
        ages.insert("paypa1.com".to_string(), 12);
        let checker = DomainAgeChecker::with_mock_ages(Duration::from_secs(1), ages);
        let plugin = DomainWhoisPlugin::new(checker, DEFAULT_MAX_AGE_DAYS, trusted());

        let claims = plugin.gather(&context("service@paypa1.com")).await.unwrap();
        let types: Vec<ClaimType> = claims.iter().map(|c| c.claim_type).collect();
        assert_eq!(types, vec![ClaimType::LookalikeDomain, ClaimType::DomainYoung]);
    }

    #[tokio::test]
    async fn test_age_is_cached_per_root_domain() {
        let checker = DomainAgeChecker::with_mock_ages(
            Duration::from_secs(1),
            DomainAgeChecker::default_mock_ages(),
        );
        assert_eq!(checker.age_days("mail.google.com").await.unwrap(), Some(9000));
        assert!(checker.cache.read().await.contains_key("google.com"));
    }
}
