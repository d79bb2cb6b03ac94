use crate::claims::{ClaimType, TrustClaim};
use crate::context::VerificationContext;
use crate::domain_utils::DomainUtils;
use crate::plugins::VerifierPlugin;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const NAME: &str = "url-reputation";

const SHORTENERS: &[&str] = &[
    "bit.ly", "tinyurl.com", "t.co", "goo.gl", "ow.ly", "short.link", "is.gd", "v.gd",
    "tiny.cc", "rb.gy", "cutt.ly", "shorturl.at", "1url.com", "u.to",
];

pub fn is_shortener(url: &str) -> bool {
    host_of(url)
        .map(|host| SHORTENERS.iter().any(|s| host == *s || host.ends_with(&format!(".{s}"))))
        .unwrap_or(false)
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|h| h.to_lowercase())
}

/// A source of URL verdicts. Returns flagged URL -> reason; an `Err`
/// means the service could not answer and must never count against the
/// message.
#[async_trait]
pub trait ReputationService: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self, urls: &[String]) -> Result<HashMap<String, String>>;
}

/// Locally maintained list of known-bad hosts
#[derive(Debug, Clone, Default)]
pub struct LocalBlocklist {
    domains: Vec<String>,
}

impl LocalBlocklist {
    pub fn new(domains: Vec<String>) -> Self {
        Self {
            domains: domains.into_iter().map(|d| d.to_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl ReputationService for LocalBlocklist {
    fn name(&self) -> &str {
        "local-blocklist"
    }

    async fn check(&self, urls: &[String]) -> Result<HashMap<String, String>> {
        Ok(urls
            .iter()
            .filter_map(|url| {
                let host = host_of(url)?;
                DomainUtils::matches_domain_list(&host, &self.domains)
                    .then(|| (url.clone(), format!("host {host} is on the local blocklist")))
            })
            .collect())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    client: ClientInfo<'a>,
    threat_info: ThreatInfo<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientInfo<'a> {
    client_id: &'a str,
    client_version: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ThreatInfo<'a> {
    threat_types: [&'a str; 4],
    platform_types: [&'a str; 1],
    threat_entry_types: [&'a str; 1],
    threat_entries: Vec<ThreatEntry<'a>>,
}

#[derive(Serialize, Deserialize)]
struct ThreatEntry<'a> {
    url: &'a str,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    #[serde(default)]
    matches: Vec<ThreatMatch>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreatMatch {
    threat_type: String,
    threat: OwnedThreatEntry,
}

#[derive(Deserialize)]
struct OwnedThreatEntry {
    url: String,
}

/// Safe Browsing v4 `threatMatches:find` lookup
pub struct SafeBrowsingService {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl SafeBrowsingService {
    pub const DEFAULT_ENDPOINT: &'static str =
        "https://safebrowsing.googleapis.com/v4/threatMatches:find";

    pub fn new(endpoint: Option<String>, api_key: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("foff-trust/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| Self::DEFAULT_ENDPOINT.to_string()),
            api_key,
        })
    }

    fn request_body<'a>(urls: &'a [String]) -> LookupRequest<'a> {
        LookupRequest {
            client: ClientInfo {
                client_id: "foff-trust",
                client_version: env!("CARGO_PKG_VERSION"),
            },
            threat_info: ThreatInfo {
                threat_types: [
                    "MALWARE",
                    "SOCIAL_ENGINEERING",
                    "UNWANTED_SOFTWARE",
                    "POTENTIALLY_HARMFUL_APPLICATION",
                ],
                platform_types: ["ANY_PLATFORM"],
                threat_entry_types: ["URL"],
                threat_entries: urls.iter().map(|u| ThreatEntry { url: u }).collect(),
            },
        }
    }

    fn parse_matches(response: LookupResponse) -> HashMap<String, String> {
        let mut flagged = HashMap::new();
        for m in response.matches {
            flagged
                .entry(m.threat.url)
                .or_insert_with(|| format!("Safe Browsing: {}", m.threat_type));
        }
        flagged
    }
}

#[async_trait]
impl ReputationService for SafeBrowsingService {
    fn name(&self) -> &str {
        "safe-browsing"
    }

    async fn check(&self, urls: &[String]) -> Result<HashMap<String, String>> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&Self::request_body(urls))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("Safe Browsing returned HTTP {}", response.status()));
        }
        let body: LookupResponse = response.json().await?;
        Ok(Self::parse_matches(body))
    }
}

/// Checks every extracted URL against the configured reputation services
pub struct UrlReputationPlugin {
    services: Vec<Arc<dyn ReputationService>>,
    max_urls: usize,
}

impl UrlReputationPlugin {
    pub fn new(services: Vec<Arc<dyn ReputationService>>, max_urls: usize) -> Self {
        Self { services, max_urls }
    }
}

#[async_trait]
impl VerifierPlugin for UrlReputationPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Reputation of links in the message body"
    }

    async fn gather(&self, context: &VerificationContext) -> Result<Vec<TrustClaim>> {
        let urls: Vec<String> = context.urls().iter().take(self.max_urls).cloned().collect();
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        if context.urls().len() > urls.len() {
            log::debug!(
                "Checking first {} of {} URLs in message {}",
                urls.len(),
                context.urls().len(),
                context.message_id()
            );
        }

        let mut verdicts: HashMap<String, Vec<String>> = HashMap::new();
        for service in &self.services {
            match service.check(&urls).await {
                Ok(flagged) => {
                    for (url, reason) in flagged {
                        verdicts
                            .entry(url)
                            .or_default()
                            .push(format!("{}: {reason}", service.name()));
                    }
                }
                Err(e) => log::warn!("Reputation service {} unavailable: {e}", service.name()),
            }
        }

        // claims follow message order
        Ok(urls
            .iter()
            .filter_map(|url| {
                let reasons = verdicts.get(url)?;
                let mut evidence = reasons.join("; ");
                if is_shortener(url) {
                    evidence.push_str("; link uses a URL shortener");
                }
                Some(TrustClaim::new(NAME, ClaimType::FlaggedUrl, url, 1.0).with_evidence(evidence))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownService;

    #[async_trait]
    impl ReputationService for DownService {
        fn name(&self) -> &str {
            "down"
        }

        async fn check(&self, _urls: &[String]) -> Result<HashMap<String, String>> {
            Err(anyhow!("connection refused"))
        }
    }

    fn context(body: &str) -> VerificationContext {
        VerificationContext::builder("m1", "t1")
            .sender("a@example.com")
            .body(body)
            .build()
            .unwrap()
    }

    #[test]
    fn test_is_shortener() {
        assert!(is_shortener("https://bit.ly/abc123"));
        assert!(is_shortener("http://tinyurl.com/test"));
        assert!(!is_shortener("https://google.com"));
        assert!(!is_shortener("https://notbit.ly.example.com/x"));
    }

    #[tokio::test]
    async fn test_flagged_urls_yield_one_claim_each() {
        let plugin = UrlReputationPlugin::new(
            vec![Arc::new(LocalBlocklist::new(vec!["evil.example".into()]))],
            20,
        );
        let ctx = context(
            "Pay at https://pay.evil.example/checkout or https://example.com/ok \
             and https://evil.example/again",
        );
        let claims = plugin.gather(&ctx).await.unwrap();
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].subject, "https://pay.evil.example/checkout");
        assert_eq!(claims[1].subject, "https://evil.example/again");
        assert!(claims.iter().all(|c| c.claim_type == ClaimType::FlaggedUrl));
    }

    #[tokio::test]
    async fn test_unavailable_service_is_no_claim() {
        let plugin = UrlReputationPlugin::new(
            vec![
                Arc::new(DownService),
                Arc::new(LocalBlocklist::new(vec!["evil.example".into()])),
            ],
            20,
        );
        let claims = plugin
            .gather(&context("https://example.com/a https://evil.example/b"))
            .await
            .unwrap();
        assert_eq!(claims.len(), 1);
        assert!(claims[0].evidence.as_deref().unwrap().starts_with("local-blocklist"));

        let only_down = UrlReputationPlugin::new(vec![Arc::new(DownService)], 20);
        assert!(only_down
            .gather(&context("https://evil.example/b"))
            .await
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_safe_browsing_wire_format() {
        let urls = vec!["http://malware.testing.google.test/testing/malware/".to_string()];
        let body = serde_json::to_value(SafeBrowsingService::request_body(&urls)).unwrap();
        assert_eq!(body["client"]["clientId"], "foff-trust");
        assert_eq!(body["threatInfo"]["threatEntries"][0]["url"], urls[0]);
        assert_eq!(body["threatInfo"]["platformTypes"][0], "ANY_PLATFORM");

        let response: LookupResponse = serde_json::from_value(serde_json::json!({
            "matches": [{
                "threatType": "MALWARE",
                "platformType": "ANY_PLATFORM",
                "threat": {"url": urls[0]},
                "cacheDuration": "300s"
            }]
        }))
        .unwrap();
        let flagged = SafeBrowsingService::parse_matches(response);
        assert_eq!(flagged[&urls[0]], "Safe Browsing: MALWARE");

        let empty: LookupResponse = serde_json::from_str("{}").unwrap();
        assert!(SafeBrowsingService::parse_matches(empty).is_empty());
    }
}
