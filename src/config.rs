use crate::plugins::{content_heuristics, dns_records, domain_whois, email_auth, external_identity, url_reputation};
use crate::scoring::{DeductionTable, DEFAULT_RULESET_VERSION};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Enablement and credentials reference for one identity provider.
/// `credentials_ref` names the secret holding the bearer token; the value
/// itself is looked up in [`Credentials`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub enabled: bool,
    #[serde(default)]
    pub credentials_ref: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Secrets resolved by the caller before the engine is built, keyed by the
/// reference names that appear in config.
#[derive(Clone, Default)]
pub struct Credentials {
    values: BTreeMap<String, String>,
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: impl Into<String>, secret: impl Into<String>) {
        self.values.insert(reference.into(), secret.into());
    }

    pub fn get(&self, reference: &str) -> Option<&str> {
        self.values.get(reference).map(String::as_str)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesetConfig {
    pub version: String,
    /// YAML deduction table; the built-in table is used when unset
    pub file: Option<String>,
}

impl Default for RulesetConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_RULESET_VERSION.to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub plugin_timeout_ms: u64,
    pub overall_deadline_ms: u64,
    pub dns_timeout_ms: u64,
    pub whois_timeout_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            plugin_timeout_ms: 5_000,
            overall_deadline_ms: 8_000,
            dns_timeout_ms: 3_000,
            whois_timeout_secs: 5,
            http_timeout_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout_ms)
    }

    pub fn overall_deadline(&self) -> Duration {
        Duration::from_millis(self.overall_deadline_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainWhoisConfig {
    pub max_age_days: i64,
    pub trusted_domains: Vec<String>,
}

impl Default for DomainWhoisConfig {
    fn default() -> Self {
        Self {
            max_age_days: domain_whois::DEFAULT_MAX_AGE_DAYS,
            trusted_domains: [
                "paypal.com",
                "google.com",
                "microsoft.com",
                "apple.com",
                "amazon.com",
                "linkedin.com",
            ]
            .iter()
            .map(|d| d.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlReputationConfig {
    pub blocklist: Vec<String>,
    /// Environment variable holding a Safe Browsing API key
    pub safe_browsing_key_ref: Option<String>,
    pub safe_browsing_endpoint: Option<String>,
    pub max_urls: usize,
}

impl Default for UrlReputationConfig {
    fn default() -> Self {
        Self {
            blocklist: Vec::new(),
            safe_browsing_key_ref: None,
            safe_browsing_endpoint: None,
            max_urls: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    /// Directory of `<message_id>.eml` files served to the generator
    pub messages_dir: String,
    pub verification_ttl_hours: i64,
    pub sweep_interval_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            messages_dir: "/var/lib/foff-trust/messages".to_string(),
            verification_ttl_hours: 72,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-plugin enable flags; plugins not listed use their default
    pub plugins: BTreeMap<String, bool>,
    pub ruleset: RulesetConfig,
    pub timeouts: TimeoutConfig,
    pub domain_whois: DomainWhoisConfig,
    pub url_reputation: UrlReputationConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub api: ApiConfig,
    /// Serve DNS, WHOIS and identity answers from built-in tables
    pub use_mock_data: bool,
}

impl Default for Config {
    fn default() -> Self {
        let plugins = [
            (email_auth::NAME, true),
            (dns_records::NAME, true),
            (domain_whois::NAME, true),
            (content_heuristics::NAME, true),
            (url_reputation::NAME, true),
            // opt-in: needs an authorized provider
            (external_identity::NAME, false),
        ]
        .into_iter()
        .map(|(name, enabled)| (name.to_string(), enabled))
        .collect();

        Config {
            plugins,
            ruleset: RulesetConfig::default(),
            timeouts: TimeoutConfig::default(),
            domain_whois: DomainWhoisConfig::default(),
            url_reputation: UrlReputationConfig::default(),
            providers: BTreeMap::new(),
            api: ApiConfig::default(),
            use_mock_data: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn plugin_enabled(&self, name: &str) -> bool {
        self.plugins
            .get(name)
            .copied()
            .unwrap_or(name != external_identity::NAME)
    }

    /// The deduction table named by `ruleset`. A file must carry the
    /// configured version so reports never claim a ruleset they did not use.
    pub fn deduction_table(&self) -> Result<DeductionTable> {
        let table = match &self.ruleset.file {
            Some(path) => DeductionTable::from_file(path)?,
            None if self.ruleset.version == DEFAULT_RULESET_VERSION => DeductionTable::default(),
            None => {
                return Err(anyhow!(
                    "ruleset {} is not built in and no ruleset file is configured",
                    self.ruleset.version
                ))
            }
        };
        if table.version != self.ruleset.version {
            return Err(anyhow!(
                "ruleset file has version {} but {} is configured",
                table.version,
                self.ruleset.version
            ));
        }
        Ok(table)
    }

    /// Every secret reference this config names, in a stable order
    pub fn credential_refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self
            .providers
            .values()
            .filter(|p| p.enabled)
            .filter_map(|p| p.credentials_ref.as_deref())
            .chain(self.url_reputation.safe_browsing_key_ref.as_deref())
            .collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }

    pub fn validate(&self) -> Result<()> {
        let known = [
            email_auth::NAME,
            dns_records::NAME,
            domain_whois::NAME,
            content_heuristics::NAME,
            url_reputation::NAME,
            external_identity::NAME,
        ];
        if let Some(unknown) = self.plugins.keys().find(|k| !known.contains(&k.as_str())) {
            return Err(anyhow!("unknown plugin in config: {unknown}"));
        }
        if self.timeouts.plugin_timeout_ms == 0 || self.timeouts.overall_deadline_ms == 0 {
            return Err(anyhow!("timeouts must be greater than zero"));
        }
        if self.api.verification_ttl_hours <= 0 {
            return Err(anyhow!("verification_ttl_hours must be positive"));
        }
        for (name, provider) in &self.providers {
            if provider.enabled && !self.use_mock_data && provider.endpoint.is_none() {
                return Err(anyhow!("provider {name} is enabled but has no endpoint"));
            }
        }
        self.deduction_table()?;
        Ok(())
    }
}
