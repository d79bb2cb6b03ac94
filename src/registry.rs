use crate::config::{Config, Credentials};
use crate::error::{TrustError, TrustResult};
use crate::plugins::dns_records::{DnsLookup, HickoryDns, StaticDns};
use crate::plugins::domain_whois::DomainAgeChecker;
use crate::plugins::external_identity::{HttpIdentityProvider, IdentityProvider, StaticIdentityProvider};
use crate::plugins::url_reputation::{LocalBlocklist, ReputationService, SafeBrowsingService};
use crate::plugins::{
    ContentHeuristicsPlugin, DnsRecordsPlugin, DomainWhoisPlugin, EmailAuthPlugin,
    ExternalIdentityPlugin, UrlReputationPlugin, VerifierPlugin,
};
use anyhow::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

#[derive(Clone)]
struct RegisteredPlugin {
    plugin: Arc<dyn VerifierPlugin>,
    enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub description: String,
    pub enabled: bool,
}

/// The set of known verifiers, keyed by name.
///
/// Writers replace the whole map; readers clone the `Arc` and work from
/// that snapshot, so toggling a plugin never disturbs a dispatch already
/// in flight.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<Arc<BTreeMap<String, RegisteredPlugin>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<BTreeMap<String, RegisteredPlugin>> {
        self.plugins
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, RegisteredPlugin>) -> TrustResult<T>,
    ) -> TrustResult<T> {
        let mut guard = self
            .plugins
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = (**guard).clone();
        let result = f(&mut next)?;
        *guard = Arc::new(next);
        Ok(result)
    }

    pub fn register(&self, plugin: Arc<dyn VerifierPlugin>) -> TrustResult<()> {
        self.register_with_state(plugin, true)
    }

    pub fn register_with_state(&self, plugin: Arc<dyn VerifierPlugin>, enabled: bool) -> TrustResult<()> {
        let name = plugin.name().to_string();
        self.update(|plugins| {
            if plugins.contains_key(&name) {
                return Err(TrustError::DuplicateName { name: name.clone() });
            }
            plugins.insert(name.clone(), RegisteredPlugin { plugin, enabled });
            Ok(())
        })?;
        log::debug!("Registered plugin {name} (enabled: {enabled})");
        Ok(())
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> TrustResult<()> {
        self.update(|plugins| match plugins.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                Ok(())
            }
            None => Err(TrustError::not_found(format!("plugin {name}"))),
        })?;
        log::info!("Plugin {name} {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn enable(&self, name: &str) -> TrustResult<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> TrustResult<()> {
        self.set_enabled(name, false)
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.snapshot()
            .values()
            .map(|entry| PluginInfo {
                name: entry.plugin.name().to_string(),
                description: entry.plugin.description().to_string(),
                enabled: entry.enabled,
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> TrustResult<Arc<dyn VerifierPlugin>> {
        self.snapshot()
            .get(name)
            .map(|entry| entry.plugin.clone())
            .ok_or_else(|| TrustError::not_found(format!("plugin {name}")))
    }

    /// Enabled plugins in name order, as of this instant
    pub fn enabled_plugins(&self) -> Vec<Arc<dyn VerifierPlugin>> {
        self.snapshot()
            .values()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.plugin.clone())
            .collect()
    }

    /// Build every verifier from configuration. Network-backed plugins use
    /// their mock tables when `use_mock_data` is set.
    pub fn from_config(
        config: &Config,
        credentials: &Credentials,
        identity_providers: &BTreeMap<String, Arc<dyn IdentityProvider>>,
    ) -> Result<Self> {
        let registry = Self::new();
        let http_timeout = Duration::from_secs(config.timeouts.http_timeout_secs);
        let whois_timeout = Duration::from_secs(config.timeouts.whois_timeout_secs);

        let dns: Arc<dyn DnsLookup> = if config.use_mock_data {
            Arc::new(StaticDns::mock())
        } else {
            Arc::new(HickoryDns::from_system_conf(Duration::from_millis(
                config.timeouts.dns_timeout_ms,
            ))?)
        };

        let checker = if config.use_mock_data {
            DomainAgeChecker::with_mock_ages(whois_timeout, DomainAgeChecker::default_mock_ages())
        } else {
            DomainAgeChecker::new(whois_timeout)
        };

        let mut services: Vec<Arc<dyn ReputationService>> = vec![Arc::new(LocalBlocklist::new(
            config.url_reputation.blocklist.clone(),
        ))];
        if let Some(key_ref) = &config.url_reputation.safe_browsing_key_ref {
            match credentials.get(key_ref) {
                Some(key) => services.push(Arc::new(SafeBrowsingService::new(
                    config.url_reputation.safe_browsing_endpoint.clone(),
                    key.to_string(),
                    http_timeout,
                )?)),
                None => log::warn!("Safe Browsing key {key_ref} not set, using local blocklist only"),
            }
        }

        let plugins: Vec<Arc<dyn VerifierPlugin>> = vec![
            Arc::new(EmailAuthPlugin::new()),
            Arc::new(DnsRecordsPlugin::new(dns)),
            Arc::new(DomainWhoisPlugin::new(
                checker,
                config.domain_whois.max_age_days,
                config.domain_whois.trusted_domains.clone(),
            )),
            Arc::new(ContentHeuristicsPlugin::new()?),
            Arc::new(UrlReputationPlugin::new(services, config.url_reputation.max_urls)),
            Arc::new(ExternalIdentityPlugin::new(
                identity_providers.values().cloned().collect(),
            )),
        ];

        for plugin in plugins {
            let enabled = config.plugin_enabled(plugin.name());
            registry.register_with_state(plugin, enabled)?;
        }
        Ok(registry)
    }
}

/// Clients for every enabled provider that can actually be reached.
/// A provider whose credentials cannot be resolved is skipped with a warning.
pub fn identity_providers(
    config: &Config,
    credentials: &Credentials,
) -> BTreeMap<String, Arc<dyn IdentityProvider>> {
    let timeout = Duration::from_secs(config.timeouts.http_timeout_secs);
    let mut clients: BTreeMap<String, Arc<dyn IdentityProvider>> = BTreeMap::new();

    for (name, provider) in config.providers.iter().filter(|(_, p)| p.enabled) {
        if config.use_mock_data {
            clients.insert(name.clone(), Arc::new(StaticIdentityProvider::new(name)));
            continue;
        }
        match HttpIdentityProvider::from_config(name, provider, credentials, timeout) {
            Ok(client) => {
                clients.insert(name.clone(), Arc::new(client));
            }
            Err(e) => log::warn!("Identity provider {name} unavailable: {e:#}"),
        }
    }
    clients
}

/// Same clients keyed for the verification workflow
pub fn identity_provider_map(
    providers: &BTreeMap<String, Arc<dyn IdentityProvider>>,
) -> HashMap<String, Arc<dyn IdentityProvider>> {
    providers
        .iter()
        .map(|(name, client)| (name.clone(), client.clone()))
        .collect()
}
