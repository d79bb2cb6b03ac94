use crate::claims::{ClaimType, TrustClaim};
use crate::config::{Credentials, ProviderConfig};
use crate::context::VerificationContext;
use crate::plugins::VerifierPlugin;
use crate::verification::VerificationRequest;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const NAME: &str = "external-identity";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityMatch {
    pub verified: bool,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub profile_url: Option<String>,
}

/// An identity provider the user has authorized us to query.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` when the provider knows nothing about `email`
    async fn lookup(&self, email: &str) -> Result<Option<IdentityMatch>>;

    /// Ask the provider to confirm `request.target_email` out of band. The
    /// outcome arrives later through the callback route.
    async fn request_verification(&self, request: &VerificationRequest) -> Result<()>;
}

#[derive(Serialize)]
struct DispatchBody<'a> {
    request_id: &'a str,
    report_id: &'a str,
    target_email: &'a str,
}

/// Provider reached over HTTPS with a bearer token.
///
/// The token is looked up in the resolved [`Credentials`] under the
/// provider's `credentials_ref`; the token itself never sits in config.
pub struct HttpIdentityProvider {
    name: String,
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpIdentityProvider {
    pub fn new(name: &str, endpoint: &str, token: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("foff-trust/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            name: name.to_string(),
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(
        name: &str,
        config: &ProviderConfig,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| anyhow!("provider {name} has no endpoint"))?;
        let credentials_ref = config
            .credentials_ref
            .as_deref()
            .ok_or_else(|| anyhow!("provider {name} has no credentials_ref"))?;
        let token = credentials
            .get(credentials_ref)
            .ok_or_else(|| anyhow!("credentials {credentials_ref} for provider {name} not set"))?;
        Self::new(name, endpoint, token.to_string(), timeout)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, email: &str) -> Result<Option<IdentityMatch>> {
        let response = self
            .client
            .get(format!("{}/identities", self.endpoint))
            .bearer_auth(&self.token)
            .query(&[("email", email)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(anyhow!("{} identity lookup returned HTTP {status}", self.name)),
        }
    }

    async fn request_verification(&self, request: &VerificationRequest) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/verifications", self.endpoint))
            .bearer_auth(&self.token)
            .json(&DispatchBody {
                request_id: &request.id,
                report_id: &request.report_id,
                target_email: &request.target_email,
            })
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(anyhow!(
                "{} rejected verification request {}: HTTP {}",
                self.name,
                request.id,
                response.status()
            ))
        }
    }
}

/// Provider backed by a fixed table, used in mock mode and tests
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    name: String,
    identities: HashMap<String, IdentityMatch>,
    reject_dispatch: bool,
}

impl StaticIdentityProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_identity(mut self, email: &str, display_name: &str) -> Self {
        self.identities.insert(
            email.to_lowercase(),
            IdentityMatch {
                verified: true,
                display_name: Some(display_name.to_string()),
                profile_url: None,
            },
        );
        self
    }

    pub fn rejecting(mut self) -> Self {
        self.reject_dispatch = true;
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, email: &str) -> Result<Option<IdentityMatch>> {
        Ok(self.identities.get(&email.to_lowercase()).cloned())
    }

    async fn request_verification(&self, request: &VerificationRequest) -> Result<()> {
        if self.reject_dispatch {
            return Err(anyhow!("{} refused request {}", self.name, request.id));
        }
        Ok(())
    }
}

/// Positive signal: the sender is a verified identity at one of the
/// authorized providers
pub struct ExternalIdentityPlugin {
    providers: Vec<Arc<dyn IdentityProvider>>,
}

impl ExternalIdentityPlugin {
    pub fn new(providers: Vec<Arc<dyn IdentityProvider>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl VerifierPlugin for ExternalIdentityPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Sender identity confirmed by an authorized external provider"
    }

    async fn gather(&self, context: &VerificationContext) -> Result<Vec<TrustClaim>> {
        let sender = context.sender_address();
        let mut claims = Vec::new();

        for provider in &self.providers {
            match provider.lookup(sender).await {
                Ok(Some(found)) if found.verified => {
                    let who = found.display_name.as_deref().unwrap_or(sender);
                    claims.push(
                        TrustClaim::new(NAME, ClaimType::IdentityVerified, sender, 1.0)
                            .with_evidence(format!("Verified by {} as {who}", provider.name())),
                    );
                }
                Ok(_) => log::debug!("{} has no verified identity for {sender}", provider.name()),
                Err(e) => log::warn!("Identity lookup via {} failed: {e:#}", provider.name()),
            }
        }

        Ok(claims)
    }
}
