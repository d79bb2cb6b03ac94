use crate::config::ProviderConfig;
use crate::domain_utils::DomainUtils;
use crate::error::{TrustError, TrustResult};
use crate::plugins::external_identity::IdentityProvider;
use crate::store::ReportStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Requested,
    Pending,
    Verified,
    Failed,
    Expired,
}

impl VerificationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed | Self::Expired)
    }

    /// The transition table. Terminal states have no outgoing edges.
    pub fn can_transition(&self, to: VerificationState) -> bool {
        use VerificationState::*;
        matches!(
            (self, to),
            (Requested, Pending)
                | (Requested, Failed)
                | (Requested, Expired)
                | (Pending, Verified)
                | (Pending, Failed)
                | (Pending, Expired)
        )
    }
}

impl fmt::Display for VerificationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub id: String,
    pub report_id: String,
    pub provider: String,
    pub target_email: String,
    state: VerificationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VerificationRequest {
    pub fn new(report_id: &str, provider: &str, target_email: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            report_id: report_id.to_string(),
            provider: provider.to_string(),
            target_email: target_email.to_string(),
            state: VerificationState::Requested,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> VerificationState {
        self.state
    }

    pub fn transition(&mut self, to: VerificationState) -> TrustResult<()> {
        if !self.state.can_transition(to) {
            return Err(TrustError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to,
            });
        }
        log::debug!("Verification request {}: {} -> {to}", self.id, self.state);
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub enabled: bool,
    /// whether the `external-identity` verifier is enabled in the registry
    pub plugin_enabled: bool,
    /// enabled in config, a client could be built for it and the verifier is on
    pub available: bool,
}

/// Out-of-band identity confirmation, decoupled from scoring.
///
/// All state changes go through [`VerificationRequest::transition`] and are
/// serialized by one lock, so a dispatch result, a provider callback and the
/// expiry sweep can never race each other into two terminal states.
#[derive(Clone)]
pub struct VerificationWorkflow {
    store: Arc<dyn ReportStore>,
    configured: Arc<BTreeMap<String, ProviderConfig>>,
    clients: Arc<HashMap<String, Arc<dyn IdentityProvider>>>,
    ttl: chrono::Duration,
    transitions: Arc<Mutex<()>>,
}

impl VerificationWorkflow {
    pub fn new(
        store: Arc<dyn ReportStore>,
        configured: BTreeMap<String, ProviderConfig>,
        clients: HashMap<String, Arc<dyn IdentityProvider>>,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            store,
            configured: Arc::new(configured),
            clients: Arc::new(clients),
            ttl,
            transitions: Arc::new(Mutex::new(())),
        }
    }

    /// Status of every configured provider, given whether the identity
    /// verifier is currently enabled in the plugin registry
    pub fn providers(&self, plugin_enabled: bool) -> Vec<ProviderStatus> {
        self.configured
            .iter()
            .map(|(name, config)| ProviderStatus {
                name: name.clone(),
                enabled: config.enabled,
                plugin_enabled,
                available: plugin_enabled && self.client(name).is_some(),
            })
            .collect()
    }

    fn client(&self, provider: &str) -> Option<Arc<dyn IdentityProvider>> {
        self.configured
            .get(provider)
            .filter(|config| config.enabled)
            .and_then(|_| self.clients.get(provider).cloned())
    }

    /// Store a new `requested` request and dispatch it in the background.
    ///
    /// The returned handle resolves once the dispatch outcome has been
    /// recorded; callers are free to drop it.
    pub async fn create(
        &self,
        report_id: &str,
        provider: &str,
        target_email: &str,
    ) -> TrustResult<(VerificationRequest, JoinHandle<()>)> {
        let client = self
            .client(provider)
            .ok_or_else(|| TrustError::ProviderUnavailable {
                provider: provider.to_string(),
            })?;
        let target_email = target_email.trim().to_lowercase();
        if DomainUtils::extract_domain(&target_email).is_none() {
            return Err(TrustError::invalid_context(format!(
                "target email is malformed: {target_email}"
            )));
        }

        let request = {
            let _guard = self.transitions.lock().await;
            if self
                .store
                .get_report(report_id)
                .await
                .map_err(TrustError::Store)?
                .is_none()
            {
                return Err(TrustError::not_found(format!("report {report_id}")));
            }

            let outstanding = self
                .store
                .list_requests()
                .await
                .map_err(TrustError::Store)?
                .into_iter()
                .any(|r| r.report_id == report_id && r.provider == provider && !r.state.is_terminal());
            if outstanding {
                return Err(TrustError::DuplicateRequest {
                    report_id: report_id.to_string(),
                    provider: provider.to_string(),
                });
            }

            let request = VerificationRequest::new(report_id, provider, &target_email);
            self.store
                .save_request(&request)
                .await
                .map_err(TrustError::Store)?;
            request
        };
        log::info!(
            "Created verification request {} via {provider} for report {report_id}",
            request.id
        );

        let workflow = self.clone();
        let dispatched = request.clone();
        let handle = tokio::spawn(async move {
            workflow.dispatch(client, dispatched).await;
        });
        Ok((request, handle))
    }

    async fn dispatch(&self, client: Arc<dyn IdentityProvider>, request: VerificationRequest) {
        let next = match client.request_verification(&request).await {
            Ok(()) => VerificationState::Pending,
            Err(e) => {
                log::warn!("Dispatch of verification request {} failed: {e:#}", request.id);
                VerificationState::Failed
            }
        };
        if let Err(e) = self.apply(&request.id, next).await {
            log::warn!("Could not record dispatch outcome for {}: {e}", request.id);
        }
    }

    async fn apply(&self, request_id: &str, to: VerificationState) -> TrustResult<VerificationRequest> {
        let _guard = self.transitions.lock().await;
        let mut request = self.get(request_id).await?;
        request.transition(to)?;
        self.store
            .save_request(&request)
            .await
            .map_err(TrustError::Store)?;
        Ok(request)
    }

    pub async fn get(&self, request_id: &str) -> TrustResult<VerificationRequest> {
        self.store
            .get_request(request_id)
            .await
            .map_err(TrustError::Store)?
            .ok_or_else(|| TrustError::not_found(format!("verification request {request_id}")))
    }

    /// Provider callback with the final verdict
    pub async fn complete(&self, request_id: &str, verified: bool) -> TrustResult<VerificationRequest> {
        let to = if verified {
            VerificationState::Verified
        } else {
            VerificationState::Failed
        };
        let request = self.apply(request_id, to).await?;
        log::info!("Verification request {request_id} completed: {to}");
        Ok(request)
    }

    /// Move every non-terminal request older than the TTL to `expired`
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> TrustResult<usize> {
        let _guard = self.transitions.lock().await;
        let mut expired = 0;
        for mut request in self.store.list_requests().await.map_err(TrustError::Store)? {
            if request.state.is_terminal() || now - request.created_at < self.ttl {
                continue;
            }
            request.transition(VerificationState::Expired)?;
            self.store
                .save_request(&request)
                .await
                .map_err(TrustError::Store)?;
            expired += 1;
        }
        if expired > 0 {
            log::info!("Expired {expired} stale verification request(s)");
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::TrustReport;
    use crate::plugins::external_identity::StaticIdentityProvider;
    use crate::store::InMemoryReportStore;
    use VerificationState::*;

    const ALL: [VerificationState; 5] = [Requested, Pending, Verified, Failed, Expired];

    async fn workflow() -> VerificationWorkflow {
        let store = Arc::new(InMemoryReportStore::new());
        store
            .save_report(&TrustReport::new(
                "r1".into(),
                "t1".into(),
                "m1".into(),
                65,
                Vec::new(),
                "2024.1".into(),
                Utc::now(),
            ))
            .await
            .unwrap();

        let enabled = ProviderConfig {
            enabled: true,
            credentials_ref: None,
            endpoint: None,
        };
        let mut configured = BTreeMap::new();
        configured.insert("linkedin".to_string(), enabled.clone());
        configured.insert("flaky".to_string(), enabled.clone());
        configured.insert(
            "off".to_string(),
            ProviderConfig {
                enabled: false,
                ..enabled
            },
        );

        let mut clients: HashMap<String, Arc<dyn IdentityProvider>> = HashMap::new();
        clients.insert("linkedin".into(), Arc::new(StaticIdentityProvider::new("linkedin")));
        clients.insert(
            "flaky".into(),
            Arc::new(StaticIdentityProvider::new("flaky").rejecting()),
        );
        clients.insert("off".into(), Arc::new(StaticIdentityProvider::new("off")));

        VerificationWorkflow::new(store, configured, clients, chrono::Duration::hours(24))
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL {
            for to in ALL {
                if from.is_terminal() {
                    assert!(!from.can_transition(to), "{from} -> {to}");
                }
            }
        }
        assert!(Requested.can_transition(Pending));
        assert!(Pending.can_transition(Verified));
        assert!(!Requested.can_transition(Requested));
        assert!(!Pending.can_transition(Requested));
    }

    #[test]
    fn test_transition_rejects_leaving_terminal() {
        let mut request = VerificationRequest::new("r1", "linkedin", "a@example.com");
        request.transition(Pending).unwrap();
        request.transition(Verified).unwrap();

        let err = request.transition(Failed).unwrap_err();
        assert!(matches!(
            err,
            TrustError::InvalidTransition {
                from: Verified,
                to: Failed,
                ..
            }
        ));
        assert_eq!(request.state(), Verified);
    }

    #[tokio::test]
    async fn test_successful_dispatch_then_callback() {
        let wf = workflow().await;
        let (request, handle) = wf.create("r1", "linkedin", "Host@Example.com").await.unwrap();
        assert_eq!(request.state(), Requested);
        assert_eq!(request.target_email, "host@example.com");

        handle.await.unwrap();
        assert_eq!(wf.get(&request.id).await.unwrap().state(), Pending);

        let done = wf.complete(&request.id, true).await.unwrap();
        assert_eq!(done.state(), Verified);

        // a late callback cannot flip the verdict
        assert!(matches!(
            wf.complete(&request.id, false).await,
            Err(TrustError::InvalidTransition { .. })
        ));
        assert!(wf.expire_stale(Utc::now() + chrono::Duration::days(30)).await.unwrap() == 0);
        assert_eq!(wf.get(&request.id).await.unwrap().state(), Verified);
    }

    #[tokio::test]
    async fn test_rejected_dispatch_is_failed_not_raised() {
        let wf = workflow().await;
        let (request, handle) = wf.create("r1", "flaky", "a@example.com").await.unwrap();
        handle.await.unwrap();
        assert_eq!(wf.get(&request.id).await.unwrap().state(), Failed);
    }

    #[tokio::test]
    async fn test_create_validation() {
        let wf = workflow().await;
        assert!(matches!(
            wf.create("nope", "linkedin", "a@example.com").await,
            Err(TrustError::NotFound { .. })
        ));
        assert!(matches!(
            wf.create("r1", "off", "a@example.com").await,
            Err(TrustError::ProviderUnavailable { .. })
        ));
        assert!(matches!(
            wf.create("r1", "unknown", "a@example.com").await,
            Err(TrustError::ProviderUnavailable { .. })
        ));
        assert!(matches!(
            wf.create("r1", "linkedin", "not-an-email").await,
            Err(TrustError::InvalidContext { .. })
        ));
    }

    #[tokio::test]
    async fn test_one_outstanding_request_per_provider() {
        let wf = workflow().await;
        let (first, handle) = wf.create("r1", "linkedin", "a@example.com").await.unwrap();
        handle.await.unwrap();

        assert!(matches!(
            wf.create("r1", "linkedin", "a@example.com").await,
            Err(TrustError::DuplicateRequest { .. })
        ));
        // another provider on the same report is fine
        let (_, h) = wf.create("r1", "flaky", "a@example.com").await.unwrap();
        h.await.unwrap();

        // once the first is terminal a new one may be opened
        wf.complete(&first.id, false).await.unwrap();
        assert!(wf.create("r1", "linkedin", "a@example.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_expiry_sweep() {
        let wf = workflow().await;
        let (request, handle) = wf.create("r1", "linkedin", "a@example.com").await.unwrap();
        handle.await.unwrap();

        assert_eq!(wf.expire_stale(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::hours(25);
        assert_eq!(wf.expire_stale(later).await.unwrap(), 1);
        assert_eq!(wf.get(&request.id).await.unwrap().state(), Expired);

        assert!(matches!(
            wf.complete(&request.id, true).await,
            Err(TrustError::InvalidTransition { from: Expired, .. })
        ));
    }

    #[tokio::test]
    async fn test_providers_status() {
        let wf = workflow().await;
        let statuses = wf.providers(true);
        let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["flaky", "linkedin", "off"]);
        assert!(statuses[1].available);
        assert!(!statuses[2].enabled);
        assert!(!statuses[2].available);

        let statuses = wf.providers(false);
        assert!(statuses[1].enabled);
        assert!(!statuses[1].plugin_enabled);
        assert!(statuses.iter().all(|s| !s.available));
    }
}
