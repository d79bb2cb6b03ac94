use crate::claims::{TrustClaim, TrustReport};
use crate::context::VerificationContext;
use crate::error::{TrustError, TrustResult};
use crate::registry::PluginRegistry;
use crate::scoring::{score_claims, DeductionTable};
use crate::store::ReportStore;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;

type SharedOutcome = Option<Result<TrustReport, String>>;

enum Role {
    Leader(watch::Sender<SharedOutcome>),
    Follower(watch::Receiver<SharedOutcome>),
}

/// Removes the thread's in-flight entry however the leader exits,
/// including cancellation
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashMap<String, watch::Receiver<SharedOutcome>>>,
    thread_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.thread_id);
    }
}

/// Fans a context out to every enabled plugin, scores what comes back and
/// persists the resulting report.
pub struct ReportGenerator {
    registry: Arc<PluginRegistry>,
    table: Arc<DeductionTable>,
    store: Arc<dyn ReportStore>,
    plugin_timeout: Duration,
    overall_deadline: Duration,
    in_flight: Mutex<HashMap<String, watch::Receiver<SharedOutcome>>>,
}

impl ReportGenerator {
    pub fn new(
        registry: Arc<PluginRegistry>,
        table: DeductionTable,
        store: Arc<dyn ReportStore>,
        plugin_timeout: Duration,
        overall_deadline: Duration,
    ) -> Self {
        Self {
            registry,
            table: Arc::new(table),
            store,
            plugin_timeout,
            overall_deadline,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn ruleset_version(&self) -> &str {
        &self.table.version
    }

    /// Generate and persist a report for `context`.
    ///
    /// At most one generation runs per thread id. Callers that arrive while
    /// one is running wait for it and receive the same report; if that run
    /// fails they get [`TrustError::Generation`].
    pub async fn generate(&self, context: VerificationContext) -> TrustResult<TrustReport> {
        let thread_id = context.thread_id().to_string();

        let role = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match in_flight.get(&thread_id) {
                Some(rx) => Role::Follower(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    in_flight.insert(thread_id.clone(), rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                log::debug!("Joining in-flight report generation for thread {thread_id}");
                let shared = rx.wait_for(Option::is_some).await.map(|v| v.clone());
                match shared {
                    Ok(Some(Ok(report))) => Ok(report),
                    Ok(Some(Err(message))) => Err(TrustError::Generation { thread_id, message }),
                    Ok(None) | Err(_) => Err(TrustError::Generation {
                        thread_id,
                        message: "generation was abandoned".to_string(),
                    }),
                }
            }
            Role::Leader(tx) => {
                let _guard = InFlightGuard {
                    in_flight: &self.in_flight,
                    thread_id,
                };
                let result = self.run(context).await;
                tx.send_replace(Some(match &result {
                    Ok(report) => Ok(report.clone()),
                    Err(e) => Err(e.to_string()),
                }));
                result
            }
        }
    }

    async fn run(&self, context: VerificationContext) -> TrustResult<TrustReport> {
        let claims = self.gather(Arc::new(context.clone())).await;
        let outcome = score_claims(&claims, &self.table);

        let report = TrustReport::new(
            uuid::Uuid::new_v4().to_string(),
            context.thread_id().to_string(),
            context.message_id().to_string(),
            outcome.score,
            outcome.findings,
            self.table.version.clone(),
            Utc::now(),
        );
        self.store
            .save_report(&report)
            .await
            .map_err(TrustError::Store)?;

        log::info!(
            "Report {} for thread {}: score {} ({}), {} finding(s)",
            report.report_id,
            report.thread_id,
            report.score(),
            report.risk_level(),
            report.findings.len()
        );
        Ok(report)
    }

    /// Run every enabled plugin concurrently. Claims come back in registry
    /// order regardless of completion order so scoring stays deterministic.
    async fn gather(&self, context: Arc<VerificationContext>) -> Vec<TrustClaim> {
        let plugins = self.registry.enabled_plugins();
        let deadline = Instant::now() + self.overall_deadline;
        let mut set = JoinSet::new();

        for (index, plugin) in plugins.iter().enumerate() {
            let plugin = plugin.clone();
            let context = context.clone();
            let timeout = self.plugin_timeout;
            set.spawn(async move {
                match tokio::time::timeout(timeout, plugin.gather_signals(&context)).await {
                    Ok(claims) => (index, claims),
                    Err(_) => {
                        log::warn!("Plugin {} timed out after {timeout:?}", plugin.name());
                        (index, Vec::new())
                    }
                }
            });
        }

        let mut results: Vec<Vec<TrustClaim>> = plugins.iter().map(|_| Vec::new()).collect();
        let mut outstanding: BTreeSet<usize> = (0..plugins.len()).collect();
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((index, claims)))) => {
                    outstanding.remove(&index);
                    results[index] = claims;
                }
                Ok(Some(Err(e))) if e.is_panic() => log::warn!("Plugin task panicked: {e}"),
                Ok(Some(Err(e))) => log::warn!("Plugin task failed: {e}"),
                Ok(None) => break,
                Err(_) => {
                    set.abort_all();
                    break;
                }
            }
        }
        if !outstanding.is_empty() {
            let names: Vec<&str> = outstanding.iter().map(|&i| plugins[i].name()).collect();
            log::warn!(
                "No result from plugin(s) {} for message {}",
                names.join(", "),
                context.message_id()
            );
        }

        plugins
            .iter()
            .zip(results)
            .flat_map(|(plugin, claims)| {
                let name = plugin.name().to_string();
                claims.into_iter().filter_map(move |mut claim| {
                    if claim.confidence.is_nan() {
                        log::debug!("Dropping {} claim from {name}: confidence is NaN", claim.claim_type);
                        return None;
                    }
                    claim.provider = name.clone();
                    claim.confidence = claim.confidence.clamp(0.0, 1.0);
                    Some(claim)
                })
            })
            .collect()
    }
}
