use crate::claims::TrustReport;
use crate::config::ApiConfig;
use crate::context::VerificationContext;
use crate::error::{TrustError, TrustResult};
use crate::plugins::external_identity;
use crate::registry::PluginRegistry;
use crate::report::ReportGenerator;
use crate::store::ReportStore;
use crate::verification::{ProviderStatus, VerificationRequest, VerificationState, VerificationWorkflow};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

// --- Message ingestion ---

/// Resolves a message reference to the facts the verifiers inspect
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn load(&self, message_id: &str, thread_id: &str) -> TrustResult<VerificationContext>;
}

/// Reads `<dir>/<message_id>.eml`
pub struct EmlDirectorySource {
    dir: PathBuf,
}

impl EmlDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl MessageSource for EmlDirectorySource {
    async fn load(&self, message_id: &str, thread_id: &str) -> TrustResult<VerificationContext> {
        if message_id.trim().is_empty()
            || message_id.contains(['/', '\\'])
            || message_id.starts_with('.')
        {
            return Err(TrustError::invalid_context(format!(
                "unusable message id: {message_id:?}"
            )));
        }

        let path = self.dir.join(format!("{message_id}.eml"));
        let raw = match tokio::fs::read(&path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrustError::not_found(format!("message {message_id}")))
            }
            Err(e) => {
                return Err(TrustError::Store(anyhow::anyhow!(
                    "failed to read {}: {e}",
                    path.display()
                )))
            }
        };
        VerificationContext::from_raw_email(message_id, thread_id, &raw)
    }
}

// --- Error Handling ---

pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(anyhow::Error),
}

impl From<TrustError> for AppError {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::NotFound { .. } => AppError::NotFound(err.to_string()),
            TrustError::InvalidContext { .. } | TrustError::ProviderUnavailable { .. } => {
                AppError::BadRequest(err.to_string())
            }
            TrustError::DuplicateName { .. }
            | TrustError::DuplicateRequest { .. }
            | TrustError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
            TrustError::Generation { .. } | TrustError::Store(_) => AppError::Internal(err.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            AppError::BadRequest(s) => (StatusCode::BAD_REQUEST, s),
            AppError::NotFound(s) => (StatusCode::NOT_FOUND, s),
            AppError::Conflict(s) => (StatusCode::CONFLICT, s),
            AppError::Internal(e) => {
                log::error!("Internal error: {e:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}

// --- Handlers ---

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<PluginRegistry>,
    pub generator: Arc<ReportGenerator>,
    pub store: Arc<dyn ReportStore>,
    pub workflow: VerificationWorkflow,
    pub messages: Arc<dyn MessageSource>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateReportRequest {
    pub message_id: String,
    pub thread_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateVerificationRequest {
    pub provider: String,
    pub target_email: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct VerificationCreated {
    pub id: String,
    pub state: VerificationState,
}

#[derive(Debug, Deserialize)]
pub struct VerificationCallback {
    pub verified: bool,
}

async fn latest_report_handler(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> Result<Json<TrustReport>, AppError> {
    let report = state
        .store
        .latest_report(&thread_id)
        .await
        .map_err(AppError::Internal)?
        .ok_or_else(|| AppError::NotFound(format!("no report for thread {thread_id}")))?;
    Ok(Json(report))
}

async fn generate_report_handler(
    State(state): State<AppState>,
    Json(payload): Json<GenerateReportRequest>,
) -> Result<(StatusCode, Json<TrustReport>), AppError> {
    let context = state
        .messages
        .load(&payload.message_id, &payload.thread_id)
        .await?;
    let report = state.generator.generate(context).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn create_verification_handler(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
    Json(payload): Json<CreateVerificationRequest>,
) -> Result<(StatusCode, Json<VerificationCreated>), AppError> {
    let (request, _dispatch) = state
        .workflow
        .create(&report_id, &payload.provider, &payload.target_email)
        .await?;
    let state = request.state();
    Ok((
        StatusCode::CREATED,
        Json(VerificationCreated {
            id: request.id,
            state,
        }),
    ))
}

async fn get_verification_handler(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> Result<Json<VerificationRequest>, AppError> {
    Ok(Json(state.workflow.get(&request_id).await?))
}

async fn verification_callback_handler(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(payload): Json<VerificationCallback>,
) -> Result<Json<VerificationRequest>, AppError> {
    Ok(Json(state.workflow.complete(&request_id, payload.verified).await?))
}

async fn providers_handler(State(state): State<AppState>) -> Json<Vec<ProviderStatus>> {
    let plugin_enabled = state
        .registry
        .list()
        .iter()
        .any(|plugin| plugin.name == external_identity::NAME && plugin.enabled);
    Json(state.workflow.providers(plugin_enabled))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/trust/reports", post(generate_report_handler))
        .route("/v1/trust/reports/:thread_id", get(latest_report_handler))
        .route(
            "/v1/trust/reports/:report_id/verification-requests",
            post(create_verification_handler),
        )
        .route("/v1/trust/providers", get(providers_handler))
        .route(
            "/v1/trust/verification-requests/:request_id",
            get(get_verification_handler),
        )
        .route(
            "/v1/trust/verification-requests/:request_id/callback",
            post(verification_callback_handler),
        )
        .with_state(state)
}

/// Periodically expire verification requests that outlived their TTL
async fn run_expiry_sweeper(
    workflow: VerificationWorkflow,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = workflow.expire_stale(Utc::now()).await {
                    log::warn!("Expiry sweep failed: {e}");
                }
            }
            _ = shutdown_rx.changed() => break,
        }
    }
    log::debug!("Expiry sweeper stopped");
}

pub async fn run_server(
    config: &ApiConfig,
    state: AppState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let sweeper = tokio::spawn(run_expiry_sweeper(
        state.workflow.clone(),
        Duration::from_secs(config.sweep_interval_secs.max(1)),
        shutdown_rx.clone(),
    ));

    let app = router(state);
    let addr: SocketAddr = config.bind_address.parse()?;
    log::info!("Trust API listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let graceful = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_rx.changed().await.ok();
        log::info!("Shutting down gracefully");
    });

    if let Err(e) = graceful.await {
        log::error!("Server error: {e}");
    }
    sweeper.await.ok();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::{ClaimType, RiskLevel};
    use crate::config::ProviderConfig;
    use crate::plugins::external_identity::{
        ExternalIdentityPlugin, IdentityProvider, StaticIdentityProvider,
    };
    use crate::plugins::test_support::StaticPlugin;
    use crate::registry::PluginRegistry;
    use crate::scoring::DeductionTable;
    use crate::store::InMemoryReportStore;
    use std::collections::{BTreeMap, HashMap};

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("foff-trust-api-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.0).ok();
        }
    }

    fn state(dir: &TempDir) -> AppState {
        let registry = PluginRegistry::new();
        registry
            .register(Arc::new(StaticPlugin::new(
                "static",
                vec![(ClaimType::MissingDmarc, 1.0)],
            )))
            .unwrap();
        let linkedin: Arc<dyn IdentityProvider> = Arc::new(StaticIdentityProvider::new("linkedin"));
        registry
            .register(Arc::new(ExternalIdentityPlugin::new(vec![linkedin.clone()])))
            .unwrap();
        let registry = Arc::new(registry);
        let store: Arc<dyn ReportStore> = Arc::new(InMemoryReportStore::new());
        let generator = ReportGenerator::new(
            registry.clone(),
            DeductionTable::default(),
            store.clone(),
            Duration::from_secs(2),
            Duration::from_secs(5),
        );

        let mut configured = BTreeMap::new();
        configured.insert(
            "linkedin".to_string(),
            ProviderConfig {
                enabled: true,
                credentials_ref: None,
                endpoint: None,
            },
        );
        let mut clients: HashMap<String, Arc<dyn IdentityProvider>> = HashMap::new();
        clients.insert("linkedin".into(), linkedin);
        let workflow =
            VerificationWorkflow::new(store.clone(), configured, clients, chrono::Duration::hours(1));

        AppState {
            registry,
            generator: Arc::new(generator),
            store,
            workflow,
            messages: Arc::new(EmlDirectorySource::new(&dir.0)),
        }
    }

    fn write_message(dir: &TempDir, id: &str) {
        std::fs::write(
            dir.0.join(format!("{id}.eml")),
            "From: Host <host@showrunner.example>\nSubject: Guest spot\n\nHi there\n",
        )
        .unwrap();
    }

    fn status_of<T: IntoResponse>(result: Result<T, AppError>) -> StatusCode {
        result.into_response().status()
    }

    #[tokio::test]
    async fn test_generate_then_fetch_latest() {
        let dir = TempDir::new();
        write_message(&dir, "msg-1");
        let state = state(&dir);

        let (status, Json(report)) = generate_report_handler(
            State(state.clone()),
            Json(GenerateReportRequest {
                message_id: "msg-1".into(),
                thread_id: "thread-1".into(),
            }),
        )
        .await
        .map_err(|e| e.into_response().status())
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(report.score(), 90);
        assert_eq!(report.risk_level(), RiskLevel::LikelyOk);

        let Json(latest) = latest_report_handler(State(state.clone()), Path("thread-1".into()))
            .await
            .map_err(|e| e.into_response().status())
            .unwrap();
        assert_eq!(latest.report_id, report.report_id);

        let json = serde_json::to_value(&latest).unwrap();
        assert_eq!(json["risk_level"], "likely_ok");
        assert_eq!(json["findings"][0]["claim"]["claim_type"], "missing_dmarc");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let dir = TempDir::new();
        let state = state(&dir);

        let missing_thread =
            latest_report_handler(State(state.clone()), Path("nope".into())).await;
        assert_eq!(status_of(missing_thread), StatusCode::NOT_FOUND);

        let missing_message = generate_report_handler(
            State(state.clone()),
            Json(GenerateReportRequest {
                message_id: "absent".into(),
                thread_id: "t".into(),
            }),
        )
        .await;
        assert_eq!(status_of(missing_message), StatusCode::NOT_FOUND);

        let traversal = generate_report_handler(
            State(state.clone()),
            Json(GenerateReportRequest {
                message_id: "../etc/passwd".into(),
                thread_id: "t".into(),
            }),
        )
        .await;
        assert_eq!(status_of(traversal), StatusCode::BAD_REQUEST);

        write_message(&dir, "msg-2");
        let empty_thread = generate_report_handler(
            State(state.clone()),
            Json(GenerateReportRequest {
                message_id: "msg-2".into(),
                thread_id: "".into(),
            }),
        )
        .await;
        assert_eq!(status_of(empty_thread), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_trust_error_mapping() {
        use crate::verification::VerificationState::*;
        let status = |e: TrustError| AppError::from(e).into_response().status();

        assert_eq!(status(TrustError::not_found("x")), StatusCode::NOT_FOUND);
        assert_eq!(status(TrustError::invalid_context("x")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status(TrustError::DuplicateName { name: "x".into() }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(TrustError::InvalidTransition {
                id: "r".into(),
                from: Verified,
                to: Failed
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(TrustError::Store(anyhow::anyhow!("down"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_verification_request_lifecycle() {
        let dir = TempDir::new();
        write_message(&dir, "msg-1");
        let state = state(&dir);
        let (_, Json(report)) = generate_report_handler(
            State(state.clone()),
            Json(GenerateReportRequest {
                message_id: "msg-1".into(),
                thread_id: "thread-1".into(),
            }),
        )
        .await
        .map_err(|e| e.into_response().status())
        .unwrap();

        let (status, Json(created)) = create_verification_handler(
            State(state.clone()),
            Path(report.report_id.clone()),
            Json(CreateVerificationRequest {
                provider: "linkedin".into(),
                target_email: "host@showrunner.example".into(),
            }),
        )
        .await
        .map_err(|e| e.into_response().status())
        .unwrap();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created.state, VerificationState::Requested);

        // wait for background dispatch
        let mut current = VerificationState::Requested;
        for _ in 0..50 {
            current = state.workflow.get(&created.id).await.unwrap().state();
            if current != VerificationState::Requested {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(current, VerificationState::Pending);

        let Json(done) = verification_callback_handler(
            State(state.clone()),
            Path(created.id.clone()),
            Json(VerificationCallback { verified: true }),
        )
        .await
        .map_err(|e| e.into_response().status())
        .unwrap();
        assert_eq!(done.state(), VerificationState::Verified);

        let again = verification_callback_handler(
            State(state.clone()),
            Path(created.id.clone()),
            Json(VerificationCallback { verified: false }),
        )
        .await;
        assert_eq!(status_of(again), StatusCode::CONFLICT);

        let unknown_provider = create_verification_handler(
            State(state.clone()),
            Path(report.report_id.clone()),
            Json(CreateVerificationRequest {
                provider: "myspace".into(),
                target_email: "host@showrunner.example".into(),
            }),
        )
        .await;
        assert_eq!(status_of(unknown_provider), StatusCode::BAD_REQUEST);

        let unknown_report = create_verification_handler(
            State(state.clone()),
            Path("no-such-report".into()),
            Json(CreateVerificationRequest {
                provider: "linkedin".into(),
                target_email: "host@showrunner.example".into(),
            }),
        )
        .await;
        assert_eq!(status_of(unknown_report), StatusCode::NOT_FOUND);

        let Json(providers) = providers_handler(State(state)).await;
        assert_eq!(providers.len(), 1);
        assert!(providers[0].available);
    }

    #[tokio::test]
    async fn test_providers_follow_identity_plugin_state() {
        let dir = TempDir::new();
        let state = state(&dir);

        state.registry.disable(external_identity::NAME).unwrap();
        let Json(providers) = providers_handler(State(state.clone())).await;
        assert_eq!(providers[0].name, "linkedin");
        assert!(providers[0].enabled);
        assert!(!providers[0].plugin_enabled);
        assert!(!providers[0].available);

        state.registry.enable(external_identity::NAME).unwrap();
        let Json(providers) = providers_handler(State(state)).await;
        assert!(providers[0].plugin_enabled);
        assert!(providers[0].available);
    }
}
