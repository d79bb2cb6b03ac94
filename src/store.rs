use crate::claims::TrustReport;
use crate::verification::VerificationRequest;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Key-based persistence for reports and verification requests.
///
/// Errors are opaque to the engine and surface to callers as
/// [`crate::error::TrustError::Store`].
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn save_report(&self, report: &TrustReport) -> Result<()>;

    /// Newest report stored for `thread_id`
    async fn latest_report(&self, thread_id: &str) -> Result<Option<TrustReport>>;

    async fn get_report(&self, report_id: &str) -> Result<Option<TrustReport>>;

    /// Insert or overwrite by request id
    async fn save_request(&self, request: &VerificationRequest) -> Result<()>;

    async fn get_request(&self, request_id: &str) -> Result<Option<VerificationRequest>>;

    async fn list_requests(&self) -> Result<Vec<VerificationRequest>>;
}

#[derive(Default)]
struct StoreInner {
    reports: HashMap<String, TrustReport>,
    // report ids per thread, oldest first
    threads: HashMap<String, Vec<String>>,
    requests: HashMap<String, VerificationRequest>,
}

/// Process-local store; contents are lost on restart
#[derive(Default)]
pub struct InMemoryReportStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn report_count(&self) -> usize {
        self.inner.read().await.reports.len()
    }
}

#[async_trait]
impl ReportStore for InMemoryReportStore {
    async fn save_report(&self, report: &TrustReport) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner
            .reports
            .insert(report.report_id.clone(), report.clone())
            .is_none()
        {
            inner
                .threads
                .entry(report.thread_id.clone())
                .or_default()
                .push(report.report_id.clone());
        }
        Ok(())
    }

    async fn latest_report(&self, thread_id: &str) -> Result<Option<TrustReport>> {
        let inner = self.inner.read().await;
        Ok(inner
            .threads
            .get(thread_id)
            .and_then(|ids| ids.last())
            .and_then(|id| inner.reports.get(id))
            .cloned())
    }

    async fn get_report(&self, report_id: &str) -> Result<Option<TrustReport>> {
        Ok(self.inner.read().await.reports.get(report_id).cloned())
    }

    async fn save_request(&self, request: &VerificationRequest) -> Result<()> {
        self.inner
            .write()
            .await
            .requests
            .insert(request.id.clone(), request.clone());
        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<VerificationRequest>> {
        Ok(self.inner.read().await.requests.get(request_id).cloned())
    }

    async fn list_requests(&self) -> Result<Vec<VerificationRequest>> {
        let mut requests: Vec<_> = self.inner.read().await.requests.values().cloned().collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(requests)
    }
}
