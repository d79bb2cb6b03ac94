use crate::verification::VerificationState;

/// Errors surfaced by the trust engine to its callers.
///
/// Plugin-local failures never show up here: they are absorbed inside the
/// plugin boundary and only ever cost the report a claim.
#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("plugin already registered: {name}")]
    DuplicateName { name: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("invalid verification context: {reason}")]
    InvalidContext { reason: String },

    #[error("invalid transition for verification request {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: VerificationState,
        to: VerificationState,
    },

    #[error("a verification request via {provider} is already outstanding for report {report_id}")]
    DuplicateRequest { report_id: String, provider: String },

    #[error("provider {provider} is not configured or disabled")]
    ProviderUnavailable { provider: String },

    #[error("report generation for thread {thread_id} failed: {message}")]
    Generation { thread_id: String, message: String },

    #[error("report store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl TrustError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn invalid_context(reason: impl Into<String>) -> Self {
        Self::InvalidContext {
            reason: reason.into(),
        }
    }
}

pub type TrustResult<T> = std::result::Result<T, TrustError>;
