pub mod api;
pub mod claims;
pub mod config;
pub mod context;
pub mod domain_utils;
pub mod error;
pub mod plugins;
pub mod registry;
pub mod report;
pub mod scoring;
pub mod store;
pub mod verification;

pub use claims::{ClaimType, Finding, RiskLevel, TrustClaim, TrustReport};
pub use config::Config;
pub use context::VerificationContext;
pub use error::{TrustError, TrustResult};
pub use registry::PluginRegistry;
pub use report::ReportGenerator;
pub use scoring::{score_claims, DeductionTable};
pub use store::{InMemoryReportStore, ReportStore};
pub use verification::{VerificationRequest, VerificationState, VerificationWorkflow};
