pub mod content_heuristics;
pub mod dns_records;
pub mod domain_whois;
pub mod email_auth;
pub mod external_identity;
pub mod url_reputation;

use crate::claims::TrustClaim;
use crate::context::VerificationContext;
use async_trait::async_trait;

pub use content_heuristics::ContentHeuristicsPlugin;
pub use dns_records::DnsRecordsPlugin;
pub use domain_whois::DomainWhoisPlugin;
pub use email_auth::EmailAuthPlugin;
pub use external_identity::ExternalIdentityPlugin;
pub use url_reputation::UrlReputationPlugin;

/// An independent unit that inspects one category of signal.
///
/// Implementors write [`VerifierPlugin::gather`] and may fail freely; callers
/// go through [`VerifierPlugin::gather_signals`], which turns any failure into
/// an empty claim list plus a log line.
#[async_trait]
pub trait VerifierPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn gather(&self, context: &VerificationContext) -> anyhow::Result<Vec<TrustClaim>>;

    async fn gather_signals(&self, context: &VerificationContext) -> Vec<TrustClaim> {
        match self.gather(context).await {
            Ok(claims) => {
                log::debug!(
                    "Plugin {} produced {} claim(s) for message {}",
                    self.name(),
                    claims.len(),
                    context.message_id()
                );
                claims
            }
            Err(e) => {
                log::warn!(
                    "Plugin {} failed on message {}: {e:#}",
                    self.name(),
                    context.message_id()
                );
                Vec::new()
            }
        }
    }
}
