use foff_trust::plugins::domain_whois::{DomainAgeChecker, DomainWhoisPlugin, DEFAULT_MAX_AGE_DAYS};
use foff_trust::plugins::VerifierPlugin;
use foff_trust::VerificationContext;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    // pass --live to query real WHOIS servers instead of the mock table
    let live = std::env::args().any(|arg| arg == "--live");
    let checker = if live {
        DomainAgeChecker::new(Duration::from_secs(10))
    } else {
        DomainAgeChecker::with_mock_ages(Duration::from_secs(1), DomainAgeChecker::default_mock_ages())
    };
    let plugin = DomainWhoisPlugin::new(
        checker,
        DEFAULT_MAX_AGE_DAYS,
        vec!["paypal.com".to_string(), "google.com".to_string()],
    );

    println!("Testing domain age functionality ({})...", if live { "live WHOIS" } else { "mock data" });

    let cases = [
        ("psybook.info (young domain)", "statefarm@psybook.info"),
        ("google.com (old domain)", "test@google.com"),
        ("suspicious.tk (very young domain)", "spam@suspicious.tk"),
        ("newdomain.info (45 days old)", "user@newdomain.info"),
        ("paypa1.com (lookalike)", "service@paypa1.com"),
    ];

    for (i, (label, sender)) in cases.iter().enumerate() {
        let context = VerificationContext::builder(format!("demo-{i}"), "demo-thread")
            .sender(*sender)
            .build()?;

        println!("\n=== Test Case {}: {label} ===", i + 1);
        let claims = plugin.gather_signals(&context).await;
        if claims.is_empty() {
            println!("No claims");
        }
        for claim in claims {
            println!(
                "{} -> {}",
                claim.claim_type,
                claim.evidence.as_deref().unwrap_or("")
            );
        }
    }

    println!("\n=== Domain Age Testing Complete ===");
    Ok(())
}
