use clap::{Arg, Command};
use foff_trust::api::{self, AppState, EmlDirectorySource};
use foff_trust::plugins::external_identity::IdentityProvider;
use foff_trust::registry::{self, PluginRegistry};
use foff_trust::config::Credentials;
use foff_trust::{
    Config, InMemoryReportStore, ReportGenerator, ReportStore, TrustReport, VerificationContext,
    VerificationWorkflow,
};
use log::LevelFilter;
use std::collections::BTreeMap;
use std::process;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let matches = Command::new("foff-trust")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Explainable trust scoring for inbound email")
        .long_about(
            "foff-trust scores inbound messages for scam and phishing risk.\n\
             Every point deducted is tied to a finding you can read: failed\n\
             authentication, a freshly registered or lookalike domain,\n\
             pay-to-pitch language, flagged links and more.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/foff-trust.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and ruleset, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("list-providers")
                .long("list-providers")
                .help("List verifier plugins and identity providers with their status")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Score a single .eml file and print the explained report")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("api-server")
                .long("api-server")
                .help("Start the trust REST API")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging with per-plugin detail")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/foff-trust.yaml");
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e:#}");
        eprintln!("Run with --test-config for details");
        process::exit(1);
    }

    let credentials = resolve_credentials(&config);
    let identity_providers = registry::identity_providers(&config, &credentials);
    let plugins = match PluginRegistry::from_config(&config, &credentials, &identity_providers) {
        Ok(plugins) => Arc::new(plugins),
        Err(e) => {
            eprintln!("Error building verifier plugins: {e:#}");
            process::exit(1);
        }
    };

    if matches.get_flag("list-providers") {
        list_providers(&config, &plugins, &identity_providers);
        return;
    }

    let table = match config.deduction_table() {
        Ok(table) => table,
        Err(e) => {
            eprintln!("Error loading ruleset: {e:#}");
            process::exit(1);
        }
    };
    let store: Arc<dyn ReportStore> = Arc::new(InMemoryReportStore::new());
    let generator = Arc::new(ReportGenerator::new(
        plugins.clone(),
        table,
        store.clone(),
        config.timeouts.plugin_timeout(),
        config.timeouts.overall_deadline(),
    ));

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(&generator, email_file).await;
        return;
    }

    if matches.get_flag("api-server") {
        let workflow = VerificationWorkflow::new(
            store.clone(),
            config.providers.clone(),
            registry::identity_provider_map(&identity_providers),
            chrono::Duration::hours(config.api.verification_ttl_hours),
        );
        let state = AppState {
            registry: plugins,
            generator,
            store,
            workflow,
            messages: Arc::new(EmlDirectorySource::new(&config.api.messages_dir)),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Received Ctrl-C, shutting down");
                shutdown_tx.send(true).ok();
            }
        });

        if let Err(e) = api::run_server(&config.api, state, shutdown_rx).await {
            eprintln!("API server error: {e:#}");
            process::exit(1);
        }
        return;
    }

    println!("Nothing to do. Use --test-email FILE or --api-server (see --help).");
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(Config::default())
    }
}

/// Secrets named by `credentials_ref` and `safe_browsing_key_ref` are
/// read from the environment here, once, and handed to the engine.
fn resolve_credentials(config: &Config) -> Credentials {
    let mut credentials = Credentials::new();
    for reference in config.credential_refs() {
        match std::env::var(reference) {
            Ok(secret) if !secret.is_empty() => credentials.insert(reference, secret),
            _ => log::warn!("Credential {reference} is not set in the environment"),
        }
    }
    credentials
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    println!("🔍 Testing configuration...");
    println!();

    if let Err(e) = config.validate() {
        println!("❌ Configuration validation failed:");
        println!("Error: {e:#}");
        process::exit(1);
    }

    match config.deduction_table() {
        Ok(table) => {
            println!("Ruleset version: {}", table.version);
            println!("Number of deduction rules: {}", table.rules.len());
        }
        Err(e) => {
            println!("❌ Ruleset failed to load: {e:#}");
            process::exit(1);
        }
    }
    let enabled = config.plugins.values().filter(|enabled| **enabled).count();
    println!("Plugins enabled in config: {enabled}");
    println!("Identity providers configured: {}", config.providers.len());
    if config.use_mock_data {
        println!("Mock data mode: DNS, WHOIS and identity answers are canned");
    }
    println!("✅ Configuration is valid");
}

fn list_providers(
    config: &Config,
    registry: &PluginRegistry,
    identity_providers: &BTreeMap<String, Arc<dyn IdentityProvider>>,
) {
    println!("Verifier plugins:");
    for plugin in registry.list() {
        let status = if plugin.enabled { "✅ enabled " } else { "⏸  disabled" };
        println!("  {status}  {:<20} {}", plugin.name, plugin.description);
    }
    println!();

    println!("Identity providers:");
    if config.providers.is_empty() {
        println!("  (none configured)");
    }
    for (name, provider) in &config.providers {
        let status = match (provider.enabled, identity_providers.contains_key(name)) {
            (true, true) => "✅ available",
            (true, false) => "❌ unavailable (check endpoint and credentials)",
            (false, _) => "⏸  disabled",
        };
        println!("  {name:<20} {status}");
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

async fn test_email_file(generator: &ReportGenerator, email_file: &str) {
    println!("🧪 Testing email file: {email_file}");
    println!();

    let raw = match std::fs::read(email_file) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            eprintln!("❌ Error reading email file: {e}");
            process::exit(1);
        }
    };

    let stem = std::path::Path::new(email_file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "test-message".to_string());
    let context = match VerificationContext::from_raw_email(stem.clone(), stem, &raw) {
        Ok(context) => context,
        Err(e) => {
            eprintln!("❌ {e}");
            process::exit(1);
        }
    };

    println!("Sender: {}", context.sender_address());
    if let Some(subject) = context.headers().get("subject") {
        println!("Subject: {}", truncate_string(subject, 72));
    }
    println!(
        "URLs: {}  Attachments: {}",
        context.urls().len(),
        context.attachments().len()
    );
    println!();

    match generator.generate(context).await {
        Ok(report) => print_report(&report),
        Err(e) => {
            eprintln!("❌ Report generation failed: {e}");
            process::exit(1);
        }
    }
}

fn print_report(report: &TrustReport) {
    println!("📊 Trust score: {}/100 ({})", report.score(), report.risk_level());
    println!("Ruleset: {}", report.ruleset_version);
    println!("═══════════════════════════════════════");
    if report.findings.is_empty() {
        println!("No findings.");
        return;
    }
    for finding in &report.findings {
        println!(
            "  -{:<3} {:<22} [{}] {}",
            finding.deduction,
            finding.claim.claim_type.as_str(),
            finding.claim.provider,
            truncate_string(&finding.claim.subject, 48)
        );
        if let Some(evidence) = &finding.claim.evidence {
            println!("        {}", truncate_string(evidence, 100));
        }
    }
}
