//! Campaign Sender — paced bulk WhatsApp campaign dispatch.
//!
//! Entry point: loads configuration, wires the dispatch services and runs one
//! of the subcommands.

mod campaign_file;

use anyhow::Context;
use campaign_channels::{SpintaxEngine, WhatsAppBridge};
use campaign_core::config::AppConfig;
use campaign_core::{CampaignStore, MemoryStore, SystemClock};
use campaign_dispatcher::{CampaignDispatcher, DispatchServices, DispatchSettings};
use campaign_file::CampaignFile;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "campaign-sender")]
#[command(about = "Paced bulk WhatsApp campaign dispatch engine")]
#[command(version)]
struct Cli {
    /// TOML configuration file (environment variables still take precedence)
    #[arg(long, short, env = "CAMPAIGN_SENDER_CONFIG")]
    config: Option<PathBuf>,

    /// Bridge hosts, comma separated (overrides config)
    #[arg(long = "host", value_delimiter = ',')]
    hosts: Vec<String>,

    /// Sending identity checked against warm-up (overrides config)
    #[arg(long, env = "CAMPAIGN_SENDER__WARMUP__IDENTITY")]
    identity: Option<String>,

    /// Expose Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load a campaign file and dispatch it until done (Ctrl-C pauses)
    Run {
        /// JSON file with name, template, optional pacing and contacts
        #[arg(long, short)]
        file: PathBuf,

        /// Skip warm-up admission for this run
        #[arg(long, default_value_t = false)]
        no_warmup: bool,
    },
    /// Validate a template and print distinct renderings
    Preview {
        #[arg(long, short)]
        template: String,

        #[arg(long, short = 'n', default_value_t = 5)]
        count: usize,

        /// Template variable, as key=value (repeatable)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Probe every configured bridge host
    Health,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from(Some(path))
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(AppConfig::load().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load config, using defaults");
            AppConfig::default()
        })),
    }
}

fn start_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()?;
    info!(port, "Metrics exporter started");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campaign_sender=info,campaign_dispatcher=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if !cli.hosts.is_empty() {
        config.bridge.hosts = cli.hosts;
    }
    if let Some(identity) = cli.identity {
        config.warmup.identity = identity;
    }
    if let Some(port) = cli.metrics_port {
        config.metrics.port = port;
    }
    config.validate()?;

    info!(
        hosts = ?config.bridge.hosts,
        identity = %config.warmup.identity,
        max_per_hour = config.rate_limit.max_per_hour,
        "Configuration loaded"
    );

    if cli.metrics_port.is_some() {
        if let Err(e) = start_metrics(config.metrics.port) {
            error!(error = %e, "Failed to start metrics exporter");
        }
    }

    match cli.command {
        Command::Run { file, no_warmup } => {
            if no_warmup {
                config.warmup.enabled = false;
            }
            run(config, &file).await
        }
        Command::Preview {
            template,
            count,
            vars,
        } => preview(&template, count, vars.into_iter().collect()),
        Command::Health => health(&config).await,
    }
}

async fn run(config: AppConfig, file: &Path) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let (campaign, queued) = CampaignFile::load(file)?.into_store(&store)?;
    info!(campaign_id = %campaign.id, name = %campaign.name, queued, "Campaign loaded");

    let services =
        DispatchServices::from_config(&config, store.clone(), store.clone(), Arc::new(SystemClock))?;
    let dispatcher = CampaignDispatcher::new(services, DispatchSettings::from_config(&config));
    dispatcher.start_campaign(campaign.id).await?;

    tokio::select! {
        _ = dispatcher.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, pausing campaign");
            dispatcher.shutdown().await?;
        }
    }

    let finished = store
        .get_campaign(campaign.id)
        .await?
        .context("campaign disappeared from the store")?;
    info!(
        campaign_id = %finished.id,
        status = %finished.status,
        sent = finished.sent_count,
        failed = finished.failed_count,
        pending = finished.pending_count,
        "Dispatch finished"
    );
    println!("{}", serde_json::to_string_pretty(&finished)?);
    Ok(())
}

fn preview(template: &str, count: usize, vars: HashMap<String, String>) -> anyhow::Result<()> {
    let validation = SpintaxEngine::validate(template);
    if !validation.valid {
        anyhow::bail!(
            "invalid template: {}",
            validation.error.unwrap_or_default()
        );
    }
    let engine = SpintaxEngine::new();
    for variation in engine.generate_variations(template, count, &vars) {
        println!("{variation}");
    }
    Ok(())
}

async fn health(config: &AppConfig) -> anyhow::Result<()> {
    let bridge = WhatsAppBridge::new(&config.bridge)?;
    let report = bridge.probe_all().await;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.iter().any(|h| h.health.connected) {
        anyhow::bail!("no bridge host is connected");
    }
    Ok(())
}
