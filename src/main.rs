//! # Nudge: Lifecycle Campaign Server
//!
//! Ingests product events, tracks user lifecycle, and dispatches email and
//! generic tasks to a webhook executor, immediately or after a delay.
//!
//! Usage:
//!   nudge                          # Start the gateway (default 127.0.0.1:3000)
//!   nudge --port 8080              # Custom port
//!   nudge --config ./nudge.toml    # Custom config file
//!   nudge --check                  # Validate config and exit
//!   nudge --init                   # Write default config to ~/.nudge/config.toml

use anyhow::Result;
use clap::Parser;
use nudge_core::NudgeConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "nudge",
    version,
    about = "📬 Nudge: lifecycle event ingestion and campaign dispatch"
)]
struct Cli {
    /// Config file (default: ~/.nudge/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address, overrides [gateway].host
    #[arg(long)]
    host: Option<String>,

    /// Port, overrides [gateway].port
    #[arg(short, long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Validate configuration and exit
    #[arg(long)]
    check: bool,

    /// Write the default configuration and exit
    #[arg(long)]
    init: bool,
}

fn expand_path(p: &str) -> String {
    shellexpand::tilde(p).to_string()
}

fn init_logging(cli: &Cli) {
    let filter = if cli.verbose {
        "nudge=debug,nudge_scheduler=debug,nudge_gateway=debug,tower_http=debug"
    } else {
        "nudge=info,nudge_scheduler=info,nudge_gateway=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config(cli: &Cli) -> Result<NudgeConfig> {
    let mut config = match &cli.config {
        Some(path) => NudgeConfig::load_from(std::path::Path::new(&expand_path(path)))?,
        None => NudgeConfig::load()?,
    };
    config.apply_env();
    if let Some(host) = &cli.host {
        config.gateway.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    if cli.init {
        let path = NudgeConfig::default_path();
        if path.exists() {
            println!("⚠️  Config already exists at {}", path.display());
        } else {
            NudgeConfig::default().save()?;
            println!("✅ Default config written to {}", path.display());
        }
        return Ok(());
    }

    let config = load_config(&cli)?;

    if cli.check {
        println!("✅ Configuration OK");
        println!("   Campaigns: {}", config.campaigns.len());
        println!("   Templates: {}", config.templates.len());
        println!("   Webhook:   {}", config.dispatch.webhook_url);
        println!("   Listen:    {}:{}", config.gateway.host, config.gateway.port);
        return Ok(());
    }

    tracing::info!("📬 Nudge v{} starting", env!("CARGO_PKG_VERSION"));
    nudge_gateway::start(config).await?;
    Ok(())
}
