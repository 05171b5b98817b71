//! ctxproxy CLI binary.
//!
//! Context-compressing proxy for AI provider APIs.
//!
//! # Commands
//!
//! - `serve` - Start the forwarding proxy
//! - `check-config` - Validate and print the effective configuration
//! - `fingerprint` - Print the session id a credential maps to

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use ctxproxy::{session::SessionId, Config, ProxyServer, VERSION};

#[derive(Parser)]
#[command(name = "ctxproxy")]
#[command(version = VERSION)]
#[command(about = "Context-compressing proxy for AI provider APIs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the forwarding proxy
    Serve {
        /// Config file (default: <config dir>/ctxproxy/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Listen host
        #[arg(long)]
        host: Option<String>,

        /// Listen port
        #[arg(short, long)]
        port: Option<u16>,

        /// Message count at which compression starts
        #[arg(short, long)]
        threshold: Option<u64>,

        /// Disable compression (sessions and metrics only)
        #[arg(long)]
        no_compression: bool,

        /// Verbose logging
        #[arg(short, long)]
        verbose: bool,

        /// Log as JSON lines
        #[arg(long)]
        json_logs: bool,
    },

    /// Validate the configuration and print it
    CheckConfig {
        /// Config file (default: <config dir>/ctxproxy/config.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print the session id for a credential
    Fingerprint {
        /// API key or token
        credential: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            host,
            port,
            threshold,
            no_compression,
            verbose,
            json_logs,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(threshold) = threshold {
                config.compression.threshold = threshold;
            }
            if no_compression {
                config.compression.enabled = false;
            }
            if verbose {
                config.logging.level = "debug".to_string();
            }
            if json_logs {
                config.logging.json = true;
            }
            cmd_serve(config)
        },

        Commands::CheckConfig { config } => cmd_check_config(config),

        Commands::Fingerprint { credential } => {
            println!("{}", SessionId::from_credential(Some(&credential)));
            Ok(())
        },
    }
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn cmd_serve(config: Config) -> anyhow::Result<()> {
    init_logging(&config);

    let server = ProxyServer::new(config).map_err(|e| anyhow::anyhow!("{}", e))?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async { server.run().await.map_err(|e| anyhow::anyhow!("{}", e)) })
}

fn cmd_check_config(path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = Config::load(path.as_deref())?;
    config.validate()?;

    println!("{}", toml::to_string_pretty(&config.redacted())?);
    eprintln!("Configuration OK");
    Ok(())
}
