// ============================================================================
// SYNAPSE CLI
// ============================================================================
// One binary, two long-running roles:
//
//   synapse agent   collect and ship metrics
//   synapse server  ingest and store metrics
//
// plus offline helpers for key generation and configuration files.
// ============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result as AnyhowResult};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use synapse::agent::Agent;
use synapse::config::{AgentConfig, AgentOverrides, ServerConfig, ServerOverrides};
use synapse::crypto::keys;
use synapse::logging::{init_logging, LoggingConfig};
use synapse::server::Server;
use synapse::{FULL_NAME, VERSION};

#[derive(Parser, Debug)]
#[command(
    name = "synapse",
    version,
    about = "Signed, encrypted metrics agent and ingestion server",
    long_about = "Synapse ships runtime metrics from agents to a central server over HTTP \
                  or gRPC, with optional HMAC signing, RSA \
                  envelope encryption and subnet-based access control."
)]
pub struct Cli {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long, global = true, env = "SYNAPSE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level override
    #[arg(long, global = true, env = "SYNAPSE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the collection agent
    Agent(AgentOverrides),

    /// Run the ingestion server
    Server(ServerOverrides),

    /// Generate an RSA key pair in PEM form
    Keygen {
        /// Modulus size in bits
        #[arg(short, long, default_value_t = 2048)]
        bits: usize,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        out: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        #[arg(value_enum)]
        role: Role,
    },

    /// Print a default configuration file
    GenerateConfig {
        #[arg(value_enum)]
        role: Role,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Agent,
    Server,
}

fn handle_version() {
    println!("{FULL_NAME} v{VERSION}");
    println!("  target: {}", std::env::consts::ARCH);
    println!("  os:     {}", std::env::consts::OS);
}

fn handle_generate_config(role: Role, output: Option<&Path>) -> AnyhowResult<()> {
    let content = match role {
        Role::Agent => AgentConfig::generate_default_config(),
        Role::Server => ServerConfig::generate_default_config(),
    };
    match output {
        Some(path) => {
            std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Configuration written to {}", path.display());
        }
        None => print!("{content}"),
    }
    Ok(())
}

fn handle_validate(role: Role, path: Option<&Path>) -> AnyhowResult<()> {
    let summary = match role {
        Role::Agent => AgentConfig::load(path, &AgentOverrides::default())?.summary(),
        Role::Server => ServerConfig::load(path, &ServerOverrides::default())?.summary(),
    };
    match path {
        Some(path) => println!("Configuration {} is valid", path.display()),
        None => println!("Defaults and environment are valid"),
    }
    for (name, value) in summary {
        println!("  {name:<22} {value}");
    }
    Ok(())
}

fn handle_keygen(bits: usize, out: &Path) -> AnyhowResult<()> {
    let (private, public) = keys::write_key_pair(out, bits)?;
    println!("Private key: {}", private.display());
    println!("Public key:  {}", public.display());
    Ok(())
}

async fn handle_agent(config: AgentConfig) -> AnyhowResult<()> {
    let agent = Agent::new(config).context("Failed to build agent")?;
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    let stats = agent.run(token).await;
    if stats.dropped > 0 {
        warn!(target: "synapse::cli", dropped = stats.dropped, "Some batches were dropped");
    }
    Ok(())
}

async fn handle_server(config: ServerConfig) -> AnyhowResult<()> {
    let server = Server::new(config).context("Failed to build server")?;
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone());

    server.run(token).await?;
    Ok(())
}

fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target: "synapse::cli", error = %e, "SIGTERM handler unavailable");
            let _ = signal::ctrl_c().await;
            info!(target: "synapse::cli", "Received SIGINT");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!(target: "synapse::cli", "Received SIGTERM"),
        _ = signal::ctrl_c() => info!(target: "synapse::cli", "Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = signal::ctrl_c().await;
    info!(target: "synapse::cli", "Received interrupt");
}

fn apply_log_overrides(mut logging: LoggingConfig, cli: &Cli) -> LoggingConfig {
    if let Some(level) = &cli.log_level {
        logging.level = level.clone();
    }
    if cli.debug {
        logging.level = "debug".into();
    }
    logging
}

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match &cli.command {
        Commands::Version => {
            handle_version();
            Ok(())
        }
        Commands::GenerateConfig { role, output } => handle_generate_config(*role, output.as_deref()),
        Commands::Validate { role } => handle_validate(*role, config_path),
        Commands::Keygen { bits, out } => handle_keygen(*bits, out),
        Commands::Agent(overrides) => {
            let config = AgentConfig::load(config_path, overrides).context("Failed to load agent configuration")?;
            init_logging(&apply_log_overrides(config.logging.clone(), &cli))?;
            info!("{FULL_NAME} v{VERSION} agent");
            handle_agent(config).await
        }
        Commands::Server(overrides) => {
            let config = ServerConfig::load(config_path, overrides).context("Failed to load server configuration")?;
            init_logging(&apply_log_overrides(config.logging.clone(), &cli))?;
            info!("{FULL_NAME} v{VERSION} server");
            handle_server(config).await
        }
    }
}
