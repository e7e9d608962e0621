//! Conductor engine entrypoint.

use clap::Parser;
use conductor_core::config::EngineConfig;
use conductor_scheduler::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(author, version, about = "Multi-agent orchestration engine", long_about = None)]
struct Cli {
    /// Configuration file (YAML).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the configured agent count.
    #[arg(long, value_name = "N")]
    agents: Option<usize>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(agents) = cli.agents {
        config.num_agents = agents;
        config.min_agents = config.min_agents.min(agents.max(1));
    }
    config.validate()?;

    let default_level = if cli.debug {
        "debug".to_string()
    } else {
        config.log_level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        num_agents = config.num_agents,
        "Conductor starting"
    );

    let supervisor = Arc::new(Supervisor::new(config)?);
    supervisor.run().await?;
    Ok(())
}
