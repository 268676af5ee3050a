//! Governance daemon: HTTP API over the approval engine plus the
//! overdue-stage sweep.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use governance_approval::api::{self, AppState};
use governance_approval::config::{AppConfig, StorageConfig};
use governance_approval::engine::ApprovalEngine;
use governance_approval::governance::GovernanceValidator;
use governance_approval::logging::init_logging;
use governance_approval::risk::RiskScorer;
use governance_approval::sod::SodRuleSet;
use governance_approval::store::{GovernanceStore, InMemoryRepository, SledRepository};
use governance_approval::types::TimeStamp;

#[derive(Parser)]
#[command(name = "governanced")]
#[command(about = "Policy-enforced approval workflow service", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "GOVERNANCE_CONFIG")]
    config: Option<String>,

    /// Listen address, overrides the configured one
    #[arg(short, long, env = "GOVERNANCE_LISTEN_ADDR")]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }

    init_logging(&config.logging)?;

    let validator = GovernanceValidator::new(SodRuleSet::builtin(), RiskScorer::new(config.risk.clone()));

    match &config.storage {
        StorageConfig::Memory => {
            info!("Using in-memory storage; state is lost on restart");
            let repo = Arc::new(InMemoryRepository::new());
            serve(repo, validator, &config).await
        }
        StorageConfig::Sled { path } => {
            info!(path = %path.display(), "Opening sled storage");
            let repo = Arc::new(
                SledRepository::open(path).with_context(|| format!("opening {}", path.display()))?,
            );
            serve(Arc::clone(&repo), validator, &config).await?;
            repo.flush()?;
            Ok(())
        }
    }
}

async fn serve<R: GovernanceStore>(
    repo: Arc<R>,
    validator: GovernanceValidator,
    config: &AppConfig,
) -> anyhow::Result<()> {
    let state = AppState::new(ApprovalEngine::new(repo).with_validator(validator));

    if config.scheduler.escalation_sweep_secs > 0 {
        let sweeper = state.clone();
        let period = Duration::from_secs(config.scheduler.escalation_sweep_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = sweeper
                    .blocking(|engine| engine.sweep_overdue(&TimeStamp::new()))
                    .await
                {
                    error!(error = %err, "Overdue-stage sweep failed");
                }
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, version = env!("CARGO_PKG_VERSION"), "governanced listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    Ok(())
}
