// =============================================================================
// Consensus Brain — Main Entry Point
// =============================================================================
//
// Orders are filled by the paper executor; no live venue is wired in here.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use consensus_brain::execution::PaperExecutor;
use consensus_brain::redis_bus::RedisBus;
use consensus_brain::risk::DynamicRiskGate;
use consensus_brain::{Brain, EngineConfig};

const DEFAULT_CONFIG_PATH: &str = "brain_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Consensus Brain — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("BRAIN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });
    config.apply_env_overrides();
    config.validate().context("invalid engine configuration")?;

    info!(
        window_seconds = config.window_seconds,
        threshold = config.consensus_threshold,
        signal_pattern = %config.bus.signal_pattern,
        status_topics = ?config.bus.status_topics,
        "Configuration ready"
    );

    // ── 2. Bus connection & health check ─────────────────────────────────
    let bus = Arc::new(RedisBus::connect(&config.bus.redis_url).await?);
    bus.ping().await.context("redis health check failed")?;
    info!(url = %config.bus.redis_url, "Redis health check passed");

    let subscription = bus
        .subscribe(
            std::slice::from_ref(&config.bus.signal_pattern),
            &config.bus.status_topics,
        )
        .await?;

    // ── 3. Collaborators ─────────────────────────────────────────────────
    let risk = Arc::new(DynamicRiskGate::new(config.risk.clone()));
    let executor = Arc::new(PaperExecutor::new());

    // ── 4. Brain & consumer loop ─────────────────────────────────────────
    let brain = Arc::new(Brain::new(&config, bus.clone(), risk.clone(), executor));

    let loop_brain = brain.clone();
    let mut consumer = tokio::spawn(async move {
        loop_brain.run(subscription).await;
    });

    info!("Consensus brain running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    let finished = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            warn!("Shutdown signal received — stopping gracefully");
            brain.stop();
            false
        }
        res = &mut consumer => {
            if let Err(e) = res {
                error!(error = %e, "Consumer loop terminated abnormally");
            }
            warn!("Signal subscription ended");
            true
        }
    };

    if !finished {
        if let Err(e) = consumer.await {
            error!(error = %e, "Consumer loop terminated abnormally");
        }
    }

    let state = risk.get_state();
    info!(
        risk_mode = %state.risk_mode,
        daily_trades = state.daily_trades_count,
        "Consensus brain shut down complete."
    );
    Ok(())
}
