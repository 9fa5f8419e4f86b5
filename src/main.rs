use rustls::crypto::{CryptoProvider, ring};
use std::time::Duration;

use manifold::config::Config;
use manifold::connectors::{destination_from_config, source_from_config};
use manifold::pipeline::Flow;
use manifold::transform::transformer_from_config;

/// Environment variable naming the config file when no CLI argument is given.
const CONFIG_ENV: &str = "MANIFOLD_CONFIG";
const DEFAULT_CONFIG: &str = "config.json";

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize logging and the rustls crypto backend
// - Load configuration
// - Build source, destination and optional transformer
// - Run the pipeline until SIGINT / SIGTERM
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // rustls >= 0.23 requires an explicit CryptoProvider, installed once
    // before the first wss:// handshake.
    if CryptoProvider::install_default(ring::default_provider()).is_err() {
        anyhow::bail!("failed to install rustls CryptoProvider");
    }

    let path = config_path();
    log::info!("loading config from {}", path);
    let config = Config::load(&path)?;

    let source = source_from_config(&config.source)?;
    let destination = destination_from_config(&config.destination)?;

    let mut flow = Flow::new(source, destination);
    if let Some(cfg) = &config.transformer {
        flow = flow.with_transformer(transformer_from_config(cfg)?);
    }
    if let Some(secs) = config.stats_every_secs() {
        flow = flow.with_stats_every(Duration::from_secs(secs));
    }

    flow.run().await?;
    Ok(())
}

/// First CLI argument, then `MANIFOLD_CONFIG`, then `config.json`.
fn config_path() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string())
}
