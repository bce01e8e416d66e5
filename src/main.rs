//! Wavestore server
//!
//! Run with: `wavestore [config.toml]`
//!
//! Without a path the default locations are searched (see
//! [`Config::load_default`]); `WAVESTORE_*` environment variables override
//! either. `RUST_LOG` takes precedence over the configured log level.

use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wavestore::{Config, Context, Server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => Config::load_with_env(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::load_default(),
    };

    init_tracing(&config);
    tracing::info!("Wavestore v{}", env!("CARGO_PKG_VERSION"));

    let roots = config.storage.root_paths();
    tracing::info!("Data roots: {:?}", roots);
    for root in &roots {
        if !root.is_dir() {
            tracing::warn!("Data root {:?} is not a directory", root);
        }
    }

    let ctx = Arc::new(Context::new(config));

    let directory = Arc::clone(&ctx.directory);
    let stats = tokio::task::spawn_blocking(move || directory.refresh())
        .await
        .context("initial directory scan")?;
    tracing::info!(
        files = stats.files,
        days = stats.days,
        "Initial directory scan complete"
    );

    Server::new(ctx).run().await?;
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wavestore={}", config.logging.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}
