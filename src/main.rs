//! Warden process bootstrap: CLI, logging, config, engine loop.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use warden::config::{self, AppConfig};
use warden::curves::CurveTable;
use warden::{Engine, HttpExecutor, PrometheusSource, TracingExporter};

#[derive(Parser, Debug)]
#[command(name = "warden", about = "Automated operations decision engine")]
struct Args {
    /// Path to the engine TOML config
    #[arg(short, long, env = "WARDEN_CONFIG", default_value = "warden.toml")]
    config: String,

    /// Log in JSON instead of human-readable lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let app = AppConfig::load(&args.config)
        .with_context(|| format!("loading engine config from {}", args.config))?;
    let (site, groups) = config::load_site_with_groups(&app).context("loading site config")?;
    let curves = CurveTable::load_dir(&app.curve_dir).context("loading curves")?;

    info!(
        site = %site.name,
        groups = groups.len(),
        curves = curves.len(),
        "configuration loaded"
    );

    let engine = Arc::new(Engine::new(
        app,
        site,
        groups,
        curves,
        Arc::new(PrometheusSource::new()),
        Arc::new(HttpExecutor::new()),
        Arc::new(TracingExporter),
    ));

    // Shutdown is a single flag the driver observes at cycle boundaries;
    // in-flight queries complete or time out on their own.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    engine.run(cancel).await;
    Ok(())
}
