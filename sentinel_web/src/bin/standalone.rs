use anyhow::{Context, bail};
use sentinel::detector::{Detector, ReplayDetector};
use sentinel::{SentinelConfig, SentinelPipeline};
use sentinel_web::{AnalysisPipeline, AppState, FrameBus, ServerConfig, spawn_analysis_worker, start_server};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(false))
            .with(env_filter)
            .init();
    }
}

/// SENTINEL_REPLAY selects a recorded detection script; otherwise the configured endpoint.
fn build_pipeline(config: SentinelConfig) -> anyhow::Result<AnalysisPipeline> {
    let detector: Box<dyn Detector + Send> = match std::env::var_os("SENTINEL_REPLAY").map(PathBuf::from) {
        Some(path) => {
            let replay = ReplayDetector::from_path(&path)
                .with_context(|| format!("loading replay script {}", path.display()))?;
            info!("Replaying {} recorded frames from {}", replay.remaining(), path.display());
            Box::new(replay)
        }
        None => match config.detector.remote()? {
            Some(remote) => Box::new(remote),
            None => bail!("no detector configured: set SENTINEL_DETECTOR_URL or SENTINEL_REPLAY"),
        },
    };
    let router = config.build_router()?;
    Ok(SentinelPipeline::new(config.policy.clone(), detector, router))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config_path = std::env::var_os("SENTINEL_CONFIG").map(PathBuf::from);
    let config = SentinelConfig::load(config_path.as_deref())?;
    let server_config = ServerConfig::from_env()?;

    let bus = FrameBus::new(4);
    let worker_bus = bus.clone();
    let queue = tokio::task::spawn_blocking(move || {
        spawn_analysis_worker(move || build_pipeline(config), worker_bus)
    })
    .await??;

    let handle = start_server(server_config, AppState { bus, queue }).await?;
    handle.await.ok();
    Ok(())
}
