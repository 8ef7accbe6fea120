use anyhow::{Context, bail};
use clap::Parser;
use opencv::{
    core::{self, Mat},
    highgui,
    prelude::*,
    videoio::VideoWriter,
};
use sentinel::detector::{Detector, ReplayDetector};
use sentinel::video::{VideoSource, draw_detections, draw_status};
use sentinel::{Report, SentinelConfig, SentinelPipeline};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const WINDOW_NAME: &str = "PPE Sentinel";

/// Watches a camera (or a video file) for people missing required safety equipment.
#[derive(Debug, Parser)]
#[command(name = "sentinel_camera", version)]
struct Args {
    /// Camera device index.
    #[arg(long, default_value_t = 0, conflicts_with = "input")]
    camera: i32,

    /// Read frames from a video file instead of a camera.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Write the annotated frames to this file (mp4v).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Replay recorded detections (one JSON array of class ids per frame).
    #[arg(long, conflicts_with = "detector_url")]
    replay: Option<PathBuf>,

    /// Inference endpoint; overrides the config file and SENTINEL_DETECTOR_URL.
    #[arg(long)]
    detector_url: Option<String>,

    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Do not open a display window.
    #[arg(long)]
    headless: bool,
}

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

fn build_detector(args: &Args, config: &SentinelConfig) -> anyhow::Result<Box<dyn Detector>> {
    if let Some(path) = &args.replay {
        let detector = ReplayDetector::from_path(path)
            .with_context(|| format!("loading replay script {}", path.display()))?;
        info!("Replaying {} recorded frames from {}", detector.remaining(), path.display());
        return Ok(Box::new(detector));
    }

    let mut detector_config = config.detector.clone();
    if let Some(url) = &args.detector_url {
        detector_config.endpoint = Some(url.clone());
    }
    match detector_config.remote()? {
        Some(remote) => Ok(Box::new(remote)),
        None => bail!("no detector configured: pass --replay, --detector-url or set SENTINEL_DETECTOR_URL"),
    }
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let args = Args::parse();

    // --- 1. Configuration & Collaborators ---
    let config = SentinelConfig::load(args.config.as_deref())?;
    let detector = build_detector(&args, &config)?;
    let router = config.build_router()?;
    let mut pipeline = SentinelPipeline::new(config.policy.clone(), detector, router);

    // --- 2. Video I/O Initialization ---
    let mut source = match &args.input {
        Some(path) => VideoSource::file(path)?,
        None => VideoSource::camera(args.camera)?,
    };

    let mut writer = match &args.output {
        Some(path) => {
            let (width, height) = source.frame_size()?;
            let fourcc = VideoWriter::fourcc('m', 'p', '4', 'v')?;
            let name = path.to_str().context("output path must be UTF-8")?;
            Some(VideoWriter::new(name, fourcc, source.fps(), core::Size::new(width, height), true)?)
        }
        None => None,
    };

    if !args.headless {
        highgui::named_window(WINDOW_NAME, highgui::WINDOW_AUTOSIZE)?;
    }
    info!(
        threshold_secs = config.policy.threshold.as_secs_f64(),
        "Vision agent running; press 'q' to quit"
    );

    // --- 3. Main Processing Loop ---
    loop {
        let captured = match source.next_frame() {
            Ok(Some(captured)) => captured,
            Ok(None) => {
                info!("End of video stream");
                break;
            }
            Err(e) => {
                error!("Error reading frame: {}", e);
                break;
            }
        };

        let report = match pipeline.process_frame(&captured.rgb, captured.at) {
            Ok(report) => report,
            Err(e) => {
                error!("Detector unavailable, stopping: {}", e);
                break;
            }
        };

        if let Report::AlertRaised(record) = &report.report {
            if !record.delivered_anywhere() {
                warn!(incident = record.incident_id.short(), "Alert raised but not delivered");
            }
        }

        // --- 4. Visualization ---
        let mut annotated: Mat = captured.mat;
        draw_detections(&mut annotated, &report.boxes, &config.policy)?;
        draw_status(&mut annotated, &report.status)?;

        if let Some(writer) = writer.as_mut() {
            writer.write(&annotated)?;
        }

        if !args.headless {
            highgui::imshow(WINDOW_NAME, &annotated)?;
            let key = highgui::wait_key(1)?;
            if key == 'q' as i32 || key == 'Q' as i32 {
                info!("Quit requested");
                break;
            }
        }
    }

    if let Some(mut writer) = writer {
        writer.release()?;
        if let Some(path) = &args.output {
            info!("Annotated output saved to {}", path.display());
        }
    }
    if !args.headless {
        highgui::destroy_all_windows()?;
    }

    let stats = pipeline.stats();
    info!(frames = stats.frames, alerts = stats.alerts, "Sentinel shut down");
    Ok(())
}
