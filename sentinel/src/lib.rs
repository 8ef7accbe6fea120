// THEORY:
// This file is the main entry point for the `sentinel` library crate. It defines
// the public API consumed by the desktop tester (`sentinel_camera`) and the web
// front end (`sentinel_web`).
//
// The primary export is `SentinelPipeline`, which takes one frame at a time and
// answers with a `FrameReport`: what to show the operator, and whether an alert
// was raised. The debounce state machine (`core_modules::episode`) is the heart of
// the crate; detectors, alert dispatchers and configuration are the adapters
// around it.

pub mod alert;
pub mod config;
pub mod core_modules;
pub mod detector;
pub mod error;
pub mod frame;
pub mod pipeline;
#[cfg(feature = "opencv")]
pub mod video;

pub use config::SentinelConfig;
pub use error::{Result, SentinelError};
pub use pipeline::{FrameReport, Report, SentinelPipeline};
