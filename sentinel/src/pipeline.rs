// THEORY:
// The `pipeline` module is the top-level API of the sentinel. It wires the layers
// together into a single, easy-to-use interface that a frame loop can call once
// per frame:
//
//   frame -> Detector -> EquipmentPolicy::assess -> ViolationEpisode::advance
//         -> (on the threshold edge) AlertRouter::fire -> FrameReport
//
// The pipeline owns the episode state. Callers never see or mutate it directly;
// they feed frames in order and render whatever `FrameReport` comes back.
//
// Error policy: a detector failure is returned to the caller, which ends its
// loop. An alert delivery failure is not an error at this level. It is logged,
// recorded in the report, and the episode stays alerted either way.

use crate::alert::{AlertPayload, AlertRouter, DispatchOutcome};
use crate::core_modules::episode::{Status, ViolationEpisode};
use crate::core_modules::equipment::{DetectedClasses, EquipmentPolicy};
use crate::core_modules::incident::IncidentId;
use crate::detector::{Detector, RemoteDetection};
use crate::error::Result;
use crate::frame::encode_jpeg;
use chrono::Local;
use image::RgbImage;
use std::time::Instant;
use tracing::{debug, info, warn};

// Re-export key data structures for the public API.
pub use crate::core_modules::episode::{FireAlert, Severity};

/// The record of an alert raised on this frame.
#[derive(Debug, Clone)]
pub struct AlertRecord {
    pub incident_id: IncidentId,
    pub description: String,
    pub outcomes: Vec<DispatchOutcome>,
}

impl AlertRecord {
    pub fn delivered_anywhere(&self) -> bool {
        self.outcomes.iter().any(|o| o.delivered)
    }
}

#[derive(Debug, Clone)]
pub enum Report {
    Quiet,
    AlertRaised(AlertRecord),
}

/// The primary output of the pipeline for a single frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub status: Status,
    pub detected: DetectedClasses,
    /// Boxes reported by the detector, for drawing.
    pub boxes: Vec<RemoteDetection>,
    pub report: Report,
}

impl FrameReport {
    pub fn alert(&self) -> Option<&AlertRecord> {
        match &self.report {
            Report::AlertRaised(record) => Some(record),
            Report::Quiet => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames: u64,
    pub alerts: u64,
}

pub struct SentinelPipeline<D: Detector> {
    policy: EquipmentPolicy,
    detector: D,
    router: AlertRouter,
    episode: ViolationEpisode,
    stats: PipelineStats,
}

impl<D: Detector> SentinelPipeline<D> {
    pub fn new(policy: EquipmentPolicy, detector: D, router: AlertRouter) -> Self {
        Self {
            policy,
            detector,
            router,
            episode: ViolationEpisode::Closed,
            stats: PipelineStats::default(),
        }
    }

    /// Runs one frame through detection, compliance and the debounce state machine.
    ///
    /// `now` must not go backwards between calls.
    pub fn process_frame(&mut self, frame: &RgbImage, now: Instant) -> Result<FrameReport> {
        let detections = self.detector.detect(frame)?;
        let detected = detections.classes;
        let compliance = self.policy.assess(&detected);
        self.stats.frames += 1;

        let was_open = self.episode.is_open();
        let episode = std::mem::take(&mut self.episode);
        let step = episode.advance(&compliance, now, self.policy.threshold, IncidentId::mint);
        self.episode = step.episode;

        match (was_open, self.episode.incident_id()) {
            (false, Some(id)) => info!(
                incident = id.short(),
                missing = %compliance.description(),
                "Violation detected, starting timer"
            ),
            (true, None) => info!("Violation cleared"),
            _ => {}
        }
        debug!(frame = self.stats.frames, classes = ?detected.sorted(), status = %step.status, "Frame processed");

        let report = match step.alert {
            Some(alert) => {
                self.stats.alerts += 1;
                Report::AlertRaised(self.raise(alert, frame))
            }
            None => Report::Quiet,
        };

        Ok(FrameReport {
            status: step.status,
            detected,
            boxes: detections.boxes,
            report,
        })
    }

    fn raise(&self, alert: FireAlert, frame: &RgbImage) -> AlertRecord {
        let description = alert.description();
        info!(
            incident = alert.incident_id.short(),
            missing = %description,
            "Persistent violation confirmed, raising alert"
        );

        let frame_jpeg = match encode_jpeg(frame) {
            Ok(jpeg) => Some(jpeg),
            Err(e) => {
                warn!("Failed to encode evidence frame: {}", e);
                None
            }
        };

        let payload = AlertPayload {
            incident_id: alert.incident_id.clone(),
            description: description.clone(),
            frame_jpeg,
            raised_at: Local::now(),
        };
        let outcomes = self.router.fire(&payload);

        AlertRecord {
            incident_id: alert.incident_id,
            description,
            outcomes,
        }
    }

    /// Closes any open episode and rewinds the detector, e.g. between two unrelated videos.
    pub fn reset(&mut self) {
        self.episode = ViolationEpisode::Closed;
        self.detector.reset();
    }

    pub fn episode(&self) -> &ViolationEpisode {
        &self.episode
    }

    pub fn policy(&self) -> &EquipmentPolicy {
        &self.policy
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }
}
