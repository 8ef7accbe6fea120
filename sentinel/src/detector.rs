//! Detector adapters.
//!
//! The sentinel never runs a model itself. A `Detector` turns one frame into the
//! set of class ids present in it; everything downstream works on that set.

use crate::core_modules::equipment::{ClassId, DetectedClasses};
use crate::error::{Result, SentinelError};
use crate::frame::encode_jpeg;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

pub trait Detector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Detections>;

    /// Called between unrelated videos. Stateless detectors have nothing to do.
    fn reset(&mut self) {}
}

impl<D: Detector + ?Sized> Detector for Box<D> {
    fn detect(&mut self, frame: &RgbImage) -> Result<Detections> {
        (**self).detect(frame)
    }

    fn reset(&mut self) {
        (**self).reset()
    }
}

/// One detection as reported by the inference service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDetection {
    pub class_id: ClassId,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in frame pixels, when the service reports boxes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f32; 4]>,
}

/// What a detector saw in one frame: the class set the policy checks, and any
/// boxes worth drawing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections {
    pub classes: DetectedClasses,
    pub boxes: Vec<RemoteDetection>,
}

impl From<DetectedClasses> for Detections {
    fn from(classes: DetectedClasses) -> Self {
        Self {
            classes,
            boxes: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    detections: Vec<RemoteDetection>,
}

/// Sends each frame as a JPEG to an HTTP inference endpoint.
pub struct RemoteDetector {
    client: reqwest::blocking::Client,
    endpoint: String,
    min_confidence: f32,
}

impl RemoteDetector {
    pub fn new(endpoint: impl Into<String>, min_confidence: f32, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            min_confidence,
        })
    }

    /// Keeps the detections whose confidence reaches the configured minimum.
    pub fn filter(&self, detections: Vec<RemoteDetection>) -> Detections {
        let kept: Vec<RemoteDetection> = detections
            .into_iter()
            .filter(|d| d.confidence >= self.min_confidence)
            .collect();
        Detections {
            classes: kept.iter().map(|d| d.class_id).collect(),
            boxes: kept.into_iter().filter(|d| d.bbox.is_some()).collect(),
        }
    }
}

impl Detector for RemoteDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Detections> {
        let jpeg = encode_jpeg(frame)?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .map_err(|e| SentinelError::Detector(format!("Inference request failed: {}", e)))?
            .error_for_status()
            .map_err(|e| SentinelError::Detector(format!("Inference service rejected frame: {}", e)))?;

        let body: DetectionResponse = response.json()?;
        debug!("Inference returned {} detections", body.detections.len());
        Ok(self.filter(body.detections))
    }
}

/// Replays recorded detections, one JSON array of class ids per line.
///
/// Blank lines and lines starting with `#` are ignored. `reset` rewinds to the
/// first frame, so one script can serve several videos.
pub struct ReplayDetector {
    frames: Vec<DetectedClasses>,
    cursor: usize,
}

impl ReplayDetector {
    pub fn from_path(path: &Path) -> Result<Self> {
        let script = std::fs::read_to_string(path)?;
        Self::from_script(&script)
    }

    pub fn from_script(script: &str) -> Result<Self> {
        let mut frames = Vec::new();
        for (index, line) in script.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let ids: Vec<ClassId> = serde_json::from_str(line).map_err(|e| {
                SentinelError::Detector(format!("Replay line {}: {}", index + 1, e))
            })?;
            frames.push(ids.into_iter().collect());
        }
        Ok(Self { frames, cursor: 0 })
    }

    pub fn remaining(&self) -> usize {
        self.frames.len() - self.cursor
    }
}

impl Detector for ReplayDetector {
    fn detect(&mut self, _frame: &RgbImage) -> Result<Detections> {
        let classes = self
            .frames
            .get(self.cursor)
            .cloned()
            .ok_or_else(|| SentinelError::Detector("Replay script exhausted".to_string()))?;
        self.cursor += 1;
        Ok(classes.into())
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }
}
