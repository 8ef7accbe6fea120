//! Background analysis of uploaded videos.
//!
//! Uploads are analysed one at a time on a dedicated OS thread. The OpenCV decoder
//! and the blocking detector client both live there, away from the async runtime;
//! the HTTP side only submits jobs and watches the [`FrameBus`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sentinel::detector::Detector;
use sentinel::frame::encode_jpeg;
use sentinel::video::{VideoSource, draw_detections, draw_status, mat_to_rgb};
use sentinel::{Report, SentinelPipeline};
use tempfile::{NamedTempFile, TempPath};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::{FrameBus, FramePacket, Meta, Phase};

pub type AnalysisPipeline = SentinelPipeline<Box<dyn Detector + Send>>;

/// An uploaded video waiting for analysis. The file is removed when the job is dropped.
#[derive(Debug)]
pub struct AnalysisJob {
    pub id: u64,
    pub file_name: String,
    pub path: TempPath,
}

#[derive(Clone)]
pub struct AnalysisQueue {
    tx: mpsc::UnboundedSender<AnalysisJob>,
    next_id: Arc<AtomicU64>,
}

impl AnalysisQueue {
    /// A queue and the receiving end a worker drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AnalysisJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (queue, rx)
    }

    pub fn submit(&self, path: TempPath, file_name: String) -> anyhow::Result<u64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(AnalysisJob { id, file_name, path })
            .map_err(|_| anyhow::anyhow!("analysis worker is not running"))?;
        Ok(id)
    }
}

/// Creates the temporary file an upload is streamed into. OpenCV picks the
/// demuxer from the extension, so it is kept.
pub fn upload_file(extension: &str) -> std::io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix("sentinel-upload-")
        .suffix(&format!(".{}", extension))
        .tempfile()
}

/// Starts the worker thread and returns the queue that feeds it.
///
/// The pipeline is built on the worker thread itself: the blocking HTTP client
/// used by remote detectors must not be created inside the async runtime.
pub fn spawn_analysis_worker<F>(build: F, bus: FrameBus) -> anyhow::Result<AnalysisQueue>
where
    F: FnOnce() -> anyhow::Result<AnalysisPipeline> + Send + 'static,
{
    let (queue, mut rx) = AnalysisQueue::new();
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<anyhow::Result<()>>(1);

    std::thread::Builder::new()
        .name("sentinel-analysis".to_string())
        .spawn(move || {
            let mut pipeline = match build() {
                Ok(pipeline) => {
                    let _ = ready_tx.send(Ok(()));
                    pipeline
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            while let Some(job) = rx.blocking_recv() {
                info!(job = job.id, file = %job.file_name, "Analysis started");
                let outcome = analyse(&mut pipeline, &job, &bus);
                pipeline.reset();

                // The upload is gone before anyone hears the job finished.
                let id = job.id;
                if let Err(e) = job.path.close() {
                    warn!(job = id, "Failed to remove upload: {}", e);
                }

                match outcome {
                    Ok(frames) => {
                        info!(job = id, frames, "Analysis complete");
                        bus.publish_meta(Meta::phase(
                            id,
                            Phase::Complete,
                            format!("Analysis complete: {} frames", frames),
                        ));
                    }
                    Err(e) => {
                        error!(job = id, "Analysis failed: {}", e);
                        bus.publish_meta(Meta::phase(id, Phase::Failed, e.to_string()));
                    }
                }
            }
            info!("Analysis queue closed");
        })?;

    ready_rx
        .recv()
        .map_err(|_| anyhow::anyhow!("analysis worker exited during startup"))??;
    Ok(queue)
}

fn analyse(pipeline: &mut AnalysisPipeline, job: &AnalysisJob, bus: &FrameBus) -> sentinel::Result<u64> {
    let mut source = VideoSource::file(&job.path)?;
    let alerts_before = pipeline.stats().alerts;
    let mut frame_index = 0u64;

    while let Some(captured) = source.next_frame()? {
        let report = pipeline.process_frame(&captured.rgb, captured.at)?;
        if let Report::AlertRaised(record) = &report.report {
            if !record.delivered_anywhere() {
                warn!(incident = record.incident_id.short(), "Alert raised but not delivered");
            }
        }

        let mut annotated = captured.mat;
        draw_detections(&mut annotated, &report.boxes, pipeline.policy())?;
        draw_status(&mut annotated, &report.status)?;
        let rgb = mat_to_rgb(&annotated)?;
        let jpeg = encode_jpeg(&rgb)?;

        bus.publish_frame(FramePacket {
            data: Arc::from(jpeg),
        });
        bus.publish_meta(Meta {
            job: job.id,
            phase: Phase::Analyzing,
            frame_index,
            width: rgb.width(),
            height: rgb.height(),
            status: report.status.to_string(),
            severity: report.status.severity().as_str().to_string(),
            incident_id: pipeline.episode().incident_id().map(|id| id.to_string()),
            alerts: pipeline.stats().alerts - alerts_before,
            message: None,
        });
        frame_index += 1;
    }

    Ok(frame_index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn upload(data: &[u8], extension: &str) -> TempPath {
        let mut file = upload_file(extension).unwrap();
        file.write_all(data).unwrap();
        file.into_temp_path()
    }

    #[test]
    fn upload_file_keeps_extension_and_is_removed_on_drop() {
        let path = upload(b"not really a video", "mp4");
        let owned = path.to_path_buf();
        assert_eq!(owned.extension().unwrap(), "mp4");
        assert_eq!(std::fs::read(&owned).unwrap(), b"not really a video");
        drop(path);
        assert!(!owned.exists());
    }

    #[test]
    fn job_ids_increase() {
        let (queue, mut rx) = AnalysisQueue::new();
        let first = queue.submit(upload(b"a", "mp4"), "a.mp4".into()).unwrap();
        let second = queue.submit(upload(b"b", "avi"), "b.avi".into()).unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(rx.try_recv().unwrap().file_name, "a.mp4");
        assert_eq!(rx.try_recv().unwrap().id, 2);
    }

    #[test]
    fn submit_fails_once_worker_is_gone() {
        let (queue, rx) = AnalysisQueue::new();
        drop(rx);
        assert!(queue.submit(upload(b"", "mp4"), "x.mp4".into()).is_err());
    }
}
