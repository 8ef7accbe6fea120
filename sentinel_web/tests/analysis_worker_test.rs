//! Uploaded videos through the analysis worker, using a generated MJPEG clip and
//! replayed detections.

use opencv::{
    core::{self, Mat, Scalar, Size},
    prelude::*,
    videoio::VideoWriter,
};
use sentinel::SentinelPipeline;
use sentinel::alert::AlertRouter;
use sentinel::core_modules::equipment::EquipmentPolicy;
use sentinel::detector::{Detector, ReplayDetector};
use sentinel_web::analysis::upload_file;
use sentinel_web::{AnalysisPipeline, AnalysisQueue, FrameBus, Meta, Phase, spawn_analysis_worker};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

const FRAMES: usize = 5;

fn clip() -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("clip.avi");
    let fourcc = VideoWriter::fourcc('M', 'J', 'P', 'G').unwrap();
    let mut writer = VideoWriter::new(path.to_str().unwrap(), fourcc, 10.0, Size::new(64, 48), true).unwrap();
    assert!(writer.is_opened().unwrap());

    for i in 0..FRAMES {
        let shade = Scalar::new(40.0, 80.0 + 20.0 * i as f64, 160.0, 0.0);
        let frame = Mat::new_rows_cols_with_default(48, 64, core::CV_8UC3, shade).unwrap();
        writer.write(&frame).unwrap();
    }
    writer.release().unwrap();
    std::fs::read(&path).unwrap()
}

fn worker(script: String, bus: &FrameBus) -> AnalysisQueue {
    let build = move || -> anyhow::Result<AnalysisPipeline> {
        let detector: Box<dyn Detector + Send> = Box::new(ReplayDetector::from_script(&script)?);
        Ok(SentinelPipeline::new(EquipmentPolicy::default(), detector, AlertRouter::new()))
    };
    spawn_analysis_worker(build, bus.clone()).unwrap()
}

fn submit(queue: &AnalysisQueue, data: &[u8], name: &str) -> (u64, PathBuf) {
    let mut file = upload_file("avi").unwrap();
    file.write_all(data).unwrap();
    let path = file.into_temp_path();
    let on_disk = path.to_path_buf();
    let job = queue.submit(path, name.to_string()).unwrap();
    (job, on_disk)
}

/// Collects one job's messages up to and including its final phase.
async fn run_of(metas: &mut broadcast::Receiver<Meta>, job: u64) -> Vec<Meta> {
    let collect = async {
        let mut seen = Vec::new();
        loop {
            let meta = metas.recv().await.unwrap();
            if meta.job != job {
                continue;
            }
            let finished = matches!(meta.phase, Phase::Complete | Phase::Failed);
            seen.push(meta);
            if finished {
                return seen;
            }
        }
    };
    timeout(Duration::from_secs(60), collect).await.unwrap()
}

#[tokio::test]
async fn consecutive_uploads_each_get_a_fresh_episode() {
    let bus = FrameBus::new(32);
    let mut metas = bus.meta_tx.subscribe();
    let mut frames = bus.frames_tx.subscribe();
    let queue = worker("[0, 11, 39, 27]\n".repeat(FRAMES), &bus);

    let video = clip();
    let (first, first_path) = submit(&queue, &video, "first.avi");
    let (second, second_path) = submit(&queue, &video, "second.avi");

    let first_run = run_of(&mut metas, first).await;
    let second_run = run_of(&mut metas, second).await;

    for run in [&first_run, &second_run] {
        let (last, progress) = run.split_last().unwrap();
        assert_eq!(last.phase, Phase::Complete, "{:?}", last.message);
        assert_eq!(progress.len(), FRAMES);
        for meta in progress {
            assert_eq!(meta.phase, Phase::Analyzing);
            assert!(meta.status.starts_with("HOLDING (Helmet, "), "{}", meta.status);
            assert_eq!(meta.severity, "warning");
            assert_eq!((meta.width, meta.height), (64, 48));
            assert_eq!(meta.alerts, 0);
        }
    }

    // Reset between videos: the second upload opens its own incident.
    assert!(first_run[0].incident_id.is_some());
    assert_ne!(first_run[0].incident_id, second_run[0].incident_id);

    assert!(!first_path.exists());
    assert!(!second_path.exists());

    let frame = frames.try_recv().unwrap();
    assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);
}

#[tokio::test]
async fn detector_failure_marks_job_failed_and_removes_upload() {
    let bus = FrameBus::new(32);
    let mut metas = bus.meta_tx.subscribe();
    // Two recorded frames for a five-frame video.
    let queue = worker("[0]\n[0]\n".to_string(), &bus);

    let video = clip();
    let (job, path) = submit(&queue, &video, "short_script.avi");
    let run = run_of(&mut metas, job).await;

    let (last, progress) = run.split_last().unwrap();
    assert_eq!(progress.len(), 2);
    assert_eq!(last.phase, Phase::Failed);
    assert!(last.message.as_deref().unwrap().contains("Replay script exhausted"));
    assert!(!path.exists());

    // The script rewinds, so the next upload gets as far again.
    let (retry, _) = submit(&queue, &video, "again.avi");
    let run = run_of(&mut metas, retry).await;
    assert_eq!(run.len(), 3);
    assert_eq!(run.last().unwrap().phase, Phase::Failed);
}
