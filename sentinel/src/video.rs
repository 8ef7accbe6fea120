//! OpenCV frame sources and overlay drawing.

use crate::core_modules::episode::Status;
use crate::core_modules::equipment::EquipmentPolicy;
use crate::detector::RemoteDetection;
use crate::error::{Result, SentinelError};
use image::RgbImage;
use opencv::{
    core::{Mat, Point, Rect, Scalar},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;

const FALLBACK_FPS: f64 = 30.0;

/// How a source stamps its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBase {
    /// Live sources: the moment the frame was read.
    WallClock,
    /// Files: the frame's position in the media, so debounce follows video time
    /// rather than decoding speed.
    MediaPosition,
}

pub struct CapturedFrame {
    /// The frame as decoded (BGR).
    pub mat: Mat,
    pub rgb: RgbImage,
    pub at: Instant,
}

pub struct VideoSource {
    capture: VideoCapture,
    time_base: TimeBase,
    origin: Instant,
    frames_read: u64,
    fps: f64,
}

impl VideoSource {
    pub fn camera(index: i32) -> Result<Self> {
        let capture = VideoCapture::new(index, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(SentinelError::FrameSource(format!("Camera {} failed to open", index)));
        }
        info!("Camera {} opened", index);
        Self::from_capture(capture, TimeBase::WallClock)
    }

    pub fn file(path: &Path) -> Result<Self> {
        let name = path
            .to_str()
            .ok_or_else(|| SentinelError::FrameSource(format!("Non UTF-8 path {:?}", path)))?;
        let capture = VideoCapture::from_file(name, videoio::CAP_ANY)?;
        if !capture.is_opened()? {
            return Err(SentinelError::FrameSource(format!("Could not open video file {}", name)));
        }
        info!("Video file {} opened", name);
        Self::from_capture(capture, TimeBase::MediaPosition)
    }

    fn from_capture(capture: VideoCapture, time_base: TimeBase) -> Result<Self> {
        let fps = capture.get(videoio::CAP_PROP_FPS)?;
        Ok(Self {
            capture,
            time_base,
            origin: Instant::now(),
            frames_read: 0,
            fps: if fps.is_finite() && fps > 0.0 { fps } else { FALLBACK_FPS },
        })
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn frame_size(&self) -> Result<(i32, i32)> {
        let width = self.capture.get(videoio::CAP_PROP_FRAME_WIDTH)?;
        let height = self.capture.get(videoio::CAP_PROP_FRAME_HEIGHT)?;
        Ok((width as i32, height as i32))
    }

    /// Reads the next frame. `None` means the stream has ended.
    pub fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        let mut mat = Mat::default();
        if !self.capture.read(&mut mat)? || mat.empty() {
            return Ok(None);
        }

        let at = match self.time_base {
            TimeBase::WallClock => Instant::now(),
            TimeBase::MediaPosition => {
                let position = self.capture.get(videoio::CAP_PROP_POS_MSEC)?;
                self.origin + media_offset(position, self.frames_read, self.fps)
            }
        };
        self.frames_read += 1;

        let rgb = mat_to_rgb(&mat)?;
        Ok(Some(CapturedFrame { mat, rgb, at }))
    }
}

/// Offset of a frame from the start of the media. Uses the container position when
/// the backend reports one, otherwise the frame count.
pub fn media_offset(position_msec: f64, frames_read: u64, fps: f64) -> Duration {
    let msec = if position_msec.is_finite() && position_msec > 0.0 {
        position_msec
    } else {
        frames_read as f64 / fps * 1000.0
    };
    Duration::from_secs_f64(msec / 1000.0)
}

/// Converts a BGR frame to an RGB image.
pub fn mat_to_rgb(mat: &Mat) -> Result<RgbImage> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
    let data = rgb.data_bytes()?.to_vec();
    RgbImage::from_raw(width, height, data)
        .ok_or_else(|| SentinelError::FrameSource("Frame buffer size mismatch".to_string()))
}

/// Draws the status line in the top-left corner, coloured by severity.
pub fn draw_status(frame: &mut Mat, status: &Status) -> Result<()> {
    let [r, g, b] = status.severity().rgb();
    imgproc::put_text(
        frame,
        &status.to_string(),
        Point::new(50, 50),
        imgproc::FONT_HERSHEY_DUPLEX,
        0.65,
        Scalar::new(b as f64, g as f64, r as f64, 0.0),
        2,
        imgproc::LINE_8,
        false,
    )?;
    Ok(())
}

/// Detection boxes, BGR.
const BOX_COLOUR: (f64, f64, f64) = (255.0, 200.0, 0.0);

/// Outlines each reported box and labels it with its class and confidence.
pub fn draw_detections(frame: &mut Mat, boxes: &[RemoteDetection], policy: &EquipmentPolicy) -> Result<()> {
    let colour = Scalar::new(BOX_COLOUR.0, BOX_COLOUR.1, BOX_COLOUR.2, 0.0);
    for detection in boxes {
        let Some([x1, y1, x2, y2]) = detection.bbox else { continue };
        let (left, top) = (x1.round() as i32, y1.round() as i32);
        let (width, height) = ((x2 - x1).round() as i32, (y2 - y1).round() as i32);
        if width <= 0 || height <= 0 {
            continue;
        }
        imgproc::rectangle(frame, Rect::new(left, top, width, height), colour, 2, imgproc::LINE_8, 0)?;

        let label = match policy.label_for(detection.class_id) {
            Some(label) => format!("{} {:.2}", label, detection.confidence),
            None => format!("class {} {:.2}", detection.class_id, detection.confidence),
        };
        imgproc::put_text(
            frame,
            &label,
            Point::new(left, (top - 6).max(12)),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            colour,
            1,
            imgproc::LINE_8,
            false,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core;
    use std::time::Duration;

    fn black(rows: i32, cols: i32) -> Mat {
        Mat::new_rows_cols_with_default(rows, cols, core::CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    fn pixel(mat: &Mat, row: usize, col: usize) -> [u8; 3] {
        let cols = mat.cols() as usize;
        let bytes = mat.data_bytes().unwrap();
        let i = (row * cols + col) * 3;
        [bytes[i], bytes[i + 1], bytes[i + 2]]
    }

    /// Every pixel the overlay touched, as BGR.
    fn painted(mat: &Mat) -> Vec<[u8; 3]> {
        mat.data_bytes()
            .unwrap()
            .chunks(3)
            .filter(|px| px.iter().any(|&c| c != 0))
            .map(|px| [px[0], px[1], px[2]])
            .collect()
    }

    #[test]
    fn mat_to_rgb_swaps_channels() {
        let mut bgr = black(1, 2);
        bgr.data_bytes_mut().unwrap().copy_from_slice(&[10, 20, 30, 200, 150, 100]);

        let rgb = mat_to_rgb(&bgr).unwrap();
        assert_eq!((rgb.width(), rgb.height()), (2, 1));
        assert_eq!(rgb.get_pixel(0, 0).0, [30, 20, 10]);
        assert_eq!(rgb.get_pixel(1, 0).0, [100, 150, 200]);
    }

    #[test]
    fn alerted_status_is_drawn_in_red() {
        let mut frame = black(80, 400);
        draw_status(&mut frame, &Status::Alerted { missing: "Helmet".to_string() }).unwrap();
        let painted = painted(&frame);
        assert!(!painted.is_empty());
        assert!(painted.iter().all(|px| *px == [0, 0, 255]));
    }

    #[test]
    fn holding_status_is_drawn_in_orange() {
        let mut frame = black(80, 400);
        let status = Status::Holding {
            missing: "Gloves".to_string(),
            remaining: Duration::from_millis(2500),
        };
        draw_status(&mut frame, &status).unwrap();
        let painted = painted(&frame);
        assert!(!painted.is_empty());
        assert!(painted.iter().all(|px| *px == [0, 165, 255]));
    }

    #[test]
    fn detections_are_outlined() {
        let mut frame = black(60, 60);
        let boxes = vec![
            RemoteDetection { class_id: 0, confidence: 0.9, bbox: Some([10.0, 10.0, 40.0, 30.0]) },
            RemoteDetection { class_id: 4, confidence: 0.8, bbox: None },
        ];
        draw_detections(&mut frame, &boxes, &EquipmentPolicy::default()).unwrap();

        assert_eq!(pixel(&frame, 20, 10), [255, 200, 0]);
        assert_eq!(pixel(&frame, 20, 25), [0, 0, 0]);
    }

    #[test]
    fn media_offset_prefers_container_position() {
        assert_eq!(media_offset(1500.0, 3, 30.0), Duration::from_millis(1500));
    }

    #[test]
    fn media_offset_falls_back_to_frame_count() {
        assert_eq!(media_offset(0.0, 60, 30.0), Duration::from_secs(2));
        assert_eq!(media_offset(f64::NAN, 15, 30.0), Duration::from_millis(500));
    }
}
