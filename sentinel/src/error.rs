//! Error types for the sentinel library.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Detector error: {0}")]
    Detector(String),

    #[error("Frame source error: {0}")]
    FrameSource(String),

    #[error("Alert error: {0}")]
    Alert(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "opencv")]
    #[error("OpenCV error: {0}")]
    OpenCv(String),
}

#[cfg(feature = "opencv")]
impl From<opencv::Error> for SentinelError {
    fn from(err: opencv::Error) -> Self {
        SentinelError::OpenCv(err.message)
    }
}

pub type Result<T> = std::result::Result<T, SentinelError>;
