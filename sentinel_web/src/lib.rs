use std::sync::Arc;

use anyhow::Context;
use axum::extract::multipart::Field;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

pub mod analysis;

pub use analysis::{AnalysisJob, AnalysisPipeline, AnalysisQueue, spawn_analysis_worker};

/// Video containers accepted by the upload endpoint.
pub const ACCEPTED_EXTENSIONS: &[&str] = &["mp4", "mov", "avi"];

/// One annotated JPEG frame, ready to send to browsers. Its job and position
/// travel in the `Meta` published right after it.
#[derive(Debug, Clone)]
pub struct FramePacket {
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Queued,
    Analyzing,
    Complete,
    Failed,
}

/// Status message streamed alongside the frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub job: u64,
    pub phase: Phase,
    pub frame_index: u64,
    pub width: u32,
    pub height: u32,
    pub status: String,
    pub severity: String,
    pub incident_id: Option<String>,
    pub alerts: u64,
    pub message: Option<String>,
}

impl Meta {
    pub fn phase(job: u64, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            job,
            phase,
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
pub struct FrameBus {
    pub frames_tx: broadcast::Sender<FramePacket>,
    pub meta_tx: broadcast::Sender<Meta>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (frames_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        let (meta_tx, _) = broadcast::channel::<Meta>(capacity.max(1) * 4);
        Self { frames_tx, meta_tx }
    }

    /// Publishing with nobody watching is not an error.
    pub fn publish_frame(&self, packet: FramePacket) {
        let _ = self.frames_tx.send(packet);
    }

    pub fn publish_meta(&self, meta: Meta) {
        let _ = self.meta_tx.send(meta);
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3001".to_string(),
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads `SENTINEL_BIND` and `SENTINEL_MAX_UPLOAD_BYTES` through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(bind) = lookup("SENTINEL_BIND") {
            config.bind_addr = bind;
        }
        if let Some(v) = lookup("SENTINEL_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = v
                .trim()
                .parse()
                .with_context(|| format!("SENTINEL_MAX_UPLOAD_BYTES='{}' is not a byte count", v))?;
        }
        Ok(config)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub bus: FrameBus,
    pub queue: AnalysisQueue,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadAccepted {
    pub job: u64,
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>PPE Sentinel</title></head>
<body style="font-family:sans-serif; margin:24px;">
  <h2>AI Safety Compliance Sentinel</h2>
  <div id="status" style="font-family:monospace; padding:8px; background:#eef; margin-bottom:12px;">Starting Vision Agent... Please upload a video file.</div>
  <form id="upload">
    <input type="file" id="video" accept=".mp4,.mov,.avi">
    <button type="submit">Analyze</button>
  </form>
  <img id="preview" alt="Live AI Analysis" style="margin-top:12px; max-width:100%; border:1px solid #444">
  <script>
  (function(){
    const status = document.getElementById('status');
    const preview = document.getElementById('preview');
    const colours = { ok: '#e6ffe6', warning: '#fff3e0', alert: '#ffe6e6' };
    let lastUrl = null;
    const ws = new WebSocket((location.protocol==='https:'?'wss://':'ws://')+location.host+'/ws/status');
    ws.binaryType = 'arraybuffer';
    ws.onmessage = (ev) => {
      if (ev.data instanceof ArrayBuffer) {
        const url = URL.createObjectURL(new Blob([ev.data], {type:'image/jpeg'}));
        preview.src = url;
        if (lastUrl) URL.revokeObjectURL(lastUrl);
        lastUrl = url;
        return;
      }
      const meta = JSON.parse(ev.data);
      if (meta.phase === 'analyzing' && meta.status) {
        status.textContent = meta.status + ' | alerts: ' + meta.alerts;
        status.style.background = colours[meta.severity] || '#eef';
      } else if (meta.message) {
        status.textContent = meta.message;
        status.style.background = meta.phase === 'failed' ? '#ffe6e6' : '#eef';
      }
    };
    document.getElementById('upload').onsubmit = async (ev) => {
      ev.preventDefault();
      const file = document.getElementById('video').files[0];
      if (!file) return;
      const body = new FormData();
      body.append('video', file);
      status.textContent = 'Uploading ' + file.name + '...';
      const resp = await fetch('/upload', { method: 'POST', body });
      if (!resp.ok) { status.textContent = 'Upload failed: ' + await resp.text(); }
    };
  })();
  </script>
</body>
</html>
"#;

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

fn accepted_extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    ACCEPTED_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadAccepted>), (StatusCode, String)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("video") {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_string();
        let ext = accepted_extension(&file_name).ok_or_else(|| {
            (
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("expected one of {:?}, got '{}'", ACCEPTED_EXTENSIONS, file_name),
            )
        })?;
        let path = store_upload(field, &ext).await?;

        let job = state
            .queue
            .submit(path, file_name.clone())
            .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))?;
        state
            .bus
            .publish_meta(Meta::phase(job, Phase::Queued, format!("Queued {}", file_name)));
        info!(job, file = %file_name, "Upload queued for analysis");
        return Ok((StatusCode::ACCEPTED, Json(UploadAccepted { job })));
    }

    Err((StatusCode::BAD_REQUEST, "missing 'video' file field".to_string()))
}

fn storage_error(e: std::io::Error) -> (StatusCode, String) {
    error!("Failed to store upload: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "failed to store upload".to_string())
}

/// Streams a multipart field to a temporary file. A partial file is removed on error.
async fn store_upload(mut field: Field<'_>, ext: &str) -> Result<TempPath, (StatusCode, String)> {
    let (file, path) = analysis::upload_file(ext).map_err(storage_error)?.into_parts();
    let mut file = tokio::fs::File::from_std(file);

    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("failed to read upload: {e}")))?
    {
        file.write_all(&chunk).await.map_err(storage_error)?;
    }
    file.flush().await.map_err(storage_error)?;
    Ok(path)
}

async fn ws_status(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_status(socket, state.bus))
}

async fn stream_status(mut socket: WebSocket, bus: FrameBus) {
    let mut frames = bus.frames_tx.subscribe();
    let mut metas = bus.meta_tx.subscribe();

    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(packet) => {
                    if socket.send(Message::Binary(packet.data.to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },
            meta = metas.recv() => match meta {
                Ok(meta) => {
                    let Ok(text) = serde_json::to_string(&meta) else { continue };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Status subscriber lagging"),
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

pub fn router(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/upload", post(upload))
        .route("/ws/status", get(ws_status))
        .route("/healthz", get(|| async { "ok" }))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(state)
}

pub async fn start_server(cfg: ServerConfig, state: AppState) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = router(state, cfg.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    info!("Sentinel web UI listening on http://{}", cfg.bind_addr);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(server)
}
