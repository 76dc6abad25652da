//! Model downloader — resumable fetch of the on-device Kokoro files.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tracing::info;

use lector_core::types::{DownloadProgress, ModelInfo, KOKORO_MODEL, KOKORO_VOICES};

/// Paths of the installed on-device model files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub model: PathBuf,
    pub voices: PathBuf,
}

impl ModelFiles {
    pub fn in_dir(models_dir: &Path) -> Self {
        Self {
            model: model_path(models_dir, &KOKORO_MODEL),
            voices: model_path(models_dir, &KOKORO_VOICES),
        }
    }

    pub fn installed(&self) -> bool {
        self.model.is_file() && self.voices.is_file()
    }
}

/// Default models directory: `<data dir>/lector/models`.
pub fn default_models_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("lector")
        .join("models")
}

pub fn model_exists(models_dir: &Path, model: &ModelInfo) -> bool {
    model_path(models_dir, model).is_file()
}

pub fn model_path(models_dir: &Path, model: &ModelInfo) -> PathBuf {
    models_dir.join(model.filename)
}

fn progress(model: &ModelInfo, bytes_done: u64, bytes_total: u64, status: &str) -> DownloadProgress {
    let percent = if bytes_total == 0 {
        100.0
    } else {
        (bytes_done as f32 / bytes_total as f32 * 100.0).min(100.0)
    };
    DownloadProgress {
        model: model.name.to_string(),
        percent,
        bytes_done,
        bytes_total,
        status: status.to_string(),
    }
}

/// Total file size from a `Content-Range: bytes a-b/total` header value.
fn content_range_total(header: Option<&str>) -> Option<u64> {
    header?.rsplit('/').next()?.trim().parse().ok()
}

/// Download one model file, resuming a `.partial` file if present.
pub async fn download_model(
    models_dir: &Path,
    model: &ModelInfo,
    on_progress: impl Fn(DownloadProgress),
) -> Result<PathBuf, String> {
    tokio::fs::create_dir_all(models_dir)
        .await
        .map_err(|e| format!("failed to create models dir: {e}"))?;

    let dest = model_path(models_dir, model);
    if dest.is_file() {
        on_progress(progress(model, model.expected_size, model.expected_size, "complete"));
        return Ok(dest);
    }

    let partial = models_dir.join(format!("{}.partial", model.filename));
    let existing_size = tokio::fs::metadata(&partial)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    let mut req = reqwest::Client::new().get(model.url);
    if existing_size > 0 {
        info!("download: resuming {} at {existing_size} bytes", model.name);
        req = req.header("Range", format!("bytes={existing_size}-"));
    }

    let resp = req
        .send()
        .await
        .map_err(|e| format!("download request failed: {e}"))?;

    let resumed = resp.status() == StatusCode::PARTIAL_CONTENT;
    if !resp.status().is_success() {
        return Err(format!("download failed with status {}", resp.status()));
    }

    // A server that ignores Range restarts from zero.
    let (mut bytes_done, total_size) = if resumed {
        let header = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok());
        (
            existing_size,
            content_range_total(header).unwrap_or(model.expected_size),
        )
    } else {
        (0, resp.content_length().unwrap_or(model.expected_size))
    };

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(resumed)
        .truncate(!resumed)
        .open(&partial)
        .await
        .map_err(|e| format!("failed to open partial file: {e}"))?;

    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("download stream error: {e}"))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("failed to write chunk: {e}"))?;

        bytes_done += chunk.len() as u64;
        on_progress(progress(model, bytes_done, total_size, "downloading"));
    }

    file.flush()
        .await
        .map_err(|e| format!("flush failed: {e}"))?;
    drop(file);

    tokio::fs::rename(&partial, &dest)
        .await
        .map_err(|e| format!("failed to finalize download: {e}"))?;

    on_progress(progress(model, total_size, total_size, "complete"));
    Ok(dest)
}

/// Ensure the Kokoro model and voices are present.
pub async fn ensure_models(
    models_dir: &Path,
    on_progress: impl Fn(DownloadProgress),
) -> Result<ModelFiles, String> {
    let model = download_model(models_dir, &KOKORO_MODEL, &on_progress).await?;
    let voices = download_model(models_dir, &KOKORO_VOICES, &on_progress).await?;
    Ok(ModelFiles { model, voices })
}
