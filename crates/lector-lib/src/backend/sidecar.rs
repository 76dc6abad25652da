//! Local Kokoro runtime — a `koko` sidecar process spoken to over loopback HTTP.
//!
//! Loading spawns the process (reduced mode caps its thread pool), unloading
//! kills it. Inference uses the OpenAI-compatible speech endpoint and asks for
//! WAV so the result is a self-describing file.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use lector_core::error::SpeechError;
use lector_core::types::{ResourceMode, VoiceParams};

use super::on_device::ModelRuntime;
use crate::download::ModelFiles;
use crate::manager::SidecarManager;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

pub struct SidecarRuntime {
    manager: Arc<SidecarManager>,
    models_dir: PathBuf,
    client: reqwest::Client,
}

impl SidecarRuntime {
    pub fn new(manager: Arc<SidecarManager>, models_dir: PathBuf) -> Self {
        Self {
            manager,
            models_dir,
            client: reqwest::Client::new(),
        }
    }
}

fn speech_request(text: &str, voice: &VoiceParams) -> serde_json::Value {
    serde_json::json!({
        "model": "kokoro",
        "input": text,
        "voice": voice.voice,
        "response_format": "wav",
        "speed": voice.speed,
    })
}

#[async_trait]
impl ModelRuntime for SidecarRuntime {
    async fn load(&mut self, mode: ResourceMode) -> Result<(), String> {
        let files = ModelFiles::in_dir(&self.models_dir);
        if !files.installed() {
            return Err(format!(
                "model files missing in {}",
                self.models_dir.display()
            ));
        }
        self.manager
            .start(&files.model, &files.voices, mode, STARTUP_TIMEOUT)
            .await
    }

    async fn unload(&mut self) {
        self.manager.stop().await;
    }

    async fn infer(&mut self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>, SpeechError> {
        let url = format!("{}/v1/audio/speech", self.manager.base_url());
        debug!("on-device: POST {} chars", text.len());

        let resp = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&speech_request(text, voice))
            .send()
            .await
            .map_err(|e| SpeechError::SynthesisFailed(format!("sidecar request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SpeechError::SynthesisFailed(format!(
                "sidecar error {status}: {body}"
            )));
        }

        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| SpeechError::SynthesisFailed(format!("sidecar body: {e}")))
    }
}
