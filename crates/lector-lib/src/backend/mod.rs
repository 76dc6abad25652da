//! Synthesis backends.
//!
//! Two implementations share the [`SpeechBackend`] capability:
//!
//! - [`on_device::OnDeviceBackend`] — local Kokoro model, lazily loaded, with
//!   a full and a reduced resource mode.
//! - [`network::NetworkBackend`] — remote Kokoro-FastAPI server with a
//!   per-call text limit.
//!
//! Backends are plain call/return. Cancellation is the caller's job: the
//! pipeline checks its request token around every call and discards results
//! that come back stale.

pub mod network;
pub mod on_device;
pub mod sidecar;

use async_trait::async_trait;

use lector_core::error::SpeechError;
use lector_core::types::{BackendKind, ResourceMode, VoiceParams, WordTimestamp};
use lector_core::wav::{fix_wav_sizes, wav_duration};

/// Result of one backend call.
#[derive(Debug, Clone)]
pub struct Synthesis {
    /// Complete WAV file.
    pub audio: Vec<u8>,
    pub word_timestamps: Vec<WordTimestamp>,
    pub duration: f64,
    /// The part of the input this call actually spoke.
    pub processed_text: String,
    /// Input left over because it exceeded the backend's per-call limit.
    pub unprocessed_text: Option<String>,
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether the backend can take requests right now.
    fn is_available(&self) -> bool {
        true
    }

    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Synthesis, SpeechError>;

    /// Switch resource mode. Only meaningful for stateful backends.
    async fn set_resource_mode(&self, _mode: ResourceMode) {}

    /// Drop held resources under memory pressure; the next call reloads.
    async fn release_resources(&self) {}
}

/// Validate a WAV payload and measure it.
///
/// Patches streaming sentinel sizes first so downstream decoders see a
/// well-formed file.
pub(crate) fn decode_wav(audio: Vec<u8>) -> Result<(Vec<u8>, f64), SpeechError> {
    let audio = fix_wav_sizes(audio);
    let duration = wav_duration(&audio).map_err(|e| SpeechError::DecodingFailed(e.to_string()))?;
    Ok((audio, duration))
}
