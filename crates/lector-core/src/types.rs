//! Shared types for the lector narration engine.
//!
//! Kept in lector-core so the HTTP client, the CLI and downstream UIs can
//! depend on the data model without pulling in tokio, rodio or reqwest.

use std::ops::Range;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─── Document ──────────────────────────────────────────────────────────────

/// One paragraph of the open document. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paragraph {
    /// Position in the document, stable for the session.
    pub index: usize,
    /// Full spoken content.
    pub text: String,
    /// Anchor identifier from the source document, if any (used by TOC lookup).
    #[serde(default)]
    pub anchor: Option<String>,
}

impl Paragraph {
    pub fn new(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
            anchor: None,
        }
    }
}

/// Table-of-contents entry supplied by the document collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TocEntry {
    pub label: String,
    #[serde(default)]
    pub anchor: Option<String>,
    /// Text prefix used when no anchor matches.
    #[serde(default)]
    pub text_prefix: Option<String>,
}

// ─── Synthesis output ──────────────────────────────────────────────────────

/// Synthesizer-estimated timing for one spoken word, in seconds from segment start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start: f64,
    pub end: f64,
}

impl WordTimestamp {
    pub fn new(word: impl Into<String>, start: f64, end: f64) -> Self {
        Self {
            word: word.into(),
            start,
            end,
        }
    }
}

/// Audio for one sentence unit of a paragraph. Immutable once created;
/// identity is `(paragraph_index, segment_index)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioSegment {
    pub paragraph_index: usize,
    pub segment_index: usize,
    /// Complete WAV file bytes.
    pub audio: Vec<u8>,
    /// May be empty when the backend cannot provide timing.
    pub word_timestamps: Vec<WordTimestamp>,
    pub duration: f64,
    pub source_text: String,
}

impl AudioSegment {
    pub fn id(&self) -> (usize, usize) {
        (self.paragraph_index, self.segment_index)
    }

    pub fn word_count(&self) -> usize {
        self.word_timestamps.len()
    }
}

/// Lifecycle of one paragraph's synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SynthesisStatus {
    #[default]
    Pending,
    Loading,
    Streaming,
    Ready,
    Error(String),
}

// ─── Backend selection ─────────────────────────────────────────────────────

/// Voice parameters passed unchanged to whichever backend handles a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceParams {
    pub voice: String,
    pub speed: f32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            voice: "af_heart".into(),
            speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    OnDevice,
    Network,
}

/// Resource mode of the on-device backend. The host switches to `Reduced`
/// while the process is not foregrounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    #[default]
    Full,
    Reduced,
}

/// Backend selection as reported over the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    pub preference: BackendKind,
    /// Backend the next request would go to.
    pub effective: BackendKind,
    pub on_device_available: bool,
}

/// Local Kokoro sidecar status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarStatus {
    pub model_downloaded: bool,
    pub running: bool,
    pub port: u16,
    pub mode: Option<ResourceMode>,
}

// ─── Configuration ─────────────────────────────────────────────────────────

/// Persisted reader configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub voice: String,
    pub speed: f32,
    /// Preferred backend when the on-device backend is available.
    pub backend: BackendKind,
    /// Set once the on-device model files have been downloaded.
    pub on_device_ready: bool,
    pub network_url: String,
    /// Per-call character limit of the network backend.
    pub network_max_chars: usize,
    /// Port of the local Kokoro sidecar.
    pub local_port: u16,
    pub models_dir: Option<PathBuf>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            voice: "af_heart".into(),
            speed: 1.0,
            backend: BackendKind::OnDevice,
            on_device_ready: false,
            network_url: "http://localhost:8880".into(),
            network_max_chars: 400,
            local_port: 3001,
            models_dir: None,
        }
    }
}

impl ReaderConfig {
    pub fn voice_params(&self) -> VoiceParams {
        VoiceParams {
            voice: self.voice.clone(),
            speed: self.speed,
        }
    }
}

// ─── Observable state ──────────────────────────────────────────────────────

/// Per-paragraph status entry. Only non-pending paragraphs are reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParagraphSnapshot {
    pub index: usize,
    pub status: SynthesisStatus,
    pub segment_count: usize,
}

/// Reader status snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReaderStatus {
    pub paragraph_count: usize,
    pub current_paragraph: Option<usize>,
    pub current_segment: Option<usize>,
    /// Global word index within the current paragraph. `None` while the
    /// current segment has no timing (whole-segment highlighting).
    pub current_word: Option<usize>,
    /// Byte range of the current word in the playing segment's source text.
    pub current_word_range: Option<Range<usize>>,
    pub is_playing: bool,
    /// Seconds into the current paragraph.
    pub elapsed: f64,
    /// Seconds of audio known so far for the current paragraph.
    pub total: f64,
    pub rate: f32,
    pub paragraphs: Vec<ParagraphSnapshot>,
}

impl ReaderStatus {
    pub fn status_of(&self, index: usize) -> SynthesisStatus {
        self.paragraphs
            .iter()
            .find(|p| p.index == index)
            .map(|p| p.status.clone())
            .unwrap_or_default()
    }
}

/// Events emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReaderEvent {
    /// Drives the scroll-follow consumer.
    #[serde(rename_all = "camelCase")]
    ParagraphChanged { index: usize },
    #[serde(rename_all = "camelCase")]
    SegmentReady {
        paragraph_index: usize,
        segment_index: usize,
        word_count: usize,
        duration: f64,
    },
    #[serde(rename_all = "camelCase")]
    ParagraphComplete { index: usize },
    #[serde(rename_all = "camelCase")]
    ParagraphFailed { index: usize, reason: String },
    EndOfDocument,
}

// ─── Download types ────────────────────────────────────────────────────────

/// Model file definition.
pub struct ModelInfo {
    pub name: &'static str,
    pub filename: &'static str,
    pub url: &'static str,
    pub expected_size: u64,
}

pub const KOKORO_MODEL: ModelInfo = ModelInfo {
    name: "kokoro",
    filename: "kokoro-v1.0.onnx",
    url: "https://github.com/thewh1teagle/kokoro-onnx/releases/download/model-files-v1.0/kokoro-v1.0.onnx",
    expected_size: 326_000_000,
};

pub const KOKORO_VOICES: ModelInfo = ModelInfo {
    name: "kokoro-voices",
    filename: "voices-v1.0.bin",
    url: "https://github.com/thewh1teagle/kokoro-onnx/releases/download/model-files-v1.0/voices-v1.0.bin",
    expected_size: 5_200_000,
};

/// Download progress payload.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub model: String,
    pub percent: f32,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub status: String, // "downloading" | "complete"
}
