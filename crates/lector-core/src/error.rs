//! Error taxonomy for synthesis and playback.

use thiserror::Error;

/// Failure of one synthesis or playback step.
///
/// `Cancelled` is not user-visible: it silently stops a generation and never
/// triggers the on-device → network fallback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpeechError {
    #[error("cancelled")]
    Cancelled,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("decoding failed: {0}")]
    DecodingFailed(String),
}

impl SpeechError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SpeechError::Cancelled)
    }

    /// Whether an on-device failure of this kind may be retried on the network backend.
    pub fn allows_fallback(&self) -> bool {
        !self.is_cancelled()
    }
}
