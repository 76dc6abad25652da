//! Network backend — Kokoro-FastAPI captioned speech.
//!
//! Stateless per call. Text past the per-call character limit is returned as
//! `unprocessed_text` for the pipeline to re-issue.

use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use tracing::debug;

use lector_core::error::SpeechError;
use lector_core::text_prep::split_at_limit;
use lector_core::types::{BackendKind, VoiceParams, WordTimestamp};

use super::{decode_wav, SpeechBackend, Synthesis};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct CaptionedSpeech {
    audio: String,
    #[serde(default)]
    timestamps: Vec<CaptionedWord>,
}

#[derive(Debug, Deserialize)]
struct CaptionedWord {
    word: String,
    start_time: f64,
    end_time: f64,
}

pub struct NetworkBackend {
    client: reqwest::Client,
    base_url: String,
    max_chars: usize,
}

impl NetworkBackend {
    pub fn new(base_url: impl Into<String>, max_chars: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_chars,
        }
    }
}

fn captioned_request(text: &str, voice: &VoiceParams) -> serde_json::Value {
    serde_json::json!({
        "model": "kokoro",
        "input": text,
        "voice": voice.voice,
        "speed": voice.speed,
        "response_format": "wav",
        "stream": false,
        "return_timestamps": true,
    })
}

/// Decode a captioned speech response body into audio and timings.
fn parse_captioned(body: CaptionedSpeech) -> Result<(Vec<u8>, f64, Vec<WordTimestamp>), SpeechError> {
    let wav = BASE64
        .decode(body.audio.trim())
        .map_err(|e| SpeechError::DecodingFailed(format!("audio is not base64: {e}")))?;
    let (audio, duration) = decode_wav(wav)?;
    let timestamps = body
        .timestamps
        .into_iter()
        .filter(|w| !w.word.trim().is_empty())
        .map(|w| WordTimestamp::new(w.word, w.start_time, w.end_time))
        .collect();
    Ok((audio, duration, timestamps))
}

#[async_trait]
impl SpeechBackend for NetworkBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Network
    }

    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Synthesis, SpeechError> {
        let (processed, unprocessed) = split_at_limit(text, self.max_chars);
        if let Some(rest) = &unprocessed {
            debug!(
                "network: over limit, sending {} chars, {} left",
                processed.chars().count(),
                rest.chars().count()
            );
        }

        let url = format!("{}/dev/captioned_speech", self.base_url);
        let resp = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&captioned_request(&processed, voice))
            .send()
            .await
            .map_err(|e| SpeechError::SynthesisFailed(format!("request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SpeechError::SynthesisFailed(format!("server error {status}: {body}")));
        }

        let body: CaptionedSpeech = resp
            .json()
            .await
            .map_err(|e| SpeechError::DecodingFailed(format!("bad response body: {e}")))?;
        let (audio, duration, word_timestamps) = parse_captioned(body)?;

        Ok(Synthesis {
            audio,
            word_timestamps,
            duration,
            processed_text: processed,
            unprocessed_text: unprocessed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lector_core::wav::write_wav;

    #[test]
    fn request_asks_for_timestamps() {
        let body = captioned_request("Hi there.", &VoiceParams::default());
        assert_eq!(body["input"], "Hi there.");
        assert_eq!(body["voice"], "af_heart");
        assert_eq!(body["return_timestamps"], true);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn parses_captioned_response() {
        let json = serde_json::json!({
            "audio": BASE64.encode(write_wav(&vec![0i16; 24_000], 24_000)),
            "timestamps": [
                {"word": "Hi", "start_time": 0.0, "end_time": 0.4},
                {"word": " ", "start_time": 0.4, "end_time": 0.45},
                {"word": "there", "start_time": 0.45, "end_time": 0.9},
            ],
        });
        let body: CaptionedSpeech = serde_json::from_value(json).unwrap();
        let (audio, duration, words) = parse_captioned(body).unwrap();
        assert_eq!(audio.len(), 44 + 48_000);
        assert!((duration - 1.0).abs() < 1e-9);
        assert_eq!(words.len(), 2);
        assert_eq!(words[1], WordTimestamp::new("there", 0.45, 0.9));
    }

    #[test]
    fn missing_timestamps_are_empty() {
        let json = serde_json::json!({
            "audio": BASE64.encode(write_wav(&[0i16; 100], 24_000)),
        });
        let body: CaptionedSpeech = serde_json::from_value(json).unwrap();
        let (_, _, words) = parse_captioned(body).unwrap();
        assert!(words.is_empty());
    }

    #[test]
    fn bad_base64_is_decoding_failure() {
        let body = CaptionedSpeech {
            audio: "not base64!!".into(),
            timestamps: vec![],
        };
        assert!(matches!(
            parse_captioned(body),
            Err(SpeechError::DecodingFailed(_))
        ));
    }

    #[test]
    fn trims_trailing_slash() {
        let backend = NetworkBackend::new("http://host:8880/", 400);
        assert_eq!(backend.base_url, "http://host:8880");
    }

    #[tokio::test]
    async fn unreachable_server_is_synthesis_failure() {
        let backend = NetworkBackend::new("http://127.0.0.1:9", 400);
        let err = backend
            .synthesize("Hello.", &VoiceParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SpeechError::SynthesisFailed(_)));
    }
}
