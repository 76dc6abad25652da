//! Generation pipeline — one paragraph, sentence by sentence.
//!
//! Each sentence unit goes through the selector; a backend that only spoke
//! part of a unit gets the remainder re-issued until nothing is left, each
//! call producing its own segment. The request token is checked before and
//! after every call, and nothing is emitted once it goes stale.

use tracing::debug;

use lector_core::error::SpeechError;
use lector_core::text_prep::split_sentences;
use lector_core::types::{AudioSegment, Paragraph, VoiceParams};

use crate::selector::BackendSelector;
use crate::token::RequestToken;

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Completed { segments: usize },
    Cancelled,
    /// Segments emitted before the failure stay valid.
    Failed(SpeechError),
}

/// Generate every segment of `paragraph`, handing each to `on_segment_ready`
/// in `segment_index` order before starting the next call.
pub async fn generate(
    paragraph: &Paragraph,
    selector: &BackendSelector,
    voice: &VoiceParams,
    token: &RequestToken,
    mut on_segment_ready: impl FnMut(AudioSegment),
) -> GenerationOutcome {
    let units = split_sentences(&paragraph.text);
    debug!(
        "pipeline: paragraph {} → {} units (token {})",
        paragraph.index,
        units.len(),
        token.id()
    );

    let mut segment_index = 0;
    for unit in units {
        let mut pending = Some(unit);
        while let Some(text) = pending.take() {
            if token.is_stale() {
                debug!("pipeline: paragraph {} cancelled before call", paragraph.index);
                return GenerationOutcome::Cancelled;
            }

            let synthesis = match selector.synthesize(&text, voice, token).await {
                Ok(s) => s,
                Err(e) if e.is_cancelled() || token.is_stale() => {
                    debug!("pipeline: paragraph {} cancelled in flight", paragraph.index);
                    return GenerationOutcome::Cancelled;
                }
                Err(e) => return GenerationOutcome::Failed(e),
            };

            if token.is_stale() {
                debug!(
                    "pipeline: paragraph {} stale on return, discarding segment {segment_index}",
                    paragraph.index
                );
                return GenerationOutcome::Cancelled;
            }

            let remainder = synthesis
                .unprocessed_text
                .filter(|rest| !rest.trim().is_empty());
            if let Some(rest) = &remainder {
                if rest.chars().count() >= text.chars().count() {
                    return GenerationOutcome::Failed(SpeechError::SynthesisFailed(
                        "backend made no progress on over-limit text".into(),
                    ));
                }
            }

            on_segment_ready(AudioSegment {
                paragraph_index: paragraph.index,
                segment_index,
                audio: synthesis.audio,
                word_timestamps: synthesis.word_timestamps,
                duration: synthesis.duration,
                source_text: synthesis.processed_text,
            });
            segment_index += 1;
            pending = remainder;
        }
    }

    GenerationOutcome::Completed {
        segments: segment_index,
    }
}
