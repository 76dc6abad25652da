//! Word highlighting — maps playback time to a word index.
//!
//! Everything here is a pure function of the paragraph's segment list and the
//! current playback time, so callers can re-run it on every tick.

use std::borrow::Borrow;
use std::ops::Range;

use crate::types::{AudioSegment, WordTimestamp};

/// Index of the word being spoken at `t` seconds into a segment.
///
/// The first entry whose end lies after `t`, or the last entry once `t` is
/// past the end. `None` when the segment has no timing.
pub fn local_word_index(timestamps: &[WordTimestamp], t: f64) -> Option<usize> {
    if timestamps.is_empty() {
        return None;
    }
    Some(
        timestamps
            .iter()
            .position(|w| w.end > t)
            .unwrap_or(timestamps.len() - 1),
    )
}

/// Word index across the whole paragraph.
///
/// `segments` are the paragraph's segments in `segment_index` order. Returns
/// `None` when the active segment is unknown or has no timing, in which case
/// the whole segment should be highlighted instead.
pub fn global_word_index<S: Borrow<AudioSegment>>(
    segments: &[S],
    segment_index: usize,
    t: f64,
) -> Option<usize> {
    let current = segments.get(segment_index)?.borrow();
    let local = local_word_index(&current.word_timestamps, t)?;
    let prior: usize = segments[..segment_index]
        .iter()
        .map(|s| s.borrow().word_count())
        .sum();
    Some(prior + local)
}

/// Spread `duration` across the words of `text` in proportion to their length.
///
/// Used for backends that return audio without timing.
pub fn estimate_word_timestamps(text: &str, duration: f64) -> Vec<WordTimestamp> {
    let words: Vec<&str> = text.split_whitespace().collect();
    // One extra unit per word approximates the pause between words.
    let total: usize = words.iter().map(|w| w.chars().count() + 1).sum();
    if total == 0 || duration <= 0.0 {
        return Vec::new();
    }

    let per_unit = duration / total as f64;
    let mut start = 0.0;
    words
        .into_iter()
        .map(|word| {
            let end = start + (word.chars().count() + 1) as f64 * per_unit;
            let ts = WordTimestamp::new(word, start, end);
            start = end;
            ts
        })
        .collect()
}

/// Locate each timestamp's word in the segment's source text.
///
/// Searches forward from the previous match so repeated words resolve in
/// order. A word that cannot be found falls back to the whitespace-delimited
/// word at the proportional position. Repeated or rewritten words can still
/// land on the wrong span.
pub fn locate_words(text: &str, timestamps: &[WordTimestamp]) -> Vec<Range<usize>> {
    let text_words = word_spans(text);
    let mut cursor = 0;

    timestamps
        .iter()
        .enumerate()
        .map(|(i, ts)| {
            let needle = ts.word.trim_matches(|c: char| !c.is_alphanumeric());
            if !needle.is_empty() {
                if let Some(offset) = text[cursor..].find(needle) {
                    let start = cursor + offset;
                    cursor = start + needle.len();
                    return start..cursor;
                }
            }
            estimated_span(&text_words, i, timestamps.len(), text.len())
        })
        .collect()
}

fn estimated_span(
    text_words: &[Range<usize>],
    i: usize,
    count: usize,
    text_len: usize,
) -> Range<usize> {
    if text_words.is_empty() {
        return 0..text_len;
    }
    let pos = (i * text_words.len()) / count.max(1);
    text_words[pos.min(text_words.len() - 1)].clone()
}

fn word_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push(s..i);
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push(s..text.len());
    }
    spans
}
