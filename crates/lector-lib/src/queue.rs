//! Playback queue — one paragraph's segments played back to back.
//!
//! Segments arrive incrementally while the paragraph is still generating. The
//! queue keeps one segment handed to the output ahead of the one playing, so
//! the output can chain them without a gap, and reports when the paragraph
//! runs out.
//!
//! ```text
//! load(p) → Awaiting(0) ─push─▶ Playing(i) ─finished─▶ Playing(i+1) … ─▶ Exhausted
//!                                    │ no next segment yet
//!                                    ▼
//!                               Awaiting(i+1)
//! ```

use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, warn};

use lector_core::error::SpeechError;
use lector_core::highlight::{global_word_index, local_word_index, locate_words};
use lector_core::types::AudioSegment;

use crate::output::AudioOutput;

pub const MIN_RATE: f32 = 0.5;
pub const MAX_RATE: f32 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    Idle,
    /// Waiting for segment `n` to arrive.
    Awaiting(usize),
    /// `base` was passed to `play()`, segments up to `handed` to the output.
    Playing { base: usize, handed: usize },
    Exhausted,
}

/// What a [`PlaybackQueue::poll`] call observed.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Nothing,
    Started(usize),
    /// Every segment played and no more are coming.
    Exhausted,
    Failed(SpeechError),
}

pub struct PlaybackQueue<O: AudioOutput> {
    output: O,
    paragraph: Option<usize>,
    segments: Vec<Arc<AudioSegment>>,
    complete: bool,
    cursor: Cursor,
    paused: bool,
    rate: f32,
}

impl<O: AudioOutput> PlaybackQueue<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            paragraph: None,
            segments: Vec::new(),
            complete: false,
            cursor: Cursor::Idle,
            paused: false,
            rate: 1.0,
        }
    }

    pub fn paragraph(&self) -> Option<usize> {
        self.paragraph
    }

    pub fn segments(&self) -> &[Arc<AudioSegment>] {
        &self.segments
    }

    /// Start a fresh queue for `paragraph`, releasing the previous one.
    pub fn load(&mut self, paragraph: usize) {
        self.output.stop();
        self.paragraph = Some(paragraph);
        self.segments.clear();
        self.complete = false;
        self.cursor = Cursor::Awaiting(0);
    }

    /// Hand over a whole cached paragraph at once.
    pub fn load_cached(&mut self, paragraph: usize, segments: Vec<Arc<AudioSegment>>) {
        self.load(paragraph);
        for segment in segments {
            self.push(segment);
        }
        self.complete = true;
    }

    /// Play the current paragraph again from its first segment.
    pub fn restart(&mut self) {
        if self.paragraph.is_some() {
            self.output.stop();
            self.cursor = Cursor::Awaiting(0);
        }
    }

    /// Release the output and forget the paragraph.
    pub fn clear(&mut self) {
        self.output.stop();
        self.paragraph = None;
        self.segments.clear();
        self.complete = false;
        self.cursor = Cursor::Idle;
    }

    /// Stop playback but keep the segments.
    pub fn halt(&mut self) {
        self.output.stop();
        self.cursor = Cursor::Idle;
    }

    /// Append the next segment of the loaded paragraph.
    pub fn push(&mut self, segment: Arc<AudioSegment>) -> bool {
        if Some(segment.paragraph_index) != self.paragraph
            || segment.segment_index != self.segments.len()
        {
            debug!(
                "playback: rejecting segment {:?} for queue of {:?}",
                segment.id(),
                self.paragraph
            );
            return false;
        }
        self.segments.push(segment);
        true
    }

    /// No more segments will arrive for this paragraph.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// Advance the queue against the output's progress.
    pub fn poll(&mut self) -> QueueEvent {
        match self.cursor {
            Cursor::Idle | Cursor::Exhausted => QueueEvent::Nothing,
            Cursor::Awaiting(n) => self.start_or_wait(n),
            Cursor::Playing { base, handed } => {
                let current = base + self.output.finished_count();
                if current > handed {
                    return self.start_or_wait(current);
                }
                if handed == current && handed + 1 < self.segments.len() {
                    if let Err(e) = self.output.enqueue(&self.segments[handed + 1].audio) {
                        return self.fail(e);
                    }
                    self.cursor = Cursor::Playing {
                        base,
                        handed: handed + 1,
                    };
                }
                QueueEvent::Nothing
            }
        }
    }

    fn start_or_wait(&mut self, n: usize) -> QueueEvent {
        if n < self.segments.len() {
            if let Err(e) = self.output.play(&self.segments[n].audio) {
                return self.fail(e);
            }
            self.cursor = Cursor::Playing { base: n, handed: n };
            QueueEvent::Started(n)
        } else if self.complete {
            self.cursor = Cursor::Exhausted;
            QueueEvent::Exhausted
        } else {
            self.cursor = Cursor::Awaiting(n);
            QueueEvent::Nothing
        }
    }

    fn fail(&mut self, e: SpeechError) -> QueueEvent {
        warn!("playback: {e}");
        self.halt();
        QueueEvent::Failed(e)
    }

    // ─── Controls ─────────────────────────────────────────────────────────

    pub fn pause(&mut self) {
        self.paused = true;
        self.output.pause();
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.output.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Playing or about to play as soon as audio arrives.
    pub fn is_active(&self) -> bool {
        matches!(self.cursor, Cursor::Awaiting(_) | Cursor::Playing { .. })
    }

    pub fn is_playing(&self) -> bool {
        self.is_active() && !self.paused
    }

    /// Seek within the playing segment, clamped to its duration.
    pub fn seek(&mut self, position: f64) {
        let Some(i) = self.current_segment() else {
            return;
        };
        let duration = self.segments[i].duration;
        self.output.seek(position.clamp(0.0, duration));
    }

    pub fn set_rate(&mut self, rate: f32) {
        self.rate = rate.clamp(MIN_RATE, MAX_RATE);
        self.output.set_rate(self.rate);
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    // ─── Observation ──────────────────────────────────────────────────────

    /// Index of the segment on the output right now.
    pub fn current_segment(&self) -> Option<usize> {
        match self.cursor {
            Cursor::Playing { base, handed } => {
                let current = base + self.output.finished_count();
                (current <= handed).then_some(current)
            }
            _ => None,
        }
    }

    /// Seconds into the playing segment.
    pub fn position(&self) -> f64 {
        match self.current_segment() {
            Some(_) => self.output.position(),
            None => 0.0,
        }
    }

    /// Seconds into the paragraph.
    pub fn elapsed(&self) -> f64 {
        let played = |n: usize| -> f64 { self.segments[..n].iter().map(|s| s.duration).sum() };
        match self.cursor {
            Cursor::Idle => 0.0,
            Cursor::Awaiting(n) => played(n.min(self.segments.len())),
            Cursor::Exhausted => self.total(),
            Cursor::Playing { .. } => match self.current_segment() {
                Some(i) => played(i) + self.output.position(),
                None => played(self.segments.len()),
            },
        }
    }

    /// Seconds of audio known for the paragraph.
    pub fn total(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Global word index at the current position.
    pub fn word_index(&self) -> Option<usize> {
        let i = self.current_segment()?;
        global_word_index(&self.segments, i, self.output.position())
    }

    /// Where the current word sits in the playing segment's source text.
    pub fn word_range(&self) -> Option<Range<usize>> {
        let segment = &self.segments[self.current_segment()?];
        let local = local_word_index(&segment.word_timestamps, self.output.position())?;
        locate_words(&segment.source_text, &segment.word_timestamps)
            .into_iter()
            .nth(local)
    }
}
