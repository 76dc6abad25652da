//! Segment cache — per-paragraph synthesis state, owned by the engine.

use std::collections::HashMap;
use std::sync::Arc;

use lector_core::types::{AudioSegment, ParagraphSnapshot, SynthesisStatus};

/// Synthesis state of one paragraph.
#[derive(Debug, Clone, Default)]
pub struct ParagraphSynthesis {
    pub status: SynthesisStatus,
    pub segments: Vec<Arc<AudioSegment>>,
    /// Id of the request currently allowed to write here.
    token: Option<u64>,
}

impl ParagraphSynthesis {
    /// Attach a new request: `loading`, no segments.
    pub fn begin(&mut self, token: u64) {
        self.status = SynthesisStatus::Loading;
        self.segments.clear();
        self.token = Some(token);
    }

    pub fn owned_by(&self, token: u64) -> bool {
        self.token == Some(token)
    }

    /// Append the next segment. Refused unless `token` owns this entry and
    /// the segment continues the list without a gap.
    pub fn push(&mut self, token: u64, segment: Arc<AudioSegment>) -> bool {
        if !self.owned_by(token) || segment.segment_index != self.segments.len() {
            return false;
        }
        self.segments.push(segment);
        self.status = SynthesisStatus::Streaming;
        true
    }

    pub fn complete(&mut self, token: u64) -> bool {
        if !self.owned_by(token) {
            return false;
        }
        self.status = SynthesisStatus::Ready;
        self.token = None;
        true
    }

    pub fn fail(&mut self, token: u64, reason: String) -> bool {
        if !self.owned_by(token) {
            return false;
        }
        self.status = SynthesisStatus::Error(reason);
        self.token = None;
        true
    }

    /// Detach the request after cancellation. Delivered segments stay.
    pub fn cancel(&mut self) {
        self.status = SynthesisStatus::Pending;
        self.token = None;
    }

    /// Back to `pending` with nothing cached.
    pub fn reset(&mut self) {
        self.status = SynthesisStatus::Pending;
        self.segments.clear();
        self.token = None;
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SegmentCache {
    entries: HashMap<usize, ParagraphSynthesis>,
}

impl SegmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&mut self, index: usize) -> &mut ParagraphSynthesis {
        self.entries.entry(index).or_default()
    }

    pub fn get(&self, index: usize) -> Option<&ParagraphSynthesis> {
        self.entries.get(&index)
    }

    pub fn status(&self, index: usize) -> SynthesisStatus {
        self.get(index).map(|e| e.status.clone()).unwrap_or_default()
    }

    pub fn segments(&self, index: usize) -> &[Arc<AudioSegment>] {
        self.get(index).map(|e| e.segments.as_slice()).unwrap_or(&[])
    }

    /// Reset every paragraph not in `keep`. Returns the evicted indices that
    /// held anything.
    pub fn evict_except(&mut self, keep: &[usize]) -> Vec<usize> {
        let mut evicted: Vec<usize> = self
            .entries
            .iter()
            .filter(|(i, e)| {
                !keep.contains(*i) && (!e.is_empty() || e.status != SynthesisStatus::Pending)
            })
            .map(|(i, _)| *i)
            .collect();
        evicted.sort_unstable();
        self.entries.retain(|i, _| keep.contains(i));
        evicted
    }

    /// Paragraphs worth reporting, in index order.
    pub fn snapshot(&self) -> Vec<ParagraphSnapshot> {
        let mut out: Vec<ParagraphSnapshot> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.is_empty() || e.status != SynthesisStatus::Pending)
            .map(|(i, e)| ParagraphSnapshot {
                index: *i,
                status: e.status.clone(),
                segment_count: e.segments.len(),
            })
            .collect();
        out.sort_by_key(|p| p.index);
        out
    }

    pub fn non_empty_count(&self) -> usize {
        self.entries.values().filter(|e| !e.is_empty()).count()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
