//! Reader engine — the single owner of paragraph state, generation and playback.
//!
//! ```text
//! ReaderEngine (handle) ──[cmd_tx]──▶ actor task ──spawn──▶ generation task (active)
//!                                        ▲   │       └────▶ generation task (preload)
//!                     [gen_tx] segments ─┘   │
//!                                            ├──▶ PlaybackQueue ──▶ AudioOutput
//!                                            ├──▶ watch<ReaderStatus>
//!                                            └──▶ broadcast<ReaderEvent>
//! ```
//!
//! The actor is the only writer of the segment cache. At most two generation
//! tasks exist: the active one, bound to playback, and the preload for the
//! paragraph right after it. Each has its own [`TokenSource`]; superseding a
//! generation bumps its epoch, and the actor drops any event whose token no
//! longer matches the generation it has on record. Reaching a paragraph whose
//! preload is still running adopts that generation as the active one.
//!
//! A tick drives the queue so segment boundaries, word index and elapsed time
//! are picked up without a callback from the output.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use lector_core::document::resolve_toc_entry;
use lector_core::types::{
    AudioSegment, BackendInfo, BackendKind, Paragraph, ReaderEvent, ReaderStatus,
    SynthesisStatus, TocEntry, VoiceParams,
};

use crate::cache::SegmentCache;
use crate::output::AudioOutput;
use crate::pipeline::{self, GenerationOutcome};
use crate::queue::{PlaybackQueue, QueueEvent};
use crate::selector::BackendSelector;
use crate::token::{RequestToken, TokenSource};

const TICK: Duration = Duration::from_millis(20);
const EVENT_CAPACITY: usize = 256;

/// Cloneable handle to the engine. Control methods are non-blocking.
#[derive(Clone)]
pub struct ReaderEngine {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ReaderStatus>,
    events: broadcast::Sender<ReaderEvent>,
    selector: Arc<BackendSelector>,
}

// ─── Internal types ────────────────────────────────────────────────────────

enum Command {
    Load(Vec<Paragraph>),
    Play(usize),
    Jump(usize),
    JumpToc(TocEntry, oneshot::Sender<Option<usize>>),
    TogglePlayPause,
    Stop,
    Seek(f64),
    SetRate(f32),
    SetVoice(VoiceParams),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Active,
    Preload,
}

/// Events from a generation task, tagged with the token source it was issued from.
enum GenEvent {
    Segment {
        source: Role,
        token: u64,
        segment: AudioSegment,
    },
    Finished {
        source: Role,
        token: u64,
        outcome: GenerationOutcome,
    },
}

/// A generation task on record.
struct Generation {
    paragraph: usize,
    /// Token source the task was started from; differs from the slot it
    /// fills once a preload is adopted.
    source: Role,
    token: RequestToken,
}

impl Generation {
    fn owns(&self, source: Role, token: u64) -> bool {
        self.source == source && self.token.id() == token && self.token.is_current()
    }
}

// ─── Engine construction ───────────────────────────────────────────────────

impl ReaderEngine {
    /// Spawn the engine actor on the current tokio runtime.
    pub fn new<O>(selector: Arc<BackendSelector>, output: O, voice: VoiceParams) -> Self
    where
        O: AudioOutput + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (gen_tx, gen_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ReaderStatus {
            rate: 1.0,
            ..ReaderStatus::default()
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            paragraphs: Vec::new(),
            cache: SegmentCache::new(),
            queue: PlaybackQueue::new(output),
            selector: selector.clone(),
            voice,
            current: None,
            active: None,
            preload: None,
            active_tokens: TokenSource::new(),
            preload_tokens: TokenSource::new(),
            gen_tx,
            status_tx,
            events: events.clone(),
        };
        tokio::spawn(actor.run(cmd_rx, gen_rx));

        Self {
            cmd_tx,
            status_rx,
            events,
            selector,
        }
    }

    fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).is_err() {
            error!("engine: actor is gone");
        }
    }

    /// Replace the document. Supersedes all generation and stops playback.
    pub fn load_paragraphs(&self, paragraphs: Vec<Paragraph>) {
        self.send(Command::Load(paragraphs));
    }

    /// Start playing paragraph `index` from its beginning.
    pub fn play_paragraph(&self, index: usize) {
        self.send(Command::Play(index));
    }

    /// Move to paragraph `index`, keeping the play/pause state.
    pub fn jump_to_paragraph(&self, index: usize) {
        self.send(Command::Jump(index));
    }

    /// Resolve a table-of-contents entry and jump to it.
    pub async fn jump_to_toc(&self, entry: TocEntry) -> Option<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::JumpToc(entry, tx));
        rx.await.ok().flatten()
    }

    pub fn toggle_play_pause(&self) {
        self.send(Command::TogglePlayPause);
    }

    /// Cancel all generation and stop audio. The cursor stays put.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Seek within the playing segment.
    pub fn seek(&self, position: f64) {
        self.send(Command::Seek(position));
    }

    pub fn set_rate(&self, rate: f32) {
        self.send(Command::SetRate(rate));
    }

    /// Voice for generations started from now on.
    pub fn set_voice(&self, voice: VoiceParams) {
        self.send(Command::SetVoice(voice));
    }

    pub fn status(&self) -> ReaderStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ReaderStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ReaderEvent> {
        self.events.subscribe()
    }

    // ─── Backend selection and host lifecycle ──────────────────────────────

    pub fn backend_info(&self) -> BackendInfo {
        self.selector.info()
    }

    pub fn set_backend_preference(&self, kind: BackendKind) {
        info!("engine: backend preference → {kind:?}");
        self.selector.set_preference(kind);
    }

    pub async fn enter_background(&self) {
        self.selector.enter_background().await;
    }

    pub async fn enter_foreground(&self) {
        self.selector.enter_foreground().await;
    }

    pub async fn memory_warning(&self) {
        self.selector.memory_warning().await;
    }
}

// ─── Actor ─────────────────────────────────────────────────────────────────

struct Actor<O: AudioOutput> {
    paragraphs: Vec<Paragraph>,
    cache: SegmentCache,
    queue: PlaybackQueue<O>,
    selector: Arc<BackendSelector>,
    voice: VoiceParams,
    current: Option<usize>,
    active: Option<Generation>,
    preload: Option<Generation>,
    active_tokens: TokenSource,
    preload_tokens: TokenSource,
    gen_tx: mpsc::UnboundedSender<GenEvent>,
    status_tx: watch::Sender<ReaderStatus>,
    events: broadcast::Sender<ReaderEvent>,
}

impl<O: AudioOutput + 'static> Actor<O> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut gen_rx: mpsc::UnboundedReceiver<GenEvent>,
    ) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                Some(event) = gen_rx.recv() => self.handle_generation(event),
                _ = tick.tick() => {}
            }
            self.poll_queue();
            self.publish_status();
        }

        debug!("engine: all handles dropped, shutting down");
        self.stop();
    }

    fn emit(&self, event: ReaderEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Load(paragraphs) => {
                info!("engine: loaded {} paragraphs", paragraphs.len());
                self.stop();
                self.cache.clear();
                self.queue.clear();
                self.current = None;
                self.paragraphs = paragraphs;
            }
            Command::Play(index) => self.activate(index, true),
            Command::Jump(index) => self.activate(index, false),
            Command::JumpToc(entry, reply) => {
                let target = resolve_toc_entry(&entry, &self.paragraphs);
                match target {
                    Some(index) => self.activate(index, false),
                    None => debug!("engine: no paragraph matches toc entry {:?}", entry.label),
                }
                let _ = reply.send(target);
            }
            Command::TogglePlayPause => self.toggle(),
            Command::Stop => {
                info!("engine: stop");
                self.stop();
            }
            Command::Seek(position) => self.queue.seek(position),
            Command::SetRate(rate) => self.queue.set_rate(rate),
            Command::SetVoice(voice) => self.voice = voice,
        }
    }

    fn toggle(&mut self) {
        if self.queue.is_active() {
            if self.queue.is_paused() {
                self.queue.resume();
            } else {
                self.queue.pause();
            }
            return;
        }
        // Stopped or finished: start over on the current paragraph.
        match self.current.or((!self.paragraphs.is_empty()).then_some(0)) {
            Some(index) => self.activate(index, true),
            None => debug!("engine: nothing to play"),
        }
    }

    /// Make `index` the current paragraph.
    ///
    /// `resume` starts playback; otherwise the pause state is kept.
    fn activate(&mut self, index: usize, resume: bool) {
        if index >= self.paragraphs.len() {
            warn!(
                "engine: paragraph {index} out of range ({} paragraphs)",
                self.paragraphs.len()
            );
            return;
        }
        if resume {
            self.queue.resume();
        }

        // Same paragraph with a live or finished generation: replay, no re-synthesis.
        if self.current == Some(index) && self.queue.paragraph() == Some(index) {
            let live = self.active.as_ref().is_some_and(|g| g.paragraph == index);
            if live || self.cache.status(index) == SynthesisStatus::Ready {
                debug!("engine: restarting paragraph {index}");
                self.queue.restart();
                return;
            }
        }

        self.cancel_active();
        let adopted = self.preload.take_if(|p| p.paragraph == index);
        if self
            .preload
            .as_ref()
            .is_some_and(|p| p.paragraph != index + 1)
        {
            self.cancel_preload();
        }

        let promote = self.cache.status(index) == SynthesisStatus::Ready;
        let next = index + 1;
        let mut keep = vec![index];
        if self.preload.is_some() || self.cache.status(next) == SynthesisStatus::Ready {
            keep.push(next);
        }
        let evicted = self.cache.evict_except(&keep);
        if !evicted.is_empty() {
            debug!("engine: evicted paragraphs {evicted:?}");
        }

        self.current = Some(index);
        self.queue.load(index);
        self.emit(ReaderEvent::ParagraphChanged { index });

        if promote {
            let segments = self.cache.segments(index).to_vec();
            info!(
                "engine: promoting preloaded paragraph {index} ({} segments)",
                segments.len()
            );
            for s in &segments {
                self.emit(segment_ready(s));
            }
            self.queue.load_cached(index, segments);
            self.schedule_preload();
        } else if let Some(generation) = adopted {
            let segments = self.cache.segments(index).to_vec();
            info!(
                "engine: adopting preload of paragraph {index} ({} segments so far)",
                segments.len()
            );
            for s in segments {
                self.emit(segment_ready(&s));
                self.queue.push(s);
            }
            self.active = Some(generation);
        } else {
            self.start_active(index);
        }
    }

    fn start_active(&mut self, index: usize) {
        let token = self.active_tokens.issue();
        info!("engine: generating paragraph {index} (token {})", token.id());
        self.cache.entry(index).begin(token.id());
        self.spawn_generation(Role::Active, index, token.clone());
        self.active = Some(Generation {
            paragraph: index,
            source: Role::Active,
            token,
        });
    }

    /// Start preloading the paragraph after the current one, if it needs it.
    fn schedule_preload(&mut self) {
        let Some(current) = self.current else {
            return;
        };
        let next = current + 1;
        if next >= self.paragraphs.len() || self.active.is_some() || self.preload.is_some() {
            return;
        }
        if self.cache.status(next) == SynthesisStatus::Ready {
            return;
        }

        let token = self.preload_tokens.issue();
        debug!("preload: paragraph {next} (token {})", token.id());
        self.cache.entry(next).begin(token.id());
        self.spawn_generation(Role::Preload, next, token.clone());
        self.preload = Some(Generation {
            paragraph: next,
            source: Role::Preload,
            token,
        });
    }

    fn spawn_generation(&self, source: Role, index: usize, token: RequestToken) {
        let paragraph = self.paragraphs[index].clone();
        let selector = self.selector.clone();
        let voice = self.voice.clone();
        let tx = self.gen_tx.clone();

        tokio::spawn(async move {
            let id = token.id();
            let outcome = pipeline::generate(&paragraph, &selector, &voice, &token, |segment| {
                let _ = tx.send(GenEvent::Segment {
                    source,
                    token: id,
                    segment,
                });
            })
            .await;
            let _ = tx.send(GenEvent::Finished {
                source,
                token: id,
                outcome,
            });
        });
    }

    fn cancel_active(&mut self) {
        self.active_tokens.invalidate();
        if let Some(g) = self.active.take() {
            if g.source == Role::Preload {
                self.preload_tokens.invalidate();
            }
            debug!("engine: cancelled generation of paragraph {}", g.paragraph);
            self.cache.entry(g.paragraph).cancel();
        }
    }

    fn cancel_preload(&mut self) {
        self.preload_tokens.invalidate();
        if let Some(p) = self.preload.take() {
            debug!("preload: cancelled paragraph {}", p.paragraph);
            self.cache.entry(p.paragraph).reset();
        }
    }

    fn stop(&mut self) {
        self.cancel_active();
        self.cancel_preload();
        self.queue.halt();
    }

    // ─── Generation events ─────────────────────────────────────────────────

    fn handle_generation(&mut self, event: GenEvent) {
        match event {
            GenEvent::Segment {
                source,
                token,
                segment,
            } => self.on_segment(source, token, segment),
            GenEvent::Finished {
                source,
                token,
                outcome,
            } => self.on_finished(source, token, outcome),
        }
    }

    /// The slot holding the generation that issued `token` from `source`.
    fn owner(&self, source: Role, token: u64) -> Option<(Role, usize)> {
        [(Role::Active, &self.active), (Role::Preload, &self.preload)]
            .into_iter()
            .find_map(|(slot, g)| {
                g.as_ref()
                    .filter(|g| g.owns(source, token))
                    .map(|g| (slot, g.paragraph))
            })
    }

    fn on_segment(&mut self, source: Role, token: u64, segment: AudioSegment) {
        let index = segment.paragraph_index;
        let role = match self.owner(source, token) {
            Some((role, paragraph)) if paragraph == index => role,
            _ => {
                debug!(
                    "engine: dropping stale segment {:?} ({source:?}, token {token})",
                    segment.id()
                );
                return;
            }
        };

        let segment = Arc::new(segment);
        if !self.cache.entry(index).push(token, segment.clone()) {
            warn!("engine: out-of-order segment {:?}", segment.id());
            return;
        }
        if role == Role::Active {
            self.emit(segment_ready(&segment));
            self.queue.push(segment);
        }
    }

    fn on_finished(&mut self, source: Role, token: u64, outcome: GenerationOutcome) {
        let Some((role, index)) = self.owner(source, token) else {
            debug!("engine: ignoring finish of superseded {source:?} token {token}");
            return;
        };

        match role {
            Role::Active => {
                self.active = None;
                match outcome {
                    GenerationOutcome::Completed { segments } => {
                        info!("engine: paragraph {index} ready ({segments} segments)");
                        self.cache.entry(index).complete(token);
                        self.queue.mark_complete();
                        self.schedule_preload();
                    }
                    GenerationOutcome::Cancelled => {
                        self.cache.entry(index).cancel();
                    }
                    GenerationOutcome::Failed(e) => {
                        error!("engine: paragraph {index} failed: {e}");
                        self.cache.entry(index).fail(token, e.to_string());
                        self.queue.mark_complete();
                        self.emit(ReaderEvent::ParagraphFailed {
                            index,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            Role::Preload => {
                self.preload = None;
                match outcome {
                    GenerationOutcome::Completed { segments } => {
                        debug!("preload: paragraph {index} ready ({segments} segments)");
                        self.cache.entry(index).complete(token);
                    }
                    GenerationOutcome::Cancelled => {
                        self.cache.entry(index).reset();
                    }
                    GenerationOutcome::Failed(e) => {
                        warn!("preload: paragraph {index} failed, will generate on demand: {e}");
                        self.cache.entry(index).reset();
                    }
                }
            }
        }
    }

    // ─── Playback ──────────────────────────────────────────────────────────

    fn poll_queue(&mut self) {
        loop {
            match self.queue.poll() {
                QueueEvent::Nothing => return,
                QueueEvent::Started(i) => {
                    debug!("playback: segment {i} of paragraph {:?}", self.current);
                    return;
                }
                QueueEvent::Exhausted => self.on_exhausted(),
                QueueEvent::Failed(e) => {
                    if let Some(index) = self.current {
                        error!("engine: playback of paragraph {index} failed: {e}");
                        self.cancel_active();
                        let entry = self.cache.entry(index);
                        entry.status = SynthesisStatus::Error(e.to_string());
                        self.emit(ReaderEvent::ParagraphFailed {
                            index,
                            reason: e.to_string(),
                        });
                    }
                    return;
                }
            }
        }
    }

    fn on_exhausted(&mut self) {
        let Some(index) = self.current else {
            return;
        };
        if let SynthesisStatus::Error(reason) = self.cache.status(index) {
            info!("engine: paragraph {index} stopped on error: {reason}");
            self.queue.halt();
            return;
        }

        self.emit(ReaderEvent::ParagraphComplete { index });
        let next = index + 1;
        if next >= self.paragraphs.len() {
            info!("engine: end of document");
            self.emit(ReaderEvent::EndOfDocument);
            self.queue.halt();
            return;
        }
        self.activate(next, false);
    }

    fn publish_status(&self) {
        let status = ReaderStatus {
            paragraph_count: self.paragraphs.len(),
            current_paragraph: self.current,
            current_segment: self.queue.current_segment(),
            current_word: self.queue.word_index(),
            current_word_range: self.queue.word_range(),
            is_playing: self.queue.is_playing(),
            elapsed: self.queue.elapsed(),
            total: self.queue.total(),
            rate: self.queue.rate(),
            paragraphs: self.cache.snapshot(),
        };
        self.status_tx.send_if_modified(|s| {
            if *s == status {
                false
            } else {
                *s = status;
                true
            }
        });
    }
}

fn segment_ready(segment: &AudioSegment) -> ReaderEvent {
    ReaderEvent::SegmentReady {
        paragraph_index: segment.paragraph_index,
        segment_index: segment.segment_index,
        word_count: segment.word_count(),
        duration: segment.duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use lector_core::error::SpeechError;
    use tokio::sync::Semaphore;

    use crate::testing::{wait_until, FakeOutput, ScriptedBackend};

    struct Harness {
        engine: ReaderEngine,
        on_device: Arc<ScriptedBackend>,
        network: Arc<ScriptedBackend>,
        output: FakeOutput,
        events: broadcast::Receiver<ReaderEvent>,
    }

    fn harness(on_device: ScriptedBackend, network: ScriptedBackend, output: FakeOutput) -> Harness {
        let on_device = Arc::new(on_device);
        let network = Arc::new(network);
        let selector = Arc::new(BackendSelector::new(
            on_device.clone(),
            network.clone(),
            BackendKind::OnDevice,
        ));
        let engine = ReaderEngine::new(selector, output.clone(), VoiceParams::default());
        let events = engine.subscribe_events();
        Harness {
            engine,
            on_device,
            network,
            output,
            events,
        }
    }

    fn plain() -> Harness {
        harness(
            ScriptedBackend::new(BackendKind::OnDevice),
            ScriptedBackend::new(BackendKind::Network),
            FakeOutput::default(),
        )
    }

    fn gated(gate: &Arc<Semaphore>) -> Harness {
        harness(
            ScriptedBackend::new(BackendKind::OnDevice).gated(gate.clone()),
            ScriptedBackend::new(BackendKind::Network),
            FakeOutput::default(),
        )
    }

    /// `n` paragraphs of two sentences, three words each.
    fn doc(n: usize) -> Vec<Paragraph> {
        (0..n)
            .map(|i| Paragraph::new(i, format!("Paragraph {i} first. Paragraph {i} second.")))
            .collect()
    }

    fn drain(rx: &mut broadcast::Receiver<ReaderEvent>) -> Vec<ReaderEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn calls_for(backend: &ScriptedBackend, needle: &str) -> usize {
        backend.calls().iter().filter(|c| c.contains(needle)).count()
    }

    fn segments_of(status: &ReaderStatus, index: usize) -> usize {
        status
            .paragraphs
            .iter()
            .find(|p| p.index == index)
            .map_or(0, |p| p.segment_count)
    }

    fn ready_segments(events: &[ReaderEvent], paragraph: usize) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                ReaderEvent::SegmentReady {
                    paragraph_index,
                    segment_index,
                    ..
                } if *paragraph_index == paragraph => Some(*segment_index),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn generates_in_order_and_preloads_next() {
        let mut h = plain();
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);

        wait_until(|| {
            let s = h.engine.status();
            s.status_of(0) == SynthesisStatus::Ready && s.status_of(1) == SynthesisStatus::Ready
        })
        .await;

        let status = h.engine.status();
        assert_eq!(status.current_paragraph, Some(0));
        assert_eq!(status.current_segment, Some(0));
        assert!(status.is_playing);
        assert_eq!(segments_of(&status, 0), 2);
        assert_eq!(segments_of(&status, 1), 2);
        assert_eq!(status.status_of(2), SynthesisStatus::Pending);

        let events = drain(&mut h.events);
        assert_eq!(events[0], ReaderEvent::ParagraphChanged { index: 0 });
        assert_eq!(ready_segments(&events, 0), vec![0, 1]);
        // Preloaded segments are announced on promotion, not before.
        assert!(ready_segments(&events, 1).is_empty());
    }

    #[tokio::test]
    async fn promotes_preloaded_paragraph_without_resynthesis() {
        let mut h = plain();
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);
        wait_until(|| h.engine.status().status_of(1) == SynthesisStatus::Ready).await;

        h.output.set_auto_finish(true);
        wait_until(|| h.engine.status().current_paragraph == Some(2)).await;

        assert_eq!(calls_for(&h.on_device, "Paragraph 1 first."), 1);
        assert_eq!(calls_for(&h.on_device, "Paragraph 1 second."), 1);

        let events = drain(&mut h.events);
        assert!(events.contains(&ReaderEvent::ParagraphComplete { index: 0 }));
        assert!(events.contains(&ReaderEvent::ParagraphChanged { index: 1 }));
        assert_eq!(ready_segments(&events, 1), vec![0, 1]);
    }

    #[tokio::test]
    async fn plays_to_end_of_document() {
        let mut h = harness(
            ScriptedBackend::new(BackendKind::OnDevice),
            ScriptedBackend::new(BackendKind::Network),
            FakeOutput::auto_finishing(),
        );
        h.engine.load_paragraphs(doc(2));
        h.engine.play_paragraph(0);

        wait_until(|| {
            let s = h.engine.status();
            s.current_paragraph == Some(1) && s.status_of(1) == SynthesisStatus::Ready && !s.is_playing
        })
        .await;
        let events = drain(&mut h.events);
        assert!(events.contains(&ReaderEvent::ParagraphComplete { index: 1 }));
        assert_eq!(events.last(), Some(&ReaderEvent::EndOfDocument));
    }

    #[tokio::test]
    async fn never_more_than_two_paragraphs_hold_segments() {
        let h = plain();
        let max_seen = Arc::new(AtomicUsize::new(0));
        let mut rx = h.engine.subscribe_status();
        let watcher = {
            let max_seen = max_seen.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    let non_empty = rx
                        .borrow()
                        .paragraphs
                        .iter()
                        .filter(|p| p.segment_count > 0)
                        .count();
                    max_seen.fetch_max(non_empty, Ordering::SeqCst);
                }
            })
        };

        h.engine.load_paragraphs(doc(6));
        for (target, next) in [(0, 1), (3, 4), (1, 2)] {
            h.engine.jump_to_paragraph(target);
            wait_until(|| {
                let s = h.engine.status();
                s.status_of(target) == SynthesisStatus::Ready
                    && s.status_of(next) == SynthesisStatus::Ready
            })
            .await;
            assert_eq!(h.engine.status().paragraphs.len(), 2);
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 2);
        watcher.abort();
    }

    #[tokio::test]
    async fn falls_back_to_network_for_failed_paragraph() {
        let h = harness(
            ScriptedBackend::new(BackendKind::OnDevice).failing_on(
                "Paragraph 3",
                SpeechError::BackendUnavailable("not loaded".into()),
            ),
            ScriptedBackend::new(BackendKind::Network),
            FakeOutput::default(),
        );
        h.engine.load_paragraphs(doc(5));
        h.engine.play_paragraph(3);
        wait_until(|| h.engine.status().status_of(3) == SynthesisStatus::Ready).await;

        assert_eq!(
            h.network.calls(),
            vec!["Paragraph 3 first.".to_string(), "Paragraph 3 second.".to_string()]
        );
        assert!(h.network.voices().iter().all(|v| *v == VoiceParams::default()));
        assert_eq!(calls_for(&h.on_device, "Paragraph 3"), 2);
    }

    #[tokio::test]
    async fn superseded_paragraph_never_reaches_playback() {
        let gate = Arc::new(Semaphore::new(0));
        let mut h = gated(&gate);
        h.engine.load_paragraphs(doc(6));
        h.engine.play_paragraph(2);
        wait_until(|| h.on_device.calls().len() == 1).await;

        // Paragraph 5 waits for its on-device turn behind paragraph 2's call.
        h.engine.play_paragraph(5);
        wait_until(|| h.engine.status().current_paragraph == Some(5)).await;
        gate.add_permits(16);

        wait_until(|| h.engine.status().status_of(5) == SynthesisStatus::Ready).await;
        let events = drain(&mut h.events);
        assert!(ready_segments(&events, 2).is_empty());
        assert_eq!(ready_segments(&events, 5), vec![0, 1]);
        assert_eq!(calls_for(&h.on_device, "Paragraph 2"), 1);

        let status = h.engine.status();
        assert_eq!(status.status_of(2), SynthesisStatus::Pending);
        assert_eq!(segments_of(&status, 2), 0);
    }

    #[tokio::test]
    async fn exhausting_before_preload_adopts_the_running_preload() {
        let gate = Arc::new(Semaphore::new(2));
        let mut h = gated(&gate);
        h.engine.load_paragraphs(doc(2));
        h.engine.play_paragraph(0);

        // Paragraph 0 completes, the preload of 1 blocks on its first call.
        wait_until(|| h.engine.status().status_of(0) == SynthesisStatus::Ready).await;
        wait_until(|| h.on_device.calls().len() == 3).await;
        assert_eq!(h.engine.status().status_of(1), SynthesisStatus::Loading);

        h.output.set_auto_finish(true);
        wait_until(|| h.engine.status().current_paragraph == Some(1)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(h.on_device.calls().len(), 3);
        gate.add_permits(16);

        wait_until(|| h.engine.status().status_of(1) == SynthesisStatus::Ready).await;
        wait_until(|| !h.engine.status().is_playing).await;
        let events = drain(&mut h.events);
        assert_eq!(ready_segments(&events, 1), vec![0, 1]);
        assert_eq!(calls_for(&h.on_device, "Paragraph 1 first."), 1);
        assert_eq!(calls_for(&h.on_device, "Paragraph 1 second."), 1);
        assert_eq!(events.last(), Some(&ReaderEvent::EndOfDocument));
    }

    #[tokio::test]
    async fn jump_to_preloading_paragraph_keeps_its_segments() {
        let gate = Arc::new(Semaphore::new(3));
        let mut h = gated(&gate);
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);

        // Paragraph 0 done, the preload of 1 has one segment and blocks on the next.
        wait_until(|| segments_of(&h.engine.status(), 1) == 1).await;
        wait_until(|| h.on_device.calls().len() == 4).await;

        h.engine.jump_to_paragraph(1);
        wait_until(|| h.engine.status().current_paragraph == Some(1)).await;
        gate.add_permits(16);
        wait_until(|| h.engine.status().status_of(1) == SynthesisStatus::Ready).await;

        let events = drain(&mut h.events);
        assert_eq!(ready_segments(&events, 1), vec![0, 1]);
        assert_eq!(calls_for(&h.on_device, "Paragraph 1"), 2);
        assert_eq!(h.engine.status().current_segment, Some(0));
    }

    #[tokio::test]
    async fn stop_after_some_segments_keeps_them_pending() {
        let gate = Arc::new(Semaphore::new(1));
        let h = gated(&gate);
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);
        wait_until(|| segments_of(&h.engine.status(), 0) == 1).await;
        wait_until(|| h.on_device.calls().len() == 2).await;

        h.engine.stop();
        wait_until(|| h.engine.status().status_of(0) == SynthesisStatus::Pending).await;
        gate.add_permits(16);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let status = h.engine.status();
        assert_eq!(status.status_of(0), SynthesisStatus::Pending);
        assert_eq!(segments_of(&status, 0), 1);
        assert!(!status.is_playing);
        assert_eq!(status.current_paragraph, Some(0));
        assert_eq!(h.on_device.calls().len(), 2);
    }

    #[tokio::test]
    async fn stop_before_any_segment_leaves_nothing() {
        let gate = Arc::new(Semaphore::new(0));
        let h = gated(&gate);
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);
        wait_until(|| h.engine.status().status_of(0) == SynthesisStatus::Loading).await;

        h.engine.stop();
        gate.add_permits(16);
        wait_until(|| h.engine.status().paragraphs.is_empty()).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(h.engine.status().paragraphs.is_empty());
    }

    #[tokio::test]
    async fn repeated_jump_does_not_resynthesize() {
        let gate = Arc::new(Semaphore::new(0));
        let h = gated(&gate);
        h.engine.load_paragraphs(doc(3));
        h.engine.jump_to_paragraph(1);
        h.engine.jump_to_paragraph(1);
        wait_until(|| h.on_device.calls().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(h.on_device.calls().len(), 1);
        assert_eq!(h.engine.status().status_of(1), SynthesisStatus::Loading);

        gate.add_permits(2);
        wait_until(|| h.engine.status().status_of(1) == SynthesisStatus::Ready).await;
        assert_eq!(calls_for(&h.on_device, "Paragraph 1"), 2);
    }

    #[tokio::test]
    async fn failure_after_fallback_marks_error() {
        let mut h = harness(
            ScriptedBackend::new(BackendKind::OnDevice)
                .failing(SpeechError::SynthesisFailed("oom".into())),
            ScriptedBackend::new(BackendKind::Network)
                .failing(SpeechError::SynthesisFailed("offline".into())),
            FakeOutput::auto_finishing(),
        );
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);

        wait_until(|| {
            let s = h.engine.status();
            matches!(s.status_of(0), SynthesisStatus::Error(_)) && !s.is_playing
        })
        .await;
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ReaderEvent::ParagraphFailed { index: 0, reason } if reason.contains("offline")
        )));
        assert!(!events.contains(&ReaderEvent::ParagraphComplete { index: 0 }));
        assert_eq!(h.engine.status().current_paragraph, Some(0));

        // Retrying starts over.
        h.engine.play_paragraph(0);
        wait_until(|| h.network.calls().len() == 2).await;
    }

    #[tokio::test]
    async fn undecodable_audio_fails_the_paragraph() {
        let mut h = harness(
            ScriptedBackend::new(BackendKind::OnDevice).undecodable_on("Paragraph 0"),
            ScriptedBackend::new(BackendKind::Network),
            FakeOutput::auto_finishing(),
        );
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);

        wait_until(|| {
            let s = h.engine.status();
            matches!(s.status_of(0), SynthesisStatus::Error(_)) && !s.is_playing
        })
        .await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let status = h.engine.status();
        assert!(matches!(status.status_of(0), SynthesisStatus::Error(_)));
        assert_eq!(status.current_paragraph, Some(0));
        let events = drain(&mut h.events);
        assert!(events.iter().any(|e| matches!(
            e,
            ReaderEvent::ParagraphFailed { index: 0, reason } if reason.contains("decoding failed")
        )));
        assert!(!events.contains(&ReaderEvent::ParagraphComplete { index: 0 }));
        assert!(!events.contains(&ReaderEvent::ParagraphChanged { index: 1 }));
        assert!(h.network.calls().is_empty());

        // Retrying synthesizes the paragraph again.
        h.engine.play_paragraph(0);
        wait_until(|| calls_for(&h.on_device, "Paragraph 0 first.") == 2).await;
    }

    #[tokio::test]
    async fn preload_failure_is_silent() {
        let mut h = harness(
            ScriptedBackend::new(BackendKind::OnDevice)
                .failing_on("Paragraph 1", SpeechError::SynthesisFailed("oom".into())),
            ScriptedBackend::new(BackendKind::Network)
                .failing_on("Paragraph 1", SpeechError::SynthesisFailed("offline".into())),
            FakeOutput::default(),
        );
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);

        wait_until(|| calls_for(&h.network, "Paragraph 1") == 1).await;
        wait_until(|| h.engine.status().status_of(1) == SynthesisStatus::Pending).await;

        let events = drain(&mut h.events);
        assert!(!events
            .iter()
            .any(|e| matches!(e, ReaderEvent::ParagraphFailed { .. })));
        assert_eq!(h.engine.status().status_of(0), SynthesisStatus::Ready);
    }

    #[tokio::test]
    async fn word_index_follows_playback_position() {
        let h = plain();
        h.engine.load_paragraphs(doc(1));
        h.engine.play_paragraph(0);
        wait_until(|| h.engine.status().status_of(0) == SynthesisStatus::Ready).await;
        assert_eq!(h.engine.status().current_word, Some(0));

        h.output.set_position(0.15);
        wait_until(|| h.engine.status().current_word == Some(1)).await;
        // "Paragraph 0 first." → the second word is "0".
        assert_eq!(h.engine.status().current_word_range, Some(10..11));

        h.output.finish_current();
        wait_until(|| h.engine.status().current_segment == Some(1)).await;
        let status = h.engine.status();
        assert_eq!(status.current_word, Some(3));
        assert!((status.elapsed - 0.3).abs() < 1e-6);
        assert!((status.total - 0.6).abs() < 1e-6);
    }

    #[tokio::test]
    async fn toggle_seek_and_rate_reach_the_output() {
        let h = plain();
        h.engine.load_paragraphs(doc(2));
        h.engine.play_paragraph(0);
        wait_until(|| h.engine.status().current_segment == Some(0)).await;
        assert!(h.engine.status().is_playing);

        h.engine.toggle_play_pause();
        wait_until(|| !h.engine.status().is_playing).await;
        assert!(h.output.is_paused());

        h.engine.toggle_play_pause();
        wait_until(|| h.engine.status().is_playing).await;
        assert!(!h.output.is_paused());

        h.engine.set_rate(1.5);
        wait_until(|| h.engine.status().rate == 1.5).await;
        assert_eq!(h.output.rate(), 1.5);

        h.engine.seek(0.2);
        wait_until(|| h.output.seeks() == vec![0.2]).await;
    }

    #[tokio::test]
    async fn jump_keeps_pause_and_play_resumes() {
        let h = plain();
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);
        h.engine.toggle_play_pause();
        h.engine.jump_to_paragraph(2);
        wait_until(|| h.engine.status().status_of(2) == SynthesisStatus::Ready).await;

        let status = h.engine.status();
        assert_eq!(status.current_paragraph, Some(2));
        assert!(!status.is_playing);

        h.engine.play_paragraph(2);
        wait_until(|| h.engine.status().is_playing).await;
        assert_eq!(calls_for(&h.on_device, "Paragraph 2"), 2);
    }

    #[tokio::test]
    async fn toc_entry_jumps_to_matching_paragraph() {
        let h = plain();
        let mut paragraphs = doc(4);
        paragraphs[3].anchor = Some("epilogue".into());
        h.engine.load_paragraphs(paragraphs);

        let target = h
            .engine
            .jump_to_toc(TocEntry {
                label: "Epilogue".into(),
                anchor: Some("epilogue".into()),
                text_prefix: None,
            })
            .await;
        assert_eq!(target, Some(3));
        wait_until(|| h.engine.status().current_paragraph == Some(3)).await;

        let missing = h
            .engine
            .jump_to_toc(TocEntry {
                label: "Appendix".into(),
                anchor: None,
                text_prefix: None,
            })
            .await;
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn loading_a_new_document_supersedes_everything() {
        let gate = Arc::new(Semaphore::new(0));
        let mut h = gated(&gate);
        h.engine.load_paragraphs(doc(3));
        h.engine.play_paragraph(0);
        wait_until(|| h.on_device.calls().len() == 1).await;

        h.engine.load_paragraphs(doc(5));
        gate.add_permits(16);
        wait_until(|| h.engine.status().paragraph_count == 5).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let status = h.engine.status();
        assert_eq!(status.current_paragraph, None);
        assert!(status.paragraphs.is_empty());
        assert!(ready_segments(&drain(&mut h.events), 0).is_empty());
    }

    #[tokio::test]
    async fn out_of_range_paragraph_is_ignored() {
        let h = plain();
        h.engine.load_paragraphs(doc(2));
        h.engine.play_paragraph(7);
        wait_until(|| h.engine.status().paragraph_count == 2).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(h.engine.status().current_paragraph, None);
        assert!(h.on_device.calls().is_empty());
    }

    #[tokio::test]
    async fn backend_preference_is_reported() {
        let h = plain();
        assert_eq!(h.engine.backend_info().effective, BackendKind::OnDevice);
        h.engine.set_backend_preference(BackendKind::Network);
        let info = h.engine.backend_info();
        assert_eq!(info.preference, BackendKind::Network);
        assert_eq!(info.effective, BackendKind::Network);

        h.engine.enter_background().await;
        h.engine.enter_foreground().await;
        h.engine.memory_warning().await;
        assert_eq!(h.on_device.modes().len(), 2);
        assert_eq!(h.on_device.releases(), 1);
    }
}
