//! Test doubles: scripted backends, a fake model runtime and a fake output.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use lector_core::error::SpeechError;
use lector_core::text_prep::split_at_limit;
use lector_core::types::{AudioSegment, BackendKind, ResourceMode, VoiceParams, WordTimestamp};
use lector_core::wav::{parse_wav_header, write_wav};

use crate::backend::on_device::ModelRuntime;
use crate::backend::{SpeechBackend, Synthesis};
use crate::output::AudioOutput;

/// Seconds of synthetic audio per word.
pub const WORD_SECONDS: f64 = 0.1;
const SAMPLE_RATE: u32 = 8_000;

/// Synthetic audio for `text`: silence lasting `WORD_SECONDS` per word, with
/// evenly spaced timestamps.
pub fn synthetic_audio(text: &str) -> (Vec<u8>, f64, Vec<WordTimestamp>) {
    let words: Vec<&str> = text.split_whitespace().collect();
    let samples = words.len() * (SAMPLE_RATE as f64 * WORD_SECONDS) as usize;
    let timestamps = words
        .iter()
        .enumerate()
        .map(|(k, w)| WordTimestamp::new(*w, k as f64 * WORD_SECONDS, (k + 1) as f64 * WORD_SECONDS))
        .collect();
    (
        write_wav(&vec![0i16; samples], SAMPLE_RATE),
        words.len() as f64 * WORD_SECONDS,
        timestamps,
    )
}

pub fn segment(paragraph: usize, index: usize, text: &str) -> Arc<AudioSegment> {
    let (audio, duration, word_timestamps) = synthetic_audio(text);
    Arc::new(AudioSegment {
        paragraph_index: paragraph,
        segment_index: index,
        audio,
        word_timestamps,
        duration,
        source_text: text.to_string(),
    })
}

/// Poll `cond` until it holds, panicking after two seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ─── ScriptedBackend ─────────────────────────────────────────────────────

#[derive(Default)]
struct CallLog {
    calls: Vec<String>,
    voices: Vec<VoiceParams>,
    modes: Vec<ResourceMode>,
    releases: usize,
}

type CallHook = Box<dyn FnMut() + Send>;

/// Backend that answers from a script and records every call.
pub struct ScriptedBackend {
    kind: BackendKind,
    available: bool,
    fail_all: Option<SpeechError>,
    fail_on: Vec<(String, SpeechError)>,
    undecodable_on: Vec<String>,
    limit: usize,
    stall: bool,
    gate: Option<Arc<Semaphore>>,
    hook: Mutex<Option<CallHook>>,
    log: Mutex<CallLog>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            available: true,
            fail_all: None,
            fail_on: Vec::new(),
            undecodable_on: Vec::new(),
            limit: 0,
            stall: false,
            gate: None,
            hook: Mutex::new(None),
            log: Mutex::new(CallLog::default()),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn failing(mut self, err: SpeechError) -> Self {
        self.fail_all = Some(err);
        self
    }

    /// Fail any call whose text contains `needle`.
    pub fn failing_on(mut self, needle: &str, err: SpeechError) -> Self {
        self.fail_on.push((needle.to_string(), err));
        self
    }

    /// Answer any call whose text contains `needle` with audio that is not WAV.
    pub fn undecodable_on(mut self, needle: &str) -> Self {
        self.undecodable_on.push(needle.to_string());
        self
    }

    /// Per-call character limit; the rest comes back unprocessed.
    pub fn with_limit(mut self, max_chars: usize) -> Self {
        self.limit = max_chars;
        self
    }

    /// Never make progress: everything comes back unprocessed.
    pub fn stalling(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Each call waits for, and consumes, one permit of `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Run `hook` at the start of every call, before the gate.
    pub fn on_call(self, hook: impl FnMut() + Send + 'static) -> Self {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().calls.clone()
    }

    pub fn voices(&self) -> Vec<VoiceParams> {
        self.log.lock().unwrap().voices.clone()
    }

    pub fn modes(&self) -> Vec<ResourceMode> {
        self.log.lock().unwrap().modes.clone()
    }

    pub fn releases(&self) -> usize {
        self.log.lock().unwrap().releases
    }
}

#[async_trait]
impl SpeechBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Synthesis, SpeechError> {
        {
            let mut log = self.log.lock().unwrap();
            log.calls.push(text.to_string());
            log.voices.push(voice.clone());
        }
        if let Some(hook) = self.hook.lock().unwrap().as_mut() {
            hook();
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        if let Some(err) = &self.fail_all {
            return Err(err.clone());
        }
        if let Some((_, err)) = self.fail_on.iter().find(|(n, _)| text.contains(n.as_str())) {
            return Err(err.clone());
        }

        let (processed, unprocessed) = if self.stall {
            (String::new(), Some(text.to_string()))
        } else {
            split_at_limit(text, self.limit)
        };
        let (mut audio, duration, word_timestamps) = synthetic_audio(&processed);
        if self.undecodable_on.iter().any(|n| text.contains(n.as_str())) {
            audio = b"not a wav file at all".to_vec();
        }
        Ok(Synthesis {
            audio,
            word_timestamps,
            duration,
            processed_text: processed,
            unprocessed_text: unprocessed,
        })
    }

    async fn set_resource_mode(&self, mode: ResourceMode) {
        self.log.lock().unwrap().modes.push(mode);
    }

    async fn release_resources(&self) {
        self.log.lock().unwrap().releases += 1;
    }
}

// ─── FakeRuntime ─────────────────────────────────────────────────────────

#[derive(Default)]
struct RuntimeState {
    loads: usize,
    unloads: usize,
    last_mode: Option<ResourceMode>,
    garbage: bool,
}

struct RuntimeInner {
    state: Mutex<RuntimeState>,
    gated: AtomicBool,
    gate: Arc<Semaphore>,
    infer_started: Notify,
}

impl Default for RuntimeInner {
    fn default() -> Self {
        Self {
            state: Mutex::new(RuntimeState::default()),
            gated: AtomicBool::new(false),
            gate: Arc::new(Semaphore::new(0)),
            infer_started: Notify::new(),
        }
    }
}

/// Model runtime that counts loads and unloads.
#[derive(Clone, Default)]
pub struct FakeRuntime {
    inner: Arc<RuntimeInner>,
}

impl FakeRuntime {
    pub fn loads(&self) -> usize {
        self.inner.state.lock().unwrap().loads
    }

    pub fn unloads(&self) -> usize {
        self.inner.state.lock().unwrap().unloads
    }

    pub fn last_mode(&self) -> Option<ResourceMode> {
        self.inner.state.lock().unwrap().last_mode
    }

    pub fn return_garbage(&self, garbage: bool) {
        self.inner.state.lock().unwrap().garbage = garbage;
    }

    /// Make inference wait for permits on the returned semaphore.
    pub fn gate(&self) -> Arc<Semaphore> {
        self.inner.gated.store(true, Ordering::SeqCst);
        self.inner.gate.clone()
    }

    pub async fn wait_for_infer_started(&self) {
        self.inner.infer_started.notified().await;
    }
}

#[async_trait]
impl ModelRuntime for FakeRuntime {
    async fn load(&mut self, mode: ResourceMode) -> Result<(), String> {
        let mut state = self.inner.state.lock().unwrap();
        state.loads += 1;
        state.last_mode = Some(mode);
        Ok(())
    }

    async fn unload(&mut self) {
        self.inner.state.lock().unwrap().unloads += 1;
    }

    async fn infer(&mut self, text: &str, _voice: &VoiceParams) -> Result<Vec<u8>, SpeechError> {
        self.inner.infer_started.notify_one();
        if self.inner.gated.load(Ordering::SeqCst) {
            self.inner.gate.acquire().await.unwrap().forget();
        }
        if self.inner.state.lock().unwrap().garbage {
            return Ok(b"not a wav file at all".to_vec());
        }
        Ok(synthetic_audio(text).0)
    }
}

// ─── FakeOutput ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct OutputState {
    handed: usize,
    finished: usize,
    position: f64,
    plays: usize,
    paused: bool,
    rate: f32,
    seeks: Vec<f64>,
    auto_finish: bool,
}

impl Default for OutputState {
    fn default() -> Self {
        Self {
            handed: 0,
            finished: 0,
            position: 0.0,
            plays: 0,
            paused: false,
            rate: 1.0,
            seeks: Vec::new(),
            auto_finish: false,
        }
    }
}

/// Output whose progress is driven by the test.
#[derive(Clone, Default)]
pub struct FakeOutput {
    state: Arc<Mutex<OutputState>>,
}

fn check_wav(audio: &[u8]) -> Result<(), SpeechError> {
    parse_wav_header(audio)
        .map(|_| ())
        .map_err(|e| SpeechError::DecodingFailed(e.to_string()))
}

impl FakeOutput {
    /// Audio finishes as soon as it is handed over.
    pub fn auto_finishing() -> Self {
        let out = Self::default();
        out.set_auto_finish(true);
        out
    }

    pub fn set_auto_finish(&self, on: bool) {
        self.state.lock().unwrap().auto_finish = on;
    }

    /// End the audio currently playing.
    pub fn finish_current(&self) {
        let mut s = self.state.lock().unwrap();
        if s.finished < s.handed {
            s.finished += 1;
            s.position = 0.0;
        }
    }

    pub fn set_position(&self, position: f64) {
        self.state.lock().unwrap().position = position;
    }

    pub fn handed(&self) -> usize {
        self.state.lock().unwrap().handed
    }

    pub fn plays(&self) -> usize {
        self.state.lock().unwrap().plays
    }

    pub fn seeks(&self) -> Vec<f64> {
        self.state.lock().unwrap().seeks.clone()
    }

    pub fn rate(&self) -> f32 {
        self.state.lock().unwrap().rate
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }
}

impl AudioOutput for FakeOutput {
    fn play(&mut self, audio: &[u8]) -> Result<(), SpeechError> {
        check_wav(audio)?;
        let mut s = self.state.lock().unwrap();
        s.plays += 1;
        s.handed = 1;
        s.finished = 0;
        s.position = 0.0;
        Ok(())
    }

    fn enqueue(&mut self, audio: &[u8]) -> Result<(), SpeechError> {
        check_wav(audio)?;
        self.state.lock().unwrap().handed += 1;
        Ok(())
    }

    fn pause(&mut self) {
        self.state.lock().unwrap().paused = true;
    }

    fn resume(&mut self) {
        self.state.lock().unwrap().paused = false;
    }

    fn stop(&mut self) {
        let mut s = self.state.lock().unwrap();
        s.handed = 0;
        s.finished = 0;
        s.position = 0.0;
    }

    fn seek(&mut self, position: f64) {
        let mut s = self.state.lock().unwrap();
        s.seeks.push(position);
        s.position = position;
    }

    fn set_rate(&mut self, rate: f32) {
        self.state.lock().unwrap().rate = rate;
    }

    fn position(&self) -> f64 {
        self.state.lock().unwrap().position
    }

    fn finished_count(&self) -> usize {
        let s = self.state.lock().unwrap();
        if s.auto_finish && !s.paused {
            s.handed
        } else {
            s.finished
        }
    }
}
