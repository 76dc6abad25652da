//! Audio output — the device side of the playback queue.
//!
//! [`RodioOutput`] runs rodio on a dedicated OS thread (rodio's
//! `OutputStream` is `!Send`) driven by commands over a std channel. One
//! `Sink` lives per `play()` call; follow-up segments are appended to it so
//! consecutive segments play without a gap. The thread publishes progress
//! (finished source count, position in the current source) into shared state
//! tagged with the generation of the `play()` call it belongs to.

use std::io::Cursor;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rodio::{Decoder, OutputStream, Sink};
use tracing::{debug, error, warn};

use lector_core::error::SpeechError;

/// Playback device for one paragraph's segments.
///
/// Pause state and rate persist across `play()` calls until changed.
pub trait AudioOutput: Send {
    /// Drop whatever is playing and start `audio` (a WAV file).
    fn play(&mut self, audio: &[u8]) -> Result<(), SpeechError>;

    /// Queue `audio` to start the instant the current audio ends.
    fn enqueue(&mut self, audio: &[u8]) -> Result<(), SpeechError>;

    fn pause(&mut self);

    fn resume(&mut self);

    /// Stop and release the current audio.
    fn stop(&mut self);

    /// Seek within the currently playing audio.
    fn seek(&mut self, position: f64);

    fn set_rate(&mut self, rate: f32);

    /// Seconds into the currently playing audio.
    fn position(&self) -> f64;

    /// Sources finished since the last `play()`.
    fn finished_count(&self) -> usize;
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);

type WavSource = Decoder<Cursor<Vec<u8>>>;

enum OutputCmd {
    Play { source: WavSource, generation: u64 },
    Enqueue { source: WavSource, generation: u64 },
    Pause,
    Resume,
    Stop,
    Seek(f64),
    Rate(f32),
}

#[derive(Debug, Default)]
struct Progress {
    generation: u64,
    finished: usize,
    position: f64,
}

pub struct RodioOutput {
    cmd_tx: mpsc::Sender<OutputCmd>,
    progress: Arc<Mutex<Progress>>,
    generation: u64,
}

fn decode(audio: &[u8]) -> Result<WavSource, SpeechError> {
    Decoder::new(Cursor::new(audio.to_vec()))
        .map_err(|e| SpeechError::DecodingFailed(format!("audio decode: {e}")))
}

impl RodioOutput {
    /// Open the default output device on a new playback thread.
    pub fn spawn() -> Result<Self, String> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let progress = Arc::new(Mutex::new(Progress::default()));

        let thread_progress = progress.clone();
        std::thread::Builder::new()
            .name("lector-playback".into())
            .spawn(move || playback_thread(cmd_rx, thread_progress, ready_tx))
            .map_err(|e| format!("failed to spawn playback thread: {e}"))?;

        ready_rx
            .recv()
            .map_err(|_| "playback thread exited during startup".to_string())??;

        Ok(Self {
            cmd_tx,
            progress,
            generation: 0,
        })
    }

    fn progress(&self) -> std::sync::MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn send(&self, cmd: OutputCmd) {
        if self.cmd_tx.send(cmd).is_err() {
            error!("playback: thread is gone");
        }
    }
}

impl AudioOutput for RodioOutput {
    fn play(&mut self, audio: &[u8]) -> Result<(), SpeechError> {
        let source = decode(audio)?;
        self.generation += 1;
        *self.progress() = Progress {
            generation: self.generation,
            ..Progress::default()
        };
        self.send(OutputCmd::Play {
            source,
            generation: self.generation,
        });
        Ok(())
    }

    fn enqueue(&mut self, audio: &[u8]) -> Result<(), SpeechError> {
        let source = decode(audio)?;
        self.send(OutputCmd::Enqueue {
            source,
            generation: self.generation,
        });
        Ok(())
    }

    fn pause(&mut self) {
        self.send(OutputCmd::Pause);
    }

    fn resume(&mut self) {
        self.send(OutputCmd::Resume);
    }

    fn stop(&mut self) {
        // Orphan any progress the thread still reports for the old sink.
        self.generation += 1;
        *self.progress() = Progress {
            generation: self.generation,
            ..Progress::default()
        };
        self.send(OutputCmd::Stop);
    }

    fn seek(&mut self, position: f64) {
        self.send(OutputCmd::Seek(position));
    }

    fn set_rate(&mut self, rate: f32) {
        self.send(OutputCmd::Rate(rate));
    }

    fn position(&self) -> f64 {
        self.progress().position
    }

    fn finished_count(&self) -> usize {
        self.progress().finished
    }
}

// ─── Playback OS thread ───────────────────────────────────────────────────

fn playback_thread(
    cmd_rx: mpsc::Receiver<OutputCmd>,
    progress: Arc<Mutex<Progress>>,
    ready_tx: mpsc::Sender<Result<(), String>>,
) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => {
            let _ = ready_tx.send(Ok(()));
            pair
        }
        Err(e) => {
            error!("playback: failed to open audio output: {e}");
            let _ = ready_tx.send(Err(format!("failed to open audio output: {e}")));
            return;
        }
    };

    let mut sink: Option<Sink> = None;
    let mut generation = 0;
    let mut appended = 0usize;
    let mut paused = false;
    let mut rate = 1.0f32;

    loop {
        match cmd_rx.recv_timeout(POLL_INTERVAL) {
            Ok(OutputCmd::Play {
                source,
                generation: g,
            }) => {
                if let Some(old) = sink.take() {
                    old.stop();
                }
                match Sink::try_new(&handle) {
                    Ok(s) => {
                        s.set_speed(rate);
                        if paused {
                            s.pause();
                        }
                        s.append(source);
                        sink = Some(s);
                        generation = g;
                        appended = 1;
                        debug!("playback: started source (gen {g})");
                    }
                    Err(e) => error!("playback: failed to create sink: {e}"),
                }
            }
            Ok(OutputCmd::Enqueue {
                source,
                generation: g,
            }) => match &sink {
                Some(s) if g == generation => {
                    s.append(source);
                    appended += 1;
                }
                _ => debug!("playback: dropping enqueue for stale gen {g}"),
            },
            Ok(OutputCmd::Pause) => {
                paused = true;
                if let Some(s) = &sink {
                    s.pause();
                }
            }
            Ok(OutputCmd::Resume) => {
                paused = false;
                if let Some(s) = &sink {
                    s.play();
                }
            }
            Ok(OutputCmd::Stop) => {
                if let Some(s) = sink.take() {
                    s.stop();
                }
                appended = 0;
            }
            Ok(OutputCmd::Seek(t)) => {
                if let Some(s) = &sink {
                    if let Err(e) = s.try_seek(Duration::from_secs_f64(t.max(0.0))) {
                        warn!("playback: seek failed: {e}");
                    }
                }
            }
            Ok(OutputCmd::Rate(r)) => {
                rate = r;
                if let Some(s) = &sink {
                    s.set_speed(r);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(s) = sink.take() {
                    s.stop();
                }
                break;
            }
        }

        if let Some(s) = &sink {
            let mut p = progress.lock().unwrap_or_else(|e| e.into_inner());
            if p.generation == generation {
                p.finished = appended.saturating_sub(s.len());
                p.position = s.get_pos().as_secs_f64();
            }
        }
    }
}
