//! On-device backend — a lazily loaded local model behind an exclusive lock.
//!
//! The model runtime is loaded on the first request, can be released under
//! memory pressure and reloads transparently. Switching resource mode bumps a
//! switch epoch before waiting for the in-flight call, so a call that straddles
//! a switch fails with `BackendUnavailable` instead of returning audio from a
//! torn-down runtime.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use lector_core::error::SpeechError;
use lector_core::highlight::estimate_word_timestamps;
use lector_core::types::{BackendKind, ResourceMode, VoiceParams};

use super::{decode_wav, SpeechBackend, Synthesis};

/// The loadable model behind the on-device backend.
#[async_trait]
pub trait ModelRuntime: Send {
    async fn load(&mut self, mode: ResourceMode) -> Result<(), String>;

    async fn unload(&mut self);

    /// Synthesize `text` into a WAV file. Only called while loaded.
    async fn infer(&mut self, text: &str, voice: &VoiceParams) -> Result<Vec<u8>, SpeechError>;
}

struct RuntimeSlot {
    runtime: Box<dyn ModelRuntime>,
    loaded: Option<ResourceMode>,
}

pub struct OnDeviceBackend {
    slot: Mutex<RuntimeSlot>,
    mode: StdMutex<ResourceMode>,
    switch_epoch: AtomicU64,
    ready: AtomicBool,
}

impl OnDeviceBackend {
    /// `ready` is the persisted model readiness flag; the backend reports
    /// itself unavailable until it is set.
    pub fn new(runtime: Box<dyn ModelRuntime>, ready: bool) -> Self {
        Self {
            slot: Mutex::new(RuntimeSlot {
                runtime,
                loaded: None,
            }),
            mode: StdMutex::new(ResourceMode::Full),
            switch_epoch: AtomicU64::new(0),
            ready: AtomicBool::new(ready),
        }
    }

    pub fn mode(&self) -> ResourceMode {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mode the runtime is currently loaded in, if any.
    pub async fn loaded_mode(&self) -> Option<ResourceMode> {
        self.slot.lock().await.loaded
    }

    /// Switch resource mode, unloading and reloading a loaded runtime.
    ///
    /// Waits for an in-flight call to return first; that call fails.
    pub async fn switch_mode(&self, mode: ResourceMode) {
        {
            let mut current = self.mode.lock().unwrap_or_else(|e| e.into_inner());
            if *current == mode {
                return;
            }
            *current = mode;
        }
        self.switch_epoch.fetch_add(1, Ordering::SeqCst);

        let mut slot = self.slot.lock().await;
        if slot.loaded.take().is_some() {
            info!("on-device: switching to {mode:?} mode");
            slot.runtime.unload().await;
            match slot.runtime.load(mode).await {
                Ok(()) => slot.loaded = Some(mode),
                Err(e) => warn!("on-device: reload after mode switch failed: {e}"),
            }
        } else {
            debug!("on-device: mode set to {mode:?} (not loaded)");
        }
    }

    /// Release the runtime. The next request reloads it.
    pub async fn release(&self) {
        let mut slot = self.slot.lock().await;
        if slot.loaded.take().is_some() {
            info!("on-device: releasing model under memory pressure");
            slot.runtime.unload().await;
        }
    }
}

#[async_trait]
impl SpeechBackend for OnDeviceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OnDevice
    }

    fn is_available(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn synthesize(&self, text: &str, voice: &VoiceParams) -> Result<Synthesis, SpeechError> {
        if !self.is_available() {
            return Err(SpeechError::BackendUnavailable("model not installed".into()));
        }

        let epoch = self.switch_epoch.load(Ordering::SeqCst);
        let mut slot = self.slot.lock().await;
        if self.switch_epoch.load(Ordering::SeqCst) != epoch {
            return Err(SpeechError::BackendUnavailable("resource mode switched".into()));
        }

        let mode = self.mode();
        if slot.loaded != Some(mode) {
            if slot.loaded.take().is_some() {
                slot.runtime.unload().await;
            }
            info!("on-device: loading model ({mode:?})");
            slot.runtime
                .load(mode)
                .await
                .map_err(SpeechError::BackendUnavailable)?;
            slot.loaded = Some(mode);
        }

        debug!("on-device: synthesizing {} chars", text.len());
        let wav = slot.runtime.infer(text, voice).await?;
        if self.switch_epoch.load(Ordering::SeqCst) != epoch {
            return Err(SpeechError::BackendUnavailable(
                "resource mode switched during synthesis".into(),
            ));
        }
        drop(slot);

        let (audio, duration) = decode_wav(wav)?;
        Ok(Synthesis {
            word_timestamps: estimate_word_timestamps(text, duration),
            audio,
            duration,
            processed_text: text.to_string(),
            unprocessed_text: None,
        })
    }

    async fn set_resource_mode(&self, mode: ResourceMode) {
        self.switch_mode(mode).await;
    }

    async fn release_resources(&self) {
        self.release().await;
    }
}
