//! Backend selection and on-device → network fallback.
//!
//! On-device is used when it is available and preferred. A failed on-device
//! call is retried once on the network backend, unless it failed because the
//! request was cancelled; cancellation never falls back.
//!
//! On-device calls take turns. The token is checked once a call has its
//! turn, so a request superseded while queued never reaches the model.

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;

use tracing::{debug, info, warn};

use lector_core::error::SpeechError;
use lector_core::types::{BackendInfo, BackendKind, ResourceMode, VoiceParams};

use crate::backend::{SpeechBackend, Synthesis};
use crate::token::RequestToken;

pub struct BackendSelector {
    on_device: Arc<dyn SpeechBackend>,
    network: Arc<dyn SpeechBackend>,
    preference: RwLock<BackendKind>,
    on_device_turn: Mutex<()>,
}

impl BackendSelector {
    pub fn new(
        on_device: Arc<dyn SpeechBackend>,
        network: Arc<dyn SpeechBackend>,
        preference: BackendKind,
    ) -> Self {
        Self {
            on_device,
            network,
            preference: RwLock::new(preference),
            on_device_turn: Mutex::new(()),
        }
    }

    pub fn preference(&self) -> BackendKind {
        *self.preference.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_preference(&self, kind: BackendKind) {
        *self.preference.write().unwrap_or_else(|e| e.into_inner()) = kind;
    }

    /// Network when on-device is unavailable, else the user's preference.
    pub fn choose(&self) -> BackendKind {
        if !self.on_device.is_available() {
            BackendKind::Network
        } else {
            self.preference()
        }
    }

    pub fn info(&self) -> BackendInfo {
        BackendInfo {
            preference: self.preference(),
            effective: self.choose(),
            on_device_available: self.on_device.is_available(),
        }
    }

    /// Synthesize one unit of text on the chosen backend, with fallback.
    ///
    /// The token is checked right before the call. A stale token after an
    /// on-device failure turns the failure into `Cancelled`.
    pub async fn synthesize(
        &self,
        text: &str,
        voice: &VoiceParams,
        token: &RequestToken,
    ) -> Result<Synthesis, SpeechError> {
        token.check()?;

        let kind = self.choose();
        let result = match kind {
            BackendKind::OnDevice => {
                let _turn = self.on_device_turn.lock().await;
                if token.is_stale() {
                    debug!("selector: request superseded while waiting for on-device");
                    return Err(SpeechError::Cancelled);
                }
                self.on_device.synthesize(text, voice).await
            }
            BackendKind::Network => self.network.synthesize(text, voice).await,
        };
        let err = match result {
            Ok(synthesis) => return Ok(synthesis),
            Err(e) => e,
        };

        if kind != BackendKind::OnDevice || !err.allows_fallback() {
            return Err(err);
        }
        if token.is_stale() {
            debug!("selector: on-device failed after cancellation, not falling back");
            return Err(SpeechError::Cancelled);
        }

        warn!("selector: on-device failed ({err}), falling back to network");
        self.network.synthesize(text, voice).await
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────

    /// Host process moved to the background.
    pub async fn enter_background(&self) {
        info!("selector: entering background");
        self.on_device.set_resource_mode(ResourceMode::Reduced).await;
    }

    /// Host process returned to the foreground.
    pub async fn enter_foreground(&self) {
        info!("selector: entering foreground");
        self.on_device.set_resource_mode(ResourceMode::Full).await;
    }

    pub async fn memory_warning(&self) {
        self.on_device.release_resources().await;
    }
}
