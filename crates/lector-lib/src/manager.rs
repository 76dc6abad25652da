//! Sidecar lifecycle manager — spawns, health-checks and kills the local `koko` server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info};

use lector_core::types::{ResourceMode, SidecarStatus, KOKORO_MODEL};

use crate::download;

const KOKORO_SIDECAR: &str = "koko";

/// Thread cap for the sidecar while running in reduced mode.
const REDUCED_THREADS: &str = "1";

struct RunningService {
    child: Child,
    mode: ResourceMode,
}

pub struct SidecarManager {
    port: u16,
    kokoro: Arc<Mutex<Option<RunningService>>>,
    client: reqwest::Client,
}

impl SidecarManager {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            kokoro: Arc::new(Mutex::new(None)),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub async fn status(&self, models_dir: &Path) -> SidecarStatus {
        let mode = self.running_mode().await;
        SidecarStatus {
            model_downloaded: download::model_exists(models_dir, &KOKORO_MODEL),
            running: mode.is_some(),
            port: self.port,
            mode,
        }
    }

    /// Spawn `koko` with the given model files and wait until it answers.
    ///
    /// A server already running in the same mode is reused; one running in a
    /// different mode is killed first.
    pub async fn start(
        &self,
        model_path: &Path,
        voices_path: &Path,
        mode: ResourceMode,
        health_timeout: Duration,
    ) -> Result<(), String> {
        match self.running_mode().await {
            Some(running) if running == mode => return Ok(()),
            Some(_) => self.stop().await,
            None => {}
        }

        let binary = resolve_sidecar(KOKORO_SIDECAR)?;
        let mut cmd = tokio::process::Command::new(&binary);
        // koko --model <path> --data <voices> openai --ip 127.0.0.1 --port <port>
        cmd.args([
            "--model",
            &model_path.to_string_lossy(),
            "--data",
            &voices_path.to_string_lossy(),
            "openai",
            "--ip",
            "127.0.0.1",
            "--port",
            &self.port.to_string(),
        ])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
        if mode == ResourceMode::Reduced {
            cmd.env("OMP_NUM_THREADS", REDUCED_THREADS);
        }

        let child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {e}", binary.display()))?;
        info!("on-device: spawned koko on port {} ({mode:?})", self.port);
        self.drain_stderr(child, mode).await;

        if let Err(e) = self.wait_for_health(health_timeout).await {
            self.stop().await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let mut guard = self.kokoro.lock().await;
        if let Some(mut svc) = guard.take() {
            debug!("on-device: killing koko");
            let _ = svc.child.kill().await;
        }
    }

    /// Mode of the live sidecar, clearing the slot if the process has exited.
    pub async fn running_mode(&self) -> Option<ResourceMode> {
        let mut guard = self.kokoro.lock().await;
        let svc = guard.as_mut()?;
        match svc.child.try_wait() {
            Ok(None) => Some(svc.mode),
            Ok(Some(_)) | Err(_) => {
                *guard = None;
                None
            }
        }
    }

    async fn drain_stderr(&self, mut child: Child, mode: ResourceMode) {
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                use tokio::io::{AsyncBufReadExt, BufReader};
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[koko] {line}");
                }
            });
        }

        *self.kokoro.lock().await = Some(RunningService { child, mode });
    }

    async fn wait_for_health(&self, timeout: Duration) -> Result<(), String> {
        let url = format!("{}/", self.base_url());
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if tokio::time::Instant::now() > deadline {
                return Err(format!(
                    "koko did not become ready within {}s",
                    timeout.as_secs()
                ));
            }
            if self.running_mode().await.is_none() {
                return Err("koko exited during startup".into());
            }

            match self.client.get(&url).send().await {
                Ok(_) => return Ok(()),
                Err(_) => tokio::time::sleep(Duration::from_millis(500)).await,
            }
        }
    }
}

/// Locate the `koko` binary: next to the executable (with or without a
/// target-triple suffix), else rely on `PATH`.
fn resolve_sidecar(name: &str) -> Result<PathBuf, String> {
    let exe =
        std::env::current_exe().map_err(|e| format!("cannot determine executable path: {e}"))?;
    let exe_dir = exe
        .parent()
        .ok_or_else(|| "executable has no parent directory".to_string())?;

    let triple = target_triple();
    let candidates = [
        exe_dir.join(format!("{name}-{triple}")),
        exe_dir.join(format!("{name}-{triple}.exe")),
        exe_dir.join(name),
    ];
    Ok(candidates
        .into_iter()
        .find(|p| p.is_file())
        .unwrap_or_else(|| PathBuf::from(name)))
}

fn target_triple() -> &'static str {
    #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
    {
        "x86_64-unknown-linux-gnu"
    }
    #[cfg(all(target_arch = "aarch64", target_os = "linux"))]
    {
        "aarch64-unknown-linux-gnu"
    }
    #[cfg(all(target_arch = "x86_64", target_os = "macos"))]
    {
        "x86_64-apple-darwin"
    }
    #[cfg(all(target_arch = "aarch64", target_os = "macos"))]
    {
        "aarch64-apple-darwin"
    }
    #[cfg(all(target_arch = "x86_64", target_os = "windows"))]
    {
        "x86_64-pc-windows-msvc"
    }
    #[cfg(not(any(
        all(target_arch = "x86_64", target_os = "linux"),
        all(target_arch = "aarch64", target_os = "linux"),
        all(target_arch = "x86_64", target_os = "macos"),
        all(target_arch = "aarch64", target_os = "macos"),
        all(target_arch = "x86_64", target_os = "windows"),
    )))]
    {
        "unknown"
    }
}
