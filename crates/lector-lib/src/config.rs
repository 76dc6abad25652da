//! Persisted reader configuration (JSON).

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use lector_core::types::ReaderConfig;

/// `<config dir>/lector/config.json`, falling back to `~/.config`.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lector")
        .join("config.json")
}

/// Load the config at `path`. A missing file yields the defaults.
pub fn load(path: &Path) -> Result<ReaderConfig, String> {
    if !path.exists() {
        debug!("config: {} not found, using defaults", path.display());
        return Ok(ReaderConfig::default());
    }
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("invalid config {}: {e}", path.display()))
}

pub fn save(path: &Path, config: &ReaderConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("failed to serialize config: {e}"))?;
    std::fs::write(path, json).map_err(|e| format!("failed to write {}: {e}", path.display()))?;
    info!("config: saved {}", path.display());
    Ok(())
}
