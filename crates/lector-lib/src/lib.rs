//! lector-lib — narration engine.
//!
//! Sentence-level speech synthesis across an on-device and a network backend,
//! next-paragraph preload, gapless playback, word sync, model download,
//! sidecar lifecycle and the HTTP API. Depends on lector-core for pure types
//! and text processing.

pub mod backend;
pub mod cache;
pub mod config;
pub mod download;
pub mod engine;
pub mod manager;
pub mod output;
pub mod pipeline;
pub mod queue;
pub mod selector;
pub mod server;
pub mod token;

#[cfg(test)]
pub(crate) mod testing;

// Re-export lector-core for convenience
pub use lector_core;
