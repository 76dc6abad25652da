//! Request tokens — epoch-based cancellation.
//!
//! A [`TokenSource`] holds a shared epoch. Issuing a token bumps the epoch, so
//! every token issued earlier becomes stale at once. Work compares its captured
//! token against the live epoch before taking any externally visible action.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lector_core::error::SpeechError;

#[derive(Debug, Clone, Default)]
pub struct TokenSource {
    epoch: Arc<AtomicU64>,
}

impl TokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidate every outstanding token and return a fresh one.
    pub fn issue(&self) -> RequestToken {
        let id = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        RequestToken {
            id,
            epoch: self.epoch.clone(),
        }
    }

    /// Invalidate every outstanding token.
    pub fn invalidate(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

/// One "synthesize paragraph P" intent.
#[derive(Debug, Clone)]
pub struct RequestToken {
    id: u64,
    epoch: Arc<AtomicU64>,
}

impl RequestToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_current(&self) -> bool {
        self.epoch.load(Ordering::SeqCst) == self.id
    }

    pub fn is_stale(&self) -> bool {
        !self.is_current()
    }

    /// `Err(Cancelled)` once superseded.
    pub fn check(&self) -> Result<(), SpeechError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(SpeechError::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuing_supersedes_previous() {
        let source = TokenSource::new();
        let first = source.issue();
        assert!(first.is_current());

        let second = source.issue();
        assert!(first.is_stale());
        assert!(second.is_current());
        assert_eq!(first.check(), Err(SpeechError::Cancelled));
        assert_eq!(second.check(), Ok(()));
    }

    #[test]
    fn invalidate_without_replacement() {
        let source = TokenSource::new();
        let token = source.issue();
        source.invalidate();
        assert!(token.is_stale());
    }

    #[test]
    fn sources_are_independent() {
        let active = TokenSource::new();
        let preload = TokenSource::new();
        let a = active.issue();
        let p = preload.issue();
        active.invalidate();
        assert!(a.is_stale());
        assert!(p.is_current());
    }
}
