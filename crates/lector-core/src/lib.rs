//! lector-core — Pure types, text processing and word highlighting.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod document;
pub mod error;
pub mod highlight;
pub mod text_prep;
pub mod types;
pub mod wav;
