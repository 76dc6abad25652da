//! Document assembly and table-of-contents resolution.

use crate::text_prep::{clean_markdown, split_paragraphs};
use crate::types::{Paragraph, TocEntry};

/// Build the paragraph list for a plain-text or markdown document.
///
/// Paragraphs are separated by blank lines. Markdown blocks are cleaned one
/// at a time and dropped if nothing speakable is left.
pub fn paragraphs_from_text(text: &str, markdown: bool) -> Vec<Paragraph> {
    split_paragraphs(text)
        .into_iter()
        .map(|p| if markdown { clean_markdown(&p) } else { p })
        .filter(|p| !p.trim().is_empty())
        .enumerate()
        .map(|(i, p)| Paragraph::new(i, p))
        .collect()
}

/// Find the paragraph a TOC entry points at.
///
/// An exact anchor match wins. Otherwise the first paragraph whose text
/// contains the entry's text prefix (or its label, when no prefix is given).
pub fn resolve_toc_entry(entry: &TocEntry, paragraphs: &[Paragraph]) -> Option<usize> {
    if let Some(anchor) = entry.anchor.as_deref().filter(|a| !a.is_empty()) {
        if let Some(p) = paragraphs
            .iter()
            .find(|p| p.anchor.as_deref() == Some(anchor))
        {
            return Some(p.index);
        }
    }

    let needle = entry
        .text_prefix
        .as_deref()
        .unwrap_or(&entry.label)
        .trim();
    if needle.is_empty() {
        return None;
    }
    paragraphs
        .iter()
        .find(|p| p.text.contains(needle))
        .map(|p| p.index)
}
