//! Text preparation — sentence segmentation, markdown cleaning, paragraph
//! splitting and per-call length limits.
//!
//! Pure functions, no I/O.

use regex::Regex;
use std::sync::LazyLock;

// Compiled regexes — allocated once, reused across calls.
static RE_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)(?:^|\n)(\|[^\n]+\|(?:\n\|[^\n]+\|)*)").unwrap());
static RE_FENCED_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").unwrap());
static RE_INLINE_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`]+`").unwrap());
static RE_HR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[\s]*[-*_]{3,}[\s]*$").unwrap());
static RE_BOLD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap());
static RE_ITALIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*([^*]+)\*").unwrap());
static RE_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#{1,6}\s*").unwrap());
static RE_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap());
static RE_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[\s]*[-*]\s+").unwrap());
static RE_NUMBERED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[\s]*\d+\.\s+").unwrap());
static RE_LEADING_DOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\.\s*").unwrap());
static RE_DOUBLE_DOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\s*\.").unwrap());
static RE_MULTI_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{2,}").unwrap());

/// Strip markdown formatting so text reads naturally when spoken.
///
/// Handles: fenced code blocks, tables, inline code, bold/italic,
/// headings, links, bullets/numbered lists, horizontal rules.
pub fn clean_markdown(text: &str) -> String {
    let mut c = text.to_string();

    // Tables → placeholder (before code blocks, since tables can appear inside fences)
    c = RE_TABLE.replace_all(&c, "\nSee the table in the document.\n").into_owned();
    // Fenced code blocks → placeholder
    c = RE_FENCED_CODE.replace_all(&c, " See the code in the document. ").into_owned();
    // Inline code → removed
    c = RE_INLINE_CODE.replace_all(&c, "").into_owned();
    // Horizontal rules → removed
    c = RE_HR.replace_all(&c, "").into_owned();
    // Bold → plain
    c = RE_BOLD.replace_all(&c, "$1").into_owned();
    // Italic → plain
    c = RE_ITALIC.replace_all(&c, "$1").into_owned();
    // Headings → pound signs removed
    c = RE_HEADING.replace_all(&c, "").into_owned();
    // Links → text only
    c = RE_LINK.replace_all(&c, "$1").into_owned();
    // Bullets / numbered lists → ". " prefix
    c = RE_BULLET.replace_all(&c, ". ").into_owned();
    c = RE_NUMBERED.replace_all(&c, ". ").into_owned();
    // Clean up leading dot at start of string
    c = RE_LEADING_DOT.replace(&c, "").into_owned();
    // Double periods → single
    c = RE_DOUBLE_DOT.replace_all(&c, ".").into_owned();
    // Collapse whitespace
    c = RE_MULTI_SPACE.replace_all(&c, " ").into_owned();

    c.trim().to_string()
}

/// Characters that close a sentence unit.
const TERMINALS: &[char] = &['.', '!', '?', '。', '！', '？'];

/// Characters absorbed into a unit right after its terminal punctuation.
const CLOSERS: &[char] = &['"', '\'', ')', ']', '”', '’', '»', '」', '』', '）'];

fn is_terminal(c: char) -> bool {
    TERMINALS.contains(&c)
}

/// Split paragraph text into sentence-sized synthesis units.
///
/// A unit closes at terminal punctuation (`. ! ? 。 ！ ？`). Runs of terminal
/// punctuation and trailing closing quotes stay with the unit they end, and an
/// ASCII `.` directly followed by a letter or digit (`3.14`, `e.g`) does not
/// close a unit. Units are trimmed.
///
/// Text without terminal punctuation comes back as a single unit, so non-blank
/// input never yields an empty list. Blank input yields no units.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if !is_terminal(c) {
            continue;
        }
        if c == '.' && matches!(chars.peek(), Some((_, next)) if next.is_alphanumeric()) {
            continue;
        }

        let mut end = i + c.len_utf8();
        while let Some(&(j, next)) = chars.peek() {
            if is_terminal(next) || CLOSERS.contains(&next) {
                end = j + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        push_unit(&mut units, &text[start..end]);
        start = end;
    }

    push_unit(&mut units, &text[start..]);
    units
}

fn push_unit(units: &mut Vec<String>, raw: &str) {
    let unit = raw.trim();
    if !unit.is_empty() {
        units.push(unit.to_string());
    }
}

/// Split a plain-text document into paragraphs at blank lines.
///
/// Lines inside a paragraph are joined with a single space.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    let mut paragraphs = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(current.join(" "));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current.join(" "));
    }

    paragraphs
}

/// Split `text` at a per-call length limit of `max_chars` characters.
///
/// Returns the part to process now and the unprocessed remainder, if any.
/// Prefers a sentence boundary in the back half of the window, then a word
/// boundary in the back two thirds, then a hard split. A limit of 0 means
/// unlimited.
pub fn split_at_limit(text: &str, max_chars: usize) -> (String, Option<String>) {
    let text = text.trim();
    let window_end = match text.char_indices().nth(max_chars) {
        Some((byte, _)) if max_chars > 0 => byte,
        _ => return (text.to_string(), None),
    };
    let window = &text[..window_end];

    let sentence_break = window
        .char_indices()
        .zip(window.chars().skip(1))
        .filter(|((_, c), next)| is_terminal(*c) && next.is_whitespace())
        .map(|((i, c), _)| i + c.len_utf8())
        .last()
        .filter(|&pos| pos >= window_end / 2);

    let split_at = sentence_break.unwrap_or_else(|| word_boundary_or_hard(window, window_end));

    let head = text[..split_at].trim_end().to_string();
    let tail = text[split_at..].trim_start();
    let tail = (!tail.is_empty()).then(|| tail.to_string());
    (head, tail)
}

/// Find a word boundary, or fall back to a hard split.
fn word_boundary_or_hard(window: &str, window_end: usize) -> usize {
    if let Some(pos) = window.rfind(' ') {
        if pos >= window_end / 3 {
            return pos;
        }
    }
    window_end
}
