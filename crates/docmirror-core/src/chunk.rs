//! Heading-aware text chunker.
//!
//! Splits sanitized document text into [`IngestedChunk`]s bounded by
//! `max_chars` characters. Text is first cut into sections on `## heading`
//! lines; each section keeps its heading as `heading_path` and the language
//! of its first fenced code block as `code_lang`.
//!
//! # Algorithm
//!
//! 1. Split the text into sections at every line starting with `## `.
//!    The heading line stays at the top of its section's text.
//! 2. A section no longer than `max_chars` becomes one chunk.
//! 3. Larger sections are split on blank-line paragraph boundaries and
//!    paragraphs are packed greedily into chunks of at most `max_chars`.
//! 4. A single paragraph longer than `max_chars` is hard-split every
//!    `max_chars` characters.
//!
//! Empty text yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use docmirror_core::chunk::chunk_structured_text;
//!
//! let chunks = chunk_structured_text("## Auth\n\nUse a bearer token.", 1800);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].heading_path.as_deref(), Some("Auth"));
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::extract::normalize_whitespace;
use crate::models::IngestedChunk;

/// Default upper bound on chunk length, in characters.
pub const DEFAULT_MAX_CHUNK_CHARS: usize = 1800;

static FENCE_LANG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)```([a-z0-9_+-]+)\n").unwrap());

/// A heading-delimited slice of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredSection {
    pub heading_path: Option<String>,
    pub text: String,
    pub code_lang: Option<String>,
}

fn heading_of(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix("## ")
}

fn make_section(heading_path: Option<String>, body: &[&str]) -> Option<StructuredSection> {
    let text = normalize_whitespace(&body.join("\n"));
    if text.is_empty() {
        return None;
    }
    let code_lang = FENCE_LANG_RE
        .captures(&text)
        .map(|c| c[1].to_lowercase());
    Some(StructuredSection {
        heading_path,
        text,
        code_lang,
    })
}

/// Split text into sections on `## heading` lines.
///
/// Text before the first heading forms a section without a heading path.
/// Sections that are empty after whitespace normalization are dropped.
pub fn split_structured_sections(text: &str) -> Vec<StructuredSection> {
    let mut sections = Vec::new();
    let mut heading_path: Option<String> = None;
    let mut body: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some(heading) = heading_of(line) {
            if !body.is_empty() {
                sections.extend(make_section(heading_path.take(), &body));
            }
            let heading = heading.trim();
            heading_path = (!heading.is_empty()).then(|| heading.to_string());
            body = vec![line];
            continue;
        }
        body.push(line);
    }

    if !body.is_empty() {
        sections.extend(make_section(heading_path, &body));
    }

    sections
}

fn chunk_of(section: &StructuredSection, text: String) -> IngestedChunk {
    IngestedChunk {
        text,
        heading_path: section.heading_path.clone(),
        code_lang: section.code_lang.clone(),
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split `paragraph` into pieces of at most `max_chars` characters.
fn hard_split(paragraph: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = paragraph.chars().collect();
    chars
        .chunks(max_chars)
        .map(|piece| piece.iter().collect::<String>())
        .filter(|piece| !piece.trim().is_empty())
        .collect()
}

/// Chunk sanitized text into heading-scoped pieces of at most `max_chars`
/// characters each.
///
/// A `max_chars` of zero is treated as one.
pub fn chunk_structured_text(text: &str, max_chars: usize) -> Vec<IngestedChunk> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();

    for section in split_structured_sections(text) {
        if char_len(&section.text) <= max_chars {
            let text = section.text.clone();
            chunks.push(chunk_of(&section, text));
            continue;
        }

        let mut current = String::new();
        for paragraph in section.text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            if char_len(paragraph) > max_chars {
                if !current.is_empty() {
                    chunks.push(chunk_of(&section, std::mem::take(&mut current)));
                }
                for piece in hard_split(paragraph, max_chars) {
                    chunks.push(chunk_of(&section, piece));
                }
                continue;
            }

            let would_be = if current.is_empty() {
                char_len(paragraph)
            } else {
                char_len(&current) + 2 + char_len(paragraph)
            };

            if would_be > max_chars {
                chunks.push(chunk_of(&section, std::mem::take(&mut current)));
                current.push_str(paragraph);
            } else {
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(paragraph);
            }
        }

        if !current.trim().is_empty() {
            chunks.push(chunk_of(&section, current.trim().to_string()));
        }
    }

    chunks
}

/// Rough token estimate: the larger of the word count and `chars / 4`.
pub fn estimate_token_count(text: &str) -> i64 {
    let words = text.split_whitespace().count();
    let by_chars = char_len(text).div_ceil(4);
    words.max(by_chars) as i64
}

/// Hex-encoded SHA-256 of the full document content.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
