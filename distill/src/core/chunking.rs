//! Document chunking helpers exposed to supervisor code when the
//! built-in-chunking flag is set.
//!
//! All lengths are counted in characters, not bytes.

use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;

pub const DEFAULT_MIN_PARAGRAPH_LEN: usize = 100;
pub const DEFAULT_CHUNK_SIZE: usize = 6000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 500;

static SECTION_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\A(?:={3}|#{3,}\s)").unwrap());
static BLANK_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n\s*\n").unwrap());

/// Split before every line that opens with `===` or a `###` header.
pub fn chunk_by_section(text: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices('\n') {
        if SECTION_HEADER_RE.is_match(&text[idx + 1..]) {
            parts.push(&text[start..idx]);
            start = idx + 1;
        }
    }
    parts.push(&text[start..]);

    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split on blank lines, merging short paragraphs until `min_length` is reached.
///
/// A trailing remainder shorter than `min_length` is folded into the last chunk.
pub fn chunk_by_paragraph(text: &str, min_length: usize) -> Vec<String> {
    let mut chunks: Vec<String> = Vec::new();
    let mut buf = String::new();
    for para in BLANK_LINE_RE.split(text).map(str::trim) {
        if para.is_empty() {
            continue;
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
        if buf.chars().count() >= min_length {
            chunks.push(std::mem::take(&mut buf));
        }
    }
    if !buf.is_empty() {
        match chunks.last_mut() {
            Some(last) => {
                last.push_str("\n\n");
                last.push_str(&buf);
            }
            None => chunks.push(buf),
        }
    }
    chunks
}

/// Overlapping fixed-size character windows.
///
/// Text no longer than `chunk_size` comes back as a single chunk. Each window
/// starts `chunk_size - overlap` characters after the previous one.
pub fn chunk_by_tokens(text: &str, chunk_size: usize, overlap: usize) -> Result<Vec<String>> {
    if chunk_size == 0 {
        bail!("chunk_size must be > 0");
    }
    if overlap >= chunk_size {
        bail!("overlap ({overlap}) must be smaller than chunk_size ({chunk_size})");
    }
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= chunk_size {
        return Ok(vec![text.to_string()]);
    }
    let stride = chunk_size - overlap;
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        start += stride;
    }
    Ok(chunks)
}
