//! Recursive character splitter.
//!
//! Splits document text into [`Passage`]s of at most `max_chars` characters,
//! carrying up to `overlap_chars` characters of trailing context from one
//! passage into the next. Splitting tries paragraph breaks first, then line
//! breaks, then spaces, and only falls back to hard character cuts for runs
//! with no whitespace at all.
//!
//! Output is a pure function of the input: passage ids are derived from the
//! source path and position, so identical documents always produce identical
//! passages.

use std::collections::VecDeque;

use sha2::{Digest, Sha256};

use crate::models::{Document, Passage};

/// Separators tried in order. The empty separator means "split into chars".
const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone, Copy)]
pub struct ChunkSettings {
    pub max_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            overlap_chars: 300,
        }
    }
}

/// Split every document into passages, preserving document order.
pub fn split_documents(documents: &[Document], settings: ChunkSettings) -> Vec<Passage> {
    documents
        .iter()
        .flat_map(|doc| split_document(&doc.path, &doc.text, settings))
        .collect()
}

/// Split one document's text. Positions are contiguous from 0.
pub fn split_document(source: &str, text: &str, settings: ChunkSettings) -> Vec<Passage> {
    split_text(text, settings)
        .into_iter()
        .enumerate()
        .map(|(i, piece)| make_passage(source, i as u32, piece))
        .collect()
}

/// Split text into trimmed, non-empty pieces of at most `max_chars` chars.
pub fn split_text(text: &str, settings: ChunkSettings) -> Vec<String> {
    let max = settings.max_chars.max(1);
    let overlap = settings.overlap_chars.min(max - 1);
    recursive_split(text, &SEPARATORS, max, overlap)
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn recursive_split(text: &str, separators: &[&str], max: usize, overlap: usize) -> Vec<String> {
    // First separator that occurs in the text; "" always matches.
    let idx = separators
        .iter()
        .position(|sep| sep.is_empty() || text.contains(sep))
        .unwrap_or(separators.len() - 1);
    let separator = separators[idx];
    let finer = &separators[idx + 1..];

    let pieces: Vec<String> = if separator.is_empty() {
        text.chars().map(String::from).collect()
    } else {
        text.split(separator)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    };

    let mut out = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    for piece in pieces {
        if char_len(&piece) <= max {
            pending.push(piece);
            continue;
        }
        if !pending.is_empty() {
            out.extend(merge_pieces(&pending, separator, max, overlap));
            pending.clear();
        }
        if finer.is_empty() {
            out.push(piece);
        } else {
            out.extend(recursive_split(&piece, finer, max, overlap));
        }
    }
    if !pending.is_empty() {
        out.extend(merge_pieces(&pending, separator, max, overlap));
    }
    out
}

/// Greedily pack pieces (each already `<= max`) into passages joined by
/// `separator`. When a passage is flushed, pieces are dropped from its front
/// until at most `overlap` characters remain to seed the next passage.
fn merge_pieces(pieces: &[String], separator: &str, max: usize, overlap: usize) -> Vec<String> {
    let sep_len = char_len(separator);
    let mut out = Vec::new();
    let mut window: VecDeque<(&str, usize)> = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let len = char_len(piece);
        let joiner = if window.is_empty() { 0 } else { sep_len };
        if total + joiner + len > max && !window.is_empty() {
            push_joined(&mut out, &window, separator);
            while let Some(&(_, front_len)) = window.front() {
                let joiner = if window.is_empty() { 0 } else { sep_len };
                let too_much_overlap = total > overlap;
                let cannot_fit = total + joiner + len > max;
                if !(too_much_overlap || cannot_fit) {
                    break;
                }
                window.pop_front();
                total -= front_len + if window.is_empty() { 0 } else { sep_len };
            }
        }
        let joiner = if window.is_empty() { 0 } else { sep_len };
        total += joiner + len;
        window.push_back((piece.as_str(), len));
    }
    push_joined(&mut out, &window, separator);
    out
}

fn push_joined(out: &mut Vec<String>, window: &VecDeque<(&str, usize)>, separator: &str) {
    let joined = window
        .iter()
        .map(|(piece, _)| *piece)
        .collect::<Vec<_>>()
        .join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn make_passage(source: &str, position: u32, text: String) -> Passage {
    let mut id_hasher = Sha256::new();
    id_hasher.update(source.as_bytes());
    id_hasher.update([0u8]);
    id_hasher.update(position.to_le_bytes());
    let id = hex::encode(&id_hasher.finalize()[..16]);

    let hash = hex::encode(Sha256::digest(text.as_bytes()));

    Passage {
        id,
        source: source.to_string(),
        position,
        text,
        hash,
    }
}
