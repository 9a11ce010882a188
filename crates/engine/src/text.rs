//! Per-page text extraction on top of the `pdf` crate, plus the reflow used before speech.

use std::collections::HashMap;
use std::io::Read as _;

use parking_lot::Mutex;
use pdf::content::{Op, TextDrawAdjusted};
use pdf::file::{CachedFile, FileOptions};
use pdf::font::ToUnicodeMap;
use pdf::object::{Resolve, Resources};
use pdf::primitive::{Name, PdfString};
use tracing::debug;

use crate::native::{ByteStream, TextDocument, TextExtractor};
use crate::{EngineError, Result};

/// A `TJ` adjustment at or below this (in thousandths of an em) reads as a word gap.
const TJ_INSERT_SPACE_THRESHOLD: f32 = -200.0;

#[derive(Debug, Default, Clone, Copy)]
pub struct PdfTextExtractor;

impl PdfTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl TextExtractor for PdfTextExtractor {
    fn open(&self, mut stream: Box<dyn ByteStream>) -> Result<Box<dyn TextDocument>> {
        let mut bytes = Vec::new();
        stream.read_to_end(&mut bytes)?;
        drop(stream);
        let file = FileOptions::cached()
            .load(bytes)
            .map_err(|err| EngineError::Text(err.to_string()))?;
        let page_count = file.num_pages();
        debug!(page_count, "text document opened");
        Ok(Box::new(PdfTextDocument {
            file: Mutex::new(file),
            page_count,
        }))
    }
}

struct PdfTextDocument {
    file: Mutex<CachedFile<Vec<u8>>>,
    page_count: u32,
}

impl TextDocument for PdfTextDocument {
    fn page_count(&self) -> u32 {
        self.page_count
    }

    fn page_text(&self, index: u32) -> Result<String> {
        if index >= self.page_count {
            return Err(EngineError::PageOutOfRange {
                index,
                count: self.page_count,
            });
        }
        let file = self.file.lock();
        let resolver = file.resolver();
        let page = file
            .get_page(index)
            .map_err(|err| EngineError::Text(err.to_string()))?;
        let resources = page
            .resources()
            .map_err(|err| EngineError::Text(err.to_string()))?;
        let Some(content) = &page.contents else {
            return Ok(String::new());
        };
        let ops = content
            .operations(&resolver)
            .map_err(|err| EngineError::Text(err.to_string()))?;
        Ok(ops_to_text(&ops, &resolver, resources).trim().to_string())
    }
}

fn ops_to_text(ops: &[Op], resolver: &impl Resolve, resources: &Resources) -> String {
    let mut tounicode_cache: HashMap<Name, Option<ToUnicodeMap>> = HashMap::new();
    let mut current_font: Option<Name> = None;
    let mut pending_space = false;
    let mut out = String::new();

    for op in ops {
        match op {
            Op::TextFont { name, .. } => current_font = Some(name.clone()),
            Op::TextDraw { text } => {
                let piece = decode_pdf_string(
                    text,
                    current_font.as_ref(),
                    resolver,
                    resources,
                    &mut tounicode_cache,
                );
                push_piece(&mut out, &piece, &mut pending_space);
            }
            Op::TextDrawAdjusted { array } => {
                for item in array {
                    match item {
                        TextDrawAdjusted::Text(text) => {
                            let piece = decode_pdf_string(
                                text,
                                current_font.as_ref(),
                                resolver,
                                resources,
                                &mut tounicode_cache,
                            );
                            push_piece(&mut out, &piece, &mut pending_space);
                        }
                        TextDrawAdjusted::Spacing(spacing) => {
                            if *spacing <= TJ_INSERT_SPACE_THRESHOLD {
                                pending_space = true;
                            }
                        }
                    }
                }
            }
            Op::TextNewline => {
                out.push('\n');
                pending_space = false;
            }
            Op::MoveTextPosition { translation } if translation.y < 0.0 => {
                out.push('\n');
                pending_space = false;
            }
            _ => {}
        }
    }

    out
}

fn push_piece(out: &mut String, piece: &str, pending_space: &mut bool) {
    let cleaned = strip_unprintable(piece);
    let piece = cleaned.trim_matches('\0');
    if piece.is_empty() {
        return;
    }

    if std::mem::take(pending_space) {
        let closes = piece
            .chars()
            .find(|ch| !ch.is_whitespace())
            .is_some_and(|ch| matches!(ch, ',' | '.' | ';' | ':' | '!' | '?' | ')' | ']' | '}'));
        if !out.is_empty()
            && !closes
            && !out.ends_with([' ', '\n', '\t'])
            && !piece.starts_with(char::is_whitespace)
        {
            out.push(' ');
        }
    }
    out.push_str(piece);
}

fn decode_pdf_string(
    text: &PdfString,
    font: Option<&Name>,
    resolver: &impl Resolve,
    resources: &Resources,
    cache: &mut HashMap<Name, Option<ToUnicodeMap>>,
) -> String {
    let Some(font) = font else {
        return text.to_string_lossy();
    };
    let Some(map) = tounicode_for_font(font, resolver, resources, cache) else {
        return text.to_string_lossy();
    };
    decode_with_tounicode(text.as_bytes(), map).unwrap_or_else(|| text.to_string_lossy())
}

fn tounicode_for_font<'a>(
    font: &Name,
    resolver: &impl Resolve,
    resources: &Resources,
    cache: &'a mut HashMap<Name, Option<ToUnicodeMap>>,
) -> Option<&'a ToUnicodeMap> {
    cache
        .entry(font.clone())
        .or_insert_with(|| {
            resources
                .fonts
                .get(font)
                .and_then(|lazy| lazy.load(resolver).ok())
                .and_then(|loaded| loaded.to_unicode(resolver))
                .and_then(|res| res.ok())
        })
        .as_ref()
}

/// Tries one- and two-byte codes and keeps whichever the map explains better. `None` when
/// neither looks like this font's encoding.
fn decode_with_tounicode(bytes: &[u8], map: &ToUnicodeMap) -> Option<String> {
    let mut best = decode_codes(bytes, 1, map);
    if bytes.len().is_multiple_of(2) {
        let wide = decode_codes(bytes, 2, map);
        if wide.matched > best.matched
            || (wide.matched == best.matched && wide.text.len() > best.text.len())
        {
            best = wide;
        }
    }

    if best.total == 0 {
        return None;
    }
    let ratio = best.matched as f32 / best.total as f32;
    if (best.matched < 2 && ratio < 0.3) || ratio < 0.05 {
        return None;
    }
    Some(best.text)
}

struct Decoded {
    text: String,
    matched: usize,
    total: usize,
}

fn decode_codes(bytes: &[u8], width: usize, map: &ToUnicodeMap) -> Decoded {
    let codes: Vec<u16> = match width {
        1 => bytes.iter().map(|&b| u16::from(b)).collect(),
        2 => bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect(),
        _ => Vec::new(),
    };

    let mut text = String::new();
    let mut matched = 0;
    for &code in &codes {
        match map.get(code) {
            Some(s) => {
                text.push_str(s);
                matched += 1;
            }
            None => text.push('\u{FFFD}'),
        }
    }
    Decoded {
        text,
        matched,
        total: codes.len(),
    }
}

fn strip_unprintable(s: &str) -> String {
    s.chars()
        .filter_map(|ch| match ch {
            '\n' | '\t' => Some(ch),
            '\r' => Some('\n'),
            '\u{FFFD}' => None,
            _ if ch.is_control() => None,
            _ if is_private_use(ch as u32) || is_noncharacter(ch as u32) => None,
            _ => Some(ch),
        })
        .collect()
}

fn is_private_use(code: u32) -> bool {
    (0xE000..=0xF8FF).contains(&code)
        || (0xF0000..=0xFFFFD).contains(&code)
        || (0x100000..=0x10FFFD).contains(&code)
}

fn is_noncharacter(code: u32) -> bool {
    (0xFDD0..=0xFDEF).contains(&code) || (code & 0xFFFF == 0xFFFE) || (code & 0xFFFF == 0xFFFF)
}

/// Joins hard-wrapped extraction output into paragraphs separated by one blank line, so a
/// speech engine does not pause at every layout line break.
pub fn reflow_text(raw: &str) -> String {
    let cleaned = strip_unprintable(raw);
    let mut lines: Vec<&str> = cleaned.split('\n').collect();
    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    let mut lens: Vec<usize> = lines
        .iter()
        .map(|line| line.trim().len())
        .filter(|len| *len > 0)
        .collect();
    lens.sort_unstable();
    let typical = lens.get(lens.len() / 2).copied().unwrap_or(0);
    let short_line = (typical as f32 * 0.6).round() as usize;

    let mut out = String::new();
    let mut paragraph = String::new();
    let mut prev_len = 0usize;
    let mut prev_blank = true;

    for raw_line in lines {
        let indented = raw_line.starts_with("  ") || raw_line.starts_with('\t');
        let line = collapse_whitespace(raw_line);
        if line.is_empty() {
            flush_paragraph(&mut out, &mut paragraph);
            prev_blank = true;
            continue;
        }

        let breaks = !paragraph.is_empty()
            && (is_list_item(&line)
                || (indented && !prev_blank)
                || (prev_len > 0
                    && short_line > 0
                    && prev_len <= short_line
                    && starts_uppercase(&line)));
        if breaks {
            flush_paragraph(&mut out, &mut paragraph);
        }

        join_line(&mut paragraph, &line);
        prev_len = line.len();
        prev_blank = false;
    }

    flush_paragraph(&mut out, &mut paragraph);
    out
}

/// First `max_chars` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => &text[..cut],
        None => text,
    }
}

fn collapse_whitespace(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut last_space = false;
    for ch in line.chars() {
        // soft hyphen
        if ch == '\u{00AD}' {
            continue;
        }
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
            continue;
        }
        out.push(ch);
        last_space = false;
    }
    out.trim().to_string()
}

fn flush_paragraph(out: &mut String, paragraph: &mut String) {
    let text = paragraph.trim();
    if !text.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(text);
    }
    paragraph.clear();
}

fn join_line(paragraph: &mut String, line: &str) {
    if paragraph.is_empty() {
        paragraph.push_str(line);
        return;
    }
    if paragraph.ends_with('-') && joins_hyphenated(paragraph, line) {
        paragraph.pop();
        paragraph.push_str(line);
        return;
    }
    if !paragraph.ends_with(' ') {
        paragraph.push(' ');
    }
    paragraph.push_str(line);
}

fn joins_hyphenated(paragraph: &str, next: &str) -> bool {
    if paragraph.ends_with("--") {
        return false;
    }
    let before = paragraph
        .chars()
        .rev()
        .nth(1)
        .is_some_and(|ch| ch.is_alphabetic());
    let after = next.chars().next().is_some_and(|ch| ch.is_alphabetic());
    before && after
}

fn is_list_item(line: &str) -> bool {
    let line = line.trim_start();
    if line.starts_with(['•', '-', '*', '–', '—']) {
        return line.chars().nth(1).is_some_and(char::is_whitespace);
    }

    let digits = line.chars().take_while(|ch| ch.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    let mut rest = line[digits..].chars();
    matches!(rest.next(), Some('.' | ')')) && rest.next().is_some_and(char::is_whitespace)
}

fn starts_uppercase(line: &str) -> bool {
    line.chars()
        .find(|ch| ch.is_alphabetic())
        .is_some_and(char::is_uppercase)
}
