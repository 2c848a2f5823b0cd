//! PDF → spans via `pdf-extract`.
//!
//! The extracted text carries no paragraph structure, so paragraphs are
//! recovered heuristically: pages are split on form feeds, paragraphs on
//! blank lines, and line breaks inside a paragraph are folded to spaces.

use super::{ParsedDocument, SpanSink};
use crate::error::ReviewError;
use crate::model::{SpanKind, SpanPosition};
use once_cell::sync::Lazy;
use regex::Regex;
use std::panic::{catch_unwind, AssertUnwindSafe};

static RE_PARAGRAPH_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n[ \t\r]*\n").unwrap());

/// Parse a PDF held in memory.
pub fn parse(filename: &str, bytes: &[u8]) -> Result<ParsedDocument, ReviewError> {
    let text = catch_unwind(AssertUnwindSafe(|| pdf_extract::extract_text_from_mem(bytes)))
        .map_err(|_| ReviewError::parse(filename, "PDF text extraction panicked"))?
        .map_err(|e| ReviewError::parse(filename, e))?;
    Ok(spans_from_text(&text))
}

/// Split extracted text into paragraph spans.
pub(crate) fn spans_from_text(text: &str) -> ParsedDocument {
    let text = text.replace("\r\n", "\n");
    let pages: Vec<&str> = text.split('\u{c}').collect();
    let paged = pages.len() > 1;

    let mut sink = SpanSink::default();
    for (page_idx, page) in pages.iter().enumerate() {
        let mut block = 0;
        for para in RE_PARAGRAPH_BREAK.split(page) {
            let folded = para
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            let position = SpanPosition {
                block,
                page: paged.then_some(page_idx as u32 + 1),
                ..Default::default()
            };
            if sink.push_text(SpanKind::Text, &folded, position).is_some() {
                block += 1;
            }
        }
    }
    sink.finish()
}
