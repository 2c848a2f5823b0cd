//! Comment mapper: resolve each finding's location reference to span offsets.
//!
//! The model points at problems in two ways: a verbatim snippet
//! (`original_text`) and the `[ID: n]` marker of the element it read the
//! snippet in. Neither is reliable on its own. Snippets get paraphrased,
//! re-cased or have their full-width digits "fixed"; ids get off-by-one'd or
//! invented. The strategies below are tried from most to least precise:
//!
//! 1. **Exact** — the snippet occurs verbatim in a span; failing that, the
//!    snippet without surrounding whitespace and quote marks does.
//! 2. **Fuzzy** — the snippet occurs after both sides are normalised (case,
//!    whitespace runs, full-width ASCII, curly quotes).
//! 3. **Span hint** — the snippet cannot be found, but the named span ids
//!    exist; the whole span is flagged.
//!
//! Whatever cannot be placed is returned as unanchored together with a
//! [`MappingFailure`]. Mapping is pure: it never panics, never errors and
//! never mutates its inputs.

use crate::error::{MappingFailure, MappingFailureKind};
use crate::model::{Anchor, AnchoredFinding, Finding, MatchKind, Span};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Result of [`map_findings`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingOutcome {
    pub anchored: Vec<AnchoredFinding>,
    pub unanchored: Vec<Finding>,
    pub failures: Vec<MappingFailure>,
}

/// Map every finding onto `spans`.
pub fn map_findings(spans: &[Span], findings: Vec<Finding>) -> MappingOutcome {
    let by_id: HashMap<u32, &Span> = spans.iter().map(|s| (s.id, s)).collect();
    let mut outcome = MappingOutcome::default();

    for finding in findings {
        match locate(spans, &by_id, &finding) {
            Ok(anchors) => {
                debug!(
                    "Finding {} anchored to span {} ({:?})",
                    finding.index, anchors[0].span_id, anchors[0].match_kind
                );
                outcome.anchored.push(AnchoredFinding { finding, anchors });
            }
            Err(failure) => {
                warn!("Unanchored: {}", failure);
                outcome.failures.push(failure);
                outcome.unanchored.push(finding);
            }
        }
    }
    outcome
}

fn locate(
    spans: &[Span],
    by_id: &HashMap<u32, &Span>,
    finding: &Finding,
) -> Result<Vec<Anchor>, MappingFailure> {
    let loc = &finding.location;
    let hinted: Vec<&Span> = loc
        .element_ids
        .iter()
        .filter_map(|id| by_id.get(id).copied())
        .collect();
    let raw = loc.quote.as_deref().filter(|q| !q.trim().is_empty());
    let quote = raw.map(bare_quote).filter(|q| !q.is_empty());

    if let (Some(raw), Some(quote)) = (raw, quote) {
        if let Some(anchor) = find_exact(spans, &loc.element_ids, raw) {
            return Ok(vec![anchor]);
        }
        if quote != raw {
            if let Some(anchor) = find_exact(spans, &loc.element_ids, quote) {
                return Ok(vec![anchor]);
            }
        }
        if let Some(anchor) = find_fuzzy(spans, &loc.element_ids, quote) {
            return Ok(vec![anchor]);
        }
    }

    if !hinted.is_empty() {
        return Ok(hinted
            .into_iter()
            .map(|span| Anchor {
                span_id: span.id,
                start: 0,
                end: span.content.len(),
                match_kind: MatchKind::SpanHint,
            })
            .collect());
    }

    let failure = |kind, detail: String| MappingFailure {
        finding_index: finding.index,
        kind,
        detail,
    };
    Err(match (quote, loc.element_ids.is_empty()) {
        (Some(q), true) => failure(
            MappingFailureKind::NoMatch,
            format!("quote {q:?} occurs in no span"),
        ),
        (Some(q), false) => failure(
            MappingFailureKind::NoMatch,
            format!(
                "quote {q:?} occurs in no span and span ids {:?} do not exist",
                loc.element_ids
            ),
        ),
        (None, false) => failure(
            MappingFailureKind::UnknownSpan,
            format!("span ids {:?} do not exist", loc.element_ids),
        ),
        (None, true) => failure(
            MappingFailureKind::EmptyReference,
            "no quote and no span id".to_string(),
        ),
    })
}

/// Characters models wrap quotes in.
const QUOTE_CHARS: &[char] = &['"', '\'', '“', '”', '‘', '’', '「', '」', '『', '』', '`'];

/// `quote` without surrounding whitespace and quote marks.
pub(crate) fn bare_quote(quote: &str) -> &str {
    quote.trim().trim_matches(QUOTE_CHARS).trim()
}

/// Among `candidates` (span, start, end) in document order, prefer the first
/// span named by the model.
fn pick(candidates: Vec<(u32, usize, usize)>, hints: &[u32]) -> Option<(u32, usize, usize)> {
    candidates
        .iter()
        .find(|(id, _, _)| hints.contains(id))
        .or_else(|| candidates.first())
        .copied()
}

fn find_exact(spans: &[Span], hints: &[u32], quote: &str) -> Option<Anchor> {
    let candidates = spans
        .iter()
        .filter_map(|s| {
            s.content
                .find(quote)
                .map(|start| (s.id, start, start + quote.len()))
        })
        .collect();
    pick(candidates, hints).map(|(span_id, start, end)| Anchor {
        span_id,
        start,
        end,
        match_kind: MatchKind::Exact,
    })
}

fn find_fuzzy(spans: &[Span], hints: &[u32], quote: &str) -> Option<Anchor> {
    let needle = Normalized::new(quote);
    let needle = needle
        .text
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim();
    if needle.is_empty() {
        return None;
    }

    let candidates = spans
        .iter()
        .filter_map(|s| {
            let hay = Normalized::new(&s.content);
            hay.find(needle).map(|(start, end)| (s.id, start, end))
        })
        .collect();
    pick(candidates, hints).map(|(span_id, start, end)| Anchor {
        span_id,
        start,
        end,
        match_kind: MatchKind::Fuzzy,
    })
}

// ── Normalisation ────────────────────────────────────────────────────────

/// Normalised text plus, for every byte of it, the byte range of the
/// original character it came from.
struct Normalized {
    text: String,
    origin: Vec<(usize, usize)>,
}

impl Normalized {
    fn new(s: &str) -> Self {
        let mut text = String::with_capacity(s.len());
        let mut origin = Vec::with_capacity(s.len());
        let mut in_space = false;

        for (pos, ch) in s.char_indices() {
            let range = (pos, pos + ch.len_utf8());
            let folded = fold_char(ch);
            if folded.is_whitespace() {
                if !in_space {
                    text.push(' ');
                    origin.push(range);
                    in_space = true;
                }
                continue;
            }
            in_space = false;
            for lower in folded.to_lowercase() {
                text.push(lower);
                origin.extend(std::iter::repeat(range).take(lower.len_utf8()));
            }
        }
        Self { text, origin }
    }

    /// Byte range in the original string of the first occurrence of `needle`.
    fn find(&self, needle: &str) -> Option<(usize, usize)> {
        let start = self.text.find(needle)?;
        let end = start + needle.len();
        Some((self.origin[start].0, self.origin[end - 1].1))
    }
}

fn fold_char(ch: char) -> char {
    match ch {
        // Full-width ASCII block.
        '\u{ff01}'..='\u{ff5e}' => char::from_u32(ch as u32 - 0xfee0).unwrap_or(ch),
        '\u{3000}' => ' ',
        '“' | '”' | '„' | '「' | '」' => '"',
        '‘' | '’' | '『' | '』' => '\'',
        _ => ch,
    }
}
