//! Highlighter: spans + anchored findings → HTML view.
//!
//! The view is a fragment, not a page; [`crate::server`] wraps it in the
//! document page together with [`HIGHLIGHT_CSS`]. Every span becomes one
//! element with `id="doc-el-{span_id}"`, so the issue list can scroll to the
//! element even for findings that only carry a span hint.
//!
//! ## Overlapping findings
//!
//! Two findings may cover overlapping byte ranges of the same span. The span
//! is cut at every range boundary; each resulting segment is wrapped in one
//! `<mark>` listing every finding that covers it and coloured by the most
//! severe of them. Nested `<mark>` elements would be simpler to emit but
//! cannot express partial overlap.

use crate::model::{AnalysisResult, Document, MatchKind, Severity, Span, SpanKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use uuid::Uuid;

/// Styles for the classes emitted by [`render_html`].
pub const HIGHLIGHT_CSS: &str = r#"
.document-view { line-height: 1.7; }
.document-view p { margin: 0 0 0.8em; white-space: pre-wrap; }
.document-view table.doc-table { border-collapse: collapse; margin: 0 0 1em; }
.document-view table.doc-table td { border: 1px solid #d1d5db; padding: 4px 8px; vertical-align: top; white-space: pre-wrap; }
.document-view figure { margin: 0 0 1em; }
.document-view figure img { max-width: 100%; }
.document-view .page-break { border-top: 1px dashed #9ca3af; margin: 1.5em 0; color: #6b7280; font-size: 0.8em; }
mark.finding { border-radius: 2px; padding: 0 1px; cursor: pointer; }
mark.sev-high { background: #fee2e2; border-bottom: 2px solid #ef4444; }
mark.sev-medium { background: #fef3c7; border-bottom: 2px solid #f59e0b; }
mark.sev-low { background: #e0f2fe; border-bottom: 2px solid #3b82f6; }
.flagged.sev-high { outline: 2px solid #ef4444; background: #fee2e2; }
.flagged.sev-medium { outline: 2px solid #f59e0b; background: #fef3c7; }
.flagged.sev-low { outline: 2px solid #3b82f6; background: #e0f2fe; }
mark.active, .flagged.active { box-shadow: 0 0 0 3px #111827; }
"#;

/// One highlighted range, as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HighlightRange {
    pub finding_index: usize,
    pub span_id: u32,
    pub start: usize,
    pub end: usize,
    pub severity: Severity,
    /// The whole element is flagged (span hint or image) rather than a range.
    pub whole_element: bool,
}

/// Every highlight of `analysis` that lands on a span of `document`.
///
/// Ranges that do not fall on character boundaries of the current span
/// content (a record edited by hand, say) are dropped.
pub fn highlight_ranges(document: &Document, analysis: &AnalysisResult) -> Vec<HighlightRange> {
    let mut out = Vec::new();
    for af in &analysis.anchored {
        for anchor in &af.anchors {
            let Some(span) = document.span(anchor.span_id) else {
                continue;
            };
            let whole_element =
                anchor.match_kind == MatchKind::SpanHint || span.kind == SpanKind::Image;
            let valid = anchor.start <= anchor.end
                && span.content.is_char_boundary(anchor.start)
                && span.content.is_char_boundary(anchor.end);
            if !whole_element && (!valid || anchor.start == anchor.end) {
                continue;
            }
            out.push(HighlightRange {
                finding_index: af.finding.index,
                span_id: span.id,
                start: if whole_element { 0 } else { anchor.start },
                end: if whole_element { span.content.len() } else { anchor.end },
                severity: af.finding.severity,
                whole_element,
            });
        }
    }
    out
}

/// Render `document` as HTML with the findings of `analysis` highlighted.
///
/// `active` is the index of the finding the user selected, if any.
pub fn render_html(
    document: &Document,
    analysis: Option<&AnalysisResult>,
    active: Option<usize>,
) -> String {
    let ranges = analysis
        .map(|a| highlight_ranges(document, a))
        .unwrap_or_default();
    let mut by_span: BTreeMap<u32, Vec<&HighlightRange>> = BTreeMap::new();
    for r in &ranges {
        by_span.entry(r.span_id).or_default().push(r);
    }

    let mut r = Renderer {
        out: String::with_capacity(document.spans.len() * 96),
        doc_id: document.id,
        by_span,
        active,
        seen: BTreeSet::new(),
    };
    r.out.push_str("<div class=\"document-view\">\n");

    let mut page = None;
    let mut i = 0;
    while i < document.spans.len() {
        let span = &document.spans[i];
        if span.position.page.is_some() && span.position.page != page {
            if page.is_some() {
                let _ = writeln!(
                    r.out,
                    "<div class=\"page-break\">Page {}</div>",
                    span.position.page.unwrap_or_default()
                );
            }
            page = span.position.page;
        }

        if let Some(key) = table_key(span) {
            let len = document.spans[i..]
                .iter()
                .take_while(|s| table_key(s).as_ref() == Some(&key))
                .count();
            r.table(&document.spans[i..i + len]);
            i += len;
        } else {
            r.block(span);
            i += 1;
        }
    }

    r.out.push_str("</div>\n");
    r.out
}

/// Spans sharing this key render into the same `<table>`.
fn table_key(span: &Span) -> Option<(usize, Option<usize>, Option<String>)> {
    let p = &span.position;
    (p.table.is_some() || p.sheet.is_some()).then(|| (p.block, p.table, p.sheet.clone()))
}

struct Renderer<'a> {
    out: String,
    doc_id: Uuid,
    by_span: BTreeMap<u32, Vec<&'a HighlightRange>>,
    active: Option<usize>,
    /// Findings whose `issue-{i}` target was already emitted.
    seen: BTreeSet<usize>,
}

impl Renderer<'_> {
    fn block(&mut self, span: &Span) {
        match span.kind {
            SpanKind::Image => self.image(span),
            _ => {
                let attrs = self.element_attrs(span);
                let _ = write!(self.out, "<p{attrs}>");
                self.targets_for_element(span);
                self.text(span);
                self.out.push_str("</p>\n");
            }
        }
    }

    fn image(&mut self, span: &Span) {
        let attrs = self.element_attrs(span);
        let _ = write!(self.out, "<figure{attrs}>");
        self.targets_for_element(span);
        let alt = span
            .image
            .as_ref()
            .map_or_else(|| format!("Image {}", span.id), |i| i.file_name.clone());
        let _ = write!(
            self.out,
            "<img src=\"/api/documents/{}/images/{}\" alt=\"{}\" loading=\"lazy\"></figure>\n",
            self.doc_id,
            span.id,
            escape(&alt)
        );
    }

    fn table(&mut self, spans: &[Span]) {
        let mut rows: BTreeMap<usize, BTreeMap<usize, Vec<&Span>>> = BTreeMap::new();
        for s in spans {
            rows.entry(s.position.row.unwrap_or(0))
                .or_default()
                .entry(s.position.col.unwrap_or(0))
                .or_default()
                .push(s);
        }
        // Only columns that hold a cell in some row; sparse sheets stay small.
        let columns: BTreeSet<usize> = rows.values().flat_map(|cols| cols.keys().copied()).collect();

        self.out.push_str("<table class=\"doc-table\">\n");
        for cols in rows.values() {
            self.out.push_str("<tr>");
            for c in &columns {
                let Some(cell) = cols.get(c) else {
                    self.out.push_str("<td></td>");
                    continue;
                };
                // The text span (if any) owns the cell; images sit inside it.
                match cell.iter().find(|s| s.kind != SpanKind::Image) {
                    Some(text) => {
                        let attrs = self.element_attrs(text);
                        let _ = write!(self.out, "<td{attrs}>");
                        self.targets_for_element(text);
                    }
                    None => self.out.push_str("<td>"),
                }
                for s in cell {
                    if s.kind == SpanKind::Image {
                        self.image(s);
                    } else {
                        self.text(s);
                    }
                }
                self.out.push_str("</td>");
            }
            self.out.push_str("</tr>\n");
        }
        self.out.push_str("</table>\n");
    }

    /// `id` and, for flagged elements, class and data attributes.
    fn element_attrs(&self, span: &Span) -> String {
        let mut attrs = format!(" id=\"doc-el-{}\"", span.id);
        let flags: Vec<&HighlightRange> = self
            .by_span
            .get(&span.id)
            .map(|v| v.iter().copied().filter(|r| r.whole_element).collect())
            .unwrap_or_default();
        if let Some(sev) = most_severe(&flags) {
            let active = if self.is_active(&flags) { " active" } else { "" };
            let _ = write!(
                attrs,
                " class=\"flagged sev-{sev}{active}\" data-issues=\"{}\"",
                issue_list(&flags)
            );
        }
        attrs
    }

    /// Scroll targets for findings that flag the whole element.
    fn targets_for_element(&mut self, span: &Span) {
        let Some(ranges) = self.by_span.get(&span.id) else {
            return;
        };
        let new: Vec<usize> = ranges
            .iter()
            .filter(|r| r.whole_element && !self.seen.contains(&r.finding_index))
            .map(|r| r.finding_index)
            .collect();
        for i in new {
            if self.seen.insert(i) {
                let _ = write!(self.out, "<span class=\"issue-anchor\" id=\"issue-{i}\"></span>");
            }
        }
    }

    fn text(&mut self, span: &Span) {
        let content = &span.content;
        let ranges: Vec<&HighlightRange> = self
            .by_span
            .get(&span.id)
            .map(|v| v.iter().copied().filter(|r| !r.whole_element).collect())
            .unwrap_or_default();
        if ranges.is_empty() {
            self.out.push_str(&escape(content));
            return;
        }

        let mut cuts: BTreeSet<usize> = BTreeSet::from([0, content.len()]);
        for r in &ranges {
            cuts.insert(r.start);
            cuts.insert(r.end);
        }
        let cuts: Vec<usize> = cuts.into_iter().collect();

        for w in cuts.windows(2) {
            let (a, b) = (w[0], w[1]);
            let piece = escape(&content[a..b]);
            let covering: Vec<&HighlightRange> = ranges
                .iter()
                .copied()
                .filter(|r| r.start <= a && b <= r.end)
                .collect();
            let Some(sev) = most_severe(&covering) else {
                self.out.push_str(&piece);
                continue;
            };

            let mut starting: Vec<usize> = covering
                .iter()
                .map(|r| r.finding_index)
                .filter(|i| !self.seen.contains(i))
                .collect();
            starting.sort_unstable();
            starting.dedup();
            let mut id_attr = String::new();
            if let Some((&first, rest)) = starting.split_first() {
                for &i in rest {
                    let _ = write!(self.out, "<span class=\"issue-anchor\" id=\"issue-{i}\"></span>");
                }
                id_attr = format!(" id=\"issue-{first}\"");
                self.seen.extend(starting.iter().copied());
            }
            let active = if self.is_active(&covering) { " active" } else { "" };
            let _ = write!(
                self.out,
                "<mark{id_attr} class=\"finding sev-{sev}{active}\" data-issues=\"{}\">{piece}</mark>",
                issue_list(&covering)
            );
        }
    }

    fn is_active(&self, ranges: &[&HighlightRange]) -> bool {
        self.active
            .is_some_and(|a| ranges.iter().any(|r| r.finding_index == a))
    }
}

fn most_severe(ranges: &[&HighlightRange]) -> Option<Severity> {
    ranges.iter().map(|r| r.severity).min_by_key(|s| s.rank())
}

fn issue_list(ranges: &[&HighlightRange]) -> String {
    let ids: BTreeSet<usize> = ranges.iter().map(|r| r.finding_index).collect();
    ids.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Escape text for HTML element content and attribute values.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
