//! Exporter: analysis → DOCX with native Word review comments.
//!
//! For DOCX uploads the original package is rewritten: `word/document.xml`
//! is streamed through the same [`BodyCursor`] the parser used, so paragraph
//! numbering and paragraph text are identical to what the spans were built
//! from, and runs are split exactly at the anchor's byte offsets. Every
//! other package part is copied byte-for-byte.
//!
//! PDF and XLSX uploads have no Word package to annotate; a minimal one is
//! synthesized with one paragraph per span and annotated the same way.
//!
//! ## Comment markup
//!
//! ```text
//! <w:commentRangeStart w:id="n"/> … text … <w:commentRangeEnd w:id="n"/>
//! <w:r><w:commentReference w:id="n"/></w:r>
//! ```
//!
//! plus one `<w:comment w:id="n">` in `word/comments.xml`, which is created
//! (with its relationship and content-type override) or appended to.

use crate::config::ReviewConfig;
use crate::error::ReviewError;
use crate::model::{
    AnalysisResult, Document, DocumentFormat, Finding, MatchKind, Span, SpanKind,
};
use crate::ooxml::{
    attr, parse_relationships, resolve_part, BodyCursor, CellLoc, ParaLoc, Step,
    COMMENTS_CONTENT_TYPE, COMMENTS_REL_TYPE, WORD_NS,
};
use crate::parser::docx::read_part;
use chrono::Utc;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Cursor, Write};
use std::path::Path;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// Who the comments are attributed to, and which findings to export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOptions {
    pub author: String,
    pub initials: String,
    /// Finding indices to export; `None` exports every anchored finding.
    pub selection: Option<Vec<usize>>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            author: "CRO Review".to_string(),
            initials: "CR".to_string(),
            selection: None,
        }
    }
}

impl ExportOptions {
    pub fn from_config(config: &ReviewConfig) -> Self {
        Self {
            author: config.comment_author.clone(),
            initials: config.comment_initials.clone(),
            selection: None,
        }
    }

    pub fn with_selection(mut self, selection: Option<Vec<usize>>) -> Self {
        self.selection = selection;
        self
    }
}

/// The annotated document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedDocx {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// Number of `w:comment` elements added.
    pub comments: usize,
}

/// Produce a DOCX carrying one review comment per selected anchored finding.
///
/// `source` is the original upload; it is only read for DOCX documents.
/// Unanchored findings are never exported.
pub fn export_annotated(
    document: &Document,
    source: &[u8],
    analysis: &AnalysisResult,
    options: &ExportOptions,
) -> Result<AnnotatedDocx, ReviewError> {
    let selected = select(document, analysis, options.selection.as_deref());
    let (bytes, comments) = match document.format {
        DocumentFormat::Docx => annotate_package(source, &selected, options)?,
        DocumentFormat::Pdf | DocumentFormat::Xlsx => synthesize(document, &selected, options)?,
    };
    info!(
        "Exported {} with {} comments ({} bytes)",
        document.original_filename,
        comments,
        bytes.len()
    );
    Ok(AnnotatedDocx {
        file_name: reviewed_file_name(&document.original_filename),
        bytes,
        comments,
    })
}

/// `report.pdf` → `report_reviewed.docx`.
pub fn reviewed_file_name(original: &str) -> String {
    let stem = Path::new(original)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("document");
    format!("{stem}_reviewed.docx")
}

fn export_err(e: impl std::fmt::Display) -> ReviewError {
    ReviewError::Export(e.to_string())
}

// ── Selection ────────────────────────────────────────────────────────────

/// One comment to place: the finding, its first anchor's span and range.
struct Planned<'a> {
    finding: &'a Finding,
    span: &'a Span,
    start: usize,
    end: usize,
    whole: bool,
}

fn select<'a>(
    document: &'a Document,
    analysis: &'a AnalysisResult,
    selection: Option<&[usize]>,
) -> Vec<Planned<'a>> {
    let mut planned: Vec<Planned<'a>> = analysis
        .anchored
        .iter()
        .filter(|af| selection.is_none_or(|s| s.contains(&af.finding.index)))
        .filter_map(|af| {
            let anchor = af.anchors.first()?;
            let Some(span) = document.span(anchor.span_id) else {
                warn!(
                    "Finding {} points at missing span {}; not exported",
                    af.finding.index, anchor.span_id
                );
                return None;
            };
            let valid = anchor.start < anchor.end
                && span.content.is_char_boundary(anchor.start)
                && span.content.is_char_boundary(anchor.end);
            let whole =
                anchor.match_kind == MatchKind::SpanHint || span.kind == SpanKind::Image || !valid;
            Some(Planned {
                finding: &af.finding,
                span,
                start: anchor.start,
                end: anchor.end,
                whole,
            })
        })
        .collect();
    planned.sort_by_key(|p| p.finding.index);
    planned
}

// ── Paragraph plans ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Edge {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Marker {
    offset: usize,
    edge: Edge,
    id: u32,
}

/// Comment boundaries inside one paragraph.
#[derive(Debug, Default)]
struct ParaPlan {
    /// Comments covering the whole paragraph.
    whole: Vec<u32>,
    /// Boundaries at byte offsets of the paragraph text, sorted.
    markers: Vec<Marker>,
}

impl ParaPlan {
    fn add_range(&mut self, id: u32, start: usize, end: usize) {
        self.markers.push(Marker {
            offset: start,
            edge: Edge::Start,
            id,
        });
        self.markers.push(Marker {
            offset: end,
            edge: Edge::End,
            id,
        });
        self.markers.sort();
    }
}

fn target_paragraph(span: &Span) -> ParaLoc {
    let p = &span.position;
    let cell = match (p.table, p.row, p.col) {
        (Some(table), Some(row), Some(col)) => Some(CellLoc { table, row, col }),
        _ => None,
    };
    ParaLoc {
        block: p.block,
        cell,
        index_in_cell: 0,
    }
}

// ── Marker emission ──────────────────────────────────────────────────────

struct MarkupWriter {
    out: Writer<Vec<u8>>,
    /// Comments whose range end (and reference) has been written.
    closed: HashSet<u32>,
}

impl MarkupWriter {
    fn new() -> Self {
        Self {
            out: Writer::new(Vec::new()),
            closed: HashSet::new(),
        }
    }

    fn put(&mut self, event: Event<'_>) -> Result<(), ReviewError> {
        self.out.write_event(event).map_err(export_err)
    }

    fn start(&mut self, id: u32) -> Result<(), ReviewError> {
        let id = id.to_string();
        self.put(Event::Empty(
            BytesStart::new("w:commentRangeStart").with_attributes([("w:id", id.as_str())]),
        ))
    }

    fn end(&mut self, id: u32) -> Result<(), ReviewError> {
        let ids = id.to_string();
        self.put(Event::Empty(
            BytesStart::new("w:commentRangeEnd").with_attributes([("w:id", ids.as_str())]),
        ))?;
        self.put(Event::Start(BytesStart::new("w:r")))?;
        self.put(Event::Empty(
            BytesStart::new("w:commentReference").with_attributes([("w:id", ids.as_str())]),
        ))?;
        self.put(Event::End(BytesEnd::new("w:r")))?;
        self.closed.insert(id);
        Ok(())
    }

    fn marker(&mut self, m: Marker) -> Result<(), ReviewError> {
        match m.edge {
            Edge::Start => self.start(m.id),
            Edge::End => self.end(m.id),
        }
    }

    fn text(&mut self, text: &str) -> Result<(), ReviewError> {
        self.put(Event::Text(BytesText::new(text)))
    }

    fn into_inner(self) -> (Vec<u8>, HashSet<u32>) {
        (self.out.into_inner(), self.closed)
    }
}

// ── DOCX body rewrite ────────────────────────────────────────────────────

/// Paragraph currently being annotated.
struct ActivePara<'p> {
    plan: &'p ParaPlan,
    next: usize,
    pos: usize,
    begun: bool,
}

impl ActivePara<'_> {
    fn pending_at_or_before(&self, offset: usize) -> bool {
        self.plan
            .markers
            .get(self.next)
            .is_some_and(|m| m.offset <= offset)
    }

    fn pending_inside(&self, from: usize, to: usize) -> bool {
        self.plan.markers[self.next..]
            .iter()
            .any(|m| m.offset > from && m.offset < to)
    }
}

/// A `w:r` element collected whole so it can be split.
struct RunBuffer<'a> {
    events: Vec<(Event<'a>, Step)>,
    depth: usize,
}

impl<'a> RunBuffer<'a> {
    /// Returns true once the run's end tag was pushed.
    fn push(&mut self, event: Event<'a>, step: Step) -> bool {
        match &event {
            Event::Start(_) => self.depth += 1,
            Event::End(_) => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.events.push((event, step));
        self.depth == 0
    }

    fn text_len(&self) -> usize {
        self.events.iter().map(|(_, s)| step_len(s)).sum()
    }

    /// All text is in direct `w:t` children and all symbols are direct
    /// children, so the run can be cut anywhere. Ruby and other nested runs
    /// are not.
    fn is_flat(&self) -> bool {
        let mut depth = 0usize;
        for (ev, step) in &self.events {
            let ok = match step {
                Step::Text(_) => depth == 2,
                Step::Symbol(_) => depth == 1,
                _ => true,
            };
            if !ok {
                return false;
            }
            depth_after(&mut depth, ev);
        }
        true
    }

    /// The run's own `w:rPr`, as events.
    fn properties(&self) -> Vec<Event<'a>> {
        let mut out = Vec::new();
        let mut depth = 0usize;
        let mut capturing = false;
        for (ev, _) in &self.events {
            match ev {
                Event::Start(e) => {
                    if depth == 1 && e.name().as_ref() == b"w:rPr" {
                        capturing = true;
                    }
                    if capturing {
                        out.push(ev.clone());
                    }
                    depth += 1;
                }
                Event::End(e) => {
                    depth = depth.saturating_sub(1);
                    if capturing {
                        out.push(ev.clone());
                        if depth == 1 && e.name().as_ref() == b"w:rPr" {
                            break;
                        }
                    }
                }
                Event::Empty(e) if depth == 1 && e.name().as_ref() == b"w:rPr" => {
                    out.push(ev.clone());
                    break;
                }
                other if capturing => out.push(other.clone()),
                _ => {}
            }
        }
        out
    }
}

fn step_len(step: &Step) -> usize {
    match step {
        Step::Text(t) => t.len(),
        Step::Symbol(c) => c.len_utf8(),
        _ => 0,
    }
}

struct BodyAnnotator<'p> {
    w: MarkupWriter,
    plans: &'p HashMap<ParaLoc, ParaPlan>,
    current: Option<ActivePara<'p>>,
}

impl<'p> BodyAnnotator<'p> {
    fn open(&mut self, loc: ParaLoc) {
        self.current = self.plans.get(&loc).map(|plan| ActivePara {
            plan,
            next: 0,
            pos: 0,
            begun: false,
        });
    }

    /// Whole-paragraph starts, once, before the first non-`w:pPr` child.
    fn begin(&mut self) -> Result<(), ReviewError> {
        let Some(p) = self.current.as_mut() else {
            return Ok(());
        };
        if p.begun {
            return Ok(());
        }
        p.begun = true;
        let ids = p.plan.whole.clone();
        for id in ids {
            self.w.start(id)?;
        }
        Ok(())
    }

    fn emit_upto(&mut self, offset: usize) -> Result<(), ReviewError> {
        loop {
            let Some(p) = self.current.as_mut() else {
                return Ok(());
            };
            let Some(&m) = p.plan.markers.get(p.next) else {
                return Ok(());
            };
            if m.offset > offset {
                return Ok(());
            }
            p.next += 1;
            self.w.marker(m)?;
        }
    }

    /// Everything still open goes in before `</w:p>`.
    fn finish(&mut self) -> Result<(), ReviewError> {
        self.begin()?;
        self.emit_upto(usize::MAX)?;
        if let Some(p) = self.current.take() {
            for &id in &p.plan.whole {
                self.w.end(id)?;
            }
        }
        Ok(())
    }

    fn flush_run(&mut self, run: RunBuffer<'_>) -> Result<(), ReviewError> {
        let Some(p) = self.current.as_ref() else {
            for (ev, _) in run.events {
                self.w.put(ev)?;
            }
            return Ok(());
        };
        let run_start = p.pos;
        let run_end = run_start + run.text_len();

        self.emit_upto(run_start)?;
        let split = self
            .current
            .as_ref()
            .is_some_and(|p| p.pending_inside(run_start, run_end));
        if !split {
            for (ev, _) in run.events {
                self.w.put(ev)?;
            }
            self.advance_pos(run_end);
            return self.emit_upto(run_end);
        }
        if !run.is_flat() {
            return self.widen_around(run, run_end);
        }

        let run_tag = match run.events.first() {
            Some((Event::Start(e), _)) => e.clone(),
            _ => BytesStart::new("w:r"),
        };
        let props = run.properties();
        let mut pos = run_start;
        let mut depth = 0usize;
        let mut in_t = false;

        for (ev, step) in &run.events {
            match step {
                Step::Text(t) => {
                    let mut local = 0;
                    while let Some(m) = self.next_marker_before(pos + t.len()) {
                        let cut = m.offset.saturating_sub(pos).min(t.len());
                        if cut > local && t.is_char_boundary(cut) {
                            self.w.text(&t[local..cut])?;
                            local = cut;
                        }
                        self.split_at(m.offset, &run_tag, &props, in_t)?;
                    }
                    self.w.text(&t[local..])?;
                    pos += t.len();
                    self.advance_pos(pos);
                    continue;
                }
                Step::Symbol(c) => {
                    if pos > run_start && self.has_pending_at_or_before(pos) {
                        self.split_at(pos, &run_tag, &props, false)?;
                    }
                    self.w.put(ev.clone())?;
                    pos += c.len_utf8();
                    self.advance_pos(pos);
                    depth_after(&mut depth, ev);
                    continue;
                }
                _ => {}
            }

            match ev {
                Event::Start(e) if depth == 1 && e.name().as_ref() == b"w:t" => {
                    if pos > run_start && self.has_pending_at_or_before(pos) {
                        self.split_at(pos, &run_tag, &props, false)?;
                    }
                    let mut tag = e.clone();
                    if attr(e, b"xml:space").is_none() {
                        tag.push_attribute(("xml:space", "preserve"));
                    }
                    self.w.put(Event::Start(tag))?;
                    in_t = true;
                }
                Event::End(e) if depth == 2 && e.name().as_ref() == b"w:t" => {
                    self.w.put(ev.clone())?;
                    in_t = false;
                }
                _ => self.w.put(ev.clone())?,
            }
            depth_after(&mut depth, ev);
        }
        self.emit_upto(run_end)
    }

    /// Starts inside an unsplittable run move before it, ends move after it.
    fn widen_around(&mut self, run: RunBuffer<'_>, run_end: usize) -> Result<(), ReviewError> {
        let mut ends = Vec::new();
        while let Some(m) = self.next_marker_before(run_end) {
            if let Some(p) = self.current.as_mut() {
                p.next += 1;
            }
            match m.edge {
                Edge::Start => self.w.marker(m)?,
                Edge::End => ends.push(m),
            }
        }
        for (ev, _) in run.events {
            self.w.put(ev)?;
        }
        self.advance_pos(run_end);
        for m in ends {
            self.w.marker(m)?;
        }
        self.emit_upto(run_end)
    }

    fn advance_pos(&mut self, pos: usize) {
        if let Some(p) = self.current.as_mut() {
            p.pos = pos;
        }
    }

    fn has_pending_at_or_before(&self, offset: usize) -> bool {
        self.current
            .as_ref()
            .is_some_and(|p| p.pending_at_or_before(offset))
    }

    /// Next unemitted marker strictly before `limit`, without consuming it.
    fn next_marker_before(&self, limit: usize) -> Option<Marker> {
        let p = self.current.as_ref()?;
        p.plan
            .markers
            .get(p.next)
            .copied()
            .filter(|m| m.offset < limit)
    }

    /// Close the run (and `w:t` when inside one), emit markers up to
    /// `offset`, then reopen with the same properties.
    fn split_at(
        &mut self,
        offset: usize,
        run_tag: &BytesStart<'_>,
        props: &[Event<'_>],
        in_t: bool,
    ) -> Result<(), ReviewError> {
        if in_t {
            self.w.put(Event::End(BytesEnd::new("w:t")))?;
        }
        self.w.put(Event::End(BytesEnd::new("w:r")))?;
        self.emit_upto(offset)?;
        self.w.put(Event::Start(run_tag.clone()))?;
        for ev in props {
            self.w.put(ev.clone())?;
        }
        if in_t {
            self.w.put(Event::Start(
                BytesStart::new("w:t").with_attributes([("xml:space", "preserve")]),
            ))?;
        }
        Ok(())
    }
}

fn depth_after(depth: &mut usize, ev: &Event<'_>) {
    match ev {
        Event::Start(_) => *depth += 1,
        Event::End(_) => *depth = depth.saturating_sub(1),
        _ => {}
    }
}

fn is_element(ev: &Event<'_>, name: &[u8]) -> bool {
    match ev {
        Event::Start(e) | Event::Empty(e) => e.name().as_ref() == name,
        _ => false,
    }
}

/// Rewrite `document.xml`, returning the new XML and the ids actually placed.
fn annotate_body(
    xml: &str,
    plans: &HashMap<ParaLoc, ParaPlan>,
) -> Result<(Vec<u8>, HashSet<u32>), ReviewError> {
    let mut reader = Reader::from_str(xml);
    let mut cursor = BodyCursor::new();
    let mut ann = BodyAnnotator {
        w: MarkupWriter::new(),
        plans,
        current: None,
    };
    let mut run: Option<RunBuffer<'_>> = None;

    loop {
        let event = reader.read_event().map_err(|e| {
            export_err(format!(
                "word/document.xml: XML error at byte {}: {e}",
                reader.buffer_position()
            ))
        })?;
        if matches!(event, Event::Eof) {
            break;
        }
        let child_of_paragraph = matches!(event, Event::Start(_) | Event::Empty(_))
            && cursor.paragraph_depth() == Some(cursor.depth())
            && !is_element(&event, b"w:pPr");
        let step = cursor.advance(&event).map_err(export_err)?;

        if let Some(mut buf) = run.take() {
            if buf.push(event, step) {
                ann.flush_run(buf)?;
            } else {
                run = Some(buf);
            }
            continue;
        }

        if child_of_paragraph {
            ann.begin()?;
        }

        match step {
            Step::ParagraphStart(loc) => {
                ann.w.put(event)?;
                ann.open(loc);
            }
            Step::ParagraphEnd(_) => {
                ann.finish()?;
                ann.w.put(event)?;
            }
            Step::EmptyParagraph(loc) => {
                ann.open(loc);
                let expand = match &event {
                    Event::Empty(e) if ann.current.is_some() => Some(e.clone()),
                    _ => None,
                };
                match expand {
                    Some(tag) => {
                        ann.w.put(Event::Start(tag))?;
                        ann.finish()?;
                        ann.w.put(Event::End(BytesEnd::new("w:p")))?;
                    }
                    None => ann.w.put(event)?,
                }
            }
            step => {
                let starts_run = matches!(&event, Event::Start(e) if e.name().as_ref() == b"w:r")
                    && ann.current.is_some()
                    && cursor.paragraph().is_some()
                    && !cursor.skipping();
                if starts_run {
                    run = Some(RunBuffer {
                        events: vec![(event, step)],
                        depth: 1,
                    });
                } else {
                    ann.w.put(event)?;
                }
            }
        }
    }

    Ok(ann.w.into_inner())
}

// ── Comments part ────────────────────────────────────────────────────────

fn comment_paragraphs(finding: &Finding) -> Vec<String> {
    let mut paras = vec![format!(
        "[{} · {}] {}",
        finding.severity, finding.category, finding.explanation
    )];
    if let Some(s) = finding.suggestion.as_deref().filter(|s| !s.trim().is_empty()) {
        paras.push(format!("Suggestion: {s}"));
    }
    paras
}

/// `<w:comment>` elements for the given (id, finding) pairs.
fn comment_elements(
    comments: &[(u32, &Finding)],
    options: &ExportOptions,
) -> Result<Vec<u8>, ReviewError> {
    let date = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut w = MarkupWriter::new();
    for (id, finding) in comments {
        let id = id.to_string();
        w.put(Event::Start(BytesStart::new("w:comment").with_attributes([
            ("w:id", id.as_str()),
            ("w:author", options.author.as_str()),
            ("w:date", date.as_str()),
            ("w:initials", options.initials.as_str()),
        ])))?;
        for (i, text) in comment_paragraphs(finding).iter().enumerate() {
            w.put(Event::Start(BytesStart::new("w:p")))?;
            if i == 0 {
                w.put(Event::Start(BytesStart::new("w:r")))?;
                w.put(Event::Empty(BytesStart::new("w:annotationRef")))?;
                w.put(Event::End(BytesEnd::new("w:r")))?;
            }
            write_text_run(&mut w, text)?;
            w.put(Event::End(BytesEnd::new("w:p")))?;
        }
        w.put(Event::End(BytesEnd::new("w:comment")))?;
    }
    Ok(w.into_inner().0)
}

/// One run; `\n` and `\t` become `w:br` and `w:tab`.
fn write_text_run(w: &mut MarkupWriter, text: &str) -> Result<(), ReviewError> {
    w.put(Event::Start(BytesStart::new("w:r")))?;
    let mut first_line = true;
    for line in text.split('\n') {
        if !first_line {
            w.put(Event::Empty(BytesStart::new("w:br")))?;
        }
        first_line = false;
        let mut first_cell = true;
        for piece in line.split('\t') {
            if !first_cell {
                w.put(Event::Empty(BytesStart::new("w:tab")))?;
            }
            first_cell = false;
            if !piece.is_empty() {
                w.put(Event::Start(
                    BytesStart::new("w:t").with_attributes([("xml:space", "preserve")]),
                ))?;
                w.text(piece)?;
                w.put(Event::End(BytesEnd::new("w:t")))?;
            }
        }
    }
    w.put(Event::End(BytesEnd::new("w:r")))
}

fn new_comments_part(elements: &[u8]) -> Vec<u8> {
    let mut out = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:comments xmlns:w="{WORD_NS}">"#
    )
    .into_bytes();
    out.extend_from_slice(elements);
    out.extend_from_slice(b"</w:comments>");
    out
}

fn append_comments(existing: &str, elements: &[u8]) -> Result<Vec<u8>, ReviewError> {
    let close = existing
        .rfind("</w:comments>")
        .ok_or_else(|| export_err("word/comments.xml has no closing w:comments tag"))?;
    let mut out = existing[..close].as_bytes().to_vec();
    out.extend_from_slice(elements);
    out.extend_from_slice(existing[close..].as_bytes());
    Ok(out)
}

/// Highest `w:id` among existing comments.
fn max_comment_id(xml: &str) -> Result<Option<u32>, ReviewError> {
    let mut reader = Reader::from_str(xml);
    let mut max = None;
    loop {
        match reader.read_event().map_err(export_err)? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"w:comment" => {
                if let Some(id) = attr(&e, b"w:id").and_then(|v| v.parse::<u32>().ok()) {
                    max = max.max(Some(id));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(max)
}

fn insert_before(xml: &str, closing: &str, fragment: &str) -> Result<Vec<u8>, ReviewError> {
    let at = xml
        .rfind(closing)
        .ok_or_else(|| export_err(format!("package part lacks {closing}")))?;
    Ok(format!("{}{fragment}{}", &xml[..at], &xml[at..]).into_bytes())
}

// ── DOCX package ─────────────────────────────────────────────────────────

const DOCUMENT_PART: &str = "word/document.xml";
const DOCUMENT_RELS_PART: &str = "word/_rels/document.xml.rels";
const CONTENT_TYPES_PART: &str = "[Content_Types].xml";
const RELS_NS: &str = "http://schemas.openxmlformats.org/package/2006/relationships";

fn read_required<R: std::io::Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<String, ReviewError> {
    read_part(archive, name)
        .ok_or_else(|| export_err(format!("package has no {name}")))?
        .map_err(|e| export_err(format!("cannot read {name}: {e}")))
}

fn annotate_package(
    source: &[u8],
    planned: &[Planned<'_>],
    options: &ExportOptions,
) -> Result<(Vec<u8>, usize), ReviewError> {
    let mut archive = ZipArchive::new(Cursor::new(source))
        .map_err(|e| export_err(format!("source is not a DOCX package: {e}")))?;
    let body = read_required(&mut archive, DOCUMENT_PART)?;
    let content_types = read_required(&mut archive, CONTENT_TYPES_PART)?;
    let rels_xml = match read_part(&mut archive, DOCUMENT_RELS_PART) {
        Some(r) => Some(r.map_err(|e| export_err(format!("cannot read {DOCUMENT_RELS_PART}: {e}")))?),
        None => None,
    };
    let rels = match &rels_xml {
        Some(xml) => parse_relationships(xml).map_err(export_err)?,
        None => HashMap::new(),
    };

    let comments_rel = rels.values().find(|r| r.rel_type == COMMENTS_REL_TYPE);
    let comments_part = comments_rel
        .map(|r| resolve_part(&r.target))
        .unwrap_or_else(|| "word/comments.xml".to_string());
    let existing_comments = match read_part(&mut archive, &comments_part) {
        Some(r) => Some(r.map_err(|e| export_err(format!("cannot read {comments_part}: {e}")))?),
        None => None,
    };
    let first_id = match &existing_comments {
        Some(xml) => max_comment_id(xml)?.map_or(0, |m| m + 1),
        None => 0,
    };

    // Plan.
    let mut plans: HashMap<ParaLoc, ParaPlan> = HashMap::new();
    let mut by_id: BTreeMap<u32, &Finding> = BTreeMap::new();
    for (n, p) in planned.iter().enumerate() {
        let id = first_id + n as u32;
        by_id.insert(id, p.finding);
        let plan = plans.entry(target_paragraph(p.span)).or_default();
        // Cell text spans several paragraphs; the comment covers the first.
        if p.whole || p.span.kind == SpanKind::TableCell {
            plan.whole.push(id);
        } else {
            let lead = p.span.position.leading_ws;
            plan.add_range(id, lead + p.start, lead + p.end);
        }
    }

    let (new_body, placed) = annotate_body(&body, &plans)?;
    let placed: Vec<(u32, &Finding)> = by_id
        .into_iter()
        .filter(|(id, _)| placed.contains(id))
        .collect();
    if placed.len() < planned.len() {
        warn!(
            "{} of {} comments could not be placed in the document body",
            planned.len() - placed.len(),
            planned.len()
        );
    }

    let mut replacements: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    replacements.insert(DOCUMENT_PART.to_string(), new_body);

    if !placed.is_empty() {
        let elements = comment_elements(&placed, options)?;
        let comments_xml = match &existing_comments {
            Some(xml) => append_comments(xml, &elements)?,
            None => new_comments_part(&elements),
        };
        replacements.insert(comments_part.clone(), comments_xml);

        if comments_rel.is_none() {
            let rid = next_relationship_id(&rels);
            let target = comments_part
                .strip_prefix("word/")
                .unwrap_or(&comments_part)
                .to_string();
            let rel = format!(
                r#"<Relationship Id="{rid}" Type="{COMMENTS_REL_TYPE}" Target="{target}"/>"#
            );
            let rels_out = match &rels_xml {
                Some(xml) => insert_before(xml, "</Relationships>", &rel)?,
                None => format!(
                    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{RELS_NS}">{rel}</Relationships>"#
                )
                .into_bytes(),
            };
            replacements.insert(DOCUMENT_RELS_PART.to_string(), rels_out);
        }

        let part_name = format!("/{comments_part}");
        if !content_types.contains(&format!("PartName=\"{part_name}\"")) {
            let o = format!(
                r#"<Override PartName="{part_name}" ContentType="{COMMENTS_CONTENT_TYPE}"/>"#
            );
            replacements.insert(
                CONTENT_TYPES_PART.to_string(),
                insert_before(&content_types, "</Types>", &o)?,
            );
        }
    }

    let bytes = rewrite_zip(&mut archive, replacements)?;
    Ok((bytes, placed.len()))
}

fn next_relationship_id(rels: &HashMap<String, crate::ooxml::Relationship>) -> String {
    let max = rels
        .keys()
        .filter_map(|id| id.strip_prefix("rId")?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    let mut n = max + 1;
    while rels.contains_key(&format!("rId{n}")) {
        n += 1;
    }
    format!("rId{n}")
}

/// Copy every entry, replacing (or adding) the parts in `replacements`.
fn rewrite_zip<R: std::io::Read + std::io::Seek>(
    archive: &mut ZipArchive<R>,
    mut replacements: BTreeMap<String, Vec<u8>>,
) -> Result<Vec<u8>, ReviewError> {
    let mut out = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default();
    for i in 0..archive.len() {
        let file = archive.by_index_raw(i).map_err(export_err)?;
        let name = file.name().to_string();
        match replacements.remove(&name) {
            Some(content) => {
                drop(file);
                out.start_file(name, opts).map_err(export_err)?;
                out.write_all(&content).map_err(export_err)?;
            }
            None => out.raw_copy_file(file).map_err(export_err)?,
        }
    }
    for (name, content) in replacements {
        debug!("Adding package part {}", name);
        out.start_file(name, opts).map_err(export_err)?;
        out.write_all(&content).map_err(export_err)?;
    }
    Ok(out.finish().map_err(export_err)?.into_inner())
}

// ── Synthesized package (PDF / XLSX) ─────────────────────────────────────

/// Text of the paragraph standing in for `span`, and where its content starts.
fn synthesized_text(span: &Span) -> (String, usize) {
    let p = &span.position;
    let label = match (span.kind, &p.sheet, &p.cell) {
        (SpanKind::Image, _, _) => {
            let name = span.image.as_ref().map_or("image", |i| i.file_name.as_str());
            return (format!("[Image: {name}]"), 0);
        }
        (SpanKind::TableCell, Some(sheet), Some(cell)) => format!("[{sheet}!{cell}] "),
        (SpanKind::TableCell, _, _) => format!(
            "[Table {}, row {}, col {}] ",
            p.table.map_or(0, |t| t + 1),
            p.row.map_or(0, |r| r + 1),
            p.col.map_or(0, |c| c + 1)
        ),
        (SpanKind::Text, _, _) => String::new(),
    };
    let offset = label.len();
    (format!("{label}{}", span.content), offset)
}

fn synthesize(
    document: &Document,
    planned: &[Planned<'_>],
    options: &ExportOptions,
) -> Result<(Vec<u8>, usize), ReviewError> {
    let mut plans: HashMap<u32, ParaPlan> = HashMap::new();
    let mut comments: Vec<(u32, &Finding)> = Vec::new();
    for (n, p) in planned.iter().enumerate() {
        let id = n as u32;
        comments.push((id, p.finding));
        let (_, offset) = synthesized_text(p.span);
        let plan = plans.entry(p.span.id).or_default();
        if p.whole {
            plan.whole.push(id);
        } else {
            plan.add_range(id, offset + p.start, offset + p.end);
        }
    }

    let mut w = MarkupWriter::new();
    let mut heading: Option<String> = None;
    for span in &document.spans {
        let section = match (&span.position.sheet, span.position.page) {
            (Some(sheet), _) => Some(format!("Sheet: {sheet}")),
            (None, Some(page)) => Some(format!("Page {page}")),
            _ => None,
        };
        if section.is_some() && section != heading {
            if let Some(title) = &section {
                w.put(Event::Start(BytesStart::new("w:p")))?;
                write_text_run(&mut w, title)?;
                w.put(Event::End(BytesEnd::new("w:p")))?;
            }
            heading = section;
        }

        let (text, _) = synthesized_text(span);
        let empty = ParaPlan::default();
        let plan = plans.get(&span.id).unwrap_or(&empty);
        w.put(Event::Start(BytesStart::new("w:p")))?;
        for &id in &plan.whole {
            w.start(id)?;
        }
        let mut local = 0;
        for m in &plan.markers {
            let cut = m.offset.min(text.len());
            if cut > local && text.is_char_boundary(cut) {
                write_text_run(&mut w, &text[local..cut])?;
                local = cut;
            }
            w.marker(*m)?;
        }
        if local < text.len() {
            write_text_run(&mut w, &text[local..])?;
        }
        for &id in &plan.whole {
            w.end(id)?;
        }
        w.put(Event::End(BytesEnd::new("w:p")))?;
    }
    let (body, _) = w.into_inner();

    let mut document_xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<w:document xmlns:w="{WORD_NS}"><w:body>"#
    )
    .into_bytes();
    document_xml.extend_from_slice(&body);
    document_xml.extend_from_slice(b"<w:sectPr/></w:body></w:document>");

    let comments_xml = new_comments_part(&comment_elements(&comments, options)?);

    let parts: [(&str, Vec<u8>); 5] = [
        (
            CONTENT_TYPES_PART,
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/><Override PartName="/word/comments.xml" ContentType="{COMMENTS_CONTENT_TYPE}"/></Types>"#
            )
            .into_bytes(),
        ),
        (
            "_rels/.rels",
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{RELS_NS}"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="word/document.xml"/></Relationships>"#
            )
            .into_bytes(),
        ),
        (DOCUMENT_PART, document_xml),
        (
            DOCUMENT_RELS_PART,
            format!(
                r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="{RELS_NS}"><Relationship Id="rId1" Type="{COMMENTS_REL_TYPE}" Target="comments.xml"/></Relationships>"#
            )
            .into_bytes(),
        ),
        ("word/comments.xml", comments_xml),
    ];

    let mut out = ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default();
    for (name, content) in parts {
        out.start_file(name, opts).map_err(export_err)?;
        out.write_all(&content).map_err(export_err)?;
    }
    let bytes = out.finish().map_err(export_err)?.into_inner();
    Ok((bytes, comments.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Anchor, AnchoredFinding, LocationRef, Severity, TokenUsage};
    use crate::parser::docx::tests::docx_with;
    use crate::parser::parse_bytes;
    use uuid::Uuid;

    fn finding(index: usize, severity: Severity) -> Finding {
        Finding {
            document_id: Uuid::nil(),
            index,
            category: "calculation".into(),
            severity,
            explanation: format!("explanation {index}"),
            suggestion: Some("Recalculate".into()),
            location: LocationRef::default(),
        }
    }

    fn analysis(anchored: Vec<(usize, Anchor)>) -> AnalysisResult {
        AnalysisResult {
            document_id: Uuid::nil(),
            analyzed_at: Utc::now(),
            anchored: anchored
                .into_iter()
                .map(|(i, a)| AnchoredFinding {
                    finding: finding(i, Severity::High),
                    anchors: vec![a],
                })
                .collect(),
            unanchored: vec![finding(99, Severity::Low)],
            mapping_failures: vec![],
            model: "m".into(),
            usage: TokenUsage::default(),
            duration_ms: 0,
        }
    }

    fn exact(span_id: u32, start: usize, end: usize) -> Anchor {
        Anchor {
            span_id,
            start,
            end,
            match_kind: MatchKind::Exact,
        }
    }

    fn document_from(filename: &str, bytes: &[u8]) -> Document {
        let (format, parsed) = parse_bytes(filename, bytes).unwrap();
        Document {
            id: Uuid::nil(),
            original_filename: filename.into(),
            format,
            spans: parsed.spans,
            uploaded_at: Utc::now(),
        }
    }

    fn part(bytes: &[u8], name: &str) -> Option<String> {
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        read_part(&mut archive, name).map(|r| r.unwrap())
    }

    fn span_texts(bytes: &[u8]) -> Vec<String> {
        let (_, parsed) = parse_bytes("out.docx", bytes).unwrap();
        parsed.spans.into_iter().map(|s| s.content).collect()
    }

    const BODY: &str = r#"<w:p><w:r><w:rPr><w:b/></w:rPr><w:t xml:space="preserve">  RSD = 2.3% (n=6)</w:t></w:r></w:p><w:p><w:r><w:t>Recovery</w:t></w:r><w:r><w:tab/><w:t>98%</w:t></w:r></w:p><w:tbl><w:tr><w:tc><w:p><w:r><w:t>Mean</w:t></w:r></w:p></w:tc><w:tc><w:p/><w:p><w:r><w:t>12.5</w:t></w:r></w:p></w:tc></w:tr></w:tbl>"#;

    #[test]
    fn range_comment_splits_run_and_keeps_text() {
        let src = docx_with(BODY, &[], "");
        let doc = document_from("r.docx", &src);
        assert_eq!(doc.spans[0].content, "RSD = 2.3% (n=6)");

        let a = analysis(vec![(0, exact(0, 6, 10))]);
        let out = export_annotated(&doc, &src, &a, &ExportOptions::default()).unwrap();
        assert_eq!(out.comments, 1);
        assert_eq!(out.file_name, "r_reviewed.docx");

        let body = part(&out.bytes, "word/document.xml").unwrap();
        assert!(body.contains(
            r#"<w:t xml:space="preserve">  RSD = </w:t></w:r><w:commentRangeStart w:id="0"/><w:r><w:rPr><w:b/></w:rPr><w:t xml:space="preserve">2.3%</w:t></w:r><w:commentRangeEnd w:id="0"/><w:r><w:commentReference w:id="0"/></w:r><w:r><w:rPr><w:b/></w:rPr><w:t xml:space="preserve"> (n=6)</w:t></w:r>"#
        ));
        assert_eq!(span_texts(&out.bytes), span_texts(&src));

        let comments = part(&out.bytes, "word/comments.xml").unwrap();
        assert_eq!(comments.matches("<w:comment ").count(), 1);
        assert!(comments.contains("[high · calculation] explanation 0"));
        assert!(comments.contains("Suggestion: Recalculate"));
        assert!(comments.contains(r#"w:author="CRO Review""#));

        let types = part(&out.bytes, "[Content_Types].xml").unwrap();
        assert!(types.contains(r#"PartName="/word/comments.xml""#));
        let rels = part(&out.bytes, "word/_rels/document.xml.rels").unwrap();
        assert!(rels.contains(COMMENTS_REL_TYPE));
    }

    #[test]
    fn range_across_runs_and_tabs() {
        let src = docx_with(BODY, &[], "");
        let doc = document_from("r.docx", &src);
        assert_eq!(doc.spans[1].content, "Recovery\t98%");

        // "ery\t98" starts inside the first run and ends inside the second.
        let a = analysis(vec![(0, exact(1, 5, 11))]);
        let out = export_annotated(&doc, &src, &a, &ExportOptions::default()).unwrap();
        let body = part(&out.bytes, "word/document.xml").unwrap();
        assert!(body.contains(r#"Recov</w:t></w:r><w:commentRangeStart w:id="0"/>"#));
        assert!(body.contains(r#"98</w:t></w:r><w:commentRangeEnd w:id="0"/>"#));
        assert_eq!(span_texts(&out.bytes), span_texts(&src));
    }

    #[test]
    fn range_inside_ruby_widens_to_the_whole_run() {
        let body = r#"<w:p><w:r><w:t>b</w:t></w:r><w:r><w:ruby><w:rubyBase><w:r><w:t>base</w:t></w:r></w:rubyBase></w:ruby></w:r></w:p>"#;
        let src = docx_with(body, &[], "");
        let doc = document_from("r.docx", &src);
        assert_eq!(doc.spans[0].content, "bbase");

        let a = analysis(vec![(0, exact(0, 2, 4))]);
        let out = export_annotated(&doc, &src, &a, &ExportOptions::default()).unwrap();
        assert_eq!(out.comments, 1);
        let xml = part(&out.bytes, "word/document.xml").unwrap();
        assert!(xml.contains(r#"<w:t>b</w:t></w:r><w:commentRangeStart w:id="0"/><w:r><w:ruby>"#));
        assert!(xml.contains(r#"</w:ruby></w:r><w:commentRangeEnd w:id="0"/>"#));

        let mut reader = Reader::from_str(&xml);
        loop {
            match reader.read_event() {
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => panic!("malformed document.xml: {e}"),
            }
        }
        assert_eq!(span_texts(&out.bytes), span_texts(&src));
    }

    #[test]
    fn table_cell_comment_covers_first_paragraph() {
        let src = docx_with(BODY, &[], "");
        let doc = document_from("r.docx", &src);
        let cell = doc.spans.iter().find(|s| s.content == "12.5").unwrap();
        let a = analysis(vec![(
            0,
            Anchor {
                span_id: cell.id,
                start: 0,
                end: 4,
                match_kind: MatchKind::Exact,
            },
        )]);
        let out = export_annotated(&doc, &src, &a, &ExportOptions::default()).unwrap();
        let body = part(&out.bytes, "word/document.xml").unwrap();
        // The cell's first paragraph was `<w:p/>`; it is expanded to hold the range.
        assert!(body.contains(
            r#"<w:p><w:commentRangeStart w:id="0"/><w:commentRangeEnd w:id="0"/><w:r><w:commentReference w:id="0"/></w:r></w:p>"#
        ));
        assert_eq!(out.comments, 1);
    }

    #[test]
    fn selection_limits_comments_and_unanchored_are_never_exported() {
        let src = docx_with(BODY, &[], "");
        let doc = document_from("r.docx", &src);
        let a = analysis(vec![(0, exact(0, 0, 3)), (1, exact(1, 0, 8))]);
        let opts = ExportOptions::default().with_selection(Some(vec![1, 99]));
        let out = export_annotated(&doc, &src, &a, &opts).unwrap();
        assert_eq!(out.comments, 1);
        let comments = part(&out.bytes, "word/comments.xml").unwrap();
        assert!(comments.contains("explanation 1"));
        assert!(!comments.contains("explanation 0"));
        assert!(!comments.contains("explanation 99"));
    }

    #[test]
    fn existing_comments_are_appended() {
        let existing = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:comments xmlns:w="{WORD_NS}"><w:comment w:id="7" w:author="QA"><w:p><w:r><w:t>old</w:t></w:r></w:p></w:comment></w:comments>"#
        );
        let rel = format!(r#"<Relationship Id="rId3" Type="{COMMENTS_REL_TYPE}" Target="comments.xml"/>"#);
        let src = docx_with(BODY, &[("word/comments.xml", existing.as_bytes())], &rel);
        let doc = document_from("r.docx", &src);
        let a = analysis(vec![(0, exact(0, 0, 3))]);
        let out = export_annotated(&doc, &src, &a, &ExportOptions::default()).unwrap();

        let comments = part(&out.bytes, "word/comments.xml").unwrap();
        assert_eq!(comments.matches("<w:comment ").count(), 2);
        assert!(comments.contains(r#"<w:comment w:id="8""#));
        let body = part(&out.bytes, "word/document.xml").unwrap();
        assert!(body.contains(r#"<w:commentRangeStart w:id="8"/>"#));
        let rels = part(&out.bytes, "word/_rels/document.xml.rels").unwrap();
        assert_eq!(rels.matches(COMMENTS_REL_TYPE).count(), 1);
    }

    #[test]
    fn no_findings_keeps_package_intact() {
        let src = docx_with(BODY, &[], "");
        let doc = document_from("r.docx", &src);
        let out = export_annotated(&doc, &src, &analysis(vec![]), &ExportOptions::default()).unwrap();
        assert_eq!(out.comments, 0);
        assert!(part(&out.bytes, "word/comments.xml").is_none());
        assert_eq!(span_texts(&out.bytes), span_texts(&src));
    }

    #[test]
    fn spreadsheet_export_is_synthesized() {
        let doc = Document {
            id: Uuid::nil(),
            original_filename: "batch.xlsx".into(),
            format: DocumentFormat::Xlsx,
            spans: vec![Span {
                id: 0,
                kind: SpanKind::TableCell,
                content: "2.3%".into(),
                position: crate::model::SpanPosition {
                    sheet: Some("Results".into()),
                    cell: Some("B3".into()),
                    row: Some(2),
                    col: Some(1),
                    ..Default::default()
                },
                image: None,
            }],
            uploaded_at: Utc::now(),
        };
        let a = analysis(vec![(0, exact(0, 0, 4))]);
        let out = export_annotated(&doc, &[], &a, &ExportOptions::default()).unwrap();
        assert_eq!(out.file_name, "batch_reviewed.docx");
        assert_eq!(out.comments, 1);

        let texts = span_texts(&out.bytes);
        assert_eq!(texts, vec!["Sheet: Results", "[Results!B3] 2.3%"]);
        let body = part(&out.bytes, "word/document.xml").unwrap();
        assert!(body.contains(
            r#"[Results!B3] </w:t></w:r><w:commentRangeStart w:id="0"/><w:r><w:t xml:space="preserve">2.3%</w:t></w:r><w:commentRangeEnd w:id="0"/>"#
        ));
    }

    #[test]
    fn comment_text_layout() {
        let mut f = finding(0, Severity::Medium);
        f.suggestion = None;
        assert_eq!(comment_paragraphs(&f), vec!["[medium · calculation] explanation 0"]);
    }

    #[test]
    fn reviewed_names() {
        assert_eq!(reviewed_file_name("report.pdf"), "report_reviewed.docx");
        assert_eq!(reviewed_file_name(".docx"), ".docx_reviewed.docx");
    }
}
