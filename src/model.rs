//! Domain records shared by every stage: documents, spans, findings and
//! analysis results.
//!
//! Everything here is plain data with `serde` derives so the same structs
//! are persisted by [`crate::store`], returned as JSON by the web layer and
//! printed by the CLI. Derived numbers (quality score, per-severity counts,
//! risk summary) are computed on demand and never stored, so a record can
//! never disagree with itself.

use crate::error::MappingFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ── Documents and spans ──────────────────────────────────────────────────

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Docx,
    Pdf,
    Xlsx,
}

impl DocumentFormat {
    /// File extension without the dot.
    pub fn extension(self) -> &'static str {
        match self {
            DocumentFormat::Docx => "docx",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Xlsx => "xlsx",
        }
    }

    /// Map a file extension (case-insensitive, with or without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "docx" => Some(DocumentFormat::Docx),
            "pdf" => Some(DocumentFormat::Pdf),
            "xlsx" => Some(DocumentFormat::Xlsx),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// What kind of content a span addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Text,
    TableCell,
    Image,
}

/// Where a span came from inside its document.
///
/// Only the fields meaningful for the source format are set; the rest stay
/// `None` and are omitted from JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanPosition {
    /// Top-level body element index (DOCX), paragraph index (PDF) or sheet
    /// index (XLSX).
    pub block: usize,
    /// 1-based page number (PDF only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// 0-based table ordinal among the document's tables (DOCX).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<usize>,
    /// Worksheet name (XLSX).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    /// A1-style cell reference (XLSX).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell: Option<String>,
    /// Bytes trimmed from the front of the raw paragraph text.
    #[serde(default)]
    pub leading_ws: usize,
    /// Paragraph style id (DOCX).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

/// Metadata of an extracted image; the bytes live in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAsset {
    /// File name under the document's asset directory.
    pub file_name: String,
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// An addressable unit of document content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Dense, 0-based, in document order.
    pub id: u32,
    pub kind: SpanKind,
    /// Trimmed text; empty for images.
    pub content: String,
    pub position: SpanPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageAsset>,
}

/// A parsed upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub original_filename: String,
    pub format: DocumentFormat,
    pub spans: Vec<Span>,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    /// A new document with a fresh id, uploaded now.
    pub fn new(original_filename: impl Into<String>, format: DocumentFormat, spans: Vec<Span>) -> Self {
        Self {
            id: Uuid::new_v4(),
            original_filename: original_filename.into(),
            format,
            spans,
            uploaded_at: Utc::now(),
        }
    }

    pub fn span(&self, id: u32) -> Option<&Span> {
        // Ids are dense, so index first and fall back to a scan.
        match self.spans.get(id as usize) {
            Some(s) if s.id == id => Some(s),
            _ => self.spans.iter().find(|s| s.id == id),
        }
    }

    pub fn image_count(&self) -> usize {
        self.spans
            .iter()
            .filter(|s| s.kind == SpanKind::Image)
            .count()
    }
}

// ── Findings ─────────────────────────────────────────────────────────────

/// Severity of a finding, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Lenient parse of whatever label the model produced.
    ///
    /// Accepts the English and Chinese CRO review vocabulary; unknown
    /// labels fall back to [`Severity::Medium`].
    pub fn parse_lenient(label: &str) -> Self {
        let l = label.trim().to_lowercase();
        match l.as_str() {
            "critical" | "high" | "severe" | "严重" | "高" | "高风险" => Severity::High,
            "major" | "medium" | "moderate" | "主要" | "中" | "中风险" => Severity::Medium,
            "minor" | "low" | "info" | "trivial" | "次要" | "低" | "低风险" => Severity::Low,
            _ => Severity::Medium,
        }
    }

    /// Points deducted from the quality score per finding.
    pub fn penalty(self) -> u32 {
        match self {
            Severity::High => 20,
            Severity::Medium => 10,
            Severity::Low => 5,
        }
    }

    /// 0 for the most severe level; smaller wins when ranges overlap.
    pub fn rank(self) -> u8 {
        match self {
            Severity::High => 0,
            Severity::Medium => 1,
            Severity::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The model's description of where a finding is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRef {
    /// Span ids the model named, in the order given.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub element_ids: Vec<u32>,
    /// Verbatim snippet the finding is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
}

impl LocationRef {
    pub fn is_empty(&self) -> bool {
        self.element_ids.is_empty() && self.quote.as_deref().is_none_or(|q| q.trim().is_empty())
    }
}

/// One issue reported by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub document_id: Uuid,
    /// Position in the model's answer; stable across reloads.
    pub index: usize,
    pub category: String,
    pub severity: Severity,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    pub location: LocationRef,
}

/// How an anchor was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Fuzzy,
    SpanHint,
}

/// A byte range inside one span's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub span_id: u32,
    pub start: usize,
    pub end: usize,
    pub match_kind: MatchKind,
}

impl Anchor {
    /// True when the anchor covers the span's whole content.
    pub fn covers(&self, span: &Span) -> bool {
        self.start == 0 && self.end >= span.content.len()
    }
}

/// A finding with at least one resolved anchor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchoredFinding {
    pub finding: Finding,
    pub anchors: Vec<Anchor>,
}

// ── Analysis ─────────────────────────────────────────────────────────────

/// Token accounting reported by the model API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Findings per severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }

    /// `max(0, 100 - (20·high + 10·medium + 5·low))`.
    pub fn quality_score(&self) -> u32 {
        let penalty = self.high as u32 * Severity::High.penalty()
            + self.medium as u32 * Severity::Medium.penalty()
            + self.low as u32 * Severity::Low.penalty();
        100u32.saturating_sub(penalty)
    }

    /// Headline for the most severe non-empty bucket.
    pub fn risk_summary(&self) -> String {
        if self.high > 0 {
            format!("{} high-severity issues", self.high)
        } else if self.medium > 0 {
            format!("{} medium-severity issues", self.medium)
        } else if self.low > 0 {
            format!("{} low-severity issues", self.low)
        } else {
            "no issues found".to_string()
        }
    }
}

/// The outcome of one review run. Replaced wholesale on re-analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub document_id: Uuid,
    pub analyzed_at: DateTime<Utc>,
    pub anchored: Vec<AnchoredFinding>,
    pub unanchored: Vec<Finding>,
    #[serde(default)]
    pub mapping_failures: Vec<MappingFailure>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub duration_ms: u64,
}

impl AnalysisResult {
    /// Every finding, anchored or not, in answer order.
    pub fn findings(&self) -> Vec<&Finding> {
        let mut all: Vec<&Finding> = self
            .anchored
            .iter()
            .map(|a| &a.finding)
            .chain(self.unanchored.iter())
            .collect();
        all.sort_by_key(|f| f.index);
        all
    }

    pub fn counts(&self) -> SeverityCounts {
        let mut counts = SeverityCounts::default();
        for f in self.findings() {
            counts.add(f.severity);
        }
        counts
    }

    pub fn quality_score(&self) -> u32 {
        self.counts().quality_score()
    }

    pub fn risk_summary(&self) -> String {
        self.counts().risk_summary()
    }

    pub fn anchored_by_index(&self, index: usize) -> Option<&AnchoredFinding> {
        self.anchored.iter().find(|a| a.finding.index == index)
    }
}

// ── Stored records ───────────────────────────────────────────────────────

/// Lifecycle of a stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Uploaded,
    Analyzing,
    Analyzed,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Analyzing => "analyzing",
            DocumentStatus::Analyzed => "analyzed",
        })
    }
}

/// Everything the store keeps about one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document: Document,
    pub status: DocumentStatus,
    #[serde(default)]
    pub analysis: Option<AnalysisResult>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    pub fn new(document: Document) -> Self {
        let updated_at = document.uploaded_at;
        Self {
            document,
            status: DocumentStatus::Uploaded,
            analysis: None,
            updated_at,
        }
    }

    pub fn id(&self) -> Uuid {
        self.document.id
    }

    /// Analysis result, only once the document is in the analyzed state.
    pub fn completed_analysis(&self) -> Option<&AnalysisResult> {
        match self.status {
            DocumentStatus::Analyzed => self.analysis.as_ref(),
            _ => None,
        }
    }

    pub fn quality_score(&self) -> Option<u32> {
        self.completed_analysis().map(AnalysisResult::quality_score)
    }

    pub fn risk_summary(&self) -> String {
        match self.completed_analysis() {
            Some(a) => a.risk_summary(),
            None => "not analyzed".to_string(),
        }
    }
}

/// How many analyzed documents fall into each risk bucket.
///
/// A document counts once, under its most severe finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskStats {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl RiskStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DocumentRecord>) -> Self {
        let mut stats = RiskStats::default();
        for analysis in records.into_iter().filter_map(|r| r.completed_analysis()) {
            let c = analysis.counts();
            if c.high > 0 {
                stats.high += 1;
            } else if c.medium > 0 {
                stats.medium += 1;
            } else {
                stats.low += 1;
            }
        }
        stats
    }
}
