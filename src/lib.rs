//! # cro-review
//!
//! Review CRO (contract research organization) report documents with a
//! hosted multimodal model and turn its findings into highlighted review
//! comments.
//!
//! ## Why this crate?
//!
//! A model can spot an RSD above its acceptance limit or a date that
//! contradicts the study plan, but it answers in free text with a loose idea
//! of *where* the problem is. This crate parses the report into numbered
//! spans, asks Qwen-VL-Max to cite those spans, and then anchors every
//! finding back to an exact byte range, so the same finding can be shown as
//! an HTML highlight and written into the original DOCX as a native Word
//! comment.
//!
//! ## Pipeline Overview
//!
//! ```text
//! DOCX / PDF / XLSX
//!  │
//!  ├─ 1. Parse    spans (paragraphs, table cells, images), spawn_blocking
//!  ├─ 2. Encode   embedded images → base64 data URIs
//!  ├─ 3. Model    one DashScope multimodal call with "[ID: n]" markers
//!  ├─ 4. Salvage  findings array recovered from fences, prose, truncation
//!  ├─ 5. Map      exact → fuzzy → span hint anchoring
//!  └─ 6. Output   HTML highlights, annotated DOCX, quality score
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cro_review::{review_file, ExportOptions, ReviewConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // DASHSCOPE_API_KEY from the environment
//!     let config = ReviewConfig::from_env()?;
//!     let output = review_file("report.docx", &config).await?;
//!     eprintln!("score {} ({})",
//!         output.analysis.quality_score(),
//!         output.analysis.risk_summary());
//!     let docx = output.export(&ExportOptions::from_config(&config))?;
//!     std::fs::write(&docx.file_name, &docx.bytes)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature  | Default | Description |
//! |----------|---------|-------------|
//! | `server` | on      | axum web layer ([`server`]) |
//! | `cli`    | on      | the `cro-review` binary (clap + anyhow + tracing-subscriber) |
//!
//! Library-only users can drop both:
//! ```toml
//! cro-review = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod export;
pub mod highlight;
pub mod mapper;
pub mod model;
pub(crate) mod ooxml;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod review;
#[cfg(feature = "server")]
pub mod server;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ReviewConfig, ReviewConfigBuilder, ServerConfig};
pub use error::{LlmError, MappingFailure, MappingFailureKind, ReviewError};
pub use export::{export_annotated, AnnotatedDocx, ExportOptions};
pub use highlight::{highlight_ranges, render_html, HighlightRange};
pub use mapper::{map_findings, MappingOutcome};
pub use model::{
    AnalysisResult, Anchor, AnchoredFinding, Document, DocumentFormat, DocumentRecord,
    DocumentStatus, Finding, LocationRef, MatchKind, RiskStats, Severity, SeverityCounts, Span,
    SpanKind, SpanPosition, TokenUsage,
};
pub use pipeline::llm::{DashScopeClient, LlmClient, RecordingClient, ReplayClient};
pub use progress::{NoopProgressCallback, ProgressCallback, ReviewProgressCallback};
pub use review::{
    analyze_stored, export_stored, inspect_file, review_bytes, review_document, review_file,
    ReviewOutput,
};
pub use store::DocumentStore;
