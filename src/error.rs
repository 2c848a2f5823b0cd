//! Error types for the cro-review library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`ReviewError`] — **Fatal**: the operation cannot proceed at all
//!   (unsupported upload, corrupt document, model unreachable, unknown
//!   document id). Returned as `Err(ReviewError)` from every public entry
//!   point.
//!
//! * [`LlmError`] — the reason a model round-trip failed. Wrapped by
//!   [`ReviewError::Llm`] but kept separate so [`crate::pipeline::llm::LlmClient`]
//!   implementations do not depend on storage or parsing concerns.
//!
//! * [`MappingFailure`] — **Non-fatal**: one finding's location reference
//!   could not be resolved to a span. Stored inside
//!   [`crate::model::AnalysisResult`] so the review still succeeds and the
//!   finding is shown in the unanchored list instead of being lost.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// All fatal errors returned by the cro-review library.
#[derive(Debug, Error)]
pub enum ReviewError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Upload is not a DOCX, PDF or XLSX file.
    #[error("Unsupported document '{filename}': {reason}\nSupported formats: .docx, .pdf, .xlsx")]
    UnsupportedFormat { filename: String, reason: String },

    /// The file looked like a supported format but could not be parsed.
    #[error("Failed to parse '{filename}': {detail}")]
    Parse { filename: String, detail: String },

    /// Input file was not found at the given path.
    #[error("File not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The model round-trip failed.
    #[error(transparent)]
    Llm(#[from] LlmError),

    // ── Store errors ──────────────────────────────────────────────────────
    /// No document with this id exists in the store.
    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    /// Export or highlight requested before any analysis finished.
    #[error("Document {0} has not been analyzed yet")]
    NotAnalyzed(Uuid),

    /// Reading or writing the flat-file store failed.
    #[error("Store error at '{path}': {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored record exists but is not valid JSON for this version.
    #[error("Corrupt record '{path}': {detail}")]
    CorruptRecord { path: PathBuf, detail: String },

    // ── Export errors ─────────────────────────────────────────────────────
    /// Producing the annotated DOCX failed.
    #[error("Export failed: {0}")]
    Export(String),

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReviewError {
    /// Build a [`ReviewError::Parse`] from any displayable cause.
    pub fn parse(filename: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        ReviewError::Parse {
            filename: filename.into(),
            detail: detail.to_string(),
        }
    }

    /// Wrap an I/O failure on `path` as a store error.
    pub fn store(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ReviewError::Store {
            path: path.into(),
            source,
        }
    }
}

/// Why a model round-trip failed.
///
/// No variant is retried automatically; callers decide whether to try again.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LlmError {
    /// No API key was configured for the hosted model.
    #[error("LLM client is not configured: {hint}")]
    NotConfigured { hint: String },

    /// Connection refused, DNS failure, TLS error and the like.
    #[error("Network error talking to the model API: {0}")]
    Network(String),

    /// The call did not finish within the configured timeout.
    #[error("Model API call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// HTTP 429: quota exhausted or rate limited.
    #[error("Model API quota exceeded or rate limited: {detail}")]
    RateLimited { detail: String },

    /// HTTP 401/403 from the model API.
    #[error("Model API rejected the credentials: {detail}\nCheck DASHSCOPE_API_KEY.")]
    Auth { detail: String },

    /// Any other non-success answer from the model API.
    #[error("Model API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The model answered, but no findings list could be recovered from it.
    #[error("Model returned an unparseable response: {detail}")]
    InvalidResponse { detail: String },
}

/// Why a single finding stayed unanchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingFailureKind {
    /// The reference carried neither a quote nor a span id.
    EmptyReference,
    /// A quote was given but occurs in no span, even after normalisation.
    NoMatch,
    /// Only span ids were given and none of them exist in the document.
    UnknownSpan,
}

/// A non-fatal mapping failure for one finding.
///
/// Stored alongside the unanchored finding in [`crate::model::AnalysisResult`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Finding {finding_index}: {detail}")]
pub struct MappingFailure {
    /// Index of the finding in the model's answer.
    pub finding_index: usize,
    pub kind: MappingFailureKind,
    /// Human-readable description, including the offending reference.
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_format_display() {
        let e = ReviewError::UnsupportedFormat {
            filename: "notes.txt".into(),
            reason: "unknown extension".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("notes.txt"), "got: {msg}");
        assert!(msg.contains(".docx"));
    }

    #[test]
    fn llm_error_is_transparent() {
        let e: ReviewError = LlmError::Timeout { secs: 120 }.into();
        assert_eq!(e.to_string(), "Model API call timed out after 120s");
    }

    #[test]
    fn auth_error_mentions_key() {
        let e = LlmError::Auth {
            detail: "InvalidApiKey".into(),
        };
        assert!(e.to_string().contains("DASHSCOPE_API_KEY"));
    }

    #[test]
    fn mapping_failure_serialises_kind_snake_case() {
        let f = MappingFailure {
            finding_index: 3,
            kind: MappingFailureKind::NoMatch,
            detail: "quote 'typo' not found".into(),
        };
        let json = serde_json::to_value(&f).unwrap();
        assert_eq!(json["kind"], "no_match");
        assert!(f.to_string().starts_with("Finding 3"));
    }

    #[test]
    fn not_found_display_contains_id() {
        let id = Uuid::nil();
        let e = ReviewError::DocumentNotFound(id);
        assert!(e.to_string().contains(&id.to_string()));
    }
}
