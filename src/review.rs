//! Review entry points: parse → encode → model → map.
//!
//! ## Why two flavours?
//!
//! The web layer works on documents already in the [`DocumentStore`] and must
//! keep the stored status honest while the model call is in flight
//! ([`analyze_stored`]). The CLI works on files and keeps everything in
//! memory ([`review_file`]). Both end in the same [`review_document`], so a
//! finding anchors identically whichever front end asked for it.

use crate::config::ReviewConfig;
use crate::error::ReviewError;
use crate::export::{self, AnnotatedDocx, ExportOptions};
use crate::mapper::map_findings;
use crate::model::{AnalysisResult, Document, DocumentRecord, DocumentStatus, SpanKind};
use crate::parser::{self, ExtractedImage};
use crate::pipeline::{encode, llm, postprocess};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::store::DocumentStore;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A reviewed file, kept in memory.
#[derive(Debug, Clone)]
pub struct ReviewOutput {
    pub document: Document,
    pub analysis: AnalysisResult,
    /// The original upload, needed for [`ReviewOutput::export`].
    pub source: Vec<u8>,
}

impl ReviewOutput {
    /// Annotated DOCX with every anchored finding.
    pub fn export(&self, options: &ExportOptions) -> Result<AnnotatedDocx, ReviewError> {
        export::export_annotated(&self.document, &self.source, &self.analysis, options)
    }
}

/// Review one already-parsed document.
///
/// `images` maps image span ids to their raw bytes; spans without bytes are
/// announced to the model as not attached.
///
/// # Errors
/// Only model failures are fatal. References that cannot be resolved end
/// up in [`AnalysisResult::unanchored`] with a [`crate::MappingFailure`].
pub async fn review_document(
    document: &Document,
    images: &HashMap<u32, Vec<u8>>,
    config: &ReviewConfig,
) -> Result<AnalysisResult, ReviewError> {
    let cb: ProgressCallback = config
        .progress_callback
        .clone()
        .unwrap_or_else(|| Arc::new(NoopProgressCallback));
    let name = document.original_filename.as_str();

    let result = run_review(document, images, config, &cb).await;
    if let Err(e) = &result {
        warn!("Review of '{}' failed: {}", name, e);
        cb.on_review_error(name, &e.to_string());
    }
    result
}

async fn run_review(
    document: &Document,
    images: &HashMap<u32, Vec<u8>>,
    config: &ReviewConfig,
    cb: &ProgressCallback,
) -> Result<AnalysisResult, ReviewError> {
    let start = Instant::now();
    let name = document.original_filename.as_str();

    // ── Step 1: Prepare images ───────────────────────────────────────────
    let encoded = if config.include_images {
        prepare_images(document, images, config).await?
    } else {
        HashMap::new()
    };
    cb.on_review_start(name, document.spans.len(), encoded.len());

    // ── Step 2: Call the model ───────────────────────────────────────────
    let client = llm::resolve_client(config)?;
    let request = llm::build_request(&document.spans, &encoded, config);
    info!(
        "Reviewing '{}' with {} ({} spans, {} images)",
        name,
        request.model,
        document.spans.len(),
        request.image_count()
    );
    cb.on_request_sent(name, &request.model);
    let response = llm::submit(client.as_ref(), &request).await?;
    cb.on_response(name, response.usage.output_tokens);

    // ── Step 3: Anchor findings ──────────────────────────────────────────
    let findings = postprocess::to_findings(response.findings, document.id);
    let total = findings.len();
    let outcome = map_findings(&document.spans, findings);
    let anchored = outcome.anchored.len();

    let analysis = AnalysisResult {
        document_id: document.id,
        analyzed_at: Utc::now(),
        anchored: outcome.anchored,
        unanchored: outcome.unanchored,
        mapping_failures: outcome.failures,
        model: response.model,
        usage: response.usage,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    info!(
        "Review of '{}' complete: {} findings, {} anchored, score {}, {}ms",
        name,
        total,
        anchored,
        analysis.quality_score(),
        analysis.duration_ms
    );
    cb.on_review_complete(name, total, anchored);
    Ok(analysis)
}

/// Encode up to `max_images` images on the blocking pool.
///
/// Undecodable pictures (EMF/WMF, truncated files) are skipped with a
/// warning and do not count against the limit.
async fn prepare_images(
    document: &Document,
    images: &HashMap<u32, Vec<u8>>,
    config: &ReviewConfig,
) -> Result<HashMap<u32, String>, ReviewError> {
    let candidates: Vec<(u32, Vec<u8>)> = document
        .spans
        .iter()
        .filter(|s| s.kind == SpanKind::Image)
        .filter_map(|s| images.get(&s.id).map(|b| (s.id, b.clone())))
        .collect();
    if candidates.is_empty() || config.max_images == 0 {
        return Ok(HashMap::new());
    }

    let max_images = config.max_images;
    let max_pixels = config.max_image_pixels;
    let available = candidates.len();
    let encoded = tokio::task::spawn_blocking(move || {
        let mut out = HashMap::new();
        for (span_id, bytes) in candidates {
            if out.len() >= max_images {
                break;
            }
            match encode::encode_image(&bytes, max_pixels) {
                Ok(uri) => {
                    out.insert(span_id, uri);
                }
                Err(e) => warn!("Skipping image of span {}: {}", span_id, e),
            }
        }
        out
    })
    .await
    .map_err(|e| ReviewError::Internal(format!("image encoding task failed: {e}")))?;

    debug!("Attached {} of {} images", encoded.len(), available);
    Ok(encoded)
}

/// Index extracted images by the span that refers to them.
pub fn images_by_span(document: &Document, images: Vec<ExtractedImage>) -> HashMap<u32, Vec<u8>> {
    let mut by_name: HashMap<String, Vec<u8>> =
        images.into_iter().map(|i| (i.file_name, i.bytes)).collect();
    document
        .spans
        .iter()
        .filter_map(|s| {
            let asset = s.image.as_ref()?;
            by_name.remove(&asset.file_name).map(|b| (s.id, b))
        })
        .collect()
}

// ── In-memory flavour ────────────────────────────────────────────────────

/// Parse and review in-memory bytes.
pub async fn review_bytes(
    filename: &str,
    bytes: Vec<u8>,
    config: &ReviewConfig,
) -> Result<ReviewOutput, ReviewError> {
    let (format, parsed) = parser::parse_document(filename, bytes.clone()).await?;
    let document = Document::new(filename, format, parsed.spans);
    let images = images_by_span(&document, parsed.images);
    let analysis = review_document(&document, &images, config).await?;
    Ok(ReviewOutput {
        document,
        analysis,
        source: bytes,
    })
}

/// Parse and review a file on disk.
pub async fn review_file(
    path: impl AsRef<Path>,
    config: &ReviewConfig,
) -> Result<ReviewOutput, ReviewError> {
    let path = path.as_ref();
    let bytes = read_input(path).await?;
    review_bytes(&file_name_of(path), bytes, config).await
}

/// Parse a file without contacting the model.
pub async fn inspect_file(path: impl AsRef<Path>) -> Result<Document, ReviewError> {
    let path = path.as_ref();
    let bytes = read_input(path).await?;
    let name = file_name_of(path);
    let (format, parsed) = parser::parse_document(&name, bytes).await?;
    Ok(Document::new(name, format, parsed.spans))
}

async fn read_input(path: &Path) -> Result<Vec<u8>, ReviewError> {
    match tokio::fs::read(path).await {
        Ok(b) => Ok(b),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ReviewError::FileNotFound {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(ReviewError::parse(file_name_of(path), e)),
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ── Stored flavour ───────────────────────────────────────────────────────

/// Review a stored document and persist the result.
///
/// The status is `analyzing` while the model runs. On success the new result
/// replaces any previous one; on failure the previous status is restored and
/// the previous result is left untouched.
pub async fn analyze_stored(
    store: &DocumentStore,
    id: Uuid,
    config: &ReviewConfig,
) -> Result<DocumentRecord, ReviewError> {
    let record = store.get(id).await?;
    let previous = record.status;
    store.set_status(id, DocumentStatus::Analyzing).await?;

    let mut images = HashMap::new();
    if config.include_images {
        for span in record.document.spans.iter().filter(|s| s.kind == SpanKind::Image) {
            match store.read_image(&record, span.id).await {
                Ok((bytes, _)) => {
                    images.insert(span.id, bytes);
                }
                Err(e) => warn!("Image of span {} unavailable: {}", span.id, e),
            }
        }
    }

    match review_document(&record.document, &images, config).await {
        Ok(analysis) => store.save_analysis(id, analysis).await,
        Err(e) => {
            if let Err(restore) = store.set_status(id, previous).await {
                warn!("Failed to restore status of {}: {}", id, restore);
            }
            Err(e)
        }
    }
}

/// Annotated DOCX for a stored, analyzed document.
pub async fn export_stored(
    store: &DocumentStore,
    id: Uuid,
    options: ExportOptions,
) -> Result<AnnotatedDocx, ReviewError> {
    let record = store.get(id).await?;
    if record.completed_analysis().is_none() {
        return Err(ReviewError::NotAnalyzed(id));
    }
    let source = store.read_source(&record).await?;
    tokio::task::spawn_blocking(move || {
        let analysis = record
            .completed_analysis()
            .ok_or(ReviewError::NotAnalyzed(id))?;
        export::export_annotated(&record.document, &source, analysis, &options)
    })
    .await
    .map_err(|e| ReviewError::Internal(format!("export task failed: {e}")))?
}
