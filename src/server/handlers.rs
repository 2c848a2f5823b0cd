//! JSON API handlers.

use super::error::ApiError;
use super::AppState;
use crate::config::ReviewConfig;
use crate::error::ReviewError;
use crate::export::ExportOptions;
use crate::highlight::{self, HighlightRange};
use crate::model::{
    AnalysisResult, Document, DocumentFormat, DocumentRecord, DocumentStatus, RiskStats,
    SeverityCounts,
};
use crate::parser;
use crate::pipeline::llm::{self, RecordingClient, ReplayClient};
use crate::review;
use axum::{
    extract::{Multipart, Path, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

// ── Response bodies ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub success: bool,
    pub doc_id: Uuid,
    pub message: String,
    pub span_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub id: Uuid,
    pub filename: String,
    pub format: DocumentFormat,
    pub status: DocumentStatus,
    pub uploaded_at: DateTime<Utc>,
    pub span_count: usize,
    pub issues_count: Option<usize>,
    pub quality_score: Option<u32>,
    pub risk_summary: String,
}

impl From<&DocumentRecord> for DocumentSummary {
    fn from(r: &DocumentRecord) -> Self {
        Self {
            id: r.id(),
            filename: r.document.original_filename.clone(),
            format: r.document.format,
            status: r.status,
            uploaded_at: r.document.uploaded_at,
            span_count: r.document.spans.len(),
            issues_count: r.completed_analysis().map(|a| a.findings().len()),
            quality_score: r.quality_score(),
            risk_summary: r.risk_summary(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentList {
    pub documents: Vec<DocumentSummary>,
    pub stats: RiskStats,
}

#[derive(Debug, Serialize)]
pub struct DocumentDetail {
    pub document: Document,
    pub status: DocumentStatus,
    pub analysis: Option<AnalysisResult>,
    pub quality_score: Option<u32>,
    pub counts: Option<SeverityCounts>,
    pub risk_summary: String,
    pub highlights: Vec<HighlightRange>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub use_mock: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnalyzeResponse {
    pub success: bool,
    pub message: String,
    pub issues_count: usize,
    pub anchored: usize,
    pub unanchored: usize,
    pub quality_score: u32,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    /// Comma-separated finding indices.
    pub findings: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────────────────

pub async fn health() -> &'static str {
    "OK"
}

/// Accept a multipart `file` field, parse it and store it.
pub async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InvalidRequest(format!("malformed multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| ApiError::InvalidRequest("file field has no file name".into()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::InvalidRequest(format!("failed to read upload: {e}")))?;
        upload = Some((filename, bytes.to_vec()));
        break;
    }
    let (filename, bytes) =
        upload.ok_or_else(|| ApiError::InvalidRequest("no file uploaded".into()))?;

    let (format, parsed) = parser::parse_document(&filename, bytes.clone()).await?;
    let record = state.store.create(&filename, format, &bytes, parsed).await?;
    let span_count = record.document.spans.len();
    Ok(Json(UploadResponse {
        success: true,
        doc_id: record.id(),
        message: format!("Uploaded {filename}: {span_count} elements extracted"),
        span_count,
    }))
}

pub async fn list_documents(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DocumentList>, ApiError> {
    let records = state.store.list().await?;
    Ok(Json(DocumentList {
        stats: RiskStats::from_records(&records),
        documents: records.iter().map(DocumentSummary::from).collect(),
    }))
}

pub async fn get_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<DocumentDetail>, ApiError> {
    let record = state.store.get(id).await?;
    let completed = record.completed_analysis();
    let highlights = completed
        .map(|a| highlight::highlight_ranges(&record.document, a))
        .unwrap_or_default();
    let counts = completed.map(AnalysisResult::counts);
    let quality_score = record.quality_score();
    let risk_summary = record.risk_summary();
    Ok(Json(DocumentDetail {
        document: record.document,
        status: record.status,
        analysis: record.analysis,
        quality_score,
        counts,
        risk_summary,
        highlights,
    }))
}

/// Run the review; `{"use_mock": true}` replays the configured findings file.
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<AnalyzeRequest>>,
) -> Result<Json<AnalyzeResponse>, ApiError> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let config = review_config(&state, request.use_mock)?;
    let record = review::analyze_stored(&state.store, id, &config).await?;
    let analysis = record
        .completed_analysis()
        .ok_or_else(|| ReviewError::Internal(format!("analysis of {id} was not saved")))?;
    let issues_count = analysis.findings().len();
    Ok(Json(AnalyzeResponse {
        success: true,
        message: format!("Analysis complete: {issues_count} issues found"),
        issues_count,
        anchored: analysis.anchored.len(),
        unanchored: analysis.unanchored.len(),
        quality_score: analysis.quality_score(),
    }))
}

pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete(id).await?;
    Ok(Json(serde_json::json!({ "success": true, "message": "Document deleted" })))
}

/// The annotated DOCX, optionally limited to `?findings=0,2,5`.
pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let selection = query.findings.as_deref().map(parse_selection).transpose()?;
    let options = ExportOptions::from_config(&state.review).with_selection(selection);
    let docx = review::export_stored(&state.store, id, options).await?;
    Ok((
        [
            (
                header::CONTENT_TYPE,
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                    .to_string(),
            ),
            (header::CONTENT_DISPOSITION, attachment(&docx.file_name)),
        ],
        docx.bytes,
    )
        .into_response())
}

pub async fn image(
    State(state): State<Arc<AppState>>,
    Path((id, span_id)): Path<(Uuid, u32)>,
) -> Result<Response, ApiError> {
    let record = state.store.get(id).await?;
    let (bytes, mime) = state.store.read_image(&record, span_id).await?;
    Ok(([(header::CONTENT_TYPE, mime)], bytes).into_response())
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Per-request review config: replay for mock analysis, recording otherwise
/// when a record file is configured.
fn review_config(state: &AppState, use_mock: bool) -> Result<ReviewConfig, ApiError> {
    let mut config = state.review.clone();
    if use_mock {
        let path = state.server.mock_findings_path.clone().ok_or_else(|| {
            ReviewError::InvalidConfig(
                "mock analysis requested but no findings file is configured".into(),
            )
        })?;
        config.client = Some(Arc::new(ReplayClient::new(path)));
    } else if let Some(path) = &state.server.record_findings_path {
        let inner = llm::resolve_client(&config).map_err(ReviewError::from)?;
        config.client = Some(Arc::new(RecordingClient::new(inner, path.clone())));
    }
    Ok(config)
}

fn parse_selection(raw: &str) -> Result<Vec<usize>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| ApiError::InvalidRequest(format!("invalid finding index '{s}'")))
        })
        .collect()
}

/// `Content-Disposition` with an ASCII fallback and the RFC 5987 UTF-8 name.
fn attachment(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' { c } else { '_' })
        .collect();
    let mut encoded = String::new();
    for b in file_name.bytes() {
        if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
