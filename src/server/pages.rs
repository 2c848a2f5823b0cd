//! Server-rendered HTML pages.
//!
//! Plain `format!` templates: two pages do not justify a template engine.
//! All user-controlled text goes through [`escape`].

use super::error::ApiError;
use super::AppState;
use crate::highlight::{escape, render_html, HIGHLIGHT_CSS};
use crate::model::{AnalysisResult, DocumentRecord, DocumentStatus, RiskStats};
use axum::{
    extract::{Path, Query, State},
    response::{Html, Redirect},
};
use serde::Deserialize;
use std::fmt::Write as _;
use std::sync::Arc;
use uuid::Uuid;

const PAGE_CSS: &str = r#"
body { font-family: -apple-system, "Segoe UI", "PingFang SC", "Microsoft YaHei", sans-serif; margin: 0; color: #111827; background: #f9fafb; }
header { background: #1f2937; color: #fff; padding: 12px 24px; }
header a { color: #fff; text-decoration: none; font-weight: 600; }
main { padding: 24px; }
table.docs { border-collapse: collapse; width: 100%; background: #fff; }
table.docs th, table.docs td { border-bottom: 1px solid #e5e7eb; padding: 8px; text-align: left; }
.stats span { display: inline-block; margin-right: 16px; padding: 4px 10px; border-radius: 4px; }
.stats .high { background: #fee2e2; } .stats .medium { background: #fef3c7; } .stats .low { background: #e0f2fe; }
.layout { display: flex; gap: 24px; align-items: flex-start; }
.layout .doc { flex: 3; background: #fff; padding: 24px; border: 1px solid #e5e7eb; }
.layout aside { flex: 2; position: sticky; top: 12px; max-height: 95vh; overflow-y: auto; }
.issue { background: #fff; border-left: 4px solid #9ca3af; padding: 8px 12px; margin-bottom: 8px; }
.issue.high { border-color: #ef4444; } .issue.medium { border-color: #f59e0b; } .issue.low { border-color: #3b82f6; }
.issue.active { box-shadow: 0 0 0 2px #111827; }
.issue a { color: inherit; text-decoration: none; }
.muted { color: #6b7280; font-size: 0.9em; }
button, .button { background: #2563eb; color: #fff; border: 0; padding: 6px 14px; border-radius: 4px; cursor: pointer; text-decoration: none; font-size: 0.95em; }
"#;

const ANALYZE_JS: &str = r#"
async function analyze(id, mock) {
  const status = document.getElementById('analyze-status');
  status.textContent = 'Analyzing…';
  const res = await fetch('/api/analyze/' + id, {
    method: 'POST',
    headers: { 'Content-Type': 'application/json' },
    body: JSON.stringify({ use_mock: mock }),
  });
  const body = await res.json();
  if (res.ok) { location.reload(); } else { status.textContent = body.error; }
}
async function upload(form) {
  const res = await fetch('/api/upload', { method: 'POST', body: new FormData(form) });
  const body = await res.json();
  if (res.ok) { location.href = '/documents/' + body.doc_id; } else { alert(body.error); }
  return false;
}
async function remove(id) {
  if (!confirm('Delete this document?')) return;
  const res = await fetch('/api/documents/' + id, { method: 'DELETE' });
  if (res.ok) { location.href = '/documents'; }
}
"#;

fn page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n\
         <title>{} · CRO Review</title>\n<style>{}{}</style>\n<script>{}</script>\n</head>\n\
         <body>\n<header><a href=\"/documents\">CRO Review</a></header>\n<main>\n{}\n</main>\n</body>\n</html>\n",
        escape(title),
        PAGE_CSS,
        HIGHLIGHT_CSS,
        ANALYZE_JS,
        body
    ))
}

pub async fn index() -> Redirect {
    Redirect::to("/documents")
}

pub async fn documents(State(state): State<Arc<AppState>>) -> Result<Html<String>, ApiError> {
    let records = state.store.list().await?;
    let stats = RiskStats::from_records(&records);

    let mut body = String::new();
    body.push_str(
        "<form onsubmit=\"return upload(this)\">\
         <input type=\"file\" name=\"file\" accept=\".docx,.pdf,.xlsx\" required> \
         <button type=\"submit\">Upload</button></form>\n",
    );
    let _ = write!(
        body,
        "<p class=\"stats\"><span class=\"high\">High risk: {}</span>\
         <span class=\"medium\">Medium risk: {}</span>\
         <span class=\"low\">Low risk: {}</span></p>\n",
        stats.high, stats.medium, stats.low
    );

    if records.is_empty() {
        body.push_str("<p class=\"muted\">No documents uploaded yet.</p>");
        return Ok(page("Documents", &body));
    }

    body.push_str(
        "<table class=\"docs\"><thead><tr><th>Document</th><th>Format</th><th>Uploaded</th>\
         <th>Status</th><th>Score</th><th>Risk</th></tr></thead><tbody>\n",
    );
    for r in &records {
        let _ = writeln!(
            body,
            "<tr><td><a href=\"/documents/{}\">{}</a></td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            r.id(),
            escape(&r.document.original_filename),
            r.document.format,
            r.document.uploaded_at.format("%Y-%m-%d %H:%M"),
            r.status,
            r.quality_score().map(|s| s.to_string()).unwrap_or_else(|| "–".into()),
            escape(&r.risk_summary()),
        );
    }
    body.push_str("</tbody></table>");
    Ok(page("Documents", &body))
}

#[derive(Debug, Default, Deserialize)]
pub struct DetailQuery {
    pub issue: Option<usize>,
}

pub async fn document(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<DetailQuery>,
) -> Result<Html<String>, ApiError> {
    let record = state.store.get(id).await?;
    let analysis = record.completed_analysis();
    let mock = state.server.mock_findings_path.is_some();

    let mut body = String::new();
    let _ = write!(
        body,
        "<h2>{}</h2>\n<p>Status: <b>{}</b>",
        escape(&record.document.original_filename),
        record.status
    );
    if let Some(a) = analysis {
        let c = a.counts();
        let _ = write!(
            body,
            " · Score: <b>{}</b> · {} · {} high / {} medium / {} low · model {}",
            a.quality_score(),
            escape(&a.risk_summary()),
            c.high,
            c.medium,
            c.low,
            escape(&a.model)
        );
    }
    body.push_str("</p>\n<p>");
    if record.status != DocumentStatus::Analyzing {
        let _ = write!(body, "<button onclick=\"analyze('{id}', false)\">Analyze</button> ");
        if mock {
            let _ = write!(body, "<button onclick=\"analyze('{id}', true)\">Mock analysis</button> ");
        }
    }
    if analysis.is_some() {
        let _ = write!(
            body,
            "<a class=\"button\" href=\"/api/download/{id}\">Download annotated DOCX</a> "
        );
    }
    let _ = write!(
        body,
        "<button onclick=\"remove('{id}')\">Delete</button> <span id=\"analyze-status\" class=\"muted\"></span></p>\n"
    );

    body.push_str("<div class=\"layout\">\n<div class=\"doc\">\n");
    body.push_str(&render_html(&record.document, analysis, query.issue));
    body.push_str("\n</div>\n<aside>\n");
    match analysis {
        Some(a) => issue_list(&mut body, &record, a, query.issue),
        None => body.push_str("<p class=\"muted\">Not analyzed yet.</p>"),
    }
    body.push_str("</aside>\n</div>\n");
    if let Some(i) = query.issue {
        let _ = write!(
            body,
            "<script>document.getElementById('issue-{i}')?.scrollIntoView({{block: 'center'}});</script>"
        );
    }
    Ok(page(&record.document.original_filename, &body))
}

fn issue_list(body: &mut String, record: &DocumentRecord, analysis: &AnalysisResult, active: Option<usize>) {
    let id = record.id();
    let _ = writeln!(body, "<h3>Findings ({})</h3>", analysis.findings().len());
    for af in &analysis.anchored {
        let f = &af.finding;
        let cls = if active == Some(f.index) { " active" } else { "" };
        let _ = write!(
            body,
            "<div class=\"issue {sev}{cls}\"><a href=\"/documents/{id}?issue={i}\">\
             <b>#{n} [{sev}] {cat}</b><br>{exp}",
            sev = f.severity,
            i = f.index,
            n = f.index + 1,
            cat = escape(&f.category),
            exp = escape(&f.explanation),
        );
        if let Some(s) = &f.suggestion {
            let _ = write!(body, "<br><span class=\"muted\">Suggestion: {}</span>", escape(s));
        }
        body.push_str("</a></div>\n");
    }

    if analysis.unanchored.is_empty() {
        return;
    }
    let _ = writeln!(body, "<h3>Unanchored ({})</h3>", analysis.unanchored.len());
    for f in &analysis.unanchored {
        let _ = write!(
            body,
            "<div class=\"issue {}\"><b>#{} [{}] {}</b><br>{}",
            f.severity,
            f.index + 1,
            f.severity,
            escape(&f.category),
            escape(&f.explanation)
        );
        if let Some(q) = &f.location.quote {
            let _ = write!(body, "<br><span class=\"muted\">Quoted: “{}”</span>", escape(q));
        }
        if let Some(fail) = analysis
            .mapping_failures
            .iter()
            .find(|m| m.finding_index == f.index)
        {
            let _ = write!(body, "<br><span class=\"muted\">{}</span>", escape(&fail.detail));
        }
        body.push_str("</div>\n");
    }
}
