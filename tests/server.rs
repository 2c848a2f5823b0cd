//! Web layer and DashScope wire tests.
//!
//! The router is driven in-process with `tower::ServiceExt::oneshot`; the
//! DashScope client talks to a local axum server that imitates the
//! multimodal-generation endpoint.

#![cfg(feature = "server")]

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use cro_review::pipeline::llm::{build_request, DashScopeClient, LlmClient};
use cro_review::server::{router, AppState};
use cro_review::{LlmError, ReviewConfig, ServerConfig};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use tower::ServiceExt;
use zip::write::SimpleFileOptions;

// ── Helpers ──────────────────────────────────────────────────────────────────

const MOCK_FINDINGS: &str = r#"[
  {"element_id": 1, "original_text": "RSD = 2.3%", "issue_type": "high", "category": "data", "description": "RSD above limit", "suggestion": "re-test"},
  {"element_id": 2, "original_text": "98%", "issue_type": "low", "category": "format", "description": "missing range"},
  {"original_text": "nowhere", "issue_type": "medium", "description": "unanchored"}
]"#;

fn docx() -> Vec<u8> {
    let body = ["Method validation report", "RSD = 2.3%", "Recovery = 98%"]
        .iter()
        .map(|t| format!(r#"<w:p><w:r><w:t xml:space="preserve">{t}</w:t></w:r></w:p>"#))
        .collect::<String>();
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default();
    zip.start_file("[Content_Types].xml", opts).unwrap();
    zip.write_all(br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/word/document.xml" ContentType="application/vnd.openxmlformats-officedocument.wordprocessingml.document.main+xml"/></Types>"#).unwrap();
    zip.start_file("word/document.xml", opts).unwrap();
    write!(
        zip,
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
    )
    .unwrap();
    zip.start_file("word/_rels/document.xml.rels", opts).unwrap();
    zip.write_all(br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?><Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"></Relationships>"#).unwrap();
    zip.finish().unwrap().into_inner()
}

struct TestApp {
    app: Router,
    _dir: tempfile::TempDir,
}

async fn test_app(with_mock: bool) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mock_path = dir.path().join("mock_findings.json");
    std::fs::write(&mock_path, MOCK_FINDINGS).unwrap();

    let server = ServerConfig {
        data_dir: dir.path().join("data"),
        mock_findings_path: with_mock.then_some(mock_path),
        ..ServerConfig::default()
    };
    let state = AppState::new(server, ReviewConfig::default()).await.unwrap();
    TestApp {
        app: router(Arc::new(state)),
        _dir: dir,
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, headers, body)
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, _, body) = send(app, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn upload_request(filename: &str, bytes: &[u8]) -> Request<Body> {
    let boundary = "XCROREVIEWBOUNDARY";
    let mut body = Vec::new();
    write!(
        body,
        "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )
    .unwrap();
    body.extend_from_slice(bytes);
    write!(body, "\r\n--{boundary}--\r\n").unwrap();
    Request::post("/api/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn analyze_request(id: &str, use_mock: bool) -> Request<Body> {
    Request::post(format!("/api/analyze/{id}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "use_mock": use_mock }).to_string()))
        .unwrap()
}

async fn upload(app: &Router) -> String {
    let (status, body) = send_json(app, upload_request("method report.docx", &docx())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["span_count"], 3);
    body["doc_id"].as_str().unwrap().to_string()
}

// ── Router ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_and_index_redirect() {
    let t = test_app(false).await;
    let (status, _, body) = send(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"OK");

    let (status, headers, _) = send(&t.app, get("/")).await;
    assert!(status.is_redirection());
    assert_eq!(headers[header::LOCATION], "/documents");
}

#[tokio::test]
async fn test_upload_analyze_download_delete() {
    let t = test_app(true).await;
    let id = upload(&t.app).await;

    // Listed but not analyzed.
    let (_, list) = send_json(&t.app, get("/api/documents")).await;
    assert_eq!(list["documents"][0]["id"], id.as_str());
    assert_eq!(list["documents"][0]["status"], "uploaded");
    assert_eq!(list["documents"][0]["risk_summary"], "not analyzed");

    // Download before analysis is a client error.
    let (status, err) = send_json(&t.app, get(&format!("/api/download/{id}"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["status"], 400);

    // Mock analysis.
    let (status, res) = send_json(&t.app, analyze_request(&id, true)).await;
    assert_eq!(status, StatusCode::OK, "{res}");
    assert_eq!(res["issues_count"], 3);
    assert_eq!(res["anchored"], 2);
    assert_eq!(res["unanchored"], 1);
    assert_eq!(res["quality_score"], 65);

    let (_, detail) = send_json(&t.app, get(&format!("/api/documents/{id}"))).await;
    assert_eq!(detail["status"], "analyzed");
    assert_eq!(detail["quality_score"], 65);
    assert_eq!(detail["counts"]["high"], 1);
    assert_eq!(detail["highlights"].as_array().unwrap().len(), 2);
    assert_eq!(detail["highlights"][0]["span_id"], 1);

    let (_, list) = send_json(&t.app, get("/api/documents")).await;
    assert_eq!(list["stats"]["high"], 1);

    // Annotated DOCX.
    let (status, headers, bytes) = send(&t.app, get(&format!("/api/download/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    let disposition = headers[header::CONTENT_DISPOSITION].to_str().unwrap();
    assert!(disposition.contains("filename*=UTF-8''method%20report_reviewed.docx"));
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut comments = String::new();
    archive
        .by_name("word/comments.xml")
        .unwrap()
        .read_to_string(&mut comments)
        .unwrap();
    assert_eq!(comments.matches("<w:comment ").count(), 2);

    // Selection.
    let (_, _, bytes) = send(&t.app, get(&format!("/api/download/{id}?findings=1"))).await;
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    let mut comments = String::new();
    archive
        .by_name("word/comments.xml")
        .unwrap()
        .read_to_string(&mut comments)
        .unwrap();
    assert_eq!(comments.matches("<w:comment ").count(), 1);
    assert!(comments.contains("missing range"));

    let (status, _) = send_json(&t.app, get(&format!("/api/download/{id}?findings=a"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Delete.
    let req = Request::delete(format!("/api/documents/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send_json(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    let (status, err) = send_json(&t.app, get(&format!("/api/documents/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["status"], 404);
}

#[tokio::test]
async fn test_pages_render_highlights() {
    let t = test_app(true).await;
    let id = upload(&t.app).await;
    send_json(&t.app, analyze_request(&id, true)).await;

    let (status, _, html) = send(&t.app, get("/documents")).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(html).unwrap();
    assert!(html.contains("method report.docx"));
    assert!(html.contains("1 high-severity issues"));

    let (status, _, html) = send(&t.app, get(&format!("/documents/{id}?issue=0"))).await;
    assert_eq!(status, StatusCode::OK);
    let html = String::from_utf8(html).unwrap();
    assert!(html.contains(r#"id="doc-el-1""#));
    assert!(html.contains(r#"id="issue-0""#));
    assert!(html.contains("sev-high active"));
    assert!(html.contains("Unanchored (1)"));
    assert!(html.contains("mark.sev-high"));
}

#[tokio::test]
async fn test_unsupported_upload_is_rejected() {
    let t = test_app(false).await;
    let (status, err) = send_json(&t.app, upload_request("notes.txt", b"hello")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(err["error"].as_str().unwrap().contains("notes.txt"));

    let (status, _) = send_json(&t.app, upload_request("broken.docx", b"PK\x03\x04garbage")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_analyze_failures_keep_status() {
    let t = test_app(false).await;
    let id = upload(&t.app).await;

    // No mock file configured.
    let (status, _) = send_json(&t.app, analyze_request(&id, true)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // No API key: the model call fails and the document stays uploaded.
    let (status, err) = send_json(&t.app, analyze_request(&id, false)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY, "{err}");
    let (_, detail) = send_json(&t.app, get(&format!("/api/documents/{id}"))).await;
    assert_eq!(detail["status"], "uploaded");
}

#[tokio::test]
async fn test_unknown_document_and_image() {
    let t = test_app(true).await;
    let (status, _) = send_json(
        &t.app,
        get("/api/documents/00000000-0000-0000-0000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send_json(
        &t.app,
        analyze_request("00000000-0000-0000-0000-000000000000", true),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let id = upload(&t.app).await;
    let (status, _) = send_json(&t.app, get(&format!("/api/documents/{id}/images/0"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ── DashScope wire format ────────────────────────────────────────────────────

async fn mock_dashscope(handler: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, handler).await.unwrap();
    });
    format!("http://{addr}/api/v1")
}

const ENDPOINT: &str = "/api/v1/services/aigc/multimodal-generation/generation";

#[tokio::test]
async fn test_dashscope_client_against_mock_server() {
    let app = Router::new().route(
        ENDPOINT,
        post(|headers: axum::http::HeaderMap, Json(body): Json<Value>| async move {
            assert_eq!(headers[header::AUTHORIZATION], "Bearer sk-test");
            assert_eq!(body["model"], "qwen-vl-max");
            assert_eq!(body["parameters"]["result_format"], "message");
            assert_eq!(body["input"]["messages"][0]["role"], "system");
            Json(json!({
                "output": {"choices": [{"message": {"role": "assistant", "content": [
                    {"text": "[{\"element_id\": 0, \"original_text\": \"RSD\", \"issue_type\": \"high\", \"description\": \"d\"}]"}
                ]}}]},
                "usage": {"input_tokens": 321, "output_tokens": 12},
                "request_id": "abc"
            }))
        }),
    );
    let base = mock_dashscope(app).await;

    let client = DashScopeClient::new("sk-test", base, 10).unwrap();
    let request = build_request(&[], &HashMap::new(), &ReviewConfig::default());
    let reply = client.complete(&request).await.unwrap();
    assert!(reply.content.contains("element_id"));
    assert_eq!(reply.usage.input_tokens, 321);
    assert_eq!(reply.usage.output_tokens, 12);
}

#[tokio::test]
async fn test_dashscope_errors_are_classified() {
    let app = Router::new()
        .route(
            "/quota/api/v1/services/aigc/multimodal-generation/generation",
            post(|| async {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"code": "Throttling", "message": "Requests rate limit exceeded"})),
                )
            }),
        )
        .route(
            "/auth/api/v1/services/aigc/multimodal-generation/generation",
            post(|| async {
                (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({"code": "InvalidApiKey", "message": "Invalid API-key provided."})),
                )
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let request = build_request(&[], &HashMap::new(), &ReviewConfig::default());

    let quota = DashScopeClient::new("k", format!("http://{addr}/quota/api/v1"), 10).unwrap();
    match quota.complete(&request).await {
        Err(LlmError::RateLimited { detail }) => assert!(detail.contains("Throttling")),
        other => panic!("expected rate limit, got {other:?}"),
    }

    let auth = DashScopeClient::new("k", format!("http://{addr}/auth/api/v1"), 10).unwrap();
    assert!(matches!(
        auth.complete(&request).await,
        Err(LlmError::Auth { .. })
    ));
}

#[tokio::test]
async fn test_dashscope_unreachable_is_network_error() {
    // Port 9 (discard) is closed on test machines.
    let client = DashScopeClient::new("k", "http://127.0.0.1:9/api/v1", 5).unwrap();
    let request = build_request(&[], &HashMap::new(), &ReviewConfig::default());
    assert!(matches!(
        client.complete(&request).await,
        Err(LlmError::Network(_) | LlmError::Timeout { .. })
    ));
}
