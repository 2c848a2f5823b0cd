//! Model interaction: build the multimodal review request and call the model.
//!
//! The request layout is fixed: one system message (rules + output contract,
//! see [`crate::prompts`]) and one user message holding every span as an
//! `[ID: n]`-prefixed text part, with each attached image placed right after
//! its own marker. All prompt wording lives in `prompts`, so this module only
//! deals with transport and error classification.
//!
//! [`LlmClient`] is the seam: [`DashScopeClient`] talks to the hosted model,
//! [`ReplayClient`] answers from a recorded file, and tests plug in their own
//! implementation through [`crate::config::ReviewConfig::client`].
//!
//! No retries happen here; a failure is returned to the caller as an
//! [`LlmError`] and the document stays reviewable.

use crate::config::ReviewConfig;
use crate::error::LlmError;
use crate::model::{Span, SpanKind, TokenUsage};
use crate::pipeline::postprocess::{self, RawFinding};
use crate::prompts;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// ── Request / response types ─────────────────────────────────────────────

/// One part of the user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserPart {
    Text(String),
    /// A base64 data URI for the image span `span_id`.
    Image { span_id: u32, data_uri: String },
}

/// Everything a client needs to run one review.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRequest {
    pub model: String,
    pub system_prompt: String,
    pub parts: Vec<UserPart>,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl ReviewRequest {
    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, UserPart::Image { .. }))
            .count()
    }
}

/// What a client got back, before findings are extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmReply {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// Parsed answer of one review call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewResponse {
    pub findings: Vec<RawFinding>,
    pub model: String,
    pub usage: TokenUsage,
    pub duration_ms: u64,
}

/// A backend able to answer a [`ReviewRequest`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn complete(&self, request: &ReviewRequest) -> Result<LlmReply, LlmError>;
}

// ── Request building ─────────────────────────────────────────────────────

/// Build the review request for `spans`.
///
/// `images` maps image span ids to prepared data URIs; image spans without
/// an entry are announced with a placeholder so ids stay contiguous for the
/// model.
pub fn build_request(
    spans: &[Span],
    images: &HashMap<u32, String>,
    config: &ReviewConfig,
) -> ReviewRequest {
    let mut parts = Vec::with_capacity(spans.len() + images.len());
    for span in spans {
        match (span.kind, images.get(&span.id)) {
            (SpanKind::Image, Some(uri)) => {
                parts.push(UserPart::Text(prompts::render_span(span)));
                parts.push(UserPart::Image {
                    span_id: span.id,
                    data_uri: uri.clone(),
                });
            }
            (SpanKind::Image, None) => {
                parts.push(UserPart::Text(prompts::omitted_image_note(span)));
            }
            _ => parts.push(UserPart::Text(prompts::render_span(span))),
        }
    }

    ReviewRequest {
        model: config.model.clone(),
        system_prompt: config.effective_system_prompt(),
        parts,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    }
}

/// Call `client` and extract the findings from its answer.
pub async fn submit(
    client: &dyn LlmClient,
    request: &ReviewRequest,
) -> Result<ReviewResponse, LlmError> {
    let start = Instant::now();
    let reply = client.complete(request).await?;
    let duration = start.elapsed();
    debug!(
        "{}: {} input tokens, {} output tokens, {:?}",
        client.name(),
        reply.usage.input_tokens,
        reply.usage.output_tokens,
        duration
    );

    let findings = postprocess::parse_findings(&reply.content)?;
    Ok(ReviewResponse {
        findings,
        model: reply.model,
        usage: reply.usage,
        duration_ms: duration.as_millis() as u64,
    })
}

/// Pick the client for `config`, from most-specific to least-specific.
///
/// 1. **Pre-built client** (`config.client`) — used as-is.
/// 2. **API key** (`config.api_key`) — a [`DashScopeClient`] for
///    `config.base_url`.
pub fn resolve_client(config: &ReviewConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    if let Some(client) = &config.client {
        return Ok(Arc::clone(client));
    }
    match &config.api_key {
        Some(key) => Ok(Arc::new(DashScopeClient::new(
            key.clone(),
            config.base_url.clone(),
            config.api_timeout_secs,
        )?)),
        None => Err(LlmError::NotConfigured {
            hint: "set DASHSCOPE_API_KEY (environment or .env) or pass --api-key".into(),
        }),
    }
}

// ── DashScope ────────────────────────────────────────────────────────────

/// Client for DashScope's multimodal generation endpoint (Qwen-VL family).
pub struct DashScopeClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    timeout_secs: u64,
}

impl DashScopeClient {
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| LlmError::Network(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_secs,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/services/aigc/multimodal-generation/generation",
            self.base_url
        )
    }
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    model: &'a str,
    input: GenerationInput<'a>,
    parameters: GenerationParameters,
}

#[derive(Serialize)]
struct GenerationInput<'a> {
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WirePart<'a> {
    Text { text: &'a str },
    Image { image: &'a str },
}

#[derive(Serialize)]
struct GenerationParameters {
    result_format: &'static str,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerationResponse {
    output: Option<GenerationOutput>,
    usage: Option<WireUsage>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
struct GenerationOutput {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireReplyMessage,
}

#[derive(Deserialize)]
struct WireReplyMessage {
    content: WireContent,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireContent {
    Plain(String),
    Parts(Vec<WireReplyPart>),
}

#[derive(Deserialize)]
struct WireReplyPart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct WireError {
    code: Option<String>,
    message: Option<String>,
}

fn wire_body(request: &ReviewRequest) -> GenerationRequest<'_> {
    let user = request
        .parts
        .iter()
        .map(|p| match p {
            UserPart::Text(text) => WirePart::Text { text },
            UserPart::Image { data_uri, .. } => WirePart::Image { image: data_uri },
        })
        .collect();
    GenerationRequest {
        model: &request.model,
        input: GenerationInput {
            messages: vec![
                WireMessage {
                    role: "system",
                    content: vec![WirePart::Text {
                        text: &request.system_prompt,
                    }],
                },
                WireMessage {
                    role: "user",
                    content: user,
                },
            ],
        },
        parameters: GenerationParameters {
            result_format: "message",
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        },
    }
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> LlmError {
    let detail = match serde_json::from_str::<WireError>(body) {
        Ok(WireError {
            code: Some(code),
            message,
        }) => format!("{code}: {}", message.unwrap_or_default()),
        Ok(WireError {
            code: None,
            message: Some(message),
        }) => message,
        _ => body.chars().take(300).collect(),
    };
    match status.as_u16() {
        401 | 403 => LlmError::Auth { detail },
        429 => LlmError::RateLimited { detail },
        code => LlmError::Api {
            status: code,
            message: detail,
        },
    }
}

#[async_trait]
impl LlmClient for DashScopeClient {
    fn name(&self) -> &str {
        "dashscope"
    }

    async fn complete(&self, request: &ReviewRequest) -> Result<LlmReply, LlmError> {
        debug!(
            model = %request.model,
            parts = request.parts.len(),
            images = request.image_count(),
            "Sending review request to DashScope"
        );

        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&wire_body(request))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        secs: self.timeout_secs,
                    }
                } else {
                    LlmError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout {
                    secs: self.timeout_secs,
                }
            } else {
                LlmError::Network(e.to_string())
            }
        })?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let parsed: GenerationResponse =
            serde_json::from_str(&body).map_err(|e| LlmError::InvalidResponse {
                detail: format!("response is not DashScope JSON: {e}"),
            })?;

        let Some(choice) = parsed.output.and_then(|o| o.choices.into_iter().next()) else {
            return Err(LlmError::InvalidResponse {
                detail: format!(
                    "no choices in response ({}: {})",
                    parsed.code.unwrap_or_default(),
                    parsed.message.unwrap_or_default()
                ),
            });
        };
        let content = match choice.message.content {
            WireContent::Plain(s) => s,
            WireContent::Parts(parts) => parts.into_iter().filter_map(|p| p.text).collect(),
        };
        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
            })
            .unwrap_or_default();

        Ok(LlmReply {
            content,
            model: request.model.clone(),
            usage,
        })
    }
}

// ── Replay / recording ───────────────────────────────────────────────────

/// Answers every request with the content of a recorded findings file.
pub struct ReplayClient {
    path: PathBuf,
}

impl ReplayClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LlmClient for ReplayClient {
    fn name(&self) -> &str {
        "replay"
    }

    async fn complete(&self, _request: &ReviewRequest) -> Result<LlmReply, LlmError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            LlmError::NotConfigured {
                hint: format!("cannot read recorded findings '{}': {e}", self.path.display()),
            }
        })?;
        info!("Replaying recorded findings from {}", self.path.display());
        Ok(LlmReply {
            content,
            model: "replay".to_string(),
            usage: TokenUsage::default(),
        })
    }
}

/// Wraps another client and writes every successful answer to a file, so
/// it can be replayed later with [`ReplayClient`].
pub struct RecordingClient {
    inner: Arc<dyn LlmClient>,
    path: PathBuf,
}

impl RecordingClient {
    pub fn new(inner: Arc<dyn LlmClient>, path: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }
}

#[async_trait]
impl LlmClient for RecordingClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: &ReviewRequest) -> Result<LlmReply, LlmError> {
        let reply = self.inner.complete(request).await?;
        // Recording is best effort: a full disk must not fail the review.
        let tmp = self.path.with_extension("json.tmp");
        let written = match tokio::fs::write(&tmp, &reply.content).await {
            Ok(()) => tokio::fs::rename(&tmp, &self.path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Failed to record findings to {}: {}", self.path.display(), e);
        }
        Ok(reply)
    }
}
