//! Configuration types for document review and the web server.
//!
//! All review behaviour is controlled through [`ReviewConfig`], built via its
//! [`ReviewConfigBuilder`]. Keeping every knob in one struct makes it trivial
//! to share a config between the web layer and the CLI, log it, and diff two
//! runs to understand why their findings differ.
//!
//! # Design choice: builder over constructor
//! A fifteen-field constructor is unreadable and breaks on every new field.
//! The builder lets callers set only what they care about and rely on
//! documented defaults for the rest.

use crate::error::ReviewError;
use crate::pipeline::llm::LlmClient;
use crate::progress::ProgressCallback;
use crate::prompts::{self, DEFAULT_REVIEW_RULES};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_MODEL: &str = "qwen-vl-max";
pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/api/v1";

/// Configuration for reviewing one document.
///
/// Built via [`ReviewConfig::builder()`], [`ReviewConfig::from_env()`] or
/// [`ReviewConfig::default()`].
///
/// # Example
/// ```rust
/// use cro_review::ReviewConfig;
///
/// let config = ReviewConfig::builder()
///     .model("qwen-vl-max")
///     .api_key("sk-...")
///     .max_images(5)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ReviewConfig {
    /// DashScope model id. Default: `qwen-vl-max`.
    pub model: String,

    /// DashScope API key. Read from `DASHSCOPE_API_KEY` by [`ReviewConfig::from_env`].
    pub api_key: Option<String>,

    /// API root, without the service path. Default: the public DashScope endpoint.
    pub base_url: String,

    /// Sampling temperature. Default: 0.1.
    ///
    /// Review answers should be reproducible; a low temperature keeps the
    /// model from inventing issues between two runs on the same document.
    pub temperature: f32,

    /// Maximum tokens the model may generate. Default: 2000.
    ///
    /// Findings are short; 2000 tokens holds roughly thirty of them. A
    /// truncated answer is still salvaged up to its last complete finding.
    pub max_tokens: usize,

    /// Timeout for the whole model call in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Full system prompt override. If None, [`prompts::DEFAULT_SYSTEM_PROMPT`]
    /// is rendered with [`ReviewConfig::review_rules`].
    pub system_prompt: Option<String>,

    /// Review rules inserted into the default system prompt.
    /// If None, [`DEFAULT_REVIEW_RULES`] is used.
    pub review_rules: Option<String>,

    /// Language the model must write descriptions and suggestions in. Default: Chinese.
    pub language: String,

    /// Attach extracted images to the request. Default: true.
    pub include_images: bool,

    /// Maximum number of images attached to one request. Default: 20.
    pub max_images: usize,

    /// Images larger than this on either side are downscaled. Default: 2000.
    pub max_image_pixels: u32,

    /// Author written on exported Word comments. Default: `CRO Review`.
    pub comment_author: String,

    /// Initials written on exported Word comments. Default: `CR`.
    pub comment_initials: String,

    /// Pre-constructed model client. Takes precedence over the API key.
    pub client: Option<Arc<dyn LlmClient>>,

    /// Optional progress events sink.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.1,
            max_tokens: 2000,
            api_timeout_secs: 120,
            system_prompt: None,
            review_rules: None,
            language: "Chinese".to_string(),
            include_images: true,
            max_images: 20,
            max_image_pixels: 2000,
            comment_author: "CRO Review".to_string(),
            comment_initials: "CR".to_string(),
            client: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ReviewConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReviewConfig")
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("language", &self.language)
            .field("include_images", &self.include_images)
            .field("max_images", &self.max_images)
            .field("client", &self.client.as_ref().map(|_| "<dyn LlmClient>"))
            .finish()
    }
}

impl ReviewConfig {
    /// Create a new builder for `ReviewConfig`.
    pub fn builder() -> ReviewConfigBuilder {
        ReviewConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults overridden by `DASHSCOPE_API_KEY`, `DASHSCOPE_BASE_URL`,
    /// `CRO_REVIEW_MODEL` and `CRO_REVIEW_RULES` (path to a rules file).
    pub fn from_env() -> Result<Self, ReviewError> {
        let mut builder = Self::builder();
        if let Some(key) = non_empty_env("DASHSCOPE_API_KEY") {
            builder = builder.api_key(key);
        }
        if let Some(url) = non_empty_env("DASHSCOPE_BASE_URL") {
            builder = builder.base_url(url);
        }
        if let Some(model) = non_empty_env("CRO_REVIEW_MODEL") {
            builder = builder.model(model);
        }
        if let Some(path) = non_empty_env("CRO_REVIEW_RULES") {
            builder = builder.review_rules(read_rules_file(path)?);
        }
        builder.build()
    }

    /// The system prompt actually sent to the model.
    pub fn effective_system_prompt(&self) -> String {
        match &self.system_prompt {
            Some(p) => p.clone(),
            None => prompts::system_prompt(
                self.review_rules.as_deref().unwrap_or(DEFAULT_REVIEW_RULES),
                &self.language,
            ),
        }
    }
}

/// Builder for [`ReviewConfig`].
#[derive(Debug)]
pub struct ReviewConfigBuilder {
    config: ReviewConfig,
}

impl ReviewConfigBuilder {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn review_rules(mut self, rules: impl Into<String>) -> Self {
        self.config.review_rules = Some(rules.into());
        self
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.config.language = language.into();
        self
    }

    pub fn include_images(mut self, v: bool) -> Self {
        self.config.include_images = v;
        self
    }

    pub fn max_images(mut self, n: usize) -> Self {
        self.config.max_images = n;
        self
    }

    pub fn max_image_pixels(mut self, px: u32) -> Self {
        self.config.max_image_pixels = px.max(64);
        self
    }

    pub fn comment_author(mut self, author: impl Into<String>) -> Self {
        self.config.comment_author = author.into();
        self
    }

    pub fn comment_initials(mut self, initials: impl Into<String>) -> Self {
        self.config.comment_initials = initials.into();
        self
    }

    pub fn client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.config.client = Some(client);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ReviewConfig, ReviewError> {
        let c = &self.config;
        if c.model.trim().is_empty() {
            return Err(ReviewError::InvalidConfig("model must not be empty".into()));
        }
        if c.max_tokens == 0 {
            return Err(ReviewError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        if c.api_timeout_secs == 0 {
            return Err(ReviewError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        if !(c.base_url.starts_with("http://") || c.base_url.starts_with("https://")) {
            return Err(ReviewError::InvalidConfig(format!(
                "base_url must be an http(s) URL, got '{}'",
                c.base_url
            )));
        }
        Ok(self.config)
    }
}

/// Read a Markdown review-rules file.
pub fn read_rules_file(path: impl AsRef<Path>) -> Result<String, ReviewError> {
    let path = path.as_ref();
    std::fs::read_to_string(path).map_err(|e| {
        ReviewError::InvalidConfig(format!(
            "cannot read review rules from '{}': {e}",
            path.display()
        ))
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

// ── Server ───────────────────────────────────────────────────────────────

/// Settings of the HTTP front end.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address. Default: `0.0.0.0:5001`.
    pub bind: SocketAddr,
    /// Root of the flat-file store. Default: `<temp>/cro-review`.
    pub data_dir: PathBuf,
    /// Largest accepted upload in bytes. Default: 200 MB.
    pub max_upload_bytes: usize,
    /// Findings file replayed instead of calling the model when a request
    /// asks for mock analysis.
    pub mock_findings_path: Option<PathBuf>,
    /// When set, every live model answer is also written here.
    pub record_findings_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5001)),
            data_dir: std::env::temp_dir().join("cro-review"),
            max_upload_bytes: 200 * 1024 * 1024,
            mock_findings_path: None,
            record_findings_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `CRO_REVIEW_BIND` and `CRO_REVIEW_DATA_DIR`.
    pub fn from_env() -> Result<Self, ReviewError> {
        let mut config = Self::default();
        if let Some(bind) = non_empty_env("CRO_REVIEW_BIND") {
            config.bind = bind.parse().map_err(|e| {
                ReviewError::InvalidConfig(format!("CRO_REVIEW_BIND '{bind}' is not host:port: {e}"))
            })?;
        }
        if let Some(dir) = non_empty_env("CRO_REVIEW_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ReviewConfig::default();
        assert_eq!(c.model, "qwen-vl-max");
        assert_eq!(c.max_tokens, 2000);
        assert_eq!(c.api_timeout_secs, 120);
        assert!(c.include_images);
    }

    #[test]
    fn builder_clamps_and_trims() {
        let c = ReviewConfig::builder()
            .temperature(5.0)
            .base_url("http://localhost:9000/api/v1/")
            .max_image_pixels(1)
            .build()
            .unwrap();
        assert_eq!(c.temperature, 2.0);
        assert_eq!(c.base_url, "http://localhost:9000/api/v1");
        assert_eq!(c.max_image_pixels, 64);
    }

    #[test]
    fn builder_rejects_bad_values() {
        assert!(ReviewConfig::builder().model("  ").build().is_err());
        assert!(ReviewConfig::builder().max_tokens(0).build().is_err());
        assert!(ReviewConfig::builder().base_url("ftp://x").build().is_err());
    }

    #[test]
    fn effective_prompt_uses_rules_and_language() {
        let c = ReviewConfig::builder()
            .review_rules("Check every RSD value.")
            .language("English")
            .build()
            .unwrap();
        let p = c.effective_system_prompt();
        assert!(p.contains("Check every RSD value."));
        assert!(p.contains("in English"));

        let c = ReviewConfig::builder().system_prompt("custom").build().unwrap();
        assert_eq!(c.effective_system_prompt(), "custom");
    }

    #[test]
    fn debug_redacts_api_key() {
        let c = ReviewConfig::builder().api_key("sk-secret").build().unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("redacted"));
    }

    #[test]
    fn rules_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.md");
        std::fs::write(&path, "# Rules\n- check dates").unwrap();
        assert!(read_rules_file(&path).unwrap().contains("check dates"));
        assert!(read_rules_file(dir.path().join("missing.md")).is_err());
    }

    #[test]
    fn server_defaults() {
        let s = ServerConfig::default();
        assert_eq!(s.bind.port(), 5001);
        assert_eq!(s.max_upload_bytes, 200 * 1024 * 1024);
    }
}
