//! CLI binary for cro-review.
//!
//! A thin shim over the library crate: `serve` starts the web layer,
//! `review` runs the pipeline on files, `inspect` shows the parsed spans.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cro_review::config::{read_rules_file, DEFAULT_BASE_URL, DEFAULT_MODEL};
use cro_review::{
    inspect_file, review_file, AnalysisResult, Document, ExportOptions, ProgressCallback,
    ReplayClient, ReviewConfig, ReviewError, ReviewOutput, ReviewProgressCallback, ServerConfig,
    SeverityCounts, SpanKind,
};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

fn truncate(s: &str, max: usize) -> String {
    let one_line = s.replace('\n', " ⏎ ");
    if one_line.chars().count() > max {
        let cut: String = one_line.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}\u{2026}")
    } else {
        one_line
    }
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar for the whole batch; files may finish out of order.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<String, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new(total_files: usize) -> Arc<Self> {
        let bar = ProgressBar::new(total_files as u64);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:32.green/238}] {pos}/{len} files  {msg}  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Reviewing");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn elapsed(&self, document: &str) -> f64 {
        self.start_times
            .lock()
            .ok()
            .and_then(|mut m| m.remove(document))
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl ReviewProgressCallback for CliProgressCallback {
    fn on_review_start(&self, document: &str, span_count: usize, image_count: usize) {
        if let Ok(mut m) = self.start_times.lock() {
            m.insert(document.to_string(), Instant::now());
        }
        self.bar.println(format!(
            "{} {}  {}",
            cyan("◆"),
            bold(document),
            dim(&format!("{span_count} spans, {image_count} images"))
        ));
    }

    fn on_request_sent(&self, document: &str, model: &str) {
        self.bar.set_message(format!("{document} → {model}"));
    }

    fn on_review_complete(&self, document: &str, findings: usize, anchored: usize) {
        let secs = self.elapsed(document);
        self.bar.println(format!(
            "  {} {:<40} {:>3} findings, {:>3} anchored  {}",
            green("✓"),
            truncate(document, 40),
            findings,
            anchored,
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_review_error(&self, document: &str, error: &str) {
        let secs = self.elapsed(document);
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.bar.println(format!(
            "  {} {:<40} {}  {}",
            red("✗"),
            truncate(document, 40),
            red(&truncate(error, 80)),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Start the web UI on 0.0.0.0:5001
  cro-review serve

  # Review one report and print the findings
  cro-review review report.docx

  # Review a folder, two at a time, writing annotated DOCX + JSON
  cro-review review --concurrency 2 --out-dir reviewed/ reports/*.docx

  # Use your own review rules, answer in English
  cro-review review --rules rules.md --language English report.pdf

  # Replay a recorded answer instead of calling the model
  cro-review review --replay findings.json report.docx

  # Show the numbered spans the model will see (no API key needed)
  cro-review inspect report.xlsx

ENVIRONMENT VARIABLES:
  DASHSCOPE_API_KEY     DashScope API key (also read from .env)
  DASHSCOPE_BASE_URL    API root, default https://dashscope.aliyuncs.com/api/v1
  CRO_REVIEW_MODEL      Model id, default qwen-vl-max
  CRO_REVIEW_RULES      Markdown file with review rules
  CRO_REVIEW_BIND       Server listen address, default 0.0.0.0:5001
  CRO_REVIEW_DATA_DIR   Server data directory, default <temp>/cro-review
  RUST_LOG              Log filter, overrides --verbose/--quiet
"#;

/// Review CRO report documents with Qwen-VL and export Word comments.
#[derive(Parser, Debug)]
#[command(
    name = "cro-review",
    version,
    about = "Review CRO report documents with a multimodal LLM",
    long_about = "Parse DOCX, PDF and XLSX reports into numbered spans, ask Qwen-VL-Max on \
DashScope to review them, anchor every finding to the exact text it is about, and export the \
result as a DOCX with native Word review comments.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "CRO_REVIEW_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "CRO_REVIEW_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the web server.
    Serve(ServeArgs),
    /// Review files from the command line.
    Review(ReviewArgs),
    /// Print the spans of a document without reviewing it.
    Inspect(InspectArgs),
}

/// Model and comment settings shared by `serve` and `review`.
#[derive(Args, Debug, Clone)]
struct ModelArgs {
    /// DashScope API key.
    #[arg(long, env = "DASHSCOPE_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model id.
    #[arg(long, env = "CRO_REVIEW_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// DashScope API root.
    #[arg(long, env = "DASHSCOPE_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Markdown file with the review rules.
    #[arg(long, env = "CRO_REVIEW_RULES")]
    rules: Option<PathBuf>,

    /// Text file replacing the whole system prompt.
    #[arg(long, env = "CRO_REVIEW_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Language the findings are written in.
    #[arg(long, env = "CRO_REVIEW_LANGUAGE", default_value = "Chinese")]
    language: String,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "CRO_REVIEW_TEMPERATURE", default_value_t = 0.1)]
    temperature: f32,

    /// Max tokens the model may generate.
    #[arg(long, env = "CRO_REVIEW_MAX_TOKENS", default_value_t = 2000)]
    max_tokens: usize,

    /// Model call timeout in seconds.
    #[arg(long, env = "CRO_REVIEW_API_TIMEOUT", default_value_t = 120)]
    api_timeout: u64,

    /// Send text only, no embedded images.
    #[arg(long)]
    no_images: bool,

    /// Maximum images attached to one request.
    #[arg(long, env = "CRO_REVIEW_MAX_IMAGES", default_value_t = 20)]
    max_images: usize,

    /// Author name on exported comments.
    #[arg(long, env = "CRO_REVIEW_AUTHOR", default_value = "CRO Review")]
    author: String,

    /// Author initials on exported comments.
    #[arg(long, env = "CRO_REVIEW_INITIALS", default_value = "CR")]
    initials: String,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Listen address.
    #[arg(long, env = "CRO_REVIEW_BIND", default_value = "0.0.0.0:5001")]
    bind: SocketAddr,

    /// Store directory. Default: <temp>/cro-review.
    #[arg(long, env = "CRO_REVIEW_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Largest accepted upload in MB.
    #[arg(long, env = "CRO_REVIEW_MAX_UPLOAD_MB", default_value_t = 200)]
    max_upload_mb: usize,

    /// Findings file replayed by "mock analysis".
    #[arg(long, env = "CRO_REVIEW_MOCK_FINDINGS")]
    mock_findings: Option<PathBuf>,

    /// Write every live model answer to this file.
    #[arg(long, env = "CRO_REVIEW_RECORD_FINDINGS")]
    record_findings: Option<PathBuf>,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug)]
struct ReviewArgs {
    /// DOCX, PDF or XLSX files.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Write `<name>_reviewed.docx` and `<name>.review.json` here.
    #[arg(short, long)]
    out_dir: Option<PathBuf>,

    /// Print the analysis as JSON instead of a summary.
    #[arg(long)]
    json: bool,

    /// Files reviewed at the same time.
    #[arg(short, long, env = "CRO_REVIEW_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Replay a recorded model answer instead of calling DashScope.
    #[arg(long)]
    replay: Option<PathBuf>,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug)]
struct InspectArgs {
    file: PathBuf,

    /// Print the parsed document as JSON.
    #[arg(long)]
    json: bool,
}

/// What `--json` and `--out-dir` write per file.
#[derive(Serialize)]
struct JsonReport<'a> {
    document: &'a Document,
    analysis: &'a AnalysisResult,
    quality_score: u32,
    counts: SeverityCounts,
    risk_summary: String,
}

impl<'a> JsonReport<'a> {
    fn new(output: &'a ReviewOutput) -> Self {
        Self {
            document: &output.document,
            analysis: &output.analysis,
            quality_score: output.analysis.quality_score(),
            counts: output.analysis.counts(),
            risk_summary: output.analysis.risk_summary(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env first so clap's env fallbacks see it.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs during `review`.
    let bar_active = matches!(&cli.command, Command::Review(a) if !a.no_progress && !a.json);
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || bar_active {
        "error"
    } else {
        "info,tower_http=debug"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Review(args) => review(args, cli.quiet).await,
        Command::Inspect(args) => inspect(args).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let defaults = ServerConfig::default();
    let server = ServerConfig {
        bind: args.bind,
        data_dir: args.data_dir.unwrap_or(defaults.data_dir),
        max_upload_bytes: args.max_upload_mb.max(1) * 1024 * 1024,
        mock_findings_path: args.mock_findings,
        record_findings_path: args.record_findings,
    };

    let config = build_config(&args.model, None).await?;
    if config.api_key.is_none() && server.mock_findings_path.is_none() {
        eprintln!(
            "{} DASHSCOPE_API_KEY is not set; analysis will fail until it is",
            yellow("⚠")
        );
    }
    eprintln!(
        "{} CRO review on {}  {}",
        cyan("◆"),
        bold(&format!("http://{}", server.bind)),
        dim(&format!("data: {}", server.data_dir.display()))
    );
    cro_review::server::serve(server, config)
        .await
        .context("Server failed")
}

async fn review(args: ReviewArgs, quiet: bool) -> Result<()> {
    let show_progress = !quiet && !args.no_progress && !args.json;
    let callback = show_progress.then(|| CliProgressCallback::new(args.files.len()));
    let progress: Option<ProgressCallback> = callback
        .clone()
        .map(|cb| cb as Arc<dyn ReviewProgressCallback>);

    let mut config = build_config(&args.model, progress).await?;
    if let Some(path) = &args.replay {
        config.client = Some(Arc::new(ReplayClient::new(path.clone())));
    }
    if let Some(dir) = &args.out_dir {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    // ── Run reviews ──────────────────────────────────────────────────────
    let config_ref = &config;
    let mut results: Vec<(usize, PathBuf, Result<ReviewOutput, ReviewError>)> =
        stream::iter(args.files.iter().cloned().enumerate().map(|(i, path)| async move {
            let result = review_file(&path, config_ref).await;
            (i, path, result)
        }))
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(i, _, _)| *i);

    if let Some(cb) = &callback {
        cb.bar.finish_and_clear();
    }

    // ── Report ───────────────────────────────────────────────────────────
    let mut failed = 0usize;
    let mut reports = Vec::new();
    for (_, path, result) in &results {
        let output = match result {
            Ok(o) => o,
            Err(e) => {
                failed += 1;
                if !quiet {
                    eprintln!("{} {}: {}", red("✘"), path.display(), e);
                }
                continue;
            }
        };
        if let Some(dir) = &args.out_dir {
            write_outputs(dir, output, &config)?;
        }
        if args.json {
            reports.push(JsonReport::new(output));
        } else if !quiet {
            print_summary(output);
        }
    }

    if args.json {
        let json = if reports.len() == 1 {
            serde_json::to_string_pretty(&reports[0])
        } else {
            serde_json::to_string_pretty(&reports)
        }
        .context("Failed to serialise analysis")?;
        println!("{json}");
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} files failed", results.len());
    }
    Ok(())
}

fn write_outputs(dir: &Path, output: &ReviewOutput, config: &ReviewConfig) -> Result<()> {
    let docx = output
        .export(&ExportOptions::from_config(config))
        .with_context(|| format!("Export of {} failed", output.document.original_filename))?;
    let docx_path = dir.join(&docx.file_name);
    std::fs::write(&docx_path, &docx.bytes)
        .with_context(|| format!("Failed to write {}", docx_path.display()))?;

    let stem = Path::new(&output.document.original_filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("document");
    let json_path = dir.join(format!("{stem}.review.json"));
    let json = serde_json::to_string_pretty(&JsonReport::new(output))
        .context("Failed to serialise analysis")?;
    std::fs::write(&json_path, json)
        .with_context(|| format!("Failed to write {}", json_path.display()))?;

    eprintln!(
        "   {} {}  {}",
        dim("→"),
        docx_path.display(),
        dim(&format!("{} comments", docx.comments))
    );
    Ok(())
}

fn print_summary(output: &ReviewOutput) {
    let a = &output.analysis;
    let c = a.counts();
    let score = a.quality_score();
    let score_str = format!("{score}/100");
    let score_str = if c.high > 0 {
        red(&score_str)
    } else if c.medium > 0 {
        yellow(&score_str)
    } else {
        green(&score_str)
    };
    println!(
        "{}  {}  {}  {}",
        bold(&output.document.original_filename),
        score_str,
        a.risk_summary(),
        dim(&format!(
            "{} in / {} out tokens, {}ms",
            a.usage.input_tokens, a.usage.output_tokens, a.duration_ms
        ))
    );

    for f in a.findings() {
        let sev = match f.severity {
            cro_review::Severity::High => red("high  "),
            cro_review::Severity::Medium => yellow("medium"),
            cro_review::Severity::Low => cyan("low   "),
        };
        let place = match a.anchored_by_index(f.index) {
            Some(af) => af
                .anchors
                .first()
                .map(|an| format!("[ID: {}]", an.span_id))
                .unwrap_or_default(),
            None => red("unanchored"),
        };
        println!(
            "  {:>3}. {} {} {}  {}",
            f.index + 1,
            sev,
            place,
            bold(&f.category),
            truncate(&f.explanation, 100)
        );
        if let Some(q) = &f.location.quote {
            println!("       {}", dim(&format!("“{}”", truncate(q, 90))));
        }
    }
}

async fn inspect(args: InspectArgs) -> Result<()> {
    let document = inspect_file(&args.file)
        .await
        .with_context(|| format!("Failed to parse {}", args.file.display()))?;

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&document).context("Failed to serialise document")?
        );
        return Ok(());
    }

    println!("File:    {}", document.original_filename);
    println!("Format:  {}", document.format);
    println!("Spans:   {}", document.spans.len());
    println!("Images:  {}", document.image_count());
    println!();
    for span in &document.spans {
        let pos = &span.position;
        let label = match span.kind {
            SpanKind::Text => match pos.page {
                Some(p) => format!("p.{p}"),
                None => "text".to_string(),
            },
            SpanKind::TableCell => match (&pos.sheet, &pos.cell) {
                (Some(sheet), Some(cell)) => format!("{sheet}!{cell}"),
                _ => format!(
                    "t{} r{} c{}",
                    pos.table.unwrap_or(0),
                    pos.row.unwrap_or(0),
                    pos.col.unwrap_or(0)
                ),
            },
            SpanKind::Image => "image".to_string(),
        };
        let content = match &span.image {
            Some(img) => dim(&img.file_name),
            None => truncate(&span.content, 100),
        };
        println!("{:>5}  {:<14} {}", format!("[{}]", span.id), dim(&label), content);
    }
    Ok(())
}

/// Map CLI args to `ReviewConfig`.
async fn build_config(args: &ModelArgs, progress: Option<ProgressCallback>) -> Result<ReviewConfig> {
    let mut builder = ReviewConfig::builder()
        .model(args.model.clone())
        .base_url(args.base_url.clone())
        .language(args.language.clone())
        .temperature(args.temperature)
        .max_tokens(args.max_tokens)
        .api_timeout_secs(args.api_timeout)
        .include_images(!args.no_images)
        .max_images(args.max_images)
        .comment_author(args.author.clone())
        .comment_initials(args.initials.clone());

    if let Some(key) = &args.api_key {
        builder = builder.api_key(key.clone());
    }
    if let Some(path) = &args.rules {
        builder = builder.review_rules(read_rules_file(path).context("Invalid --rules")?);
    }
    if let Some(path) = &args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {}", path.display()))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}
