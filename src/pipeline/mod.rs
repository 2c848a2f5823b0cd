//! Pipeline stages between parsed spans and raw findings.
//!
//! Each submodule implements exactly one transformation step.
//! Keeping stages separate makes each independently testable and lets us
//! swap implementations (e.g. replay a recorded answer instead of calling
//! DashScope) without touching other stages.
//!
//! ## Data Flow
//!
//! ```text
//! spans ──▶ encode ──▶ llm ──▶ postprocess ──▶ mapper
//!          (images)   (HTTP)   (JSON salvage)  (anchors)
//! ```
//!
//! 1. [`encode`] — turn extracted images into base64 data URIs, downscaling
//!    oversized pictures and skipping formats the model cannot read
//! 2. [`llm`]    — build the multimodal request and call the model; the only
//!    stage with network I/O
//! 3. [`postprocess`] — recover the findings array from whatever the model
//!    wrote (fences, prose, truncation) and normalise its fields

pub mod encode;
pub mod llm;
pub mod postprocess;
