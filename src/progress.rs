//! Progress-callback trait for review events.
//!
//! Inject an [`Arc<dyn ReviewProgressCallback>`] via
//! [`crate::config::ReviewConfigBuilder::progress_callback`] to receive
//! events as a document moves through parse → model call → mapping.
//!
//! # Why callbacks instead of channels?
//!
//! The callback approach is the least-invasive integration point: callers can
//! forward events to a terminal spinner, a log line, or a status field in the
//! store without the library knowing how the host application communicates.
//! The trait is `Send + Sync` so the CLI can review several files at once.
//!
//! # Example
//!
//! ```rust
//! use cro_review::{ReviewConfig, ReviewProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     findings: AtomicUsize,
//! }
//!
//! impl ReviewProgressCallback for CountingCallback {
//!     fn on_review_complete(&self, _document: &str, findings: usize, _anchored: usize) {
//!         self.findings.fetch_add(findings, Ordering::SeqCst);
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { findings: AtomicUsize::new(0) });
//!
//! let config = ReviewConfig::builder()
//!     .progress_callback(counter as Arc<dyn ReviewProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the review pipeline as it processes a document.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. `document` is the original filename.
pub trait ReviewProgressCallback: Send + Sync {
    /// Called once the document is parsed, before the model is contacted.
    ///
    /// # Arguments
    /// * `span_count`  — number of spans that will be sent
    /// * `image_count` — number of images that will be attached
    fn on_review_start(&self, document: &str, span_count: usize, image_count: usize) {
        let _ = (document, span_count, image_count);
    }

    /// Called just before the model request is sent.
    fn on_request_sent(&self, document: &str, model: &str) {
        let _ = (document, model);
    }

    /// Called when the model answered.
    ///
    /// # Arguments
    /// * `output_tokens` — tokens generated, as reported by the API
    fn on_response(&self, document: &str, output_tokens: u64) {
        let _ = (document, output_tokens);
    }

    /// Called after mapping, with the total and anchored finding counts.
    fn on_review_complete(&self, document: &str, findings: usize, anchored: usize) {
        let _ = (document, findings, anchored);
    }

    /// Called when the review fails.
    fn on_review_error(&self, document: &str, error: &str) {
        let _ = (document, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ReviewProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ReviewConfig`].
pub type ProgressCallback = Arc<dyn ReviewProgressCallback>;
