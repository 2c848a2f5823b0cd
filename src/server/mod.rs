//! HTTP front end: upload → parse → analyze → display → export.
//!
//! | Method | Path | |
//! |--------|------|-|
//! | GET    | `/` | redirect to `/documents` |
//! | GET    | `/health` | `OK` |
//! | GET    | `/documents` | document list page |
//! | GET    | `/documents/:id` | highlighted document page, `?issue=n` |
//! | POST   | `/api/upload` | multipart `file` |
//! | GET    | `/api/documents` | summaries + risk statistics |
//! | GET    | `/api/documents/:id` | record, score, counts, highlight ranges |
//! | DELETE | `/api/documents/:id` | delete |
//! | GET    | `/api/documents/:id/images/:span_id` | stored image |
//! | POST   | `/api/analyze/:id` | run the review, `{"use_mock": bool}` |
//! | GET    | `/api/download/:id` | annotated DOCX, `?findings=0,2,5` |
//!
//! Requests are independent; two analyses of the same document race in the
//! store and the last one to finish wins.

pub mod error;
pub mod handlers;
pub mod pages;

use crate::config::{ReviewConfig, ServerConfig};
use crate::error::ReviewError;
use crate::store::DocumentStore;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ApiError;

/// Shared by every handler.
pub struct AppState {
    pub store: DocumentStore,
    pub review: ReviewConfig,
    pub server: ServerConfig,
}

impl AppState {
    /// Open the store under `server.data_dir`.
    pub async fn new(server: ServerConfig, review: ReviewConfig) -> Result<Self, ReviewError> {
        let store = DocumentStore::open(&server.data_dir).await?;
        Ok(Self {
            store,
            review,
            server,
        })
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let body_limit = state.server.max_upload_bytes;

    Router::new()
        .route("/", get(pages::index))
        .route("/health", get(handlers::health))
        // Pages
        .route("/documents", get(pages::documents))
        .route("/documents/:id", get(pages::document))
        // JSON API
        .route("/api/upload", post(handlers::upload))
        .route("/api/documents", get(handlers::list_documents))
        .route(
            "/api/documents/:id",
            get(handlers::get_document).delete(handlers::delete_document),
        )
        .route("/api/documents/:id/images/:span_id", get(handlers::image))
        .route("/api/analyze/:id", post(handlers::analyze))
        .route("/api/download/:id", get(handlers::download))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind `server.bind` and serve until the process is stopped.
pub async fn serve(server: ServerConfig, review: ReviewConfig) -> Result<(), ReviewError> {
    let addr = server.bind;
    let state = Arc::new(AppState::new(server, review).await?);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ReviewError::Internal(format!("cannot bind {addr}: {e}")))?;
    info!("CRO review server listening on http://{}", addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| ReviewError::Internal(format!("server error: {e}")))
}
