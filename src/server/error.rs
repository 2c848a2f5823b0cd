//! HTTP mapping of library errors.

use crate::error::ReviewError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Review(#[from] ReviewError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Review(e) => match e {
                ReviewError::UnsupportedFormat { .. }
                | ReviewError::Parse { .. }
                | ReviewError::NotAnalyzed(_)
                | ReviewError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                ReviewError::DocumentNotFound(_) | ReviewError::FileNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                ReviewError::Llm(_) => StatusCode::BAD_GATEWAY,
                ReviewError::Store { .. }
                | ReviewError::CorruptRecord { .. }
                | ReviewError::Export(_)
                | ReviewError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::debug!("{}: {}", status, self);
        }

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
