use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use super::types::ErrorResponse;
use crate::error::SummarizeError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Invalid or missing API Key")]
    Unauthorized,

    #[error("{0}")]
    InvalidInput(String),

    #[error("Internal Server Error")]
    Summarize(#[from] SummarizeError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::Summarize(e) => {
                // Details stay in the server log.
                error!("Summarization failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse {
            detail: self.to_string(),
        });

        (status, body).into_response()
    }
}
