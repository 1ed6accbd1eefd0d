use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use constant_time_eq::constant_time_eq;
use secrecy::ExposeSecret;
use tracing::warn;

use super::error::ApiError;
use super::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests whose `x-api-key` header does not match the configured
/// key. Runs before the body is read.
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .map(|value| value.as_bytes());

    match provided {
        Some(key) if constant_time_eq(key, state.api_key.expose_secret().as_bytes()) => {
            Ok(next.run(request).await)
        }
        Some(_) => {
            warn!("Rejected request to {} with a wrong API key", request.uri().path());
            Err(ApiError::Unauthorized)
        }
        None => {
            warn!("Rejected request to {} without an API key", request.uri().path());
            Err(ApiError::Unauthorized)
        }
    }
}
