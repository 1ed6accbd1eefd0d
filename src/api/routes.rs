use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    middleware,
    routing::post,
    Json, Router,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::auth::require_api_key;
use super::error::ApiError;
use super::types::{SummarizeRequest, SummarizeResponse};
use super::AppState;
use crate::config::SummaryOptions;

/// Shortest accepted text, counted in characters after trimming.
pub const MIN_TEXT_CHARS: usize = 10;

/// Widest beam search a request may ask for. Every beam is a full decoder
/// row per step.
pub const MAX_NUM_BEAMS: usize = 16;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/summarize", post(summarize))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

async fn summarize(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SummarizeRequest>, JsonRejection>,
) -> Result<Json<SummarizeResponse>, ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        debug!("Malformed summarize body: {}", rejection.body_text());
        ApiError::InvalidInput(rejection.body_text())
    })?;
    let options = validate(&request)?;

    let request_id = Uuid::new_v4();
    let started = Instant::now();
    info!(
        "Summarize request {}: {} chars, max_length={}, min_length={}, num_beams={}",
        request_id,
        request.text.chars().count(),
        options.max_length,
        options.min_length,
        options.num_beams
    );

    let summary = state.summarizer.summarize(request.text, options).await?;

    info!(
        "Summarize request {} done in {}ms ({} chars)",
        request_id,
        started.elapsed().as_millis(),
        summary.chars().count()
    );

    Ok(Json(SummarizeResponse { summary }))
}

fn validate(request: &SummarizeRequest) -> Result<SummaryOptions, ApiError> {
    if request.text.trim().chars().count() < MIN_TEXT_CHARS {
        return Err(ApiError::InvalidInput("Text too short".to_string()));
    }
    if request.num_beams == 0 {
        return Err(ApiError::InvalidInput(
            "num_beams must be at least 1".to_string(),
        ));
    }
    if request.num_beams > MAX_NUM_BEAMS {
        return Err(ApiError::InvalidInput(format!("num_beams must be at most {MAX_NUM_BEAMS}")));
    }
    if request.max_length == 0 {
        return Err(ApiError::InvalidInput(
            "max_length must be at least 1".to_string(),
        ));
    }

    Ok(SummaryOptions {
        max_length: request.max_length,
        min_length: request.min_length,
        num_beams: request.num_beams,
    })
}
