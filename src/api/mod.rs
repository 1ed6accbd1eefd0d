mod auth;
mod error;
mod routes;
mod types;

pub use error::ApiError;
pub use routes::create_router;
pub use types::{ErrorResponse, SummarizeRequest, SummarizeResponse};

use std::sync::Arc;

use secrecy::SecretString;

use crate::worker::Summarizer;

/// Shared application state
pub struct AppState {
    pub summarizer: Arc<dyn Summarizer>,
    pub api_key: SecretString,
}

impl AppState {
    pub fn new(summarizer: Arc<dyn Summarizer>, api_key: impl Into<String>) -> Self {
        Self {
            summarizer,
            api_key: SecretString::new(api_key.into()),
        }
    }
}
