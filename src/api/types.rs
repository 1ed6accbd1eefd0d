use serde::{Deserialize, Serialize};

/// Body of `POST /summarize`. A missing `text` reads as empty and is then
/// rejected as too short.
#[derive(Debug, Clone, Deserialize)]
pub struct SummarizeRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
    #[serde(default = "default_num_beams")]
    pub num_beams: usize,
}

fn default_max_length() -> usize {
    142
}

fn default_min_length() -> usize {
    56
}

fn default_num_beams() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizeResponse {
    pub summary: String,
}

/// Error body, `{"detail": "..."}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}
