use thiserror::Error;

/// Failures below the HTTP layer. None of these reach a client verbatim.
#[derive(Error, Debug)]
pub enum SummarizeError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    #[error("model hub request failed: {0}")]
    Hub(String),

    #[error("tokenizer failure: {0}")]
    Tokenizer(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("inference panicked: {0}")]
    WorkerPanicked(String),

    #[error("inference worker is not running")]
    WorkerUnavailable,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("tensor operation failed: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SummarizeError>;
