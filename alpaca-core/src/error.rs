use thiserror::Error;

/// Errors surfaced by the inference library.
#[derive(Debug, Error)]
pub enum InferError {
    /// Invalid flag combination, scaling factor or vocabulary layout.
    /// Always raised before any weights are read.
    #[error("configuration error: {0}")]
    Config(String),

    /// A templated generation did not contain the response marker.
    #[error("response marker {marker:?} not found in generated text")]
    MissingResponseMarker { marker: String, text: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("hub error: {0}")]
    Hub(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl InferError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn tokenizer(err: impl std::fmt::Display) -> Self {
        Self::Tokenizer(err.to_string())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

pub type InferResult<T> = std::result::Result<T, InferError>;
