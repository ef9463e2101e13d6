use std::fmt;

use serde::Serialize;

use super::GenerationConfig;
use crate::error::InferResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Direct,
    Serving,
}

impl BackendKind {
    pub fn default_generation_config(self) -> GenerationConfig {
        match self {
            Self::Direct => GenerationConfig::direct_default(),
            Self::Serving => GenerationConfig::serving_default(),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Serving => write!(f, "serving"),
        }
    }
}

/// Text in, text out. Outputs are returned in input order.
pub trait GenerationPipeline {
    fn backend(&self) -> BackendKind;

    fn generate(&mut self, texts: &[String], config: &GenerationConfig) -> InferResult<Vec<String>>;

    /// `config` in the backend's own parameter names.
    fn effective_config(&self, config: &GenerationConfig) -> serde_json::Value;
}
