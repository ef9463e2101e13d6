//! Sampling parameters and the generation backends.
//!
//! [`GenerationConfig`] is backend neutral. Each backend translates it into
//! its own vocabulary ([`DirectParams`] or [`ServingParams`]) at the boundary,
//! and that translation is what gets persisted next to the predictions.

pub mod direct;
pub mod pipeline;
pub mod sampling;

use serde::Serialize;

pub use direct::{extract_response, DirectPipeline, GenerationScope};
pub use pipeline::{BackendKind, GenerationPipeline};
pub use sampling::Sampler;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Penalty {
    /// Multiplicative penalty on logits of every token already in the sequence.
    Repetition(f32),
    /// Additive penalty on logits of already generated tokens.
    Presence(f32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub penalty: Penalty,
    pub max_new_tokens: usize,
    pub seed: u64,
}

impl GenerationConfig {
    pub fn direct_default() -> Self {
        Self {
            temperature: 0.2,
            top_k: 40,
            top_p: 0.9,
            penalty: Penalty::Repetition(1.1),
            max_new_tokens: 400,
            seed: 42,
        }
    }

    pub fn serving_default() -> Self {
        Self {
            penalty: Penalty::Presence(1.0),
            ..Self::direct_default()
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn to_direct_params(&self) -> DirectParams {
        DirectParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            do_sample: self.temperature > 0.0,
            num_beams: 1,
            repetition_penalty: match self.penalty {
                Penalty::Repetition(p) => p,
                Penalty::Presence(_) => 1.0,
            },
            max_new_tokens: self.max_new_tokens,
        }
    }

    pub fn to_serving_params(&self) -> ServingParams {
        ServingParams {
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            max_tokens: self.max_new_tokens,
            presence_penalty: match self.penalty {
                Penalty::Presence(p) => p,
                Penalty::Repetition(_) => 0.0,
            },
        }
    }
}

/// Parameters as the direct backend names them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectParams {
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub do_sample: bool,
    pub num_beams: usize,
    pub repetition_penalty: f32,
    pub max_new_tokens: usize,
}

/// Parameters as the serving backend names them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServingParams {
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
    pub max_tokens: usize,
    pub presence_penalty: f32,
}
