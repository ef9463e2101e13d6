//! Numerical patches installed into the model at construction time.
//!
//! A [`PatchSet`] is built once at startup and handed to every model
//! constructor. Each patch is a strategy object; applying a patch a second
//! time replaces the strategy instead of stacking on top of it.

pub mod attention;
pub mod ntk;

use std::fmt;
use std::sync::Arc;

use candle_core::Device;

use crate::error::{InferError, InferResult};
use attention::{resolve_attention_kernel, AttentionKernel, EagerAttention};
use ntk::{position_scaling, FixedNtkScaling, NtkAlpha, PositionScaling};

/// Model families the patches know how to rewrite.
pub const SUPPORTED_MODEL_TYPES: &[&str] = &["llama"];

#[derive(Clone)]
pub enum PatchStrategy {
    Attention(Arc<dyn AttentionKernel>),
    PositionScaling(Arc<dyn PositionScaling>),
}

impl fmt::Debug for PatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Attention(kernel) => write!(f, "Attention({})", kernel.name()),
            Self::PositionScaling(scaling) => write!(f, "PositionScaling({})", scaling.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchDescriptor {
    pub name: &'static str,
    pub strategy: PatchStrategy,
}

impl PatchDescriptor {
    pub fn applies_to(&self, model_type: &str) -> bool {
        SUPPORTED_MODEL_TYPES.contains(&model_type)
    }
}

impl fmt::Display for PatchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.strategy {
            PatchStrategy::Attention(kernel) => write!(f, "{}={}", self.name, kernel.name()),
            PatchStrategy::PositionScaling(scaling) => {
                write!(f, "{}={}", self.name, scaling.name())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatchSet {
    attention: Arc<dyn AttentionKernel>,
    scaling: Arc<dyn PositionScaling>,
    attention_installed: bool,
    scaling_installed: bool,
}

impl Default for PatchSet {
    fn default() -> Self {
        Self {
            attention: Arc::new(EagerAttention),
            scaling: Arc::new(FixedNtkScaling::new(1.0)),
            attention_installed: false,
            scaling_installed: false,
        }
    }
}

impl PatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the attention kernel used on `device`.
    pub fn apply_attention_patch(
        &mut self,
        use_memory_efficient_attention: bool,
        device: &Device,
    ) -> &mut Self {
        self.attention = resolve_attention_kernel(use_memory_efficient_attention, device);
        self.attention_installed = true;
        self
    }

    pub fn apply_ntk_scaling_patch(&mut self, alpha: NtkAlpha) -> &mut Self {
        self.scaling = position_scaling(alpha);
        self.scaling_installed = true;
        self
    }

    pub fn attention_kernel(&self) -> Arc<dyn AttentionKernel> {
        self.attention.clone()
    }

    pub fn position_scaling(&self) -> Arc<dyn PositionScaling> {
        self.scaling.clone()
    }

    pub fn descriptors(&self) -> Vec<PatchDescriptor> {
        let mut out = Vec::with_capacity(2);
        if self.attention_installed {
            out.push(PatchDescriptor {
                name: "attention",
                strategy: PatchStrategy::Attention(self.attention.clone()),
            });
        }
        if self.scaling_installed {
            out.push(PatchDescriptor {
                name: "ntk_scaling",
                strategy: PatchStrategy::PositionScaling(self.scaling.clone()),
            });
        }
        out
    }

    /// Fails when an installed patch cannot rewrite `model_type`.
    pub fn check_model_type(&self, model_type: &str) -> InferResult<()> {
        for patch in self.descriptors() {
            if !patch.applies_to(model_type) {
                return Err(InferError::config(format!(
                    "patch `{}` does not support model type {model_type:?} (supported: {})",
                    patch.name,
                    SUPPORTED_MODEL_TYPES.join(", ")
                )));
            }
        }
        Ok(())
    }
}
