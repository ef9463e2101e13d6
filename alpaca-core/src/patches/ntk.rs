//! NTK-aware rotary position scaling.
//!
//! The rotary frequency base is rescaled to `base * alpha^(d / (d - 2))`,
//! which stretches the low frequencies so a model trained on a short window
//! keeps working on longer inputs.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{InferError, InferResult};

/// Reference length of the automatic alpha schedule.
pub const AUTO_NTK_REFERENCE_LEN: f64 = 1024.0;

/// Slope of the automatic alpha schedule.
pub const AUTO_NTK_SLOPE: f64 = 1.1;

/// Parsed value of the `--alpha` flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NtkAlpha {
    /// Derive alpha from the requested sequence length on every call.
    Auto,
    /// Constant alpha for every request.
    Fixed(f64),
}

impl Default for NtkAlpha {
    fn default() -> Self {
        Self::Fixed(1.0)
    }
}

impl FromStr for NtkAlpha {
    type Err = InferError;

    fn from_str(s: &str) -> InferResult<Self> {
        let s = s.trim();
        if s == "auto" {
            return Ok(Self::Auto);
        }
        match s.parse::<f64>() {
            Ok(alpha) if alpha.is_finite() && alpha > 0.0 => Ok(Self::Fixed(alpha)),
            _ => Err(InferError::config(format!(
                "alpha must be a positive float or 'auto', but given {s:?}"
            ))),
        }
    }
}

impl fmt::Display for NtkAlpha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Fixed(alpha) => write!(f, "{alpha}"),
        }
    }
}

/// Strategy deciding the rotary frequency base for a forward pass.
pub trait PositionScaling: Send + Sync + fmt::Debug {
    fn name(&self) -> String;

    /// Alpha for a forward pass covering positions `0..seq_len`.
    fn alpha(&self, seq_len: usize, trained_len: usize) -> f64;

    /// True when `alpha` does not depend on the sequence length, so rotary
    /// tables may be cached and grown.
    fn is_static(&self) -> bool;

    fn scaled_base(&self, base: f64, head_dim: usize, seq_len: usize, trained_len: usize) -> f64 {
        ntk_scaled_base(base, head_dim, self.alpha(seq_len, trained_len))
    }
}

pub fn ntk_scaled_base(base: f64, head_dim: usize, alpha: f64) -> f64 {
    if alpha == 1.0 || head_dim <= 2 {
        return base;
    }
    let d = head_dim as f64;
    base * alpha.powf(d / (d - 2.0))
}

#[derive(Debug, Clone, Copy)]
pub struct FixedNtkScaling {
    alpha: f64,
}

impl FixedNtkScaling {
    pub fn new(alpha: f64) -> Self {
        Self { alpha }
    }
}

impl PositionScaling for FixedNtkScaling {
    fn name(&self) -> String {
        format!("ntk(alpha={})", self.alpha)
    }

    fn alpha(&self, _seq_len: usize, _trained_len: usize) -> f64 {
        self.alpha
    }

    fn is_static(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AutoNtkScaling;

impl PositionScaling for AutoNtkScaling {
    fn name(&self) -> String {
        "ntk(alpha=auto)".to_string()
    }

    fn alpha(&self, seq_len: usize, trained_len: usize) -> f64 {
        if seq_len <= trained_len {
            return 1.0;
        }
        let alpha = (seq_len as f64 / AUTO_NTK_REFERENCE_LEN - 1.0) * AUTO_NTK_SLOPE;
        alpha.max(1.0)
    }

    fn is_static(&self) -> bool {
        false
    }
}

pub fn position_scaling(alpha: NtkAlpha) -> Arc<dyn PositionScaling> {
    match alpha {
        NtkAlpha::Auto => Arc::new(AutoNtkScaling),
        NtkAlpha::Fixed(alpha) => Arc::new(FixedNtkScaling::new(alpha)),
    }
}
