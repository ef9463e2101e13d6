//! Attention kernels.
//!
//! Every kernel consumes rotated queries `[B, H, S, D]` and the full key/value
//! history `[B, KV, T, D]` (after the cache update) and returns the attended
//! values flattened to `[B, S, H * D]`, ready for the output projection.
//!
//! The mask, when present, is additive and broadcastable to the score shape:
//! `[1, 1, S, T]` for a causal prefill, `[B, 1, 1, T]` for padded batch decode.

use std::fmt;
use std::sync::Arc;

use candle_core::{Device, Result, Tensor, D};
use tracing::warn;

pub trait AttentionKernel: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor>;
}

/// Reference scaled dot-product attention.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerAttention;

impl AttentionKernel for EagerAttention {
    fn name(&self) -> &'static str {
        "eager"
    }

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b_sz, num_heads, seq_len, head_dim) = q.dims4()?;
        let num_kv_heads = k.dim(1)?;
        let n_rep = num_heads / num_kv_heads;
        let scale = 1.0 / (head_dim as f64).sqrt();

        if n_rep > 1 && seq_len == 1 {
            // Grouped decode: Q [B, H, 1, D] -> [B, KV, n_rep, D] so every group
            // shares its K/V head without materialising the repeat.
            let q_g = (q.reshape((b_sz, num_kv_heads, n_rep, head_dim))? * scale)?;
            let attn_weights = q_g.matmul(&k.transpose(2, 3)?)?;
            let attn_weights = match mask {
                Some(mask) => attn_weights.broadcast_add(mask)?,
                None => attn_weights,
            };
            let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
            let attn_output = attn_weights.matmul(v)?; // [B, KV, n_rep, D]
            return attn_output.reshape((b_sz, 1, num_heads * head_dim));
        }

        let k = repeat_kv(k, n_rep)?;
        let v = repeat_kv(v, n_rep)?;

        let attn_weights = (q.matmul(&k.transpose(D::Minus2, D::Minus1)?)? * scale)?;
        let attn_weights = match mask {
            Some(mask) => attn_weights.broadcast_add(mask)?,
            None => attn_weights,
        };
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_output = attn_weights.matmul(&v)?;

        // [B, H, S, D] -> [B, S, H*D]
        attn_output
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b_sz, seq_len, ()))
    }
}

pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (b, kv_heads, s, d) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((b, kv_heads, n_rep, s, d))?
        .reshape((b, kv_heads * n_rep, s, d))
}

/// Memory-efficient kernel backed by `candle-flash-attn`.
///
/// Padded batch decode needs an explicit mask, which the fused kernel does not
/// take; those steps go through the eager kernel.
#[cfg(feature = "flash-attn")]
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashAttention;

#[cfg(feature = "flash-attn")]
impl AttentionKernel for FlashAttention {
    fn name(&self) -> &'static str {
        "flash"
    }

    fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b_sz, _num_heads, seq_len, head_dim) = q.dims4()?;
        if seq_len == 1 && mask.is_some() {
            return EagerAttention.forward(q, k, v, mask);
        }
        let scale = 1.0 / (head_dim as f32).sqrt();
        // flash-attn wants [B, S, H, D].
        let q = q.transpose(1, 2)?.contiguous()?;
        let k = k.transpose(1, 2)?.contiguous()?;
        let v = v.transpose(1, 2)?.contiguous()?;
        let out = candle_flash_attn::flash_attn(&q, &k, &v, scale, seq_len > 1)?;
        out.reshape((b_sz, seq_len, ()))
    }
}

#[cfg(feature = "flash-attn")]
fn memory_efficient_kernel(device: &Device) -> Option<Arc<dyn AttentionKernel>> {
    if device.is_cuda() {
        Some(Arc::new(FlashAttention))
    } else {
        None
    }
}

#[cfg(not(feature = "flash-attn"))]
fn memory_efficient_kernel(_device: &Device) -> Option<Arc<dyn AttentionKernel>> {
    None
}

/// Picks the kernel for `device`. Asking for the memory-efficient kernel where
/// it cannot run logs a warning and returns the eager kernel.
pub fn resolve_attention_kernel(
    use_memory_efficient: bool,
    device: &Device,
) -> Arc<dyn AttentionKernel> {
    if !use_memory_efficient {
        return Arc::new(EagerAttention);
    }
    match memory_efficient_kernel(device) {
        Some(kernel) => kernel,
        None => {
            warn!(
                device = ?device,
                "memory-efficient attention unavailable (needs the `flash-attn` feature on CUDA), using eager attention"
            );
            Arc::new(EagerAttention)
        }
    }
}
