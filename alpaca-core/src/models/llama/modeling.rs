//! LLaMA transformer with pluggable attention and rotary scaling.
//!
//! Layout follows the HuggingFace checkpoint (`model.layers.N.self_attn.*`,
//! `model.layers.N.mlp.*`, `lm_head`). Runtime characteristics:
//!
//! 1. **Strategy injection**: the attention kernel and the rotary scaling
//!    are taken from a [`PatchSet`] at construction, so every forward pass runs
//!    the patched computation.
//! 2. **Pre-allocated KV cache** with in-place `slice_set` writes.
//! 3. **Merged QKV / gate+up projections** for floating-point weights.
//! 4. **Q8_0 projections** through [`LinearLayer::Quantized`] for 8-bit loads;
//!    embeddings, norms and `lm_head` stay in floating point.
//! 5. **Batched decode**: `setup_batch_decode`, `step_batch_decode` and
//!    `extract_batch_kv` let the serving engine decode many sequences in one
//!    forward pass.

use std::sync::Arc;

use candle_core::quantized::{GgmlDType, QMatMul, QTensor};
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, RmsNorm, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::patches::attention::AttentionKernel;
use crate::patches::ntk::{ntk_scaled_base, PositionScaling};
use crate::patches::PatchSet;

// ── Config ──────────────────────────────────────────────────────────────

fn default_model_type() -> String {
    "llama".to_string()
}
fn default_max_position_embeddings() -> usize {
    2048
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_rope_theta() -> f64 {
    10_000.0
}

/// `eos_token_id` is an integer in most checkpoints and a list in some.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EosTokenId {
    Single(u32),
    Multiple(Vec<u32>),
}

impl EosTokenId {
    pub fn first(&self) -> Option<u32> {
        match self {
            Self::Single(id) => Some(*id),
            Self::Multiple(ids) => ids.first().copied(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlamaConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub eos_token_id: Option<EosTokenId>,
}

impl LlamaConfig {
    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }
}

// ── Linear layer (floating point or Q8_0) ───────────────────────────────

#[derive(Debug, Clone)]
pub enum LinearLayer {
    Standard(Linear),
    Quantized(QMatMul),
}

impl LinearLayer {
    /// Quantize to Q8_0. Layers whose input width is not a multiple of the
    /// block size stay in floating point.
    pub fn quantize_q8(linear: Linear) -> Result<Self> {
        let weight = linear.weight();
        let in_dim = weight.dim(1)?;
        if in_dim % GgmlDType::Q8_0.block_size() != 0 {
            debug!(in_dim, "projection width not block aligned, keeping it unquantized");
            return Ok(Self::Standard(linear));
        }
        let qtensor = QTensor::quantize(&weight.to_dtype(DType::F32)?, GgmlDType::Q8_0)?;
        Ok(Self::Quantized(QMatMul::from_qtensor(qtensor)?))
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Self::Quantized(_))
    }
}

impl Module for LinearLayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Self::Standard(linear) => linear.forward(xs),
            Self::Quantized(qmatmul) => {
                let dtype = xs.dtype();
                qmatmul.forward(&xs.to_dtype(DType::F32)?)?.to_dtype(dtype)
            }
        }
    }
}

fn projection(in_dim: usize, out_dim: usize, quantize: bool, vb: VarBuilder) -> Result<LinearLayer> {
    let linear = linear_no_bias(in_dim, out_dim, vb)?;
    if quantize {
        LinearLayer::quantize_q8(linear)
    } else {
        Ok(LinearLayer::Standard(linear))
    }
}

// ── Rotary Embedding ────────────────────────────────────────────────────

fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let half = x.dim(D::Minus1)? / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

fn apply_rotary_pos_emb(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    x.broadcast_mul(cos)? + rotate_half(x)?.broadcast_mul(sin)?
}

/// Full-width `[len, head_dim]` cos/sin tables for frequency base `base`.
pub fn rotary_tables(base: f64, head_dim: usize, len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
    let inv: Vec<f32> = (0..head_dim)
        .step_by(2)
        .map(|i| 1.0 / base.powf(i as f64 / head_dim as f64) as f32)
        .collect();
    let inv_freq = Tensor::new(inv.as_slice(), device)?;
    let positions: Vec<f32> = (0..len).map(|i| i as f32).collect();
    let positions = Tensor::new(positions.as_slice(), device)?;
    let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?; // [len, dim/2]
    let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?; // [len, dim]
    Ok((emb.cos()?, emb.sin()?))
}

struct RopeTables {
    alpha: f64,
    cos: Tensor,
    sin: Tensor,
}

struct RotaryEmbedding {
    head_dim: usize,
    base: f64,
    trained_len: usize,
    scaling: Arc<dyn PositionScaling>,
    cached: Option<RopeTables>,
    device: Device,
}

impl RotaryEmbedding {
    fn new(config: &LlamaConfig, scaling: Arc<dyn PositionScaling>, device: &Device) -> Self {
        Self {
            head_dim: config.head_dim(),
            base: config.rope_theta,
            trained_len: config.max_position_embeddings,
            scaling,
            cached: None,
            device: device.clone(),
        }
    }

    /// Tables covering positions `0..seq_len`, scaled for a pass of that
    /// length. Static scalings are cached and grown; length-dependent alphas
    /// above 1 are recomputed on every call.
    fn forward(&mut self, seq_len: usize) -> Result<(Tensor, Tensor)> {
        let alpha = self.scaling.alpha(seq_len, self.trained_len);
        self.tables(alpha, seq_len)
    }

    /// One `[N, head_dim]` row per decode position. Row `i` is scaled for a
    /// pass of length `positions[i] + 1`, so a sequence sees the same alpha
    /// whether it decodes alone or next to longer ones.
    fn rows_at(&mut self, positions: &[usize]) -> Result<(Tensor, Tensor)> {
        if self.scaling.is_static() {
            let max_pos = positions.iter().copied().max().unwrap_or(0) + 1;
            let (cos, sin) = self.forward(max_pos)?;
            let ids: Vec<u32> = positions.iter().map(|&p| p as u32).collect();
            let ids = Tensor::new(ids.as_slice(), &self.device)?;
            return Ok((cos.index_select(&ids, 0)?, sin.index_select(&ids, 0)?));
        }

        // Rows sharing an alpha share one table.
        let mut groups: Vec<(f64, Vec<usize>)> = Vec::new();
        for (row, &pos) in positions.iter().enumerate() {
            let alpha = self.scaling.alpha(pos + 1, self.trained_len);
            match groups.iter_mut().find(|(a, _)| *a == alpha) {
                Some((_, rows)) => rows.push(row),
                None => groups.push((alpha, vec![row])),
            }
        }

        let mut cos_rows: Vec<Option<Tensor>> = vec![None; positions.len()];
        let mut sin_rows: Vec<Option<Tensor>> = vec![None; positions.len()];
        for (alpha, rows) in groups {
            let len = rows.iter().map(|&r| positions[r]).max().unwrap_or(0) + 1;
            let (cos, sin) = self.tables(alpha, len)?;
            for r in rows {
                cos_rows[r] = Some(cos.narrow(0, positions[r], 1)?);
                sin_rows[r] = Some(sin.narrow(0, positions[r], 1)?);
            }
        }
        let cos: Vec<Tensor> = cos_rows.into_iter().flatten().collect();
        let sin: Vec<Tensor> = sin_rows.into_iter().flatten().collect();
        Ok((Tensor::cat(&cos, 0)?, Tensor::cat(&sin, 0)?))
    }

    fn tables(&mut self, alpha: f64, seq_len: usize) -> Result<(Tensor, Tensor)> {
        if let Some(ref t) = self.cached {
            if t.alpha == alpha && t.cos.dim(0)? >= seq_len {
                return Ok((t.cos.narrow(0, 0, seq_len)?, t.sin.narrow(0, 0, seq_len)?));
            }
        }

        let cacheable = self.scaling.is_static() || alpha == 1.0;
        let len = if cacheable {
            seq_len.max(self.trained_len)
        } else {
            seq_len
        };
        let base = ntk_scaled_base(self.base, self.head_dim, alpha);
        let (cos, sin) = rotary_tables(base, self.head_dim, len, &self.device)?;
        if !cacheable {
            return Ok((cos, sin));
        }
        let out = (cos.narrow(0, 0, seq_len)?, sin.narrow(0, 0, seq_len)?);
        self.cached = Some(RopeTables { alpha, cos, sin });
        Ok(out)
    }
}

// ── Attention ───────────────────────────────────────────────────────────

struct Attention {
    q_proj: LinearLayer,
    k_proj: LinearLayer,
    v_proj: LinearLayer,
    o_proj: LinearLayer,
    /// Merged QKV weight, only for floating-point projections.
    qkv_proj: Option<Linear>,
    kernel: Arc<dyn AttentionKernel>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    q_dim: usize,
    kv_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
    cache_seq_len: usize,
}

impl Attention {
    fn new(
        config: &LlamaConfig,
        kernel: Arc<dyn AttentionKernel>,
        quantize: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let head_dim = config.head_dim();
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_kv_heads();
        let q_dim = num_heads * head_dim;
        let kv_dim = num_kv_heads * head_dim;

        let q_proj = projection(config.hidden_size, q_dim, quantize, vb.pp("q_proj"))?;
        let k_proj = projection(config.hidden_size, kv_dim, quantize, vb.pp("k_proj"))?;
        let v_proj = projection(config.hidden_size, kv_dim, quantize, vb.pp("v_proj"))?;
        let o_proj = projection(q_dim, config.hidden_size, quantize, vb.pp("o_proj"))?;

        let qkv_proj = if let (LinearLayer::Standard(q), LinearLayer::Standard(k), LinearLayer::Standard(v)) =
            (&q_proj, &k_proj, &v_proj)
        {
            let qkv_w = Tensor::cat(&[q.weight(), k.weight(), v.weight()], 0)?;
            Some(Linear::new(qkv_w, None))
        } else {
            None
        };

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            qkv_proj,
            kernel,
            num_heads,
            num_kv_heads,
            head_dim,
            q_dim,
            kv_dim,
            kv_cache: None,
            cache_seq_len: 0,
        })
    }

    /// Append new K/V into the pre-allocated buffer, growing it when full.
    fn update_kv_cache(&mut self, k: Tensor, v: Tensor) -> Result<(Tensor, Tensor)> {
        const ROOM: usize = 256;
        let k = k.contiguous()?;
        let v = v.contiguous()?;
        let new_seq_len = k.dim(2)?;
        let cache_seq_len = self.cache_seq_len;

        match self.kv_cache.take() {
            Some((buf_k, buf_v)) => {
                let buf_len = buf_k.dim(2)?;
                let new_total = cache_seq_len + new_seq_len;

                if new_total <= buf_len {
                    buf_k.slice_set(&k, 2, cache_seq_len)?;
                    buf_v.slice_set(&v, 2, cache_seq_len)?;
                    let k_view = buf_k.narrow(2, 0, new_total)?;
                    let v_view = buf_v.narrow(2, 0, new_total)?;
                    self.kv_cache = Some((buf_k, buf_v));
                    self.cache_seq_len = new_total;
                    Ok((k_view, v_view))
                } else {
                    let cur_k = buf_k.narrow(2, 0, cache_seq_len)?;
                    let cur_v = buf_v.narrow(2, 0, cache_seq_len)?;
                    let full_k = Tensor::cat(&[&cur_k, &k], 2)?;
                    let full_v = Tensor::cat(&[&cur_v, &v], 2)?;
                    let (b, h, total, d) = full_k.dims4()?;
                    let new_buf_k = Tensor::zeros((b, h, total + ROOM, d), k.dtype(), k.device())?;
                    let new_buf_v = Tensor::zeros((b, h, total + ROOM, d), v.dtype(), v.device())?;
                    new_buf_k.slice_set(&full_k, 2, 0)?;
                    new_buf_v.slice_set(&full_v, 2, 0)?;
                    self.kv_cache = Some((new_buf_k, new_buf_v));
                    self.cache_seq_len = total;
                    Ok((full_k, full_v))
                }
            }
            None => {
                let (b, h, s, d) = k.dims4()?;
                let buf_k = Tensor::zeros((b, h, s + ROOM, d), k.dtype(), k.device())?;
                let buf_v = Tensor::zeros((b, h, s + ROOM, d), v.dtype(), v.device())?;
                buf_k.slice_set(&k, 2, 0)?;
                buf_v.slice_set(&v, 2, 0)?;
                self.kv_cache = Some((buf_k, buf_v));
                self.cache_seq_len = s;
                Ok((k, v))
            }
        }
    }

    fn forward(
        &mut self,
        hidden_states: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (b_sz, seq_len, _) = hidden_states.dims3()?;

        let (q, k, v) = if let Some(ref qkv_proj) = self.qkv_proj {
            let qkv = qkv_proj.forward(hidden_states)?;
            let q = qkv.narrow(D::Minus1, 0, self.q_dim)?;
            let k = qkv.narrow(D::Minus1, self.q_dim, self.kv_dim)?;
            let v = qkv.narrow(D::Minus1, self.q_dim + self.kv_dim, self.kv_dim)?;
            (q, k, v)
        } else {
            (
                self.q_proj.forward(hidden_states)?,
                self.k_proj.forward(hidden_states)?,
                self.v_proj.forward(hidden_states)?,
            )
        };

        // [B, S, H*D] -> [B, H, S, D]
        let q = q
            .reshape((b_sz, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((b_sz, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = apply_rotary_pos_emb(&q, cos, sin)?;
        let k = apply_rotary_pos_emb(&k, cos, sin)?;

        let (k, v) = self.update_kv_cache(k, v)?;
        let attn_output = self
            .kernel
            .forward(&q, &k.contiguous()?, &v.contiguous()?, attention_mask)?;
        self.o_proj.forward(&attn_output)
    }

    fn clear_kv_cache(&mut self) {
        self.kv_cache = None;
        self.cache_seq_len = 0;
    }
}

// ── MLP ─────────────────────────────────────────────────────────────────

enum MlpGateUp {
    Merged {
        gate_up_proj: Linear,
        intermediate_size: usize,
    },
    Separate {
        gate_proj: LinearLayer,
        up_proj: LinearLayer,
    },
}

struct Mlp {
    gate_up: MlpGateUp,
    down_proj: LinearLayer,
}

impl Mlp {
    fn new(config: &LlamaConfig, quantize: bool, vb: VarBuilder) -> Result<Self> {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        let down_proj = projection(inter, hidden, quantize, vb.pp("down_proj"))?;
        let gate_up = if quantize {
            MlpGateUp::Separate {
                gate_proj: projection(hidden, inter, true, vb.pp("gate_proj"))?,
                up_proj: projection(hidden, inter, true, vb.pp("up_proj"))?,
            }
        } else {
            let gate_proj = linear_no_bias(hidden, inter, vb.pp("gate_proj"))?;
            let up_proj = linear_no_bias(hidden, inter, vb.pp("up_proj"))?;
            let gate_up_w = Tensor::cat(&[gate_proj.weight(), up_proj.weight()], 0)?;
            MlpGateUp::Merged {
                gate_up_proj: Linear::new(gate_up_w, None),
                intermediate_size: inter,
            }
        };
        Ok(Self { gate_up, down_proj })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match &self.gate_up {
            MlpGateUp::Merged {
                gate_up_proj,
                intermediate_size,
            } => {
                let gu = gate_up_proj.forward(x)?;
                let gate = gu.narrow(D::Minus1, 0, *intermediate_size)?;
                let up = gu.narrow(D::Minus1, *intermediate_size, *intermediate_size)?;
                let gate = candle_nn::Activation::Silu.forward(&gate)?;
                self.down_proj.forward(&(gate * up)?)
            }
            MlpGateUp::Separate { gate_proj, up_proj } => {
                let gate = candle_nn::Activation::Silu.forward(&gate_proj.forward(x)?)?;
                let up = up_proj.forward(x)?;
                self.down_proj.forward(&(gate * up)?)
            }
        }
    }
}

// ── Decoder Layer ───────────────────────────────────────────────────────

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(
        config: &LlamaConfig,
        kernel: Arc<dyn AttentionKernel>,
        quantize: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let self_attn = Attention::new(config, kernel, quantize, vb.pp("self_attn"))?;
        let mlp = Mlp::new(config, quantize, vb.pp("mlp"))?;
        let input_layernorm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb.pp("input_layernorm"))?;
        let post_attention_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;
        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &mut self,
        hidden_states: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let residual = hidden_states;
        let hidden_states = self.input_layernorm.forward(hidden_states)?;
        let hidden_states = self
            .self_attn
            .forward(&hidden_states, cos, sin, attention_mask)?;
        let hidden_states = (residual + hidden_states)?;

        let residual = &hidden_states;
        let hidden_states = self.post_attention_layernorm.forward(&hidden_states)?;
        let hidden_states = self.mlp.forward(&hidden_states)?;
        residual + hidden_states
    }
}

// ── Full Model ──────────────────────────────────────────────────────────

/// Per-layer `(k, v)` history of one sequence.
pub type KvCaches = Vec<Option<(Tensor, Tensor)>>;

pub struct LlamaModel {
    embed_tokens: candle_nn::Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    lm_head: LinearLayer,
    rotary_emb: RotaryEmbedding,
    config: LlamaConfig,
    dtype: DType,
    device: Device,
}

impl LlamaModel {
    /// Build from checkpoint weights. `quantize` turns every attention and MLP
    /// projection into a Q8_0 matmul.
    pub fn new(config: &LlamaConfig, vb: VarBuilder, patches: &PatchSet, quantize: bool) -> Result<Self> {
        let dtype = vb.dtype();
        let device = vb.device().clone();
        let model_vb = vb.pp("model");
        let embed_tokens =
            candle_nn::embedding(config.vocab_size, config.hidden_size, model_vb.pp("embed_tokens"))?;

        let kernel = patches.attention_kernel();
        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        let layers_vb = model_vb.pp("layers");
        for i in 0..config.num_hidden_layers {
            layers.push(DecoderLayer::new(config, kernel.clone(), quantize, layers_vb.pp(i))?);
        }

        let norm = candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, model_vb.pp("norm"))?;

        let lm_head = if config.tie_word_embeddings {
            LinearLayer::Standard(Linear::new(embed_tokens.embeddings().clone(), None))
        } else {
            LinearLayer::Standard(linear_no_bias(
                config.hidden_size,
                config.vocab_size,
                vb.pp("lm_head"),
            )?)
        };

        let rotary_emb = RotaryEmbedding::new(config, patches.position_scaling(), &device);

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            lm_head,
            rotary_emb,
            config: config.clone(),
            dtype,
            device,
        })
    }

    // ── Forward ─────────────────────────────────────────────────────────

    /// Logits `[B, 1, vocab]` for the last position of `input_ids`.
    pub fn forward(&mut self, input_ids: &Tensor, start_pos: usize) -> Result<Tensor> {
        let (_b_sz, seq_len) = input_ids.dims2()?;
        let hidden_states = self.embed_tokens.forward(input_ids)?.to_dtype(self.dtype)?;

        let total_len = start_pos + seq_len;
        let (full_cos, full_sin) = self.rotary_emb.forward(total_len)?;
        let cos = full_cos.narrow(0, start_pos, seq_len)?.to_dtype(self.dtype)?;
        let sin = full_sin.narrow(0, start_pos, seq_len)?.to_dtype(self.dtype)?;

        let attention_mask = if seq_len > 1 {
            Some(causal_mask(seq_len, start_pos, input_ids.device(), self.dtype)?)
        } else {
            None
        };

        let mut hidden_states = hidden_states;
        for layer in self.layers.iter_mut() {
            hidden_states = layer.forward(&hidden_states, &cos, &sin, attention_mask.as_ref())?;
        }

        let hidden_states = self.norm.forward(&hidden_states)?;
        self.lm_head
            .forward(&hidden_states.narrow(1, seq_len - 1, 1)?)
    }

    // ── KV Cache Management ─────────────────────────────────────────────

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.clear_kv_cache();
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Valid portion of every layer's cache (views into the buffer).
    pub fn get_kv_caches(&self) -> Result<KvCaches> {
        self.layers
            .iter()
            .map(|l| {
                let len = l.self_attn.cache_seq_len;
                match l.self_attn.kv_cache {
                    Some((ref k, ref v)) => Ok(Some((k.narrow(2, 0, len)?, v.narrow(2, 0, len)?))),
                    None => Ok(None),
                }
            })
            .collect()
    }

    pub fn set_kv_caches(&mut self, caches: KvCaches) -> Result<()> {
        for (layer, cache) in self.layers.iter_mut().zip(caches) {
            let seq_len = match cache {
                Some((ref k, _)) => k.dim(2)?,
                None => 0,
            };
            layer.self_attn.kv_cache = cache;
            layer.self_attn.cache_seq_len = seq_len;
        }
        Ok(())
    }

    // ── Batched Decode ──────────────────────────────────────────────────

    /// Right-align per-sequence caches into one padded batch buffer.
    ///
    /// Returns `(kv_lens, max_kv_len)`.
    pub fn setup_batch_decode(
        &mut self,
        seq_kv_caches: &[KvCaches],
        extra_room: usize,
    ) -> Result<(Vec<usize>, usize)> {
        let kv_heads = self.config.num_kv_heads();
        let head_dim = self.config.head_dim();

        let mut kv_lens = Vec::with_capacity(seq_kv_caches.len());
        for caches in seq_kv_caches {
            let len = match caches.first() {
                Some(Some((k, _))) => k.dim(2)?,
                _ => 0,
            };
            kv_lens.push(len);
        }
        let max_kv_len = kv_lens.iter().copied().max().unwrap_or(0);

        for (layer_idx, layer) in self.layers.iter_mut().enumerate() {
            let layer_caches: Vec<&Option<(Tensor, Tensor)>> =
                seq_kv_caches.iter().map(|seq| &seq[layer_idx]).collect();

            let batched_kv = pad_and_stack_kv_caches(
                &layer_caches,
                max_kv_len,
                kv_heads,
                head_dim,
                &self.device,
                self.dtype,
            )?;

            match batched_kv {
                Some((k, v)) => {
                    let (b, h, s, d) = k.dims4()?;
                    let buf_k = Tensor::zeros((b, h, s + extra_room, d), k.dtype(), k.device())?;
                    let buf_v = Tensor::zeros((b, h, s + extra_room, d), v.dtype(), v.device())?;
                    buf_k.slice_set(&k, 2, 0)?;
                    buf_v.slice_set(&v, 2, 0)?;
                    layer.self_attn.kv_cache = Some((buf_k, buf_v));
                    layer.self_attn.cache_seq_len = max_kv_len;
                }
                None => layer.self_attn.clear_kv_cache(),
            }
        }

        Ok((kv_lens, max_kv_len))
    }

    /// One decode step for every sequence of the batch. `positions[i]` is the
    /// rotary position of sequence `i`'s new token. Returns `[N, 1, vocab]`.
    pub fn step_batch_decode(
        &mut self,
        input_ids: &Tensor,
        positions: &[usize],
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let n = positions.len();
        let hidden_states = self.embed_tokens.forward(input_ids)?.to_dtype(self.dtype)?;

        let (cos, sin) = self.rotary_emb.rows_at(positions)?;
        let head_dim = self.config.head_dim();
        let cos = cos.to_dtype(self.dtype)?.reshape((n, 1, 1, head_dim))?;
        let sin = sin.to_dtype(self.dtype)?.reshape((n, 1, 1, head_dim))?;

        let mut hidden_states = hidden_states;
        for layer in self.layers.iter_mut() {
            hidden_states = layer.forward(&hidden_states, &cos, &sin, attention_mask)?;
        }

        let hidden_states = self.norm.forward(&hidden_states)?;
        self.lm_head.forward(&hidden_states)
    }

    /// Split the padded batch buffer back into per-sequence caches and drop it.
    pub fn extract_batch_kv(
        &mut self,
        kv_lens: &[usize],
        original_max_kv: usize,
        rounds_done: usize,
    ) -> Result<Vec<KvCaches>> {
        let n_seqs = kv_lens.len();
        let num_layers = self.layers.len();
        let mut result: Vec<KvCaches> = (0..n_seqs).map(|_| Vec::with_capacity(num_layers)).collect();

        for layer in self.layers.iter_mut() {
            if let Some((ref full_k, ref full_v)) = layer.self_attn.kv_cache {
                for (i, seq) in result.iter_mut().enumerate() {
                    let total = kv_lens[i] + rounds_done;
                    let offset = original_max_kv - kv_lens[i];
                    // Contiguous copy so the padded batch buffer can be freed.
                    seq.push(Some((
                        full_k.narrow(0, i, 1)?.narrow(2, offset, total)?.contiguous()?,
                        full_v.narrow(0, i, 1)?.narrow(2, offset, total)?.contiguous()?,
                    )));
                }
            } else {
                for seq in result.iter_mut() {
                    seq.push(None);
                }
            }
            layer.self_attn.clear_kv_cache();
        }

        Ok(result)
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Rows of the input embedding matrix.
    pub fn embedding_rows(&self) -> Result<usize> {
        self.embed_tokens.embeddings().dim(0)
    }

    pub fn quantized_projections(&self) -> usize {
        self.layers
            .iter()
            .map(|l| {
                [&l.self_attn.q_proj, &l.self_attn.k_proj, &l.self_attn.v_proj, &l.self_attn.o_proj]
                    .iter()
                    .filter(|p| p.is_quantized())
                    .count()
            })
            .sum()
    }
}

// ── Utilities ───────────────────────────────────────────────────────────

/// Additive causal mask `[1, 1, seq_len, start_pos + seq_len]`.
fn causal_mask(seq_len: usize, start_pos: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let total_len = start_pos + seq_len;
    let mut mask_data = vec![0f32; seq_len * total_len];
    for i in 0..seq_len {
        for j in (start_pos + i + 1)..total_len {
            mask_data[i * total_len + j] = -1e9;
        }
    }
    Tensor::from_vec(mask_data, (1, 1, seq_len, total_len), device)?.to_dtype(dtype)
}

/// Padding mask for batched decode: `[N, 1, 1, total_width]`, or `None` when
/// no sequence is padded.
pub fn build_batch_decode_mask(
    kv_lens: &[usize],
    original_max_kv: usize,
    total_width: usize,
    device: &Device,
    dtype: DType,
) -> Result<Option<Tensor>> {
    if kv_lens.iter().all(|&l| l == original_max_kv) {
        return Ok(None);
    }
    let n = kv_lens.len();
    let mut mask_data = vec![0f32; n * total_width];
    for (i, &len) in kv_lens.iter().enumerate() {
        let pad_end = (original_max_kv - len).min(total_width);
        for j in 0..pad_end {
            mask_data[i * total_width + j] = -1e9;
        }
    }
    let mask = Tensor::from_vec(mask_data, (n, 1, 1, total_width), device)?;
    mask.to_dtype(dtype)
        .map(Some)
}

/// Left-pad per-sequence caches to `max_len` and stack along the batch dim.
fn pad_and_stack_kv_caches(
    caches: &[&Option<(Tensor, Tensor)>],
    max_len: usize,
    kv_heads: usize,
    head_dim: usize,
    device: &Device,
    dtype: DType,
) -> Result<Option<(Tensor, Tensor)>> {
    if max_len == 0 {
        return Ok(None);
    }

    let mut padded_ks = Vec::with_capacity(caches.len());
    let mut padded_vs = Vec::with_capacity(caches.len());
    for cache in caches {
        match cache {
            Some((k, v)) => {
                let pad_len = max_len - k.dim(2)?;
                if pad_len > 0 {
                    let pad = Tensor::zeros((1, kv_heads, pad_len, head_dim), dtype, device)?;
                    padded_ks.push(Tensor::cat(&[&pad, k], 2)?);
                    padded_vs.push(Tensor::cat(&[&pad, v], 2)?);
                } else {
                    padded_ks.push(k.clone());
                    padded_vs.push(v.clone());
                }
            }
            None => {
                let zeros = Tensor::zeros((1, kv_heads, max_len, head_dim), dtype, device)?;
                padded_ks.push(zeros.clone());
                padded_vs.push(zeros);
            }
        }
    }

    let stacked_k = Tensor::cat(&padded_ks, 0)?.contiguous()?;
    let stacked_v = Tensor::cat(&padded_vs, 0)?.contiguous()?;
    Ok(Some((stacked_k, stacked_v)))
}
