use candle_core::{DType, Device, Tensor};
use tokenizers::Tokenizer;

use super::modeling::{KvCaches, LlamaConfig, LlamaModel};
use crate::error::{InferError, InferResult};

/// Special tokens tried, in order, when resolving the end-of-sequence id.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>"];

/// A loaded, patched model on one device together with its tokenizer.
///
/// Weights are plain tensors, so nothing here records gradients; the handle is
/// inference-only for its whole lifetime.
pub struct ModelHandle {
    pub tokenizer: Tokenizer,
    pub device: Device,
    pub dtype: DType,
    inner: LlamaModel,
}

impl ModelHandle {
    pub fn new(inner: LlamaModel, tokenizer: Tokenizer) -> Self {
        Self {
            device: inner.device().clone(),
            dtype: inner.dtype(),
            tokenizer,
            inner,
        }
    }

    pub fn config(&self) -> &LlamaConfig {
        self.inner.config()
    }

    pub fn model(&self) -> &LlamaModel {
        &self.inner
    }

    pub fn encode(&self, text: &str) -> InferResult<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(InferError::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> InferResult<String> {
        self.tokenizer.decode(ids, true).map_err(InferError::tokenizer)
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        EOS_CANDIDATES
            .iter()
            .find_map(|t| self.tokenizer.token_to_id(t))
            .or_else(|| self.config().eos_token_id.as_ref().and_then(|e| e.first()))
    }

    /// Run a single forward step, returning `[1, 1, vocab]` logits.
    pub fn forward_step(&mut self, input_ids: &[u32], start_pos: usize) -> candle_core::Result<Tensor> {
        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        self.inner.forward(&input, start_pos)
    }

    pub fn clear_kv_cache(&mut self) {
        self.inner.clear_kv_cache();
    }

    // ── KV cache management (for the serving engine) ────────────────────

    pub fn num_layers(&self) -> usize {
        self.inner.num_layers()
    }

    pub fn get_kv_caches(&self) -> candle_core::Result<KvCaches> {
        self.inner.get_kv_caches()
    }

    pub fn set_kv_caches(&mut self, caches: KvCaches) -> candle_core::Result<()> {
        self.inner.set_kv_caches(caches)
    }

    pub fn setup_batch_decode(
        &mut self,
        seq_kv_caches: &[KvCaches],
        extra_room: usize,
    ) -> candle_core::Result<(Vec<usize>, usize)> {
        self.inner.setup_batch_decode(seq_kv_caches, extra_room)
    }

    pub fn step_batch_decode(
        &mut self,
        tokens: &[u32],
        positions: &[usize],
        attention_mask: Option<&Tensor>,
    ) -> candle_core::Result<Tensor> {
        let n = positions.len();
        let input = Tensor::new(tokens, &self.device)?.reshape((n, 1))?;
        self.inner.step_batch_decode(&input, positions, attention_mask)
    }

    pub fn extract_batch_kv(
        &mut self,
        kv_lens: &[usize],
        original_max_kv: usize,
        rounds_done: usize,
    ) -> candle_core::Result<Vec<KvCaches>> {
        self.inner
            .extract_batch_kv(kv_lens, original_max_kv, rounds_done)
    }
}
