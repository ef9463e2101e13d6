use tokio::sync::mpsc;

use super::engine::EngineResponse;
use super::scheduler::SeqId;
use crate::generation::Sampler;
use crate::models::llama::KvCaches;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    /// Queued, waiting for prefill.
    Waiting,
    /// Decoding; `kv_caches` holds the prompt and generated tokens so far.
    Running,
}

/// A single in-flight generation request managed by the engine.
pub struct Sequence {
    pub id: SeqId,
    pub status: SequenceStatus,

    /// Prompt followed by generated tokens.
    pub tokens: Vec<u32>,
    pub prompt_len: usize,

    /// Saved per-layer caches while the sequence is not loaded in the model.
    pub kv_caches: KvCaches,

    pub sampler: Sampler,
    pub max_tokens: usize,
    pub eos_token_id: Option<u32>,

    pub response_tx: mpsc::UnboundedSender<EngineResponse>,
}

impl Sequence {
    pub fn num_generated(&self) -> usize {
        self.tokens.len().saturating_sub(self.prompt_len)
    }

    fn ended_on_eos(&self) -> bool {
        self.num_generated() > 0
            && self.eos_token_id.is_some()
            && self.tokens.last().copied() == self.eos_token_id
    }

    pub fn should_stop(&self) -> bool {
        self.num_generated() >= self.max_tokens || self.ended_on_eos()
    }

    /// Number of positions already covered by the KV cache at the next forward.
    pub fn start_pos(&self) -> usize {
        match self.status {
            SequenceStatus::Waiting => 0,
            SequenceStatus::Running => self.tokens.len().saturating_sub(1),
        }
    }

    /// Prompt during prefill, last token during decode.
    pub fn next_input_ids(&self) -> &[u32] {
        match self.status {
            SequenceStatus::Waiting => &self.tokens[..self.prompt_len],
            SequenceStatus::Running => &self.tokens[self.tokens.len().saturating_sub(1)..],
        }
    }

    pub fn finish_reason(&self) -> &'static str {
        if self.ended_on_eos() {
            "stop"
        } else {
            "length"
        }
    }
}
