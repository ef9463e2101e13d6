use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use candle_core::Tensor;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::scheduler::{Scheduler, SchedulerOutput, SeqId};
use super::sequence::{Sequence, SequenceStatus};
use crate::error::{InferError, InferResult};
use crate::generation::{GenerationConfig, Sampler};
use crate::models::llama::modeling::build_batch_decode_mask;
use crate::models::llama::ModelHandle;

// ── Public types shared between the engine thread and its callers ──

/// A tokenized prompt plus the sampling parameters it runs with.
pub struct EngineRequest {
    pub tokens: Vec<u32>,
    pub config: GenerationConfig,
    pub response_tx: mpsc::UnboundedSender<EngineResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineResponse {
    /// Generation finished; `text` is the completion only.
    Finished {
        text: String,
        prompt_tokens: usize,
        completion_tokens: usize,
        finish_reason: String,
    },
    Error(String),
}

/// Cloneable sender side of one engine.
#[derive(Clone)]
pub struct EngineHandle {
    request_tx: mpsc::UnboundedSender<EngineRequest>,
}

impl EngineHandle {
    /// Queue a prompt. The returned receiver yields exactly one response.
    pub fn submit(
        &self,
        tokens: Vec<u32>,
        config: &GenerationConfig,
    ) -> InferResult<mpsc::UnboundedReceiver<EngineResponse>> {
        let (response_tx, response_rx) = mpsc::unbounded_channel();
        self.request_tx
            .send(EngineRequest {
                tokens,
                config: config.clone(),
                response_tx,
            })
            .map_err(|_| InferError::Engine("engine thread has shut down".into()))?;
        Ok(response_rx)
    }
}

#[derive(Default)]
pub struct EngineStats {
    pub total_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub total_prompt_tokens: AtomicU64,
    pub total_completion_tokens: AtomicU64,
    pub total_prefill_time_us: AtomicU64,
    pub total_decode_steps: AtomicU64,
    pub total_decode_time_us: AtomicU64,
}

impl EngineStats {
    fn rate(count: u64, micros: u64) -> f64 {
        if micros > 0 {
            count as f64 / (micros as f64 / 1_000_000.0)
        } else {
            0.0
        }
    }

    pub fn prefill_tokens_per_sec(&self) -> f64 {
        Self::rate(
            self.total_prompt_tokens.load(Ordering::Relaxed),
            self.total_prefill_time_us.load(Ordering::Relaxed),
        )
    }

    pub fn decode_tokens_per_sec(&self) -> f64 {
        Self::rate(
            self.total_decode_steps.load(Ordering::Relaxed),
            self.total_decode_time_us.load(Ordering::Relaxed),
        )
    }
}

// ── Inference engine ──

/// Continuous-batching engine owning one model replica.
///
/// Runs on a dedicated OS thread (forward passes are synchronous) and talks
/// to callers through channels.
///
/// ```text
/// callers ──(request channel)──► engine thread
///     ◄──(per-request response channel)──┘
///
/// each step:
///   1. drain new requests
///   2. scheduler picks prefill (one sequence) or decode (all running)
///   3. prefill: full prompt through the model's own KV cache
///   4. decode: pad + stack every running sequence's cache once, run up to
///      `decode_rounds` batched forwards, split the caches back once
///   5. idle: block until a request arrives or every handle is dropped
/// ```
pub struct InferenceEngine {
    model: ModelHandle,
    sequences: HashMap<SeqId, Sequence>,
    scheduler: Scheduler,
    request_rx: mpsc::UnboundedReceiver<EngineRequest>,
    active_seq_id: Option<SeqId>,
    num_layers: usize,
    next_id: SeqId,
    stats: EngineStats,
    decode_rounds: usize,
    start_time: Instant,
}

impl InferenceEngine {
    pub fn new(model: ModelHandle, max_concurrent: usize, decode_rounds: usize) -> (Self, EngineHandle) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let num_layers = model.num_layers();
        let engine = Self {
            model,
            sequences: HashMap::new(),
            scheduler: Scheduler::new(max_concurrent),
            request_rx,
            active_seq_id: None,
            num_layers,
            next_id: 0,
            stats: EngineStats::default(),
            decode_rounds: decode_rounds.max(1),
            start_time: Instant::now(),
        };
        (engine, EngineHandle { request_tx })
    }

    /// Run the engine loop until every handle has been dropped and all
    /// queued work is done. Blocking.
    pub fn run(mut self) {
        info!(
            max_concurrent = self.scheduler.max_running,
            decode_rounds = self.decode_rounds,
            device = ?self.model.device,
            "engine started"
        );

        loop {
            self.drain_requests();
            match self.scheduler.schedule() {
                Some(output) => self.execute_step(output),
                None => match self.request_rx.blocking_recv() {
                    Some(req) => self.accept_request(req),
                    None => {
                        self.log_stats();
                        return;
                    }
                },
            }
        }
    }

    fn log_stats(&self) {
        info!(
            uptime_s = self.start_time.elapsed().as_secs(),
            requests = self.stats.total_requests.load(Ordering::Relaxed),
            completed = self.stats.completed_requests.load(Ordering::Relaxed),
            failed = self.stats.failed_requests.load(Ordering::Relaxed),
            prompt_tokens = self.stats.total_prompt_tokens.load(Ordering::Relaxed),
            completion_tokens = self.stats.total_completion_tokens.load(Ordering::Relaxed),
            prefill_tok_s = format!("{:.1}", self.stats.prefill_tokens_per_sec()),
            decode_tok_s = format!("{:.1}", self.stats.decode_tokens_per_sec()),
            "engine stopped"
        );
    }

    // ── Request handling ──

    fn drain_requests(&mut self) {
        while let Ok(req) = self.request_rx.try_recv() {
            self.accept_request(req);
        }
    }

    fn accept_request(&mut self, req: EngineRequest) {
        let id = self.next_id;
        self.next_id += 1;
        let prompt_len = req.tokens.len();

        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        if prompt_len == 0 {
            self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
            let _ = req
                .response_tx
                .send(EngineResponse::Error("empty prompt".to_string()));
            return;
        }
        self.stats
            .total_prompt_tokens
            .fetch_add(prompt_len as u64, Ordering::Relaxed);

        debug!(
            id,
            prompt_len,
            max_tokens = req.config.max_new_tokens,
            waiting = self.scheduler.waiting.len() + 1,
            running = self.scheduler.running.len(),
            "request accepted"
        );

        let seq = Sequence {
            id,
            status: SequenceStatus::Waiting,
            tokens: req.tokens,
            prompt_len,
            kv_caches: vec![None; self.num_layers],
            sampler: Sampler::new(&req.config),
            max_tokens: req.config.max_new_tokens,
            eos_token_id: self.model.eos_token_id(),
            response_tx: req.response_tx,
        };
        self.sequences.insert(id, seq);
        self.scheduler.add(id);
    }

    // ── Step execution ──

    fn execute_step(&mut self, output: SchedulerOutput) {
        if output.is_prefill {
            for seq_id in output.batch {
                self.step_prefill(seq_id);
            }
        } else {
            self.step_decode_batch(output.batch);
        }
    }

    fn step_prefill(&mut self, seq_id: SeqId) {
        let t0 = Instant::now();
        if let Err(e) = self.try_prefill(seq_id) {
            self.send_error(seq_id, &format!("prefill failed: {e}"));
            return;
        }
        let prefill_us = t0.elapsed().as_micros() as u64;
        self.stats
            .total_prefill_time_us
            .fetch_add(prefill_us, Ordering::Relaxed);

        let should_stop = self.sequences.get(&seq_id).map_or(true, Sequence::should_stop);
        if should_stop {
            self.finish_sequence(seq_id);
        } else {
            self.scheduler.promote_to_running(seq_id);
        }
    }

    fn try_prefill(&mut self, seq_id: SeqId) -> InferResult<()> {
        self.swap_in(seq_id)?;
        let (input_ids, start_pos) = {
            let seq = self.sequence(seq_id)?;
            (seq.next_input_ids().to_vec(), seq.start_pos())
        };
        let logits = self.model.forward_step(&input_ids, start_pos)?;
        let next_token = self.sample(seq_id, &logits)?;
        let caches = self.model.get_kv_caches()?;

        let seq = self.sequence_mut(seq_id)?;
        seq.kv_caches = caches;
        seq.tokens.push(next_token);
        seq.status = SequenceStatus::Running;
        debug!(id = seq_id, prompt_len = input_ids.len(), "prefill complete");
        Ok(())
    }

    /// Batched decode over `batch`.
    ///
    /// Finished sequences stay in the batch tensor until the step ends (lazy
    /// eviction); caches are split back exactly once.
    fn step_decode_batch(&mut self, batch: Vec<SeqId>) {
        let t0 = Instant::now();
        let batch: Vec<SeqId> = batch
            .into_iter()
            .filter(|id| self.sequences.contains_key(id))
            .collect();
        if batch.is_empty() {
            return;
        }

        match self.try_decode_batch(&batch) {
            Ok(summary) => {
                let decode_us = t0.elapsed().as_micros() as u64;
                self.stats
                    .total_decode_time_us
                    .fetch_add(decode_us, Ordering::Relaxed);
                debug!(
                    batch_size = batch.len(),
                    tokens = summary.tokens,
                    rounds = summary.rounds,
                    finished = summary.finished.len(),
                    decode_ms = decode_us / 1000,
                    "batched decode step complete"
                );
                for id in summary.finished {
                    self.finish_sequence(id);
                }
            }
            Err(e) => {
                error!("batched decode failed: {e}");
                self.model.clear_kv_cache();
                for id in batch {
                    self.send_error(id, &format!("batched decode failed: {e}"));
                }
            }
        }
    }

    fn try_decode_batch(&mut self, batch: &[SeqId]) -> InferResult<DecodeSummary> {
        // The model may still hold the cache of the last prefilled sequence.
        if let Some(prev_id) = self.active_seq_id.take() {
            let caches = self.model.get_kv_caches()?;
            if let Some(seq) = self.sequences.get_mut(&prev_id) {
                seq.kv_caches = caches;
            }
            self.model.clear_kv_cache();
        }

        let kv_caches = batch
            .iter()
            .map(|&id| self.sequence(id).map(|s| s.kv_caches.clone()))
            .collect::<InferResult<Vec<_>>>()?;
        let (kv_lens, original_max_kv) = self.model.setup_batch_decode(&kv_caches, self.decode_rounds)?;
        drop(kv_caches);

        let full_mask = build_batch_decode_mask(
            &kv_lens,
            original_max_kv,
            original_max_kv + self.decode_rounds,
            &self.model.device,
            self.model.dtype,
        )?;

        let mut positions = Vec::with_capacity(batch.len());
        let mut last_tokens = Vec::with_capacity(batch.len());
        for &id in batch {
            let seq = self.sequence(id)?;
            positions.push(seq.start_pos());
            last_tokens.push(seq.tokens.last().copied().unwrap_or(0));
        }

        let mut alive = vec![true; batch.len()];
        let mut summary = DecodeSummary::default();

        for round in 0..self.decode_rounds {
            if alive.iter().all(|a| !a) {
                break;
            }
            let mask = match full_mask {
                Some(ref full) => Some(full.narrow(3, 0, original_max_kv + round + 1)?),
                None => None,
            };
            // Dead slots replay their last token; their logits are ignored.
            let logits = self
                .model
                .step_batch_decode(&last_tokens, &positions, mask.as_ref())?;
            summary.rounds += 1;

            for (i, &id) in batch.iter().enumerate() {
                if !alive[i] {
                    continue;
                }
                let next_token = self.sample(id, &logits.narrow(0, i, 1)?)?;
                let seq = self.sequence_mut(id)?;
                seq.tokens.push(next_token);
                last_tokens[i] = next_token;
                summary.tokens += 1;
                if seq.should_stop() {
                    alive[i] = false;
                    summary.finished.push(id);
                }
            }
            self.stats
                .total_decode_steps
                .fetch_add(alive.len() as u64, Ordering::Relaxed);

            for p in positions.iter_mut() {
                *p += 1;
            }
        }

        let extracted = self
            .model
            .extract_batch_kv(&kv_lens, original_max_kv, summary.rounds)?;
        for ((&id, caches), is_alive) in batch.iter().zip(extracted).zip(&alive) {
            if *is_alive {
                self.sequence_mut(id)?.kv_caches = caches;
            }
        }
        Ok(summary)
    }

    // ── KV cache management ──

    /// Load a sequence's cache into the model, saving the current one first.
    fn swap_in(&mut self, seq_id: SeqId) -> InferResult<()> {
        if self.active_seq_id == Some(seq_id) {
            return Ok(());
        }
        if let Some(prev_id) = self.active_seq_id.take() {
            let caches = self.model.get_kv_caches()?;
            if let Some(prev) = self.sequences.get_mut(&prev_id) {
                prev.kv_caches = caches;
            }
        }
        let caches = self.sequence(seq_id)?.kv_caches.clone();
        self.model.set_kv_caches(caches)?;
        self.active_seq_id = Some(seq_id);
        Ok(())
    }

    fn sample(&mut self, seq_id: SeqId, logits: &Tensor) -> InferResult<u32> {
        let seq = self.sequence_mut(seq_id)?;
        Ok(seq.sampler.sample(logits, &seq.tokens, seq.prompt_len)?)
    }

    fn sequence(&self, seq_id: SeqId) -> InferResult<&Sequence> {
        self.sequences
            .get(&seq_id)
            .ok_or_else(|| InferError::Engine(format!("unknown sequence {seq_id}")))
    }

    fn sequence_mut(&mut self, seq_id: SeqId) -> InferResult<&mut Sequence> {
        self.sequences
            .get_mut(&seq_id)
            .ok_or_else(|| InferError::Engine(format!("unknown sequence {seq_id}")))
    }

    // ── Responses ──

    fn send_error(&mut self, seq_id: SeqId, msg: &str) {
        error!(id = seq_id, "engine error: {msg}");
        if let Some(seq) = self.sequences.get(&seq_id) {
            let _ = seq.response_tx.send(EngineResponse::Error(msg.to_string()));
        }
        self.stats.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.cleanup_sequence(seq_id);
    }

    fn finish_sequence(&mut self, seq_id: SeqId) {
        let Some(seq) = self.sequences.get(&seq_id) else {
            return;
        };
        let completion_tokens = seq.num_generated();
        let response = match self.model.decode(&seq.tokens[seq.prompt_len..]) {
            Ok(text) => EngineResponse::Finished {
                text,
                prompt_tokens: seq.prompt_len,
                completion_tokens,
                finish_reason: seq.finish_reason().to_string(),
            },
            Err(e) => EngineResponse::Error(format!("decoding completion failed: {e}")),
        };
        debug!(
            id = seq_id,
            prompt_tokens = seq.prompt_len,
            completion_tokens,
            finish_reason = seq.finish_reason(),
            "sequence finished"
        );
        let _ = seq.response_tx.send(response);

        self.stats
            .total_completion_tokens
            .fetch_add(completion_tokens as u64, Ordering::Relaxed);
        self.stats.completed_requests.fetch_add(1, Ordering::Relaxed);
        self.cleanup_sequence(seq_id);
    }

    fn cleanup_sequence(&mut self, seq_id: SeqId) {
        self.sequences.remove(&seq_id);
        self.scheduler.remove(seq_id);
        if self.active_seq_id == Some(seq_id) {
            self.model.clear_kv_cache();
            self.active_seq_id = None;
        }
    }
}

#[derive(Default)]
struct DecodeSummary {
    rounds: usize,
    tokens: u64,
    finished: Vec<SeqId>,
}
