//! Serving backend: continuous-batching engines, one per device.
//!
//! Each [`ModelHandle`] becomes a replica running [`engine::InferenceEngine`]
//! on its own thread. [`ServingPipeline`] tokenizes prompts on the caller's
//! thread, spreads them round-robin over the replicas and reassembles the
//! completions in input order.

pub mod engine;
pub mod scheduler;
pub mod sequence;

use std::thread::JoinHandle;
use std::time::Instant;

use tokenizers::Tokenizer;
use tracing::{error, info};

use crate::error::{InferError, InferResult};
use crate::generation::{BackendKind, GenerationConfig, GenerationPipeline};
use crate::models::llama::ModelHandle;
use engine::{EngineHandle, EngineResponse, InferenceEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServingOptions {
    /// Sequences decoded together by one replica.
    pub max_concurrent: usize,
    /// Batched decode rounds per scheduling step.
    pub decode_rounds: usize,
}

impl Default for ServingOptions {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            decode_rounds: 16,
        }
    }
}

struct Replica {
    handle: EngineHandle,
    thread: JoinHandle<()>,
}

pub struct ServingPipeline {
    replicas: Vec<Replica>,
    tokenizer: Tokenizer,
    next_replica: usize,
}

impl ServingPipeline {
    pub fn new(handles: Vec<ModelHandle>, options: ServingOptions) -> InferResult<Self> {
        let tokenizer = match handles.first() {
            Some(h) => h.tokenizer.clone(),
            None => return Err(InferError::config("serving backend needs at least one device")),
        };

        let mut replicas = Vec::with_capacity(handles.len());
        for (idx, model) in handles.into_iter().enumerate() {
            let (engine, handle) = InferenceEngine::new(model, options.max_concurrent, options.decode_rounds);
            let thread = std::thread::Builder::new()
                .name(format!("inference-engine-{idx}"))
                .spawn(move || engine.run())?;
            replicas.push(Replica { handle, thread });
        }
        info!(
            replicas = replicas.len(),
            max_concurrent = options.max_concurrent,
            decode_rounds = options.decode_rounds,
            "serving engines started"
        );

        Ok(Self {
            replicas,
            tokenizer,
            next_replica: 0,
        })
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    fn encode(&self, text: &str) -> InferResult<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(InferError::tokenizer)?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl Drop for ServingPipeline {
    /// Closing the request channels stops the engines once their queues drain.
    fn drop(&mut self) {
        for replica in self.replicas.drain(..) {
            drop(replica.handle);
            if replica.thread.join().is_err() {
                error!("engine thread panicked");
            }
        }
    }
}

impl GenerationPipeline for ServingPipeline {
    fn backend(&self) -> BackendKind {
        BackendKind::Serving
    }

    fn generate(&mut self, texts: &[String], config: &GenerationConfig) -> InferResult<Vec<String>> {
        let start = Instant::now();
        let mut receivers = Vec::with_capacity(texts.len());
        for text in texts {
            let tokens = self.encode(text)?;
            let replica = &self.replicas[self.next_replica % self.replicas.len()];
            self.next_replica = (self.next_replica + 1) % self.replicas.len();
            receivers.push(replica.handle.submit(tokens, config)?);
        }

        let mut outputs = Vec::with_capacity(texts.len());
        let mut completion_tokens = 0usize;
        for mut rx in receivers {
            match rx.blocking_recv() {
                Some(EngineResponse::Finished {
                    text,
                    completion_tokens: n,
                    ..
                }) => {
                    completion_tokens += n;
                    outputs.push(text);
                }
                Some(EngineResponse::Error(msg)) => return Err(InferError::Engine(msg)),
                None => return Err(InferError::Engine("engine dropped the request".into())),
            }
        }

        let dt = start.elapsed().as_secs_f64();
        info!(
            prompts = texts.len(),
            completion_tokens,
            tokens_per_sec = format!("{:.2}", completion_tokens as f64 / dt.max(1e-9)),
            "serving batch finished"
        );
        Ok(outputs)
    }

    fn effective_config(&self, config: &GenerationConfig) -> serde_json::Value {
        serde_json::to_value(config.to_serving_params()).unwrap_or(serde_json::Value::Null)
    }
}
