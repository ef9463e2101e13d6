//! # alpaca-core
//!
//! Instruction-following inference for LLaMA checkpoints on top of
//! [Candle](https://github.com/huggingface/candle).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |---|---|
//! | [`patches`] | Attention kernel selection and NTK rotary scaling, installed at model construction |
//! | [`models`] | LLaMA transformer with a preallocated KV cache and batched decode |
//! | [`loader`] | Checkpoint resolution, vocabulary resize, LoRA merge, 8-bit projections |
//! | [`generation`] | Sampling parameters, the pipeline trait and the direct backend |
//! | [`serving`] | Continuous-batching engines, one thread per device |
//! | [`prompt`] | Instruction prompt template |
//! | [`session`] | Interactive and batch sessions, prediction files |
//! | [`config`] | Command line arguments and validation |
//!
//! ## Feature flags
//!
//! | Flag | Effect |
//! |---|---|
//! | `cuda` | CUDA devices |
//! | `metal` | Metal devices |
//! | `flash-attn` | Flash attention kernel for the memory-efficient attention patch (implies `cuda`) |
//! | `accelerate` | Link against Apple Accelerate for CPU BLAS |
//! | `mkl` | Link against Intel MKL for CPU BLAS |

pub mod config;
pub mod error;
pub mod generation;
pub mod loader;
pub mod models;
pub mod patches;
pub mod prompt;
pub mod serving;
pub mod session;
pub mod utils;

pub use config::{InferenceArgs, RunConfig};
pub use error::{InferError, InferResult};
