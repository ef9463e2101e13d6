pub mod llama;

pub use candle_core::{DType, Device};
