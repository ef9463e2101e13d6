pub mod model;
pub mod modeling;

pub use model::ModelHandle;
pub use modeling::{EosTokenId, KvCaches, LlamaConfig, LlamaModel, LinearLayer};
