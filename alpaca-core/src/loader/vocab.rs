//! Vocabulary reconciliation between a checkpoint and its tokenizer.

use std::collections::HashMap;

use candle_core::{DType, Result, Tensor};
use tracing::info;

use crate::error::{InferError, InferResult};

pub const EMBED_KEY: &str = "model.embed_tokens.weight";
pub const LM_HEAD_KEY: &str = "lm_head.weight";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VocabAction {
    Keep,
    Resize { from: usize, to: usize },
}

/// Decide what to do with a checkpoint of `model_vocab` rows served by a
/// tokenizer of `tokenizer_vocab` entries. A tokenizer smaller than the model
/// is rejected.
pub fn reconcile_vocab(model_vocab: usize, tokenizer_vocab: usize) -> InferResult<VocabAction> {
    match tokenizer_vocab.cmp(&model_vocab) {
        std::cmp::Ordering::Equal => Ok(VocabAction::Keep),
        std::cmp::Ordering::Greater => Ok(VocabAction::Resize {
            from: model_vocab,
            to: tokenizer_vocab,
        }),
        std::cmp::Ordering::Less => Err(InferError::config(format!(
            "tokenizer vocabulary ({tokenizer_vocab}) is smaller than the model vocabulary ({model_vocab})"
        ))),
    }
}

/// Grow `weight` (`[rows, hidden]`) to `new_rows`. Added rows are the mean of
/// the existing rows.
pub fn resize_rows(weight: &Tensor, new_rows: usize) -> Result<Tensor> {
    let (rows, _hidden) = weight.dims2()?;
    if new_rows <= rows {
        return weight.narrow(0, 0, new_rows);
    }
    let dtype = weight.dtype();
    let mean = weight
        .to_dtype(DType::F32)?
        .mean_keepdim(0)?
        .to_dtype(dtype)?;
    let extra = mean.repeat((new_rows - rows, 1))?;
    Tensor::cat(&[weight, &extra], 0)
}

/// Resize the input embedding and, when it is stored separately, the output
/// head inside a loaded tensor map.
pub fn resize_vocab_tensors(
    tensors: &mut HashMap<String, Tensor>,
    new_vocab: usize,
    tie_word_embeddings: bool,
) -> InferResult<()> {
    let mut keys = vec![EMBED_KEY];
    if !tie_word_embeddings {
        keys.push(LM_HEAD_KEY);
    }
    for key in keys {
        let weight = tensors
            .get(key)
            .ok_or_else(|| InferError::config(format!("checkpoint has no `{key}` tensor to resize")))?;
        let resized = resize_rows(weight, new_vocab)?;
        info!(key, from = weight.dim(0)?, to = new_vocab, "resized vocabulary rows");
        tensors.insert(key.to_string(), resized);
    }
    Ok(())
}
