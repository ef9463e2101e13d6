//! Turn a base checkpoint (plus an optional LoRA adapter) into patched,
//! inference-ready [`ModelHandle`]s.
//!
//! Loading happens in two phases. [`ModelLoader::prepare`] reads only
//! `config.json`, the tokenizer and the adapter config, so every
//! configuration problem surfaces before a single weight is touched.
//! [`ModelLoader::load`] then builds one handle per device.

pub mod adapter;
pub mod vocab;

use std::collections::HashMap;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tokenizers::Tokenizer;
use tracing::info;

use crate::error::{InferError, InferResult};
use crate::models::llama::{LlamaConfig, LlamaModel, ModelHandle};
use crate::patches::PatchSet;
use crate::utils::hub::{ModelFiles, WeightFiles};
use crate::utils::tokenizer::{load_tokenizer, vocab_size};
use adapter::{merge_adapter, AdapterSpec};
use vocab::{reconcile_vocab, resize_vocab_tensors, VocabAction};

#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    pub base_model: String,
    pub lora_model: Option<String>,
    pub tokenizer_path: Option<String>,
    pub load_in_8bit: bool,
}

impl LoaderOptions {
    /// Tokenizer location: explicit path, else the adapter, else the base model.
    pub fn tokenizer_source(&self) -> &str {
        self.tokenizer_path
            .as_deref()
            .or(self.lora_model.as_deref())
            .unwrap_or(&self.base_model)
    }
}

pub struct ModelLoader {
    options: LoaderOptions,
    base: ModelFiles,
    adapter: Option<AdapterSpec>,
    tokenizer: Tokenizer,
    config: LlamaConfig,
    vocab_action: VocabAction,
    patches: PatchSet,
}

impl ModelLoader {
    pub fn prepare(options: LoaderOptions, patches: PatchSet) -> InferResult<Self> {
        let base = ModelFiles::resolve(&options.base_model)?;
        let config: LlamaConfig = serde_json::from_slice(&std::fs::read(base.get("config.json")?)?)?;
        patches.check_model_type(&config.model_type)?;

        let tokenizer_source = options.tokenizer_source().to_string();
        let tokenizer = load_tokenizer(&ModelFiles::resolve(&tokenizer_source)?)?;

        let tokenizer_vocab = vocab_size(&tokenizer);
        info!(
            model_vocab = config.vocab_size,
            tokenizer_vocab, "vocabulary sizes"
        );
        let vocab_action = reconcile_vocab(config.vocab_size, tokenizer_vocab)?;

        let adapter = match options.lora_model {
            Some(ref source) => Some(AdapterSpec::open(source, &ModelFiles::resolve(source)?)?),
            None => None,
        };

        for patch in patches.descriptors() {
            info!(%patch, "patch installed");
        }

        Ok(Self {
            options,
            base,
            adapter,
            tokenizer,
            config,
            vocab_action,
            patches,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn vocab_action(&self) -> VocabAction {
        self.vocab_action
    }

    /// Build a handle on `device`: F16 on accelerators, F32 on CPU.
    pub fn load(&self, device: &Device) -> InferResult<ModelHandle> {
        let start = Instant::now();
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
        let weights = self.base.weight_files()?;
        let mut config = self.config.clone();

        let needs_rewrite = self.adapter.is_some()
            || matches!(self.vocab_action, VocabAction::Resize { .. })
            || matches!(weights, WeightFiles::Pickle(_));
        let vb = match weights {
            // SAFETY: the checkpoint files are not modified while mapped.
            WeightFiles::Safetensors(ref files) if !needs_rewrite => unsafe {
                VarBuilder::from_mmaped_safetensors(files, dtype, device)?
            },
            weights => {
                let mut tensors = read_tensors(&weights)?;
                if let VocabAction::Resize { to, .. } = self.vocab_action {
                    resize_vocab_tensors(&mut tensors, to, config.tie_word_embeddings)?;
                    config.vocab_size = to;
                }
                if let Some(ref adapter) = self.adapter {
                    info!(adapter = %adapter.source, "merging adapter");
                    let adapter_weights = adapter.load_weights(&Device::Cpu)?;
                    merge_adapter(&mut tensors, &adapter.config, adapter_weights)?;
                }
                VarBuilder::from_tensors(tensors, dtype, device)
            }
        };

        let model = LlamaModel::new(&config, vb, &self.patches, self.options.load_in_8bit)?;

        let rows = model.embedding_rows()?;
        let tokenizer_vocab = vocab_size(&self.tokenizer);
        if rows != tokenizer_vocab {
            return Err(InferError::config(format!(
                "embedding has {rows} rows after loading but the tokenizer has {tokenizer_vocab} entries"
            )));
        }

        info!(
            device = ?device,
            ?dtype,
            layers = config.num_hidden_layers,
            load_in_8bit = self.options.load_in_8bit,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model loaded"
        );
        Ok(ModelHandle::new(model, self.tokenizer.clone()))
    }
}

/// Every tensor of the checkpoint, on the CPU.
fn read_tensors(weights: &WeightFiles) -> InferResult<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    match weights {
        WeightFiles::Safetensors(files) => {
            for file in files {
                tensors.extend(candle_core::safetensors::load(file, &Device::Cpu)?);
            }
        }
        WeightFiles::Pickle(files) => {
            for file in files {
                tensors.extend(candle_core::pickle::read_all(file)?);
            }
        }
    }
    Ok(tensors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_source_falls_back_to_adapter_then_base() {
        let mut options = LoaderOptions {
            base_model: "base".into(),
            ..Default::default()
        };
        assert_eq!(options.tokenizer_source(), "base");
        options.lora_model = Some("lora".into());
        assert_eq!(options.tokenizer_source(), "lora");
        options.tokenizer_path = Some("tok".into());
        assert_eq!(options.tokenizer_source(), "tok");
    }
}
