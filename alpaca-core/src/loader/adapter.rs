//! LoRA adapter loading and merging.
//!
//! PEFT checkpoints store `base_model.model.<module>.lora_A.weight` (`[r, in]`)
//! and `...lora_B.weight` (`[out, r]`) per adapted projection, plus full
//! tensors for `modules_to_save`. Merging folds them into the base weights:
//! `W' = W + (lora_alpha / r) * B @ A`, and full tensors replace their base
//! counterpart.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{InferError, InferResult};
use crate::utils::hub::ModelFiles;

const PEFT_PREFIX: &str = "base_model.model.";
const SAFETENSORS_FILE: &str = "adapter_model.safetensors";
const PICKLE_FILE: &str = "adapter_model.bin";

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub target_modules: Vec<String>,
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

impl AdapterConfig {
    pub fn scale(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }
}

#[derive(Debug)]
pub struct AdapterSpec {
    pub source: String,
    pub config: AdapterConfig,
    weights: PathBuf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: usize,
    pub replaced: usize,
}

impl AdapterSpec {
    /// Read `adapter_config.json` and locate the adapter weights. No tensors
    /// are read here.
    pub fn open(source: &str, files: &ModelFiles) -> InferResult<Self> {
        let config_path = files.get("adapter_config.json")?;
        let config: AdapterConfig = serde_json::from_slice(&std::fs::read(config_path)?)?;
        if config.r == 0 {
            return Err(InferError::config("adapter rank `r` must be positive"));
        }
        let weights = files
            .try_get(SAFETENSORS_FILE)
            .or_else(|| files.try_get(PICKLE_FILE))
            .ok_or_else(|| {
                InferError::config(format!(
                    "{source} has neither {SAFETENSORS_FILE} nor {PICKLE_FILE}"
                ))
            })?;
        Ok(Self {
            source: source.to_string(),
            config,
            weights,
        })
    }

    /// Adapter tensors with the PEFT prefix stripped.
    pub fn load_weights(&self, device: &Device) -> InferResult<HashMap<String, Tensor>> {
        let raw: Vec<(String, Tensor)> = if self
            .weights
            .extension()
            .is_some_and(|ext| ext == "safetensors")
        {
            candle_core::safetensors::load(&self.weights, device)?
                .into_iter()
                .collect()
        } else {
            candle_core::pickle::read_all(&self.weights)?
                .into_iter()
                .map(|(k, t)| Ok((k, t.to_device(device)?)))
                .collect::<candle_core::Result<_>>()?
        };
        Ok(raw
            .into_iter()
            .map(|(k, t)| (normalize_key(&k), t))
            .collect())
    }
}

fn normalize_key(key: &str) -> String {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    let key = key.replace(".modules_to_save.default.", ".");
    key.replace(".default.weight", ".weight")
}

struct LoraPair {
    a: Option<Tensor>,
    b: Option<Tensor>,
}

/// Fold `adapter` into `base` in place.
pub fn merge_adapter(
    base: &mut HashMap<String, Tensor>,
    config: &AdapterConfig,
    adapter: HashMap<String, Tensor>,
) -> InferResult<MergeReport> {
    let scale = config.scale();
    let mut pairs: BTreeMap<String, LoraPair> = BTreeMap::new();
    let mut full: Vec<(String, Tensor)> = Vec::new();

    for (key, tensor) in adapter {
        if let Some(module) = key.strip_suffix(".lora_A.weight") {
            pairs
                .entry(module.to_string())
                .or_insert(LoraPair { a: None, b: None })
                .a = Some(tensor);
        } else if let Some(module) = key.strip_suffix(".lora_B.weight") {
            pairs
                .entry(module.to_string())
                .or_insert(LoraPair { a: None, b: None })
                .b = Some(tensor);
        } else {
            full.push((key, tensor));
        }
    }

    let mut report = MergeReport::default();
    for (module, pair) in pairs {
        let (a, b) = match (pair.a, pair.b) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(InferError::config(format!(
                    "adapter module `{module}` is missing one of lora_A / lora_B"
                )))
            }
        };
        let key = format!("{module}.weight");
        let weight = base
            .get(&key)
            .ok_or_else(|| InferError::config(format!("adapter targets unknown weight `{key}`")))?;
        let dtype = weight.dtype();
        let delta = b
            .to_dtype(DType::F32)?
            .to_device(weight.device())?
            .matmul(&a.to_dtype(DType::F32)?.to_device(weight.device())?)?;
        let delta = if config.fan_in_fan_out { delta.t()? } else { delta };
        if delta.dims() != weight.dims() {
            return Err(InferError::config(format!(
                "adapter delta for `{key}` has shape {:?}, base weight is {:?}",
                delta.dims(),
                weight.dims()
            )));
        }
        let merged = (weight.to_dtype(DType::F32)? + (delta * scale)?)?.to_dtype(dtype)?;
        base.insert(key, merged);
        report.merged += 1;
    }

    for (key, tensor) in full {
        match base.get(&key) {
            Some(weight) if weight.dims() == tensor.dims() => {
                let tensor = tensor.to_dtype(weight.dtype())?.to_device(weight.device())?;
                base.insert(key, tensor);
                report.replaced += 1;
            }
            Some(weight) => {
                return Err(InferError::config(format!(
                    "adapter tensor `{key}` has shape {:?}, base weight is {:?}",
                    tensor.dims(),
                    weight.dims()
                )))
            }
            None => warn!(key, "adapter tensor has no base counterpart, ignored"),
        }
    }

    info!(
        merged = report.merged,
        replaced = report.replaced,
        scale,
        "adapter merged"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(r: usize, alpha: f64) -> AdapterConfig {
        AdapterConfig {
            r,
            lora_alpha: alpha,
            target_modules: vec!["q_proj".into()],
            modules_to_save: None,
            fan_in_fan_out: false,
        }
    }

    #[test]
    fn peft_keys_are_normalised() {
        assert_eq!(
            normalize_key("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"),
            "model.layers.0.self_attn.q_proj.lora_A.weight"
        );
        assert_eq!(
            normalize_key("base_model.model.model.layers.0.self_attn.q_proj.lora_B.default.weight"),
            "model.layers.0.self_attn.q_proj.lora_B.weight"
        );
        assert_eq!(
            normalize_key("base_model.model.lm_head.modules_to_save.default.weight"),
            "lm_head.weight"
        );
    }

    #[test]
    fn merge_adds_scaled_low_rank_product() {
        let device = Device::Cpu;
        let key = "model.layers.0.self_attn.q_proj";
        let mut base = HashMap::new();
        base.insert(format!("{key}.weight"), Tensor::zeros((2, 3), DType::F32, &device).unwrap());

        let mut adapter = HashMap::new();
        // A: [r=1, in=3], B: [out=2, r=1]
        adapter.insert(
            format!("{key}.lora_A.weight"),
            Tensor::new(&[[1f32, 2.0, 3.0]], &device).unwrap(),
        );
        adapter.insert(
            format!("{key}.lora_B.weight"),
            Tensor::new(&[[1f32], [-1.0]], &device).unwrap(),
        );

        let report = merge_adapter(&mut base, &config(1, 2.0), adapter).unwrap();
        assert_eq!(report, MergeReport { merged: 1, replaced: 0 });
        let merged: Vec<Vec<f32>> = base[&format!("{key}.weight")].to_vec2().unwrap();
        assert_eq!(merged, vec![vec![2.0, 4.0, 6.0], vec![-2.0, -4.0, -6.0]]);
    }

    #[test]
    fn full_tensors_replace_base_weights() {
        let device = Device::Cpu;
        let mut base = HashMap::new();
        base.insert("lm_head.weight".to_string(), Tensor::zeros((4, 2), DType::F32, &device).unwrap());
        let mut adapter = HashMap::new();
        adapter.insert("lm_head.weight".to_string(), Tensor::ones((4, 2), DType::F32, &device).unwrap());

        let report = merge_adapter(&mut base, &config(8, 16.0), adapter).unwrap();
        assert_eq!(report.replaced, 1);
        let sum: f32 = base["lm_head.weight"].sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 8.0);
    }

    #[test]
    fn mismatched_full_tensor_is_rejected() {
        let device = Device::Cpu;
        let mut base = HashMap::new();
        base.insert("lm_head.weight".to_string(), Tensor::zeros((4, 2), DType::F32, &device).unwrap());
        let mut adapter = HashMap::new();
        adapter.insert("lm_head.weight".to_string(), Tensor::ones((5, 2), DType::F32, &device).unwrap());
        assert!(merge_adapter(&mut base, &config(8, 16.0), adapter).unwrap_err().is_config());
    }

    #[test]
    fn unpaired_lora_factor_is_rejected() {
        let device = Device::Cpu;
        let mut base = HashMap::new();
        base.insert("m.weight".to_string(), Tensor::zeros((2, 2), DType::F32, &device).unwrap());
        let mut adapter = HashMap::new();
        adapter.insert("m.lora_A.weight".to_string(), Tensor::zeros((1, 2), DType::F32, &device).unwrap());
        assert!(merge_adapter(&mut base, &config(1, 1.0), adapter).unwrap_err().is_config());
    }

    #[test]
    fn open_reads_config_and_prefers_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("adapter_config.json"),
            r#"{"r": 8, "lora_alpha": 32, "target_modules": ["q_proj", "v_proj"],
                "modules_to_save": ["embed_tokens", "lm_head"], "peft_type": "LORA"}"#,
        )
        .unwrap();
        let files = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap();
        assert!(AdapterSpec::open("lora", &files).unwrap_err().is_config());

        let mut tensors = HashMap::new();
        tensors.insert(
            "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight".to_string(),
            Tensor::zeros((8, 4), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.path().join(SAFETENSORS_FILE)).unwrap();

        let spec = AdapterSpec::open("lora", &files).unwrap();
        assert_eq!(spec.config.scale(), 4.0);
        assert_eq!(spec.config.modules_to_save.as_deref().map(|m| m.len()), Some(2));
        let weights = spec.load_weights(&Device::Cpu).unwrap();
        assert!(weights.contains_key("model.layers.0.self_attn.q_proj.lora_A.weight"));
    }
}
