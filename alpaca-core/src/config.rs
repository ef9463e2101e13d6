//! Command line arguments and their validated form.
//!
//! [`InferenceArgs::validate`] performs every check that does not need model
//! weights, so a bad combination of flags fails before anything is loaded.

use std::path::PathBuf;

use clap::Parser;

use crate::error::{InferError, InferResult};
use crate::generation::{BackendKind, GenerationConfig};
use crate::loader::LoaderOptions;
use crate::patches::ntk::NtkAlpha;
use crate::prompt::PromptTemplate;
use crate::serving::ServingOptions;
use crate::utils::parse_gpu_list;

#[derive(Parser, Debug, Clone)]
#[command(name = "alpaca-infer", version, about = "Instruction-following inference for LLaMA checkpoints")]
pub struct InferenceArgs {
    /// Base model directory or HuggingFace repo id
    #[arg(long)]
    pub base_model: String,

    /// LoRA adapter directory or repo id; without it the base model is used as is
    #[arg(long)]
    pub lora_model: Option<String>,

    /// Tokenizer location (defaults to the adapter, then the base model)
    #[arg(long)]
    pub tokenizer_path: Option<String>,

    /// File with one instruction per line
    #[arg(long)]
    pub data_file: Option<PathBuf>,

    /// Wrap each input in the instruction prompt template
    #[arg(long)]
    pub with_prompt: bool,

    /// Single-turn interactive mode
    #[arg(long)]
    pub interactive: bool,

    #[arg(long, default_value = "./predictions.json")]
    pub predictions_file: PathBuf,

    /// Comma separated device ordinals
    #[arg(long, default_value = "0")]
    pub gpus: String,

    /// Run on CPU even if an accelerator is available
    #[arg(long)]
    pub only_cpu: bool,

    /// NTK scaling factor: a positive float or "auto"
    #[arg(long, default_value = "1.0")]
    pub alpha: String,

    /// Quantize attention and MLP projections to 8 bits
    #[arg(long)]
    pub load_in_8bit: bool,

    /// Generate through the batching serving engine
    #[arg(long)]
    pub use_serving: bool,

    /// Use the eager attention kernel even where a memory-efficient one exists
    #[arg(long)]
    pub eager_attention: bool,

    /// Jinja template file with an `instruction` variable; implies --with-prompt
    #[arg(long)]
    pub prompt_template: Option<PathBuf>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub top_k: Option<usize>,

    #[arg(long)]
    pub top_p: Option<f64>,

    #[arg(long)]
    pub max_new_tokens: Option<usize>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Max sequences decoded together by one serving engine
    #[arg(long, default_value_t = 16)]
    pub max_concurrent: usize,

    /// Batched decode rounds per serving step
    #[arg(long, default_value_t = 16)]
    pub decode_rounds: usize,
}

/// Validated, typed run configuration.
#[derive(Debug)]
pub struct RunConfig {
    pub loader: LoaderOptions,
    pub backend: BackendKind,
    pub gpus: Vec<usize>,
    pub only_cpu: bool,
    pub alpha: NtkAlpha,
    pub memory_efficient_attention: bool,
    /// Present when inputs are templated.
    pub template: Option<PromptTemplate>,
    pub data_file: Option<PathBuf>,
    pub interactive: bool,
    pub predictions_file: PathBuf,
    pub generation: GenerationConfig,
    pub serving: ServingOptions,
}

impl InferenceArgs {
    pub fn validate(&self) -> InferResult<RunConfig> {
        let backend = if self.use_serving {
            BackendKind::Serving
        } else {
            BackendKind::Direct
        };

        if backend == BackendKind::Serving {
            if self.lora_model.is_some() {
                return Err(InferError::config(
                    "the serving backend does not support LoRA adapters; merge the adapter into the base model first",
                ));
            }
            if self.load_in_8bit {
                return Err(InferError::config(
                    "the serving backend does not support 8-bit loading; use the default precision or the direct backend",
                ));
            }
            if self.only_cpu {
                return Err(InferError::config(
                    "the serving backend requires an accelerator; drop --only-cpu or --use-serving",
                ));
            }
            if self.max_concurrent == 0 || self.decode_rounds == 0 {
                return Err(InferError::config(
                    "--max-concurrent and --decode-rounds must be at least 1",
                ));
            }
        }

        let alpha: NtkAlpha = self.alpha.parse()?;

        let gpus = if self.only_cpu {
            Vec::new()
        } else {
            parse_gpu_list(&self.gpus)
                .ok_or_else(|| InferError::config(format!("invalid --gpus value {:?}", self.gpus)))?
        };

        let template = match self.prompt_template {
            Some(ref path) => Some(PromptTemplate::from_file(path)?),
            None if self.with_prompt => Some(PromptTemplate::default()),
            None => None,
        };

        Ok(RunConfig {
            loader: LoaderOptions {
                base_model: self.base_model.clone(),
                lora_model: self.lora_model.clone(),
                tokenizer_path: self.tokenizer_path.clone(),
                load_in_8bit: self.load_in_8bit,
            },
            backend,
            gpus,
            only_cpu: self.only_cpu,
            alpha,
            memory_efficient_attention: !self.eager_attention,
            template,
            data_file: self.data_file.clone(),
            interactive: self.interactive,
            predictions_file: self.predictions_file.clone(),
            generation: self.generation_config(backend)?,
            serving: ServingOptions {
                max_concurrent: self.max_concurrent,
                decode_rounds: self.decode_rounds,
            },
        })
    }

    fn generation_config(&self, backend: BackendKind) -> InferResult<GenerationConfig> {
        let mut config = backend.default_generation_config();
        if let Some(t) = self.temperature {
            if !(t.is_finite() && t >= 0.0) {
                return Err(InferError::config(format!("invalid --temperature {t}")));
            }
            config.temperature = t;
        }
        if let Some(k) = self.top_k {
            config.top_k = k;
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(InferError::config(format!("--top-p must be in (0, 1], got {p}")));
            }
            config.top_p = p;
        }
        if let Some(n) = self.max_new_tokens {
            if n == 0 {
                return Err(InferError::config("--max-new-tokens must be at least 1"));
            }
            config.max_new_tokens = n;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::Penalty;

    fn parse(extra: &[&str]) -> InferenceArgs {
        let mut argv = vec!["alpaca-infer", "--base-model", "/models/base"];
        argv.extend_from_slice(extra);
        InferenceArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let args = parse(&[]);
        assert_eq!(args.gpus, "0");
        assert_eq!(args.alpha, "1.0");
        assert_eq!(args.predictions_file, PathBuf::from("./predictions.json"));

        let run = args.validate().unwrap();
        assert_eq!(run.backend, BackendKind::Direct);
        assert_eq!(run.gpus, vec![0]);
        assert_eq!(run.alpha, NtkAlpha::Fixed(1.0));
        assert!(run.memory_efficient_attention);
        assert!(run.template.is_none());
        assert_eq!(run.generation, GenerationConfig::direct_default());
    }

    #[test]
    fn base_model_is_required() {
        assert!(InferenceArgs::try_parse_from(["alpaca-infer"]).is_err());
    }

    #[test]
    fn serving_rejects_adapter() {
        let err = parse(&["--use-serving", "--lora-model", "/models/lora"])
            .validate()
            .unwrap_err();
        assert!(err.is_config());
        assert!(err.to_string().contains("LoRA"));
    }

    #[test]
    fn serving_rejects_8bit_and_cpu() {
        assert!(parse(&["--use-serving", "--load-in-8bit"]).validate().unwrap_err().is_config());
        assert!(parse(&["--use-serving", "--only-cpu"]).validate().unwrap_err().is_config());
    }

    #[test]
    fn serving_uses_presence_penalty_defaults() {
        let run = parse(&["--use-serving", "--gpus", "0,1"]).validate().unwrap();
        assert_eq!(run.backend, BackendKind::Serving);
        assert_eq!(run.gpus, vec![0, 1]);
        assert_eq!(run.generation.penalty, Penalty::Presence(1.0));
    }

    #[test]
    fn bad_alpha_fails_validation() {
        assert!(parse(&["--alpha", "fast"]).validate().unwrap_err().is_config());
        assert!(parse(&["--alpha=-2"]).validate().unwrap_err().is_config());
        let run = parse(&["--alpha", "auto"]).validate().unwrap();
        assert_eq!(run.alpha, NtkAlpha::Auto);
    }

    #[test]
    fn only_cpu_ignores_gpu_list() {
        let run = parse(&["--only-cpu", "--gpus", "not-a-list"]).validate().unwrap();
        assert!(run.gpus.is_empty());
        assert!(run.only_cpu);
    }

    #[test]
    fn sampling_overrides_apply() {
        let run = parse(&[
            "--temperature",
            "0",
            "--top-k",
            "5",
            "--top-p",
            "0.5",
            "--max-new-tokens",
            "12",
            "--seed",
            "7",
        ])
        .validate()
        .unwrap();
        assert_eq!(run.generation.temperature, 0.0);
        assert_eq!(run.generation.top_k, 5);
        assert_eq!(run.generation.top_p, 0.5);
        assert_eq!(run.generation.max_new_tokens, 12);
        assert_eq!(run.generation.seed, 7);
        assert!(parse(&["--top-p", "1.5"]).validate().is_err());
    }

    #[test]
    fn with_prompt_selects_default_template() {
        let run = parse(&["--with-prompt"]).validate().unwrap();
        assert!(run.template.is_some());
    }

    #[test]
    fn missing_template_file_fails() {
        let err = parse(&["--prompt-template", "/nonexistent/prompt.jinja"])
            .validate()
            .unwrap_err();
        assert!(matches!(err, InferError::Io(_)));
    }
}
