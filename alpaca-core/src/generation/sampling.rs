//! Token sampling shared by both backends.

use candle_core::{DType, Device, Result, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};

use super::{GenerationConfig, Penalty};

pub struct Sampler {
    processor: LogitsProcessor,
    penalty: Penalty,
}

impl Sampler {
    pub fn new(config: &GenerationConfig) -> Self {
        Self::with_seed(config, config.seed)
    }

    pub fn with_seed(config: &GenerationConfig, seed: u64) -> Self {
        let temperature = config.temperature;
        let top_p_active = config.top_p > 0.0 && config.top_p < 1.0;
        let sampling = if temperature <= 0.0 {
            Sampling::ArgMax
        } else {
            match (config.top_k, top_p_active) {
                (0, false) => Sampling::All { temperature },
                (0, true) => Sampling::TopP {
                    p: config.top_p,
                    temperature,
                },
                (k, false) => Sampling::TopK { k, temperature },
                (k, true) => Sampling::TopKThenTopP {
                    k,
                    p: config.top_p,
                    temperature,
                },
            }
        };
        Self {
            processor: LogitsProcessor::from_sampling(seed, sampling),
            penalty: config.penalty,
        }
    }

    /// Pick the next token. `tokens` is the whole sequence so far and
    /// `prompt_len` marks where generated tokens start.
    pub fn sample(&mut self, logits: &Tensor, tokens: &[u32], prompt_len: usize) -> Result<u32> {
        let logits = logits.flatten_all()?.to_dtype(DType::F32)?;
        let logits = self.apply_penalty(logits, tokens, prompt_len)?;
        self.processor.sample(&logits)
    }

    fn apply_penalty(&self, logits: Tensor, tokens: &[u32], prompt_len: usize) -> Result<Tensor> {
        match self.penalty {
            // Every token of the sequence, prompt included.
            Penalty::Repetition(p) if p != 1.0 => {
                candle_transformers::utils::apply_repeat_penalty(&logits, p, tokens)
            }
            Penalty::Presence(p) if p != 0.0 => {
                let generated = &tokens[prompt_len.min(tokens.len())..];
                apply_presence_penalty(&logits, p, generated)
            }
            _ => Ok(logits),
        }
    }
}

/// Subtract `penalty` once from the logit of every distinct token in `generated`.
pub fn apply_presence_penalty(logits: &Tensor, penalty: f32, generated: &[u32]) -> Result<Tensor> {
    let device = logits.device().clone();
    let mut values = logits.to_device(&Device::Cpu)?.to_vec1::<f32>()?;
    let mut seen = std::collections::HashSet::new();
    for &token in generated {
        let idx = token as usize;
        if idx < values.len() && seen.insert(token) {
            values[idx] -= penalty;
        }
    }
    let len = values.len();
    Tensor::from_vec(values, len, &device)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logits(values: &[f32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    fn greedy(penalty: Penalty) -> GenerationConfig {
        GenerationConfig {
            temperature: 0.0,
            penalty,
            ..GenerationConfig::direct_default()
        }
    }

    #[test]
    fn zero_temperature_is_argmax() {
        let mut sampler = Sampler::new(&greedy(Penalty::Repetition(1.0)));
        let token = sampler.sample(&logits(&[0.1, 3.0, 0.2]), &[], 0).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn repetition_penalty_discourages_recent_tokens() {
        let mut sampler = Sampler::new(&greedy(Penalty::Repetition(4.0)));
        // Token 1 was seen in the prompt; 2.0 / 4.0 = 0.5 < 1.5.
        let token = sampler.sample(&logits(&[0.0, 2.0, 1.5]), &[1], 1).unwrap();
        assert_eq!(token, 2);
    }

    #[test]
    fn repetition_penalty_covers_the_whole_sequence() {
        let mut sampler = Sampler::new(&greedy(Penalty::Repetition(4.0)));
        // Token 1 opens a long sequence and never reappears.
        let mut tokens = vec![1u32];
        tokens.extend(std::iter::repeat(0).take(200));
        let token = sampler.sample(&logits(&[0.0, 2.0, 1.5]), &tokens, 100).unwrap();
        assert_eq!(token, 2);
    }

    #[test]
    fn presence_penalty_only_counts_generated_tokens() {
        let mut sampler = Sampler::new(&greedy(Penalty::Presence(1.0)));
        // Token 1 only appears in the prompt: no penalty.
        assert_eq!(sampler.sample(&logits(&[0.0, 2.0, 1.5]), &[1], 1).unwrap(), 1);
        // Token 1 generated once: 2.0 - 1.0 = 1.0 < 1.5.
        assert_eq!(sampler.sample(&logits(&[0.0, 2.0, 1.5]), &[7, 1, 1], 1).unwrap(), 2);
    }

    #[test]
    fn presence_penalty_is_applied_once_per_token() {
        let out = apply_presence_penalty(&logits(&[1.0, 1.0, 1.0]), 0.5, &[0, 0, 2, 9])
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(out, vec![0.5, 1.0, 0.5]);
    }

    #[test]
    fn sampling_is_reproducible_for_a_seed() {
        let config = GenerationConfig {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            ..GenerationConfig::direct_default()
        };
        let l = logits(&[1.0, 1.1, 0.9, 1.05]);
        let draw = |seed| {
            let mut s = Sampler::with_seed(&config, seed);
            (0..8).map(|_| s.sample(&l, &[], 0).unwrap()).collect::<Vec<_>>()
        };
        assert_eq!(draw(7), draw(7));
    }
}
