use std::ops::{Deref, DerefMut};
use std::time::Instant;

use tracing::{debug, info};

use super::pipeline::{BackendKind, GenerationPipeline};
use super::sampling::Sampler;
use super::GenerationConfig;
use crate::error::{InferError, InferResult};
use crate::models::llama::ModelHandle;

/// Borrow of a model for the duration of a generation call. The KV cache is
/// cleared when the scope ends, on success and on error alike.
pub struct GenerationScope<'a> {
    handle: &'a mut ModelHandle,
}

impl<'a> GenerationScope<'a> {
    pub fn new(handle: &'a mut ModelHandle) -> Self {
        handle.clear_kv_cache();
        Self { handle }
    }
}

impl Deref for GenerationScope<'_> {
    type Target = ModelHandle;

    fn deref(&self) -> &ModelHandle {
        self.handle
    }
}

impl DerefMut for GenerationScope<'_> {
    fn deref_mut(&mut self) -> &mut ModelHandle {
        self.handle
    }
}

impl Drop for GenerationScope<'_> {
    fn drop(&mut self) {
        self.handle.clear_kv_cache();
    }
}

/// Trimmed text after the first `marker`.
pub fn extract_response(text: &str, marker: &str) -> InferResult<String> {
    match text.find(marker) {
        Some(idx) => Ok(text[idx + marker.len()..].trim().to_string()),
        None => Err(InferError::MissingResponseMarker {
            marker: marker.to_string(),
            text: text.to_string(),
        }),
    }
}

/// Sequential generation on a single in-process model.
pub struct DirectPipeline {
    handle: ModelHandle,
    response_marker: Option<String>,
}

impl DirectPipeline {
    /// With a `response_marker`, outputs are cut down to the text after it;
    /// otherwise the full decoded sequence (prompt included) is returned.
    pub fn new(handle: ModelHandle, response_marker: Option<String>) -> Self {
        Self {
            handle,
            response_marker,
        }
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    /// Prompt plus continuation, stopping at EOS or `max_new_tokens`.
    fn generate_tokens(
        scope: &mut GenerationScope<'_>,
        prompt: &[u32],
        config: &GenerationConfig,
    ) -> InferResult<Vec<u32>> {
        scope.clear_kv_cache();
        let mut sampler = Sampler::new(config);
        let eos_token = scope.eos_token_id();
        let mut tokens = prompt.to_vec();

        let start_gen = Instant::now();
        let mut generated_tokens = 0usize;
        for index in 0..config.max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let start_pos = tokens.len().saturating_sub(context_size);
            let logits = scope.forward_step(&tokens[start_pos..], start_pos)?;
            let next_token = sampler.sample(&logits, &tokens, prompt.len())?;
            tokens.push(next_token);
            generated_tokens += 1;
            if eos_token == Some(next_token) {
                break;
            }
        }
        let dt = start_gen.elapsed();
        info!(
            prompt_tokens = prompt.len(),
            generated_tokens,
            tokens_per_sec = format!("{:.2}", generated_tokens as f64 / dt.as_secs_f64().max(1e-9)),
            "generation finished"
        );
        Ok(tokens)
    }
}

impl GenerationPipeline for DirectPipeline {
    fn backend(&self) -> BackendKind {
        BackendKind::Direct
    }

    fn generate(&mut self, texts: &[String], config: &GenerationConfig) -> InferResult<Vec<String>> {
        let marker = self.response_marker.clone();
        let mut scope = GenerationScope::new(&mut self.handle);
        let mut outputs = Vec::with_capacity(texts.len());
        for text in texts {
            let prompt = scope.encode(text)?;
            if prompt.is_empty() {
                return Err(InferError::tokenizer("prompt encodes to zero tokens"));
            }
            let tokens = Self::generate_tokens(&mut scope, &prompt, config)?;
            let decoded = scope.decode(&tokens)?;
            debug!(chars = decoded.len(), "decoded sequence");
            let output = match marker {
                Some(ref marker) => extract_response(&decoded, marker)?,
                None => decoded,
            };
            outputs.push(output);
        }
        Ok(outputs)
    }

    fn effective_config(&self, config: &GenerationConfig) -> serde_json::Value {
        serde_json::to_value(config.to_direct_params()).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::llama::modeling::tests::tiny_model;
    use crate::patches::PatchSet;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;
    use tokenizers::Tokenizer;

    const MARKER: &str = "### Response:";

    pub(crate) fn word_tokenizer() -> Tokenizer {
        let words = [
            "<unk>", "<s>", "</s>", "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l", "m",
        ];
        let vocab: HashMap<String, u32> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32))
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab.into_iter().collect())
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
        tokenizer
    }

    fn pipeline(marker: Option<&str>) -> DirectPipeline {
        let handle = ModelHandle::new(tiny_model(&PatchSet::new(), false), word_tokenizer());
        DirectPipeline::new(handle, marker.map(str::to_string))
    }

    #[test]
    fn extracts_text_after_first_marker() {
        let text = "Instruction\n\n### Response:\n\n  hello world  ";
        assert_eq!(extract_response(text, MARKER).unwrap(), "hello world");
        let twice = "### Response: one ### Response: two";
        assert_eq!(extract_response(twice, MARKER).unwrap(), "one ### Response: two");
    }

    #[test]
    fn missing_marker_is_an_error() {
        let err = extract_response("no marker here", MARKER).unwrap_err();
        assert!(matches!(err, InferError::MissingResponseMarker { .. }));
    }

    #[test]
    fn generates_one_output_per_input_in_order() {
        let mut pipeline = pipeline(None);
        let config = GenerationConfig::direct_default().with_max_new_tokens(3);
        let texts = vec!["a b".to_string(), "c".to_string(), "d e f".to_string()];
        let outputs = pipeline.generate(&texts, &config).unwrap();
        assert_eq!(outputs.len(), 3);
        // Without a template the decoded sequence starts with the prompt.
        for (text, output) in texts.iter().zip(&outputs) {
            assert!(output.starts_with(text.as_str()), "{output:?} vs {text:?}");
        }
    }

    #[test]
    fn templated_generation_without_marker_in_output_fails() {
        // The word-level vocabulary cannot spell the marker, so it never
        // survives decoding.
        let mut pipeline = pipeline(Some(MARKER));
        let config = GenerationConfig::direct_default().with_max_new_tokens(2);
        let err = pipeline.generate(&["a".to_string()], &config).unwrap_err();
        assert!(matches!(err, InferError::MissingResponseMarker { .. }));
    }

    #[test]
    fn scope_clears_cache_on_drop() {
        let mut pipeline = pipeline(None);
        {
            let mut scope = GenerationScope::new(&mut pipeline.handle);
            scope.forward_step(&[3, 4], 0).unwrap();
            assert!(scope.get_kv_caches().unwrap()[0].is_some());
        }
        assert!(pipeline.handle.get_kv_caches().unwrap()[0].is_none());
    }

    #[test]
    fn effective_config_uses_direct_names() {
        let pipeline = pipeline(None);
        let json = pipeline.effective_config(&GenerationConfig::direct_default());
        assert_eq!(json["max_new_tokens"], 400);
        assert!(json.get("max_tokens").is_none());
    }
}
