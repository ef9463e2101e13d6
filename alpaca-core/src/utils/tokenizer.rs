use tokenizers::Tokenizer;
use tracing::info;

use super::hub::ModelFiles;
use crate::error::{InferError, InferResult};

const TOKENIZER_JSON: &str = "tokenizer.json";
const SENTENCEPIECE_MODEL: &str = "tokenizer.model";

/// Load `tokenizer.json` from `files`.
///
/// LLaMA checkpoints and adapters often ship only the SentencePiece
/// `tokenizer.model`. The `tokenizers` crate cannot read that format, so such
/// a directory is reported as a configuration error naming the conversion.
pub fn load_tokenizer(files: &ModelFiles) -> InferResult<Tokenizer> {
    let path = match files.try_get(TOKENIZER_JSON) {
        Some(path) => path,
        None if files.try_get(SENTENCEPIECE_MODEL).is_some() => {
            return Err(InferError::config(format!(
                "{files} has a SentencePiece {SENTENCEPIECE_MODEL} but no {TOKENIZER_JSON}; convert it once with \
                 `python -c \"from transformers import AutoTokenizer; \
                 AutoTokenizer.from_pretrained('{files}').save_pretrained('{files}')\"` \
                 or pass --tokenizer-path pointing at a directory with {TOKENIZER_JSON}"
            )))
        }
        None => {
            return Err(InferError::tokenizer(format!("no {TOKENIZER_JSON} found in {files}")));
        }
    };
    let tokenizer = Tokenizer::from_file(&path).map_err(InferError::tokenizer)?;
    info!(source = %files, vocab = vocab_size(&tokenizer), "tokenizer loaded");
    Ok(tokenizer)
}

/// Vocabulary size including added tokens.
pub fn vocab_size(tokenizer: &Tokenizer) -> usize {
    tokenizer.get_vocab_size(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tokenizer_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let files = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap();
        let err = load_tokenizer(&files).unwrap_err();
        assert!(matches!(err, InferError::Tokenizer(_)));
    }

    #[test]
    fn sentencepiece_only_directory_names_the_conversion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tokenizer.model"), b"\x0a\x05<unk>").unwrap();
        std::fs::write(dir.path().join("tokenizer_config.json"), r#"{"eos_token": "</s>"}"#).unwrap();

        let files = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap();
        let err = load_tokenizer(&files).unwrap_err();
        assert!(err.is_config());
        let msg = err.to_string();
        assert!(msg.contains("tokenizer.model"), "{msg}");
        assert!(msg.contains("save_pretrained"), "{msg}");
        assert!(msg.contains("--tokenizer-path"), "{msg}");
    }

    #[test]
    fn vocab_only_bpe_files_are_not_accepted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("vocab.json"), r#"{"a": 0, "b": 1, "ab": 2}"#).unwrap();
        std::fs::write(dir.path().join("merges.txt"), "#version: 0.2\na b\n").unwrap();

        let files = ModelFiles::resolve(dir.path().to_str().unwrap()).unwrap();
        assert!(load_tokenizer(&files).is_err());
    }
}
