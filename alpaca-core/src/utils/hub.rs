//! Resolve model, adapter and tokenizer locations.
//!
//! A string naming an existing directory is read in place. Anything else is
//! taken as a HuggingFace Hub repo id and files are fetched into the local
//! hub cache on demand.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use serde::Deserialize;
use tracing::info;

use crate::error::{InferError, InferResult};

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

pub enum ModelFiles {
    Local(PathBuf),
    Hub { repo_id: String, repo: ApiRepo },
}

impl fmt::Debug for ModelFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(dir) => write!(f, "Local({})", dir.display()),
            Self::Hub { repo_id, .. } => write!(f, "Hub({repo_id})"),
        }
    }
}

impl fmt::Display for ModelFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(dir) => write!(f, "{}", dir.display()),
            Self::Hub { repo_id, .. } => write!(f, "hf://{repo_id}"),
        }
    }
}

impl ModelFiles {
    pub fn resolve(location: &str) -> InferResult<Self> {
        let path = Path::new(location);
        if path.is_dir() {
            return Ok(Self::Local(path.to_path_buf()));
        }
        if location.starts_with(['/', '.', '~']) || location.contains('\\') {
            return Err(InferError::config(format!("local directory {location:?} does not exist")));
        }
        let valid = |c: char| c.is_alphanumeric() || ['-', '_', '.', '/'].contains(&c);
        if location.is_empty() || location.matches('/').count() > 1 || !location.chars().all(valid) {
            return Err(InferError::config(format!(
                "{location:?} is neither a local directory nor a hub repo id"
            )));
        }
        let api = ApiBuilder::new()
            .build()
            .map_err(|e| InferError::Hub(e.to_string()))?;
        let repo = api.repo(Repo::new(location.to_string(), RepoType::Model));
        Ok(Self::Hub {
            repo_id: location.to_string(),
            repo,
        })
    }

    pub fn get(&self, file: &str) -> InferResult<PathBuf> {
        match self {
            Self::Local(dir) => {
                let path = dir.join(file);
                if path.exists() {
                    Ok(path)
                } else {
                    Err(InferError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} not found", path.display()),
                    )))
                }
            }
            Self::Hub { repo_id, repo } => repo
                .get(file)
                .map_err(|e| InferError::Hub(format!("{repo_id}/{file}: {e}"))),
        }
    }

    pub fn try_get(&self, file: &str) -> Option<PathBuf> {
        self.get(file).ok()
    }

    /// Weight shards. Safetensors are preferred: the index file, then
    /// `model.safetensors`, then every `*.safetensors` of a local directory.
    /// PyTorch `pytorch_model*.bin` archives are looked up the same way.
    pub fn weight_files(&self) -> InferResult<WeightFiles> {
        if let Some(files) = self.find_weights("model.safetensors", |name| {
            name.ends_with(".safetensors") && !name.starts_with("adapter_")
        })? {
            return Ok(WeightFiles::Safetensors(files));
        }
        if let Some(files) = self.find_weights("pytorch_model.bin", |name| {
            name.starts_with("pytorch_model") && name.ends_with(".bin")
        })? {
            return Ok(WeightFiles::Pickle(files));
        }
        Err(InferError::config(format!(
            "no model.safetensors or pytorch_model.bin weights found in {self}"
        )))
    }

    fn find_weights(&self, single: &str, matches: impl Fn(&str) -> bool) -> InferResult<Option<Vec<PathBuf>>> {
        if let Some(index_path) = self.try_get(&format!("{single}.index.json")) {
            let index: ShardIndex = serde_json::from_slice(&std::fs::read(&index_path)?)?;
            let mut shard_names: Vec<String> = index.weight_map.into_values().collect();
            shard_names.sort();
            shard_names.dedup();
            info!(shards = shard_names.len(), index = %index_path.display(), "sharded checkpoint");
            return shard_names.iter().map(|name| self.get(name)).collect::<InferResult<_>>().map(Some);
        }
        if let Some(path) = self.try_get(single) {
            return Ok(Some(vec![path]));
        }
        if let Self::Local(dir) = self {
            let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.file_name().is_some_and(|n| matches(&n.to_string_lossy())))
                .collect();
            files.sort();
            if !files.is_empty() {
                return Ok(Some(files));
            }
        }
        Ok(None)
    }
}

/// Checkpoint weight files by on-disk format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightFiles {
    Safetensors(Vec<PathBuf>),
    /// PyTorch zip archives, read through `candle_core::pickle`.
    Pickle(Vec<PathBuf>),
}
