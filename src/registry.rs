//! Resolves a model identifier to the files a checkpoint is made of.
//!
//! An identifier naming an existing directory is read in place. Anything else
//! is treated as a Hugging Face Hub repository id and fetched through
//! `hf-hub`, or looked up in its local cache only when running offline.

use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Cache, Repo, RepoType};
use log::{debug, info};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL_ID: &str = "EleutherAI/gpt-j-6B";
pub const DEFAULT_REVISION: &str = "main";

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to initialise the model hub client: {0}")]
    Client(String),
    #[error("failed to fetch '{file}' for {model_id}: {message}")]
    Fetch {
        model_id: String,
        file: String,
        message: String,
    },
    #[error("'{file}' for {model_id} is not in the local cache and offline mode is enabled")]
    NotCached { model_id: String, file: String },
    #[error("'{file}' not found in {}", dir.display())]
    MissingFile { dir: PathBuf, file: String },
    #[error("invalid weight index {}: {source}", path.display())]
    InvalidIndex {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{model_id} has neither {WEIGHTS_FILE} nor {WEIGHTS_INDEX_FILE}")]
    NoWeights { model_id: String },
}

/// Where to find a model and how to reach the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSource {
    pub model_id: String,
    pub revision: String,
    pub cache_dir: Option<PathBuf>,
    pub offline: bool,
    pub token: Option<String>,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_ID)
    }
}

impl ModelSource {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            revision: DEFAULT_REVISION.to_string(),
            cache_dir: None,
            offline: false,
            token: None,
        }
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    pub fn with_cache_dir(mut self, cache_dir: Option<PathBuf>) -> Self {
        self.cache_dir = cache_dir;
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn is_local_dir(&self) -> bool {
        Path::new(&self.model_id).is_dir()
    }
}

/// A place checkpoint files can be fetched from.
pub trait ModelRepository {
    /// Returns a local path to `file`, downloading it if necessary.
    fn fetch(&self, file: &str) -> Result<PathBuf, RegistryError>;

    /// Like `fetch`, but a file the repository does not have is `Ok(None)`.
    fn fetch_optional(&self, file: &str) -> Result<Option<PathBuf>, RegistryError>;

    fn describe(&self) -> String;
}

pub struct LocalDirectory {
    dir: PathBuf,
}

impl LocalDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ModelRepository for LocalDirectory {
    fn fetch(&self, file: &str) -> Result<PathBuf, RegistryError> {
        self.fetch_optional(file)?.ok_or_else(|| RegistryError::MissingFile {
            dir: self.dir.clone(),
            file: file.to_string(),
        })
    }

    fn fetch_optional(&self, file: &str) -> Result<Option<PathBuf>, RegistryError> {
        let path = self.dir.join(file);
        Ok(path.is_file().then_some(path))
    }

    fn describe(&self) -> String {
        format!("local directory {}", self.dir.display())
    }
}

pub struct HubRepository {
    model_id: String,
    repo: hf_hub::api::sync::ApiRepo,
}

impl HubRepository {
    pub fn new(source: &ModelSource) -> Result<Self, RegistryError> {
        let mut builder = ApiBuilder::new().with_progress(true).with_token(source.token.clone());
        if let Some(dir) = &source.cache_dir {
            builder = builder.with_cache_dir(dir.clone());
        }
        let api: Api = builder.build().map_err(|e| RegistryError::Client(e.to_string()))?;
        let repo = api.repo(Repo::with_revision(
            source.model_id.clone(),
            RepoType::Model,
            source.revision.clone(),
        ));
        Ok(Self {
            model_id: source.model_id.clone(),
            repo,
        })
    }
}

impl ModelRepository for HubRepository {
    fn fetch(&self, file: &str) -> Result<PathBuf, RegistryError> {
        info!("Fetching {} from {}", file, self.model_id);
        self.repo.get(file).map_err(|e| RegistryError::Fetch {
            model_id: self.model_id.clone(),
            file: file.to_string(),
            message: e.to_string(),
        })
    }

    // The hub client reports a missing file and a network failure the same way,
    // so any failure here means "absent".
    fn fetch_optional(&self, file: &str) -> Result<Option<PathBuf>, RegistryError> {
        match self.repo.get(file) {
            Ok(path) => Ok(Some(path)),
            Err(e) => {
                debug!("Optional file {} unavailable for {}: {}", file, self.model_id, e);
                Ok(None)
            }
        }
    }

    fn describe(&self) -> String {
        format!("hub repository {}", self.model_id)
    }
}

/// Read-only view of the local hub cache, used in offline mode.
pub struct CachedRepository {
    model_id: String,
    repo: hf_hub::CacheRepo,
}

impl CachedRepository {
    pub fn new(source: &ModelSource) -> Self {
        let cache = match &source.cache_dir {
            Some(dir) => Cache::new(dir.clone()),
            None => Cache::default(),
        };
        let repo = cache.repo(Repo::with_revision(
            source.model_id.clone(),
            RepoType::Model,
            source.revision.clone(),
        ));
        Self {
            model_id: source.model_id.clone(),
            repo,
        }
    }
}

impl ModelRepository for CachedRepository {
    fn fetch(&self, file: &str) -> Result<PathBuf, RegistryError> {
        self.repo.get(file).ok_or_else(|| RegistryError::NotCached {
            model_id: self.model_id.clone(),
            file: file.to_string(),
        })
    }

    fn fetch_optional(&self, file: &str) -> Result<Option<PathBuf>, RegistryError> {
        Ok(self.repo.get(file))
    }

    fn describe(&self) -> String {
        format!("cached copy of {}", self.model_id)
    }
}

/// The files a checkpoint consists of, all local.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct WeightIndex {
    weight_map: HashMap<String, String>,
}

/// Shard file names listed in a `model.safetensors.index.json`, sorted and deduplicated.
pub fn read_shard_index(path: &Path) -> Result<Vec<String>, RegistryError> {
    let contents = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let index: WeightIndex = serde_json::from_str(&contents).map_err(|source| RegistryError::InvalidIndex {
        path: path.to_path_buf(),
        source,
    })?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

pub fn open_repository(source: &ModelSource) -> Result<Box<dyn ModelRepository>, RegistryError> {
    if source.is_local_dir() {
        Ok(Box::new(LocalDirectory::new(&source.model_id)))
    } else if source.offline {
        Ok(Box::new(CachedRepository::new(source)))
    } else {
        Ok(Box::new(HubRepository::new(source)?))
    }
}

pub fn resolve_files(repo: &dyn ModelRepository, model_id: &str) -> Result<ModelFiles, RegistryError> {
    info!("Resolving model files from {}", repo.describe());
    let config = repo.fetch(CONFIG_FILE)?;
    let tokenizer = repo.fetch(TOKENIZER_FILE)?;
    let generation_config = repo.fetch_optional(GENERATION_CONFIG_FILE)?;

    let weights = match repo.fetch_optional(WEIGHTS_FILE)? {
        Some(single) => vec![single],
        None => {
            let index = repo
                .fetch_optional(WEIGHTS_INDEX_FILE)?
                .ok_or_else(|| RegistryError::NoWeights {
                    model_id: model_id.to_string(),
                })?;
            read_shard_index(&index)?
                .iter()
                .map(|shard| repo.fetch(shard))
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        generation_config,
        weights,
    })
}

pub fn resolve(source: &ModelSource) -> Result<ModelFiles, RegistryError> {
    let repo = open_repository(source)?;
    resolve_files(repo.as_ref(), &source.model_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_model_source_defaults() {
        let source = ModelSource::default();
        assert_eq!(source.model_id, "EleutherAI/gpt-j-6B");
        assert_eq!(source.revision, "main");
        assert!(!source.offline);
        assert!(!source.is_local_dir());
    }

    #[test]
    fn test_resolve_local_single_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        for file in [CONFIG_FILE, TOKENIZER_FILE, WEIGHTS_FILE] {
            fs::write(dir.path().join(file), "{}")?;
        }
        let source = ModelSource::new(dir.path().to_string_lossy());
        let files = resolve(&source)?;
        assert_eq!(files.config, dir.path().join(CONFIG_FILE));
        assert_eq!(files.weights, vec![dir.path().join(WEIGHTS_FILE)]);
        assert_eq!(files.generation_config, None);
        Ok(())
    }

    #[test]
    fn test_resolve_local_sharded() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join(CONFIG_FILE), "{}")?;
        fs::write(dir.path().join(TOKENIZER_FILE), "{}")?;
        fs::write(dir.path().join(GENERATION_CONFIG_FILE), "{}")?;
        fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"metadata": {"total_size": 10}, "weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00002-of-00002.safetensors"}}"#,
        )?;
        fs::write(dir.path().join("model-00001-of-00002.safetensors"), "")?;
        fs::write(dir.path().join("model-00002-of-00002.safetensors"), "")?;

        let files = resolve(&ModelSource::new(dir.path().to_string_lossy()))?;
        assert_eq!(
            files.weights,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
        assert!(files.generation_config.is_some());
        Ok(())
    }

    #[test]
    fn test_resolve_local_reports_missing_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::write(dir.path().join(CONFIG_FILE), "{}")?;
        let source = ModelSource::new(dir.path().to_string_lossy());
        assert!(matches!(
            resolve(&source),
            Err(RegistryError::MissingFile { file, .. }) if file == TOKENIZER_FILE
        ));

        fs::write(dir.path().join(TOKENIZER_FILE), "{}")?;
        assert!(matches!(resolve(&source), Err(RegistryError::NoWeights { .. })));
        Ok(())
    }

    #[test]
    fn test_offline_uncached_model_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let cache = tempdir()?;
        let source = ModelSource::new("someone/not-a-real-model")
            .with_offline(true)
            .with_cache_dir(Some(cache.path().to_path_buf()));
        assert!(matches!(resolve(&source), Err(RegistryError::NotCached { .. })));
        Ok(())
    }

    #[test]
    fn test_invalid_shard_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join(WEIGHTS_INDEX_FILE);
        fs::write(&path, "not json")?;
        assert!(matches!(read_shard_index(&path), Err(RegistryError::InvalidIndex { .. })));
        Ok(())
    }
}
