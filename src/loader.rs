//! Builds a ready-to-use text-generation pipeline from a model identifier.

use crate::config::{ConfigError, GenerationConfig, GenerationOverrides, GptJConfig};
use crate::model::{GptJModel, ModelError};
use crate::model_loader::{checkpoint_size, load_safetensors, LoaderError};
use crate::pipeline::TextGenerationPipeline;
use crate::registry::{self, ModelFiles, ModelSource, RegistryError};
use crate::system_resources::{check_memory, MemorySnapshot};
use crate::tokenizer::{TokenizerError, TokenizerWrapper};
use log::{info, warn};
use std::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("could not resolve model files: {0}")]
    Registry(#[from] RegistryError),
    #[error("could not read model config: {0}")]
    Config(#[from] ConfigError),
    #[error("could not load tokenizer: {0}")]
    Tokenizer(#[from] TokenizerError),
    #[error("could not load weights: {0}")]
    Weights(#[from] LoaderError),
    #[error("could not build model: {0}")]
    Model(#[from] ModelError),
}

/// Resolves, downloads if needed, and loads the model named by `source`.
pub fn load_pipeline(source: &ModelSource) -> Result<TextGenerationPipeline, LoadError> {
    info!("Loading model {} (revision {})", source.model_id, source.revision);
    let files = registry::resolve(source)?;
    load_from_files(&files)
}

pub fn load_from_files(files: &ModelFiles) -> Result<TextGenerationPipeline, LoadError> {
    let started = Instant::now();
    let config = GptJConfig::load(&files.config)?;
    info!(
        "Config: {} layers, {} heads, hidden size {}, vocabulary {}, context {}",
        config.n_layer, config.n_head, config.n_embd, config.vocab_size, config.n_positions
    );

    // weights are held as f32, so half-precision checkpoints double in memory
    let on_disk = checkpoint_size(&files.weights);
    let estimate = on_disk.max(config.parameter_count() * std::mem::size_of::<f32>() as u64);
    check_memory(estimate, &MemorySnapshot::current());

    let tokenizer = TokenizerWrapper::new(&files.tokenizer)?;
    let tokenizer_vocab = tokenizer.get_vocab_size(true);
    if tokenizer_vocab > config.vocab_size {
        warn!(
            "Tokenizer has {} tokens but the model only {}; some ids will be rejected",
            tokenizer_vocab, config.vocab_size
        );
    }

    let generation_file = files
        .generation_config
        .as_deref()
        .map(GenerationOverrides::load)
        .transpose()?;
    let defaults = GenerationConfig::for_model(&config, generation_file.as_ref());

    let mut weights = load_safetensors(&files.weights)?;
    let eos_token_id = config.eos_token_id;
    let model = GptJModel::from_weights(config, &mut weights)?;
    if !weights.is_empty() {
        info!("Ignoring {} unused tensors", weights.len());
    }
    drop(weights);

    info!("Model ready in {:.1}s", started.elapsed().as_secs_f32());
    Ok(TextGenerationPipeline::new(Box::new(model), tokenizer, defaults, eos_token_id))
}
