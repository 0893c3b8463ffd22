use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found at: {}", .0.display())]
    NotFound(PathBuf),
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to deserialize JSON from {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid model config: {0}")]
    Invalid(String),
}

fn default_activation() -> String {
    "gelu_new".to_string()
}

fn default_layer_norm_epsilon() -> f32 {
    1e-5
}

fn default_eos() -> u32 {
    50256
}

/// Hyper-parameters of a GPT-J checkpoint, as found in its `config.json`.
#[derive(Deserialize, Debug, Clone)]
pub struct GptJConfig {
    pub vocab_size: usize,
    #[serde(alias = "max_position_embeddings")]
    pub n_positions: usize,
    #[serde(alias = "hidden_size")]
    pub n_embd: usize,
    #[serde(alias = "num_hidden_layers")]
    pub n_layer: usize,
    #[serde(alias = "num_attention_heads")]
    pub n_head: usize,
    #[serde(default)]
    pub rotary_dim: Option<usize>,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_activation")]
    pub activation_function: String,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f32,
    #[serde(default = "default_eos")]
    pub bos_token_id: u32,
    #[serde(default = "default_eos")]
    pub eos_token_id: u32,
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default)]
    pub task_specific_params: Option<HashMap<String, GenerationOverrides>>,
}

impl GptJConfig {
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let config: GptJConfig = read_json(config_path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Number of leading dimensions of each head that get rotary embeddings.
    pub fn rotary_dim(&self) -> usize {
        self.rotary_dim.unwrap_or_else(|| self.head_dim())
    }

    pub fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    /// Parameter count of the full model, LM head included.
    pub fn parameter_count(&self) -> u64 {
        let (e, i, v) = (self.n_embd as u64, self.inner_dim() as u64, self.vocab_size as u64);
        let per_layer = 2 * e + 4 * e * e + 2 * e * i + i + e;
        v * e + self.n_layer as u64 * per_layer + 2 * e + v * e + v
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(ConfigError::Invalid(format!(
                "n_embd ({}) must be a positive multiple of n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        let rotary_dim = self.rotary_dim();
        if rotary_dim > self.head_dim() || rotary_dim % 2 != 0 {
            return Err(ConfigError::Invalid(format!(
                "rotary_dim ({}) must be even and at most head_dim ({})",
                rotary_dim,
                self.head_dim()
            )));
        }
        if self.activation_function != "gelu_new" {
            return Err(ConfigError::Invalid(format!(
                "unsupported activation function '{}'",
                self.activation_function
            )));
        }
        if self.vocab_size == 0 || self.n_positions == 0 || self.n_layer == 0 {
            return Err(ConfigError::Invalid(
                "vocab_size, n_positions and n_layer must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Generation parameters the checkpoint recommends for the text-generation task.
    pub fn text_generation_params(&self) -> Option<&GenerationOverrides> {
        self.task_specific_params
            .as_ref()
            .and_then(|params| params.get("text-generation"))
    }
}

/// Partial generation settings, as stored in `generation_config.json` or in
/// `task_specific_params` of `config.json`. Unknown keys are ignored.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationOverrides {
    pub max_length: Option<usize>,
    pub max_new_tokens: Option<usize>,
    pub do_sample: Option<bool>,
    pub temperature: Option<f32>,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    pub repetition_penalty: Option<f32>,
    pub num_return_sequences: Option<usize>,
}

impl GenerationOverrides {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        read_json(path)
    }
}

/// Decoding parameters for one pipeline call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    /// Total sequence length, prompt included.
    pub max_length: usize,
    /// Takes precedence over `max_length` when set.
    pub max_new_tokens: Option<usize>,
    pub do_sample: bool,
    pub temperature: f32,
    pub top_k: usize,
    pub top_p: f32,
    pub repetition_penalty: f32,
    pub num_return_sequences: usize,
    pub seed: Option<u64>,
    pub return_full_text: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 20,
            max_new_tokens: None,
            do_sample: false,
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            repetition_penalty: 1.0,
            num_return_sequences: 1,
            seed: None,
            return_full_text: true,
        }
    }
}

impl GenerationConfig {
    /// Defaults for a checkpoint: library defaults, then `generation_config.json`,
    /// then the model's text-generation task parameters.
    pub fn for_model(model: &GptJConfig, generation_file: Option<&GenerationOverrides>) -> Self {
        let mut config = Self::default();
        if let Some(overrides) = generation_file {
            config.apply(overrides);
        }
        if let Some(overrides) = model.text_generation_params() {
            config.apply(overrides);
        }
        config
    }

    pub fn apply(&mut self, overrides: &GenerationOverrides) {
        if let Some(v) = overrides.max_length {
            self.max_length = v;
        }
        if let Some(v) = overrides.max_new_tokens {
            self.max_new_tokens = Some(v);
        }
        if let Some(v) = overrides.do_sample {
            self.do_sample = v;
        }
        if let Some(v) = overrides.temperature {
            self.temperature = v;
        }
        if let Some(v) = overrides.top_k {
            self.top_k = v;
        }
        if let Some(v) = overrides.top_p {
            self.top_p = v;
        }
        if let Some(v) = overrides.repetition_penalty {
            self.repetition_penalty = v;
        }
        if let Some(v) = overrides.num_return_sequences {
            self.num_return_sequences = v;
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
        path: path.to_path_buf(),
        source,
    })
}
