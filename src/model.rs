use crate::attention::GptJAttention;
use crate::common::{KvCache, LayerKvCache, LayerNorm, Linear};
use crate::config::GptJConfig;
use crate::mlp::GptJMlp;
use crate::model_loader::WeightMap;
use log::debug;
use ndarray::{s, Array1, Array2, Axis};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("missing weight tensor '{0}'")]
    MissingWeight(String),
    #[error("weight tensor '{name}' has shape {actual:?}, expected {expected:?}")]
    WeightShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("invalid shape: {0}")]
    InvalidShape(String),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
    #[error("invalid model config: {0}")]
    InvalidConfig(String),
    #[error("input sequence is empty")]
    EmptyInput,
    #[error("token id {id} is outside the vocabulary (size {vocab_size})")]
    TokenOutOfRange { id: u32, vocab_size: usize },
    #[error("sequence of {requested} tokens exceeds the model context of {max}")]
    ContextOverflow { requested: usize, max: usize },
    #[error("cache has {actual} layers, model has {expected}")]
    CacheMismatch { expected: usize, actual: usize },
}

/// A decoder-only language model that can be stepped one chunk at a time.
pub trait CausalLm: Send + Sync {
    /// Runs `input_ids` after whatever `cache` already holds and returns the
    /// logits of the last position.
    fn forward(&self, input_ids: &[u32], cache: &mut KvCache) -> Result<Array1<f32>, ModelError>;

    fn new_cache(&self) -> KvCache;

    fn max_positions(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct GptJBlock {
    ln_1: LayerNorm,
    attn: GptJAttention,
    mlp: GptJMlp,
}

impl GptJBlock {
    pub fn new(ln_1: LayerNorm, attn: GptJAttention, mlp: GptJMlp) -> Self {
        Self { ln_1, attn, mlp }
    }

    // Attention and MLP both read the same normalized input and are summed with the residual.
    pub fn forward(&self, x: &Array2<f32>, cache: &mut LayerKvCache) -> Result<Array2<f32>, ModelError> {
        let h = self.ln_1.forward(x);
        let attn_out = self.attn.forward(&h, cache)?;
        let ff_out = self.mlp.forward(&h);
        Ok(attn_out + ff_out + x)
    }
}

#[derive(Debug, Clone)]
pub struct GptJModel {
    config: GptJConfig,
    wte: Array2<f32>,
    blocks: Vec<GptJBlock>,
    ln_f: LayerNorm,
    lm_head: Linear,
}

impl GptJModel {
    /// Builds the model from Hugging Face named tensors, consuming the ones it uses.
    pub fn from_weights(config: GptJConfig, weights: &mut WeightMap) -> Result<Self, ModelError> {
        config
            .validate()
            .map_err(|e| ModelError::InvalidConfig(e.to_string()))?;

        let n_embd = config.n_embd;
        let n_inner = config.inner_dim();
        let eps = config.layer_norm_epsilon;

        let wte = weights.take_matrix("transformer.wte.weight", [config.vocab_size, n_embd])?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            let prefix = format!("transformer.h.{i}");
            let ln_1 = LayerNorm::new(
                weights.take_vector(&format!("{prefix}.ln_1.weight"), n_embd)?,
                weights.take_vector(&format!("{prefix}.ln_1.bias"), n_embd)?,
                eps,
            )?;

            let mut projection = |name: &str| -> Result<Linear, ModelError> {
                let weight = weights.take_matrix(&format!("{prefix}.attn.{name}.weight"), [n_embd, n_embd])?;
                Linear::new(weight, None)
            };
            let q_proj = projection("q_proj")?;
            let k_proj = projection("k_proj")?;
            let v_proj = projection("v_proj")?;
            let out_proj = projection("out_proj")?;
            let attn = GptJAttention::new(q_proj, k_proj, v_proj, out_proj, config.n_head, config.rotary_dim())?;

            let fc_in = Linear::new(
                weights.take_matrix(&format!("{prefix}.mlp.fc_in.weight"), [n_inner, n_embd])?,
                Some(weights.take_vector(&format!("{prefix}.mlp.fc_in.bias"), n_inner)?),
            )?;
            let fc_out = Linear::new(
                weights.take_matrix(&format!("{prefix}.mlp.fc_out.weight"), [n_embd, n_inner])?,
                Some(weights.take_vector(&format!("{prefix}.mlp.fc_out.bias"), n_embd)?),
            )?;
            let mlp = GptJMlp::new(fc_in, fc_out)?;

            blocks.push(GptJBlock::new(ln_1, attn, mlp));
            debug!("Built layer {}/{}", i + 1, config.n_layer);
        }

        let ln_f = LayerNorm::new(
            weights.take_vector("transformer.ln_f.weight", n_embd)?,
            weights.take_vector("transformer.ln_f.bias", n_embd)?,
            eps,
        )?;
        let lm_head = Linear::new(
            weights.take_matrix("lm_head.weight", [config.vocab_size, n_embd])?,
            weights.take_optional_vector("lm_head.bias", config.vocab_size)?,
        )?;

        Ok(Self {
            config,
            wte,
            blocks,
            ln_f,
            lm_head,
        })
    }
}

impl CausalLm for GptJModel {
    fn forward(&self, input_ids: &[u32], cache: &mut KvCache) -> Result<Array1<f32>, ModelError> {
        if input_ids.is_empty() {
            return Err(ModelError::EmptyInput);
        }
        if cache.num_layers() != self.blocks.len() {
            return Err(ModelError::CacheMismatch {
                expected: self.blocks.len(),
                actual: cache.num_layers(),
            });
        }
        let requested = cache.seq_len() + input_ids.len();
        if requested > self.config.n_positions {
            return Err(ModelError::ContextOverflow {
                requested,
                max: self.config.n_positions,
            });
        }

        let vocab_size = self.config.vocab_size;
        let indices = input_ids
            .iter()
            .map(|&id| {
                let idx = id as usize;
                if idx < vocab_size {
                    Ok(idx)
                } else {
                    Err(ModelError::TokenOutOfRange { id, vocab_size })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut hidden = self.wte.select(Axis(0), &indices);
        for (i, block) in self.blocks.iter().enumerate() {
            let layer_cache = cache.layer_mut(i).ok_or(ModelError::CacheMismatch {
                expected: self.blocks.len(),
                actual: i,
            })?;
            hidden = block.forward(&hidden, layer_cache)?;
        }

        let last = hidden.slice(s![hidden.nrows() - 1.., ..]).to_owned();
        let logits = self.lm_head.forward(&self.ln_f.forward(&last));
        Ok(logits.row(0).to_owned())
    }

    fn new_cache(&self) -> KvCache {
        KvCache::new(self.blocks.len())
    }

    fn max_positions(&self) -> usize {
        self.config.n_positions
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn};

    #[test]
    fn test_forward_returns_vocab_logits() {
        let model = tiny_model(7);
        let mut cache = model.new_cache();
        let logits = model.forward(&[1, 2, 3], &mut cache).unwrap();
        assert_eq!(logits.len(), 12);
        assert!(logits.iter().all(|v| v.is_finite()));
        assert_eq!(cache.seq_len(), 3);
    }

    #[test]
    fn test_incremental_decoding_matches_full_recompute() {
        let model = tiny_model(11);
        let ids = [4u32, 9, 2, 7, 5];

        let mut full_cache = model.new_cache();
        let full = model.forward(&ids, &mut full_cache).unwrap();

        let mut step_cache = model.new_cache();
        model.forward(&ids[..3], &mut step_cache).unwrap();
        model.forward(&ids[3..4], &mut step_cache).unwrap();
        let stepped = model.forward(&ids[4..], &mut step_cache).unwrap();

        for (a, b) in full.iter().zip(stepped.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_prefix_logits_ignore_future_tokens() {
        let model = tiny_model(3);
        let mut cache_a = model.new_cache();
        let mut cache_b = model.new_cache();
        let a = model.forward(&[1, 2], &mut cache_a).unwrap();
        let b = model.forward(&[1, 2], &mut cache_b).unwrap();
        model.forward(&[8], &mut cache_b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_forward_rejects_bad_input() {
        let model = tiny_model(1);

        let mut cache = model.new_cache();
        assert!(matches!(model.forward(&[], &mut cache), Err(ModelError::EmptyInput)));
        assert!(matches!(
            model.forward(&[12], &mut cache),
            Err(ModelError::TokenOutOfRange { id: 12, vocab_size: 12 })
        ));

        let too_long = vec![1u32; 33];
        assert!(matches!(
            model.forward(&too_long, &mut cache),
            Err(ModelError::ContextOverflow { requested: 33, max: 32 })
        ));

        let mut wrong_cache = KvCache::new(5);
        assert!(matches!(
            model.forward(&[1], &mut wrong_cache),
            Err(ModelError::CacheMismatch { expected: 2, actual: 5 })
        ));
    }

    #[test]
    fn test_from_weights_reports_missing_tensor() {
        let config = tiny_config();
        let mut weights = random_weights(&config, 5);
        weights.remove("transformer.h.1.attn.v_proj.weight");
        match GptJModel::from_weights(config, &mut weights) {
            Err(ModelError::MissingWeight(name)) => assert_eq!(name, "transformer.h.1.attn.v_proj.weight"),
            other => panic!("expected missing weight, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_from_weights_reports_wrong_shape() {
        let config = tiny_config();
        let mut weights = random_weights(&config, 5);
        weights.insert("transformer.ln_f.weight", ArrayD::ones(IxDyn(&[9])));
        assert!(matches!(
            GptJModel::from_weights(config, &mut weights),
            Err(ModelError::WeightShape { .. })
        ));
    }

    #[test]
    fn test_from_weights_leaves_unused_tensors() {
        let config = tiny_config();
        let mut weights = random_weights(&config, 5);
        weights.insert("transformer.h.0.attn.masked_bias", ArrayD::zeros(IxDyn(&[1])));
        GptJModel::from_weights(config, &mut weights).unwrap();
        assert_eq!(weights.len(), 1);
        assert!(weights.contains("transformer.h.0.attn.masked_bias"));
    }
}
