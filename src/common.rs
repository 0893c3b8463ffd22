use crate::model::ModelError;
use ndarray::{concatenate, Array1, Array2, Array3, Axis};

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Array1<f32>, // gamma
    bias: Array1<f32>,   // beta
    epsilon: f32,
}

impl LayerNorm {
    pub fn new(weight: Array1<f32>, bias: Array1<f32>, epsilon: f32) -> Result<Self, ModelError> {
        if weight.len() != bias.len() {
            return Err(ModelError::InvalidShape(format!(
                "layer norm weight has {} elements but bias has {}",
                weight.len(),
                bias.len()
            )));
        }
        Ok(Self { weight, bias, epsilon })
    }

    /// Normalizes each row of `x` (`[seq_len, n_embd]`).
    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let axis = Axis(1);
        let n = x.len_of(axis) as f32;
        let mean = x.sum_axis(axis) / n;
        let centered = x - &mean.insert_axis(axis);
        let variance = centered.mapv(|v| v * v).sum_axis(axis) / n;
        let std_dev_inv = (variance + self.epsilon).mapv(|v| 1.0 / v.sqrt());

        let normalized = centered * &std_dev_inv.insert_axis(axis);
        normalized * &self.weight + &self.bias
    }
}

/// Dense layer with PyTorch weight layout (`[out_features, in_features]`).
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl Linear {
    pub fn new(weight: Array2<f32>, bias: Option<Array1<f32>>) -> Result<Self, ModelError> {
        if let Some(b) = &bias {
            if b.len() != weight.nrows() {
                return Err(ModelError::InvalidShape(format!(
                    "linear bias has {} elements, expected {}",
                    b.len(),
                    weight.nrows()
                )));
            }
        }
        Ok(Self { weight, bias })
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut y = x.dot(&self.weight.t());
        if let Some(b) = &self.bias {
            y += b;
        }
        y
    }
}

// Keys and values for one layer, shape [n_head, seq_len, head_dim].
#[derive(Debug, Clone, Default)]
pub struct LayerKvCache {
    entry: Option<(Array3<f32>, Array3<f32>)>,
}

impl LayerKvCache {
    pub fn seq_len(&self) -> usize {
        self.entry.as_ref().map_or(0, |(k, _)| k.len_of(Axis(1)))
    }

    /// Appends new keys/values along the sequence axis and returns the full history.
    pub fn append(
        &mut self,
        key: Array3<f32>,
        value: Array3<f32>,
    ) -> Result<(&Array3<f32>, &Array3<f32>), ModelError> {
        let merged = match self.entry.take() {
            None => (key, value),
            Some((past_k, past_v)) => (
                concatenate(Axis(1), &[past_k.view(), key.view()])?,
                concatenate(Axis(1), &[past_v.view(), value.view()])?,
            ),
        };
        let (k, v) = &*self.entry.insert(merged);
        Ok((k, v))
    }
}

/// Per-call cache for the whole model, one entry per layer.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerKvCache>,
}

impl KvCache {
    pub fn new(n_layer: usize) -> Self {
        Self {
            layers: vec![LayerKvCache::default(); n_layer],
        }
    }

    pub fn seq_len(&self) -> usize {
        self.layers.first().map_or(0, LayerKvCache::seq_len)
    }

    pub fn layer_mut(&mut self, index: usize) -> Option<&mut LayerKvCache> {
        self.layers.get_mut(index)
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }
}
