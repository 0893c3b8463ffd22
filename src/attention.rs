use crate::common::{LayerKvCache, Linear};
use crate::model::ModelError;
use ndarray::{s, Array2, Array3, ArrayViewMut1, Axis};

const ROTARY_BASE: f32 = 10000.0;

/// Rotary position embedding in the GPT-J layout: consecutive pairs
/// `(x[2i], x[2i + 1])` of the first `rotary_dim` dimensions are rotated.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(rotary_dim: usize, base: f32) -> Self {
        let inv_freq = (0..rotary_dim / 2)
            .map(|i| 1.0 / base.powf(2.0 * i as f32 / rotary_dim as f32))
            .collect();
        Self { inv_freq }
    }

    /// Rotates `x` (`[n_head, seq_len, head_dim]`) in place; row `t` sits at position `offset + t`.
    pub fn apply(&self, x: &mut Array3<f32>, offset: usize) {
        for mut head in x.outer_iter_mut() {
            for (t, mut row) in head.outer_iter_mut().enumerate() {
                let pos = (offset + t) as f32;
                for (i, &freq) in self.inv_freq.iter().enumerate() {
                    let (sin, cos) = (pos * freq).sin_cos();
                    let x1 = row[2 * i];
                    let x2 = row[2 * i + 1];
                    row[2 * i] = x1 * cos - x2 * sin;
                    row[2 * i + 1] = x2 * cos + x1 * sin;
                }
            }
        }
    }
}

fn softmax_in_place(row: &mut ArrayViewMut1<f32>) {
    let max = row.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    row.mapv_inplace(|v| (v - max).exp());
    let sum = row.sum();
    row.mapv_inplace(|v| v / sum);
}

#[derive(Debug, Clone)]
pub struct GptJAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    n_head: usize,
    head_dim: usize,
    rotary: RotaryEmbedding,
}

impl GptJAttention {
    pub fn new(
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        out_proj: Linear,
        n_head: usize,
        rotary_dim: usize,
    ) -> Result<Self, ModelError> {
        let n_embd = q_proj.in_features();
        if n_head == 0 || n_embd % n_head != 0 {
            return Err(ModelError::InvalidShape(format!(
                "hidden size {} is not divisible by {} heads",
                n_embd, n_head
            )));
        }
        for proj in [&q_proj, &k_proj, &v_proj, &out_proj] {
            if proj.in_features() != n_embd || proj.out_features() != n_embd {
                return Err(ModelError::InvalidShape(format!(
                    "attention projection is {}x{}, expected {}x{}",
                    proj.out_features(),
                    proj.in_features(),
                    n_embd,
                    n_embd
                )));
            }
        }
        let head_dim = n_embd / n_head;
        if rotary_dim > head_dim || rotary_dim % 2 != 0 {
            return Err(ModelError::InvalidShape(format!(
                "rotary_dim {} does not fit head_dim {}",
                rotary_dim, head_dim
            )));
        }
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            n_head,
            head_dim,
            rotary: RotaryEmbedding::new(rotary_dim, ROTARY_BASE),
        })
    }

    // [seq_len, n_embd] -> [n_head, seq_len, head_dim]
    fn split_heads(&self, x: Array2<f32>) -> Result<Array3<f32>, ModelError> {
        let seq_len = x.nrows();
        let heads = x.into_shape((seq_len, self.n_head, self.head_dim))?;
        Ok(heads.permuted_axes([1, 0, 2]).as_standard_layout().into_owned())
    }

    /// Attends over the cached history plus `x`, appending this step's keys and values to `cache`.
    pub fn forward(&self, x: &Array2<f32>, cache: &mut LayerKvCache) -> Result<Array2<f32>, ModelError> {
        let seq_len = x.nrows();
        let offset = cache.seq_len();

        let mut q = self.split_heads(self.q_proj.forward(x))?;
        let mut k = self.split_heads(self.k_proj.forward(x))?;
        let v = self.split_heads(self.v_proj.forward(x))?;
        self.rotary.apply(&mut q, offset);
        self.rotary.apply(&mut k, offset);

        let (keys, values) = cache.append(k, v)?;
        let total_len = keys.len_of(Axis(1));
        let scale = (self.head_dim as f32).sqrt();

        let mut merged = Array2::<f32>::zeros((seq_len, self.n_head * self.head_dim));
        for h in 0..self.n_head {
            let q_h = q.index_axis(Axis(0), h);
            let k_h = keys.index_axis(Axis(0), h);
            let v_h = values.index_axis(Axis(0), h);

            let mut scores = q_h.dot(&k_h.t()) / scale;
            for (i, mut row) in scores.outer_iter_mut().enumerate() {
                // causal mask: query i is at absolute position offset + i
                for j in (offset + i + 1)..total_len {
                    row[j] = f32::NEG_INFINITY;
                }
                softmax_in_place(&mut row);
            }

            let context = scores.dot(&v_h);
            merged
                .slice_mut(s![.., h * self.head_dim..(h + 1) * self.head_dim])
                .assign(&context);
        }

        Ok(self.out_proj.forward(&merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array, Array1};

    fn sample_heads(n_head: usize, seq_len: usize, head_dim: usize) -> Array3<f32> {
        Array::from_shape_fn((n_head, seq_len, head_dim), |(h, t, d)| {
            ((h * 31 + t * 7 + d) as f32 * 0.37).sin()
        })
    }

    fn dot(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn test_rotary_is_identity_at_position_zero() {
        let rotary = RotaryEmbedding::new(4, ROTARY_BASE);
        let original = sample_heads(2, 1, 6);
        let mut rotated = original.clone();
        rotary.apply(&mut rotated, 0);
        for (a, b) in original.iter().zip(rotated.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rotary_rotates_adjacent_pairs() {
        // frequencies for rotary_dim 4 are 1 and 0.01; pairs are (0, 1) and (2, 3)
        let rotary = RotaryEmbedding::new(4, ROTARY_BASE);
        let mut x = Array3::from_shape_vec((1, 1, 4), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        rotary.apply(&mut x, 1);

        let expected = [1.0f32.cos(), 1.0f32.sin(), -(0.01f32.sin()), 0.01f32.cos()];
        for (got, want) in x.iter().zip(expected) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rotary_leaves_tail_dimensions_and_norm() {
        let rotary = RotaryEmbedding::new(4, ROTARY_BASE);
        let original = sample_heads(1, 5, 6);
        let mut rotated = original.clone();
        rotary.apply(&mut rotated, 3);

        for t in 0..5usize {
            let before = original.slice(s![0usize, t, ..]);
            let after = rotated.slice(s![0usize, t, ..]);
            assert_eq!(before[4], after[4]);
            assert_eq!(before[5], after[5]);
            let norm_before = before.mapv(|v| v * v).sum();
            let norm_after = after.mapv(|v| v * v).sum();
            assert_abs_diff_eq!(norm_before, norm_after, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_rotary_scores_depend_on_relative_position() {
        let rotary = RotaryEmbedding::new(4, ROTARY_BASE);
        let q: Array1<f32> = Array1::from(vec![0.3, -0.2, 0.9, 0.4]);
        let k: Array1<f32> = Array1::from(vec![-0.5, 0.1, 0.2, 0.7]);

        let rotate_at = |v: &Array1<f32>, pos: usize| {
            let mut x = v.clone().into_shape((1, 1, 4)).unwrap();
            rotary.apply(&mut x, pos);
            x.into_raw_vec()
        };

        let near = dot(&rotate_at(&q, 5), &rotate_at(&k, 3));
        let far = dot(&rotate_at(&q, 12), &rotate_at(&k, 10));
        assert_abs_diff_eq!(near, far, epsilon = 1e-4);
    }

    #[test]
    fn test_softmax_in_place_handles_masked_entries() {
        let mut row = Array1::from(vec![1.0f32, 2.0, f32::NEG_INFINITY]);
        softmax_in_place(&mut row.view_mut());
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        assert_eq!(row[2], 0.0);
        assert!(row[1] > row[0]);
    }

    #[test]
    fn test_attention_rejects_mismatched_projection() {
        let square = || Linear::new(Array2::zeros((8, 8)), None).unwrap();
        let wrong = Linear::new(Array2::zeros((4, 8)), None).unwrap();
        let result = GptJAttention::new(square(), square(), wrong, square(), 2, 2);
        assert!(matches!(result, Err(ModelError::InvalidShape(_))));
    }

    #[test]
    fn test_attention_single_token_returns_value_projection() -> Result<(), Box<dyn std::error::Error>> {
        // One token attends only to itself, so the context equals its value vector.
        let identity = || Linear::new(Array2::eye(4), None).unwrap();
        let attn = GptJAttention::new(identity(), identity(), identity(), identity(), 2, 2)?;
        let x = Array2::from_shape_vec((1, 4), vec![0.1, 0.2, 0.3, 0.4])?;
        let mut cache = LayerKvCache::default();
        let out = attn.forward(&x, &mut cache)?;
        for (a, b) in out.iter().zip(x.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
        assert_eq!(cache.seq_len(), 1);
        Ok(())
    }
}
