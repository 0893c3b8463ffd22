use crate::common::Linear;
use crate::model::ModelError;
use libm::tanhf;
use ndarray::Array2;

// GELU approximation ("gelu_new")
pub fn gelu_new(x: f32) -> f32 {
    0.5 * x * (1.0 + tanhf((2.0f32 / std::f32::consts::PI).sqrt() * (x + 0.044715 * x.powi(3))))
}

#[derive(Debug, Clone)]
pub struct GptJMlp {
    fc_in: Linear,
    fc_out: Linear,
}

impl GptJMlp {
    pub fn new(fc_in: Linear, fc_out: Linear) -> Result<Self, ModelError> {
        if fc_in.out_features() != fc_out.in_features() || fc_in.in_features() != fc_out.out_features() {
            return Err(ModelError::InvalidShape(format!(
                "fc_in is {}x{} but fc_out is {}x{}",
                fc_in.out_features(),
                fc_in.in_features(),
                fc_out.out_features(),
                fc_out.in_features()
            )));
        }
        Ok(Self { fc_in, fc_out })
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let hidden = self.fc_in.forward(x).mapv_into(gelu_new);
        self.fc_out.forward(&hidden)
    }
}
