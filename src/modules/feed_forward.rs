//! Feed-forward sublayer
//!
//! Two dense layers around a GELU, or a gated GELU (GEGLU) when `gated` is
//! set, with dropout between projection and output.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::gelu;

/// Configuration for [`FeedForward`].
#[derive(Config, Debug)]
pub struct FeedForwardConfig {
    /// Input channel dimension
    pub dim: usize,

    /// Output channel dimension (defaults to `dim`)
    pub dim_out: Option<usize>,

    /// Hidden expansion factor (default: 4)
    #[config(default = 4)]
    pub mult: usize,

    /// Use a gated GELU (GEGLU) instead of a plain GELU (default: true)
    #[config(default = true)]
    pub gated: bool,

    /// Dropout probability (default: 0.0)
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl FeedForwardConfig {
    /// Initialize the sublayer.
    pub fn init<B: Backend>(&self, device: &B::Device) -> FeedForward<B> {
        let inner_dim = self.dim * self.mult;
        let dim_out = self.dim_out.unwrap_or(self.dim);
        let proj_dim = if self.gated { inner_dim * 2 } else { inner_dim };

        FeedForward {
            proj_in: LinearConfig::new(self.dim, proj_dim).init(device),
            proj_out: LinearConfig::new(inner_dim, dim_out).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            gated: self.gated,
        }
    }
}

/// Feed-forward network with (gated) GELU activation.
#[derive(Module, Debug)]
pub struct FeedForward<B: Backend> {
    /// Input projection; twice as wide when gated
    proj_in: Linear<B>,
    /// Output projection
    proj_out: Linear<B>,
    /// Dropout between activation and output
    dropout: Dropout,
    /// Whether the activation is gated (GEGLU)
    gated: bool,
}

impl<B: Backend> FeedForward<B> {
    /// Forward pass for `[batch, seq_len, dim]`.
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let hidden = if self.gated {
            let mut chunks = self.proj_in.forward(x).chunk(2, 2);
            let gate = chunks.pop().unwrap();
            let value = chunks.pop().unwrap();
            value * gelu(gate)
        } else {
            gelu(self.proj_in.forward(x))
        };
        self.proj_out.forward(self.dropout.forward(hidden))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn gated_forward_keeps_shape() {
        let device = Default::default();
        let ff = FeedForwardConfig::new(16).init::<TestBackend>(&device);
        let x = Tensor::random([2, 5, 16], Distribution::Default, &device);
        assert_eq!(ff.forward(x).dims(), [2, 5, 16]);
    }

    #[test]
    fn plain_forward_projects_to_dim_out() {
        let device = Default::default();
        let ff = FeedForwardConfig::new(16)
            .with_gated(false)
            .with_dim_out(Some(8))
            .init::<TestBackend>(&device);
        let x = Tensor::random([1, 3, 16], Distribution::Default, &device);
        assert_eq!(ff.forward(x).dims(), [1, 3, 8]);
    }
}
