//! Spatial and temporal transformer wrappers
//!
//! Reshape image-like `(B,C,H,W)` and video-like `(B,C,T,H,W)` tensors into
//! token sequences, run the block stack, and reshape back with a residual
//! add. The output projections are zero-initialized, so a freshly
//! initialized wrapper is an identity residual.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{GroupNorm, GroupNormConfig, Initializer, Linear, LinearConfig};
use burn::prelude::*;
use tracing::trace;

use crate::config::WindowConfig;
use crate::error::AttentionError;
use crate::modules::block::{BasicTransformerBlock, TransformerBlockConfig};

/// `(B,C,H,W)` -> token sequence `(B, H*W, C)`.
pub(crate) fn spatial_to_tokens<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [batch, channels, height, width] = x.dims();
    x.reshape([batch, channels, height * width]).swap_dims(1, 2)
}

/// Token sequence `(B, H*W, C)` -> `(B,C,H,W)`. Exact inverse of
/// [`spatial_to_tokens`].
pub(crate) fn tokens_to_spatial<B: Backend>(
    tokens: Tensor<B, 3>,
    height: usize,
    width: usize,
) -> Result<Tensor<B, 4>, AttentionError> {
    let [batch, len, channels] = tokens.dims();
    if len != height * width {
        return Err(AttentionError::TokenLengthMismatch {
            expected: height * width,
            got: len,
        });
    }
    Ok(tokens.swap_dims(1, 2).reshape([batch, channels, height, width]))
}

/// Lower-triangular causal mask: position `i` may only attend to `j <= i`.
///
/// Shaped `[1, len, len]` for broadcast across batch and heads.
pub(crate) fn causal_mask<B: Backend>(len: usize, device: &B::Device) -> Tensor<B, 3, Bool> {
    let rows = Tensor::<B, 1, Int>::arange(0..len as i64, device)
        .reshape([len, 1])
        .repeat(&[1, len]);
    let cols = Tensor::<B, 1, Int>::arange(0..len as i64, device)
        .reshape([1, len])
        .repeat(&[len, 1]);
    cols.lower_equal(rows).reshape([1, len, len])
}

/// Configuration for [`SpatialTransformer`].
#[derive(Config, Debug)]
pub struct SpatialTransformerConfig {
    /// Input channel count
    pub in_channels: usize,

    /// Number of attention heads
    pub heads: usize,

    /// Per-head dimension
    pub head_dim: usize,

    /// Number of transformer blocks (default: 1)
    #[config(default = 1)]
    pub depth: usize,

    /// Dropout probability (default: 0.0)
    #[config(default = 0.0)]
    pub dropout: f64,

    /// Cross-modal context dimension
    pub context_dim: Option<usize>,

    /// Image-token cross attention in the blocks
    #[config(default = false)]
    pub image_cross_attention: bool,

    /// Group count for the input normalization (default: 32)
    #[config(default = 32)]
    pub norm_groups: usize,
}

impl SpatialTransformerConfig {
    /// Initialize the wrapper.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<SpatialTransformer<B>, AttentionError> {
        if self.in_channels % self.norm_groups != 0 {
            return Err(AttentionError::GroupCount {
                channels: self.in_channels,
                groups: self.norm_groups,
            });
        }
        let inner_dim = self.heads * self.head_dim;

        let blocks = (0..self.depth)
            .map(|_| {
                TransformerBlockConfig::new(inner_dim, self.heads, self.head_dim)
                    .with_dropout(self.dropout)
                    .with_context_dim(self.context_dim)
                    .with_image_cross_attention(self.image_cross_attention)
                    .init(device)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SpatialTransformer {
            norm: GroupNormConfig::new(self.norm_groups, self.in_channels)
                .with_epsilon(1e-6)
                .init(device),
            proj_in: LinearConfig::new(self.in_channels, inner_dim).init(device),
            proj_out: LinearConfig::new(inner_dim, self.in_channels)
                .with_initializer(Initializer::Zeros)
                .init(device),
            blocks,
        })
    }
}

/// Transformer over the spatial axes of image-like data.
#[derive(Module, Debug)]
pub struct SpatialTransformer<B: Backend> {
    /// Input group normalization
    norm: GroupNorm<B>,
    /// Token projection in
    proj_in: Linear<B>,
    /// Zero-initialized projection back to input channels
    proj_out: Linear<B>,
    /// Transformer blocks
    blocks: Vec<BasicTransformerBlock<B>>,
}

impl<B: Backend> SpatialTransformer<B> {
    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Feature map `[batch, channels, height, width]`
    /// * `context` - Cross-modal context `[batch, ctx_len, context_dim]`
    ///
    /// # Returns
    /// Same shape as `x`.
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
        context: Option<&Tensor<B, 3>>,
    ) -> Result<Tensor<B, 4>, AttentionError> {
        let [_, _, height, width] = x.dims();
        let residual = x.clone();

        let tokens = spatial_to_tokens(self.norm.forward(x));
        let mut tokens = self.proj_in.forward(tokens);
        for block in &self.blocks {
            tokens = block.forward(tokens, context, None, None)?;
        }
        let tokens = self.proj_out.forward(tokens);

        Ok(tokens_to_spatial(tokens, height, width)? + residual)
    }
}

/// Configuration for [`TemporalTransformer`].
#[derive(Config, Debug)]
pub struct TemporalTransformerConfig {
    /// Input channel count
    pub in_channels: usize,

    /// Number of attention heads
    pub heads: usize,

    /// Per-head dimension
    pub head_dim: usize,

    /// Number of transformer blocks (default: 1)
    #[config(default = 1)]
    pub depth: usize,

    /// Dropout probability (default: 0.0)
    #[config(default = 0.0)]
    pub dropout: f64,

    /// Cross-modal context dimension; self-attention-only when absent
    pub context_dim: Option<usize>,

    /// Restrict each frame to attending at or before itself
    #[config(default = false)]
    pub causal_attention: bool,

    /// Learned relative position bias
    #[config(default = false)]
    pub relative_position: bool,

    /// Maximum relative distance for the bias tables
    pub temporal_length: Option<usize>,

    /// Long-video windowing schedule
    pub window: Option<WindowConfig>,

    /// Group count for the input normalization (default: 32)
    #[config(default = 32)]
    pub norm_groups: usize,
}

impl TemporalTransformerConfig {
    /// Initialize the wrapper.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<TemporalTransformer<B>, AttentionError> {
        if self.in_channels % self.norm_groups != 0 {
            return Err(AttentionError::GroupCount {
                channels: self.in_channels,
                groups: self.norm_groups,
            });
        }
        if self.relative_position && self.temporal_length.is_none() {
            return Err(AttentionError::MissingTemporalLength);
        }
        let inner_dim = self.heads * self.head_dim;

        let blocks = (0..self.depth)
            .map(|_| {
                TransformerBlockConfig::new(inner_dim, self.heads, self.head_dim)
                    .with_dropout(self.dropout)
                    .with_context_dim(self.context_dim)
                    .with_relative_position(self.relative_position)
                    .with_temporal_length(self.temporal_length)
                    .with_window(self.window.clone())
                    .init(device)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TemporalTransformer {
            norm: GroupNormConfig::new(self.norm_groups, self.in_channels)
                .with_epsilon(1e-6)
                .init(device),
            proj_in: LinearConfig::new(self.in_channels, inner_dim).init(device),
            proj_out: LinearConfig::new(inner_dim, self.in_channels)
                .with_initializer(Initializer::Zeros)
                .init(device),
            blocks,
            causal_attention: self.causal_attention,
            cross_attend: self.context_dim.is_some(),
        })
    }
}

/// Transformer over the temporal axis of video-like data, one token
/// sequence per spatial location.
#[derive(Module, Debug)]
pub struct TemporalTransformer<B: Backend> {
    /// Input group normalization
    norm: GroupNorm<B>,
    /// Token projection in
    proj_in: Linear<B>,
    /// Zero-initialized projection back to input channels
    proj_out: Linear<B>,
    /// Transformer blocks
    blocks: Vec<BasicTransformerBlock<B>>,
    /// Whether to apply the causal temporal mask
    causal_attention: bool,
    /// Whether the blocks consume cross-modal context
    cross_attend: bool,
}

impl<B: Backend> TemporalTransformer<B> {
    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Features `[batch, channels, time, height, width]`
    /// * `context` - Cross-modal context `[batch, ctx_len, context_dim]`,
    ///   repeated across the flattened spatial axis; required iff a context
    ///   dimension was configured
    /// * `timestep` - Current diffusion timestep, gating windowed correction
    /// * `num_layer` - Index of this layer in the enclosing U-Net; accepted
    ///   for per-layer policy variation, currently traced only
    ///
    /// # Returns
    /// Same shape as `x`.
    pub fn forward(
        &self,
        x: Tensor<B, 5>,
        context: Option<&Tensor<B, 3>>,
        timestep: Option<usize>,
        num_layer: usize,
    ) -> Result<Tensor<B, 5>, AttentionError> {
        let [batch, channels, time, height, width] = x.dims();
        let device = x.device();
        let residual = x.clone();
        trace!(num_layer, time, "temporal transformer forward");

        // One token sequence per spatial location: (B*H*W, T, C).
        let tokens = self
            .norm
            .forward(x)
            .permute([0, 3, 4, 2, 1])
            .reshape([batch * height * width, time, channels]);
        let tokens = self.proj_in.forward(tokens);
        let inner_dim = tokens.dims()[2];

        let mask = if self.causal_attention {
            Some(causal_mask::<B>(time, &device))
        } else {
            None
        };

        let tokens = if self.cross_attend {
            let context = context.ok_or(AttentionError::MissingContext)?;
            let [ctx_batch, ctx_len, ctx_dim] = context.dims();
            if ctx_batch != batch {
                return Err(AttentionError::TokenLengthMismatch {
                    expected: batch,
                    got: ctx_batch,
                });
            }

            // One batch element at a time: the flattened spatial axis can
            // exceed the sequence-length limits of the backend otherwise.
            let per_batch = tokens.reshape([batch, height * width, time, inner_dim]);
            let mut outputs = Vec::with_capacity(batch);
            for index in 0..batch {
                let mut element = per_batch
                    .clone()
                    .slice([index..index + 1, 0..height * width, 0..time, 0..inner_dim])
                    .reshape([height * width, time, inner_dim]);
                let element_context = context
                    .clone()
                    .slice([index..index + 1, 0..ctx_len, 0..ctx_dim])
                    .repeat(&[height * width, 1, 1]);
                for block in &self.blocks {
                    element =
                        block.forward(element, Some(&element_context), mask.as_ref(), timestep)?;
                }
                outputs.push(element);
            }
            Tensor::stack::<4>(outputs, 0).reshape([batch * height * width, time, inner_dim])
        } else {
            if context.is_some() {
                return Err(AttentionError::UnexpectedContext);
            }
            let mut tokens = tokens;
            for block in &self.blocks {
                tokens = block.forward(tokens, None, mask.as_ref(), timestep)?;
            }
            tokens
        };

        let out = self
            .proj_out
            .forward(tokens)
            .reshape([batch, height, width, time, channels])
            .permute([0, 4, 3, 1, 2]);
        Ok(out + residual)
    }
}
