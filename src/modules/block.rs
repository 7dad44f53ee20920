//! Basic transformer block
//!
//! Pre-norm self-attention, pre-norm cross-attention, and a pre-norm
//! feed-forward sublayer, each with a residual add. When no context
//! dimension is configured the second attention runs in self mode as well
//! (temporal self-only stacks), and the windowing schedule applies to both.
//!
//! Activation checkpointing is a property of the autodiff backend: training
//! with `Autodiff<B, BalancedCheckpointing>` recomputes activations during
//! the backward pass instead of retaining them.

use burn::config::Config;
use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::*;

use crate::config::{AttentionMode, WindowConfig};
use crate::error::AttentionError;
use crate::modules::attention::{CrossAttention, CrossAttentionConfig};
use crate::modules::feed_forward::{FeedForward, FeedForwardConfig};

/// Configuration for [`BasicTransformerBlock`].
#[derive(Config, Debug)]
pub struct TransformerBlockConfig {
    /// Token channel dimension
    pub dim: usize,

    /// Number of attention heads
    pub heads: usize,

    /// Per-head dimension
    pub head_dim: usize,

    /// Dropout probability (default: 0.0)
    #[config(default = 0.0)]
    pub dropout: f64,

    /// Context dimension for the second attention; self mode when absent
    pub context_dim: Option<usize>,

    /// Gated GELU in the feed-forward (default: true)
    #[config(default = true)]
    pub gated_ff: bool,

    /// Image-token cross attention on the second attention
    #[config(default = false)]
    pub image_cross_attention: bool,

    /// Learned relative position bias on the attention layers
    #[config(default = false)]
    pub relative_position: bool,

    /// Maximum relative distance for the bias tables
    pub temporal_length: Option<usize>,

    /// Long-video windowing schedule for self-attention
    pub window: Option<WindowConfig>,
}

impl TransformerBlockConfig {
    /// Initialize the block.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<BasicTransformerBlock<B>, AttentionError> {
        let attn1 = CrossAttentionConfig::new(AttentionMode::SelfAttention, self.dim)
            .with_heads(self.heads)
            .with_head_dim(self.head_dim)
            .with_dropout(self.dropout)
            .with_relative_position(self.relative_position)
            .with_temporal_length(self.temporal_length)
            .with_window(self.window.clone())
            .init(device)?;

        let attn2 = match self.context_dim {
            Some(context_dim) => CrossAttentionConfig::new(AttentionMode::CrossAttention, self.dim)
                .with_context_dim(Some(context_dim))
                .with_heads(self.heads)
                .with_head_dim(self.head_dim)
                .with_dropout(self.dropout)
                .with_image_cross_attention(self.image_cross_attention)
                .init(device)?,
            None => CrossAttentionConfig::new(AttentionMode::SelfAttention, self.dim)
                .with_heads(self.heads)
                .with_head_dim(self.head_dim)
                .with_dropout(self.dropout)
                .with_relative_position(self.relative_position)
                .with_temporal_length(self.temporal_length)
                .with_window(self.window.clone())
                .init(device)?,
        };

        Ok(BasicTransformerBlock {
            attn1,
            attn2,
            ff: FeedForwardConfig::new(self.dim)
                .with_gated(self.gated_ff)
                .with_dropout(self.dropout)
                .init(device),
            norm1: LayerNormConfig::new(self.dim).init(device),
            norm2: LayerNormConfig::new(self.dim).init(device),
            norm3: LayerNormConfig::new(self.dim).init(device),
            cross_attend: self.context_dim.is_some(),
        })
    }
}

/// Transformer block: self-attention, cross-attention, feed-forward.
#[derive(Module, Debug)]
pub struct BasicTransformerBlock<B: Backend> {
    /// Self-attention (windowed in long-video mode)
    attn1: CrossAttention<B>,
    /// Cross-attention, or a second self-attention without a context dim
    attn2: CrossAttention<B>,
    /// Feed-forward sublayer
    ff: FeedForward<B>,
    /// Pre-norm for attn1
    norm1: LayerNorm<B>,
    /// Pre-norm for attn2
    norm2: LayerNorm<B>,
    /// Pre-norm for the feed-forward
    norm3: LayerNorm<B>,
    /// Whether attn2 consumes the context
    cross_attend: bool,
}

impl<B: Backend> BasicTransformerBlock<B> {
    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Tokens `[batch, seq_len, dim]`
    /// * `context` - Context for the cross sublayer; ignored-by-config in
    ///   self-only stacks
    /// * `mask` - Boolean mask for the self-attention sublayers; the causal
    ///   mask is never applied to cross attention
    /// * `timestep` - Current diffusion timestep for windowed correction
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Option<&Tensor<B, 3>>,
        mask: Option<&Tensor<B, 3, Bool>>,
        timestep: Option<usize>,
    ) -> Result<Tensor<B, 3>, AttentionError> {
        let x = self
            .attn1
            .forward(self.norm1.forward(x.clone()), None, mask, timestep)?
            + x;

        let (ctx, mask2) = if self.cross_attend {
            (context, None)
        } else {
            (None, mask)
        };
        let x = self
            .attn2
            .forward(self.norm2.forward(x.clone()), ctx, mask2, timestep)?
            + x;

        let x = self.ff.forward(self.norm3.forward(x.clone())) + x;
        Ok(x)
    }
}
