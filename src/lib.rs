//! Long-video attention for latent video diffusion in Burn
//!
//! Implements the attention subsystem of a video diffusion U-Net: spatial
//! self/cross attention, temporal self-attention with learned relative
//! position bias, image-conditioned cross-attention, and a windowed
//! aggregation scheme for long-video generation with PCA-based consistency
//! correction (FreePCA).
//!
//! ## Architecture
//!
//! - **CrossAttention**: projection + dispatch layer; explicit self/cross
//!   mode, optional image-token split, optional windowed long-video path
//! - **Window aggregation**: overlapping temporal windows, weighted
//!   overlap-add blending, and a principal-component fusion that corrects
//!   each window toward a global long-range attention reference
//! - **BasicTransformerBlock**: self-attn, cross-attn, and a (gated) GELU
//!   feed-forward, each pre-normalized with a residual add
//! - **SpatialTransformer / TemporalTransformer**: reshape image-like and
//!   video-like tensors into token sequences, run the block stack, reshape
//!   back with a residual add
//!
//! Gradient checkpointing is delegated to the autodiff backend: train with
//! `Autodiff<B, BalancedCheckpointing>` to recompute activations during the
//! backward pass. Inference is unaffected.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use freepca_burn::{TemporalTransformerConfig, WindowConfig};
//!
//! let transformer = TemporalTransformerConfig::new(320, 8, 40)
//!     .with_window(Some(WindowConfig::new()))
//!     .init::<Backend>(&device)?;
//!
//! // x: [batch, channels, time, height, width]
//! let out = transformer.forward(x, None, Some(timestep), layer_index)?;
//! ```

pub mod config;
pub mod error;
pub mod modules;

// Re-export main types
pub use config::{AttentionMode, WindowConfig, WindowWeighting};
pub use error::AttentionError;
pub use modules::attention::{CrossAttention, CrossAttentionConfig};
pub use modules::block::{BasicTransformerBlock, TransformerBlockConfig};
pub use modules::feed_forward::{FeedForward, FeedForwardConfig};
pub use modules::relative_position::RelativePosition;
pub use modules::transformer::{
    SpatialTransformer, SpatialTransformerConfig, TemporalTransformer, TemporalTransformerConfig,
};
