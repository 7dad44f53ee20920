//! Cross/self attention with an optional long-video windowed path
//!
//! A single layer covers plain self-attention, text cross-attention with an
//! optional image-token split, learned relative position bias, and the
//! windowed aggregation scheme used for long-video temporal self-attention.

use burn::config::Config;
use burn::module::{Ignored, Module};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::softmax;
use tracing::debug;

use crate::config::{AttentionMode, WindowConfig};
use crate::error::AttentionError;
use crate::modules::relative_position::RelativePosition;
use crate::modules::window::{
    consistency_correction, correction_active, kept_components, WindowAccumulator,
};

/// Attention probabilities over the key axis.
///
/// `q`, `k` are `[batch*heads, len, head_dim]`; `bias` is an additive
/// `[batch*heads, len_q, len_k]` term applied after scaling; `mask` is
/// boolean, broadcast over the leading axis, with masked-out scores set to
/// the most negative finite value before normalization so they receive ~0
/// probability. Only boolean masks exist at this level; soft masks are
/// unrepresentable by construction.
pub fn attention_probs<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    bias: Option<Tensor<B, 3>>,
    mask: Option<Tensor<B, 3, Bool>>,
    scale: f32,
) -> Tensor<B, 3> {
    let [bh, len_q, _] = q.dims();
    let len_k = k.dims()[1];

    let mut sim = q.matmul(k.transpose()) * scale;
    if let Some(bias) = bias {
        sim = sim + bias;
    }
    if let Some(mask) = mask {
        let mask = mask.expand([bh, len_q, len_k]);
        sim = sim.mask_fill(mask.bool_not(), f32::MIN);
    }
    softmax(sim, 2)
}

/// Scaled dot-product attention: `softmax(q·kᵀ · scale + bias) · v`.
pub fn scaled_dot_attention<B: Backend>(
    q: Tensor<B, 3>,
    k: Tensor<B, 3>,
    v: Tensor<B, 3>,
    bias: Option<Tensor<B, 3>>,
    mask: Option<Tensor<B, 3, Bool>>,
    scale: f32,
) -> Tensor<B, 3> {
    attention_probs(q, k, bias, mask, scale).matmul(v)
}

/// Configuration for [`CrossAttention`].
#[derive(Config, Debug)]
pub struct CrossAttentionConfig {
    /// Dispatch mode, fixed at construction
    pub mode: AttentionMode,

    /// Channel dimension of the query input
    pub query_dim: usize,

    /// Channel dimension of the context (defaults to `query_dim`)
    pub context_dim: Option<usize>,

    /// Number of attention heads (default: 8)
    #[config(default = 8)]
    pub heads: usize,

    /// Per-head dimension (default: 64)
    #[config(default = 64)]
    pub head_dim: usize,

    /// Dropout probability on the output projection (default: 0.0)
    #[config(default = 0.0)]
    pub dropout: f64,

    /// Whether to add learned relative position bias
    #[config(default = false)]
    pub relative_position: bool,

    /// Maximum relative distance; required when `relative_position` is set
    pub temporal_length: Option<usize>,

    /// Whether the context carries image tokens past the text segment
    #[config(default = false)]
    pub image_cross_attention: bool,

    /// Scale on the image-token attention output (default: 1.0)
    #[config(default = 1.0)]
    pub image_cross_attention_scale: f64,

    /// Number of leading text tokens in the context (default: 77)
    #[config(default = 77)]
    pub text_context_len: usize,

    /// Long-video windowing schedule; only consulted in self-attention mode
    pub window: Option<WindowConfig>,
}

impl CrossAttentionConfig {
    /// Initialize the layer, validating the configuration.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<CrossAttention<B>, AttentionError> {
        let inner_dim = self.heads * self.head_dim;
        let context_dim = self.context_dim.unwrap_or(self.query_dim);

        let (relative_position_k, relative_position_v) = if self.relative_position {
            let max = self
                .temporal_length
                .ok_or(AttentionError::MissingTemporalLength)?;
            (
                Some(RelativePosition::new(self.head_dim, max, device)),
                Some(RelativePosition::new(self.head_dim, max, device)),
            )
        } else {
            (None, None)
        };

        if let Some(window) = &self.window {
            if window.stride == 0 {
                return Err(AttentionError::ZeroStride);
            }
            window.weighting.weights(window.window_size)?;
        }

        let (to_k_ip, to_v_ip) = if self.image_cross_attention {
            (
                Some(LinearConfig::new(context_dim, inner_dim).with_bias(false).init(device)),
                Some(LinearConfig::new(context_dim, inner_dim).with_bias(false).init(device)),
            )
        } else {
            (None, None)
        };

        Ok(CrossAttention {
            to_q: LinearConfig::new(self.query_dim, inner_dim).with_bias(false).init(device),
            to_k: LinearConfig::new(context_dim, inner_dim).with_bias(false).init(device),
            to_v: LinearConfig::new(context_dim, inner_dim).with_bias(false).init(device),
            to_out: LinearConfig::new(inner_dim, self.query_dim).with_bias(true).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
            to_k_ip,
            to_v_ip,
            relative_position_k,
            relative_position_v,
            mode: Ignored(self.mode.clone()),
            window: Ignored(self.window.clone()),
            heads: self.heads,
            head_dim: self.head_dim,
            scale: 1.0 / (self.head_dim as f32).sqrt(),
            image_cross_attention_scale: self.image_cross_attention_scale as f32,
            text_context_len: self.text_context_len,
            context_dim,
        })
    }
}

/// Cross/self attention layer.
#[derive(Module, Debug)]
pub struct CrossAttention<B: Backend> {
    /// Query projection
    to_q: Linear<B>,
    /// Key projection (from context in cross mode)
    to_k: Linear<B>,
    /// Value projection
    to_v: Linear<B>,
    /// Output projection
    to_out: Linear<B>,
    /// Dropout on the output projection
    dropout: Dropout,
    /// Key projection for image tokens
    to_k_ip: Option<Linear<B>>,
    /// Value projection for image tokens
    to_v_ip: Option<Linear<B>>,
    /// Key-side relative position table
    relative_position_k: Option<RelativePosition<B>>,
    /// Value-side relative position table
    relative_position_v: Option<RelativePosition<B>>,
    /// Dispatch mode
    mode: Ignored<AttentionMode>,
    /// Long-video windowing schedule
    window: Ignored<Option<WindowConfig>>,
    /// Number of attention heads
    heads: usize,
    /// Head dimension
    head_dim: usize,
    /// Score scale, `1 / sqrt(head_dim)`
    scale: f32,
    /// Scale on the image-token attention output
    image_cross_attention_scale: f32,
    /// Leading text tokens in the context
    text_context_len: usize,
    /// Expected context channel dimension
    context_dim: usize,
}

impl<B: Backend> CrossAttention<B> {
    /// Forward pass.
    ///
    /// # Arguments
    /// * `x` - Query tokens `[batch, seq_len, query_dim]`
    /// * `context` - Context tokens `[batch, ctx_len, context_dim]`; required
    ///   in cross mode, rejected in self mode
    /// * `mask` - Boolean attention mask `[1, seq_len, seq_len]`, broadcast
    ///   over batch and heads; self-attention paths only
    /// * `timestep` - Current diffusion timestep, gating the windowed
    ///   consistency correction
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        context: Option<&Tensor<B, 3>>,
        mask: Option<&Tensor<B, 3, Bool>>,
        timestep: Option<usize>,
    ) -> Result<Tensor<B, 3>, AttentionError> {
        match (&self.mode.0, context) {
            (AttentionMode::CrossAttention, None) => return Err(AttentionError::MissingContext),
            (AttentionMode::SelfAttention, Some(_)) => {
                return Err(AttentionError::UnexpectedContext)
            }
            _ => {}
        }

        let seq_len = x.dims()[1];
        let q = self.split_heads(self.to_q.forward(x.clone()));

        let (context_text, context_img) = match context {
            Some(context) => {
                let [ctx_batch, ctx_len, ctx_dim] = context.dims();
                if ctx_dim != self.context_dim {
                    return Err(AttentionError::ContextDimMismatch {
                        expected: self.context_dim,
                        got: ctx_dim,
                    });
                }
                if self.to_k_ip.is_some() {
                    if ctx_len <= self.text_context_len {
                        return Err(AttentionError::ImageTokensMissing {
                            text_len: self.text_context_len,
                            got: ctx_len,
                        });
                    }
                    (
                        context.clone().slice([
                            0..ctx_batch,
                            0..self.text_context_len,
                            0..ctx_dim,
                        ]),
                        Some(context.clone().slice([
                            0..ctx_batch,
                            self.text_context_len..ctx_len,
                            0..ctx_dim,
                        ])),
                    )
                } else {
                    (context.clone(), None)
                }
            }
            None => (x, None),
        };

        let k = self.split_heads(self.to_k.forward(context_text.clone()));
        let v = self.split_heads(self.to_v.forward(context_text));
        let ip = match (&self.to_k_ip, &self.to_v_ip, context_img) {
            (Some(to_k_ip), Some(to_v_ip), Some(img)) => Some((
                self.split_heads(to_k_ip.forward(img.clone())),
                self.split_heads(to_v_ip.forward(img)),
            )),
            _ => None,
        };

        let out = match &self.window.0 {
            Some(window)
                if matches!(self.mode.0, AttentionMode::SelfAttention)
                    && seq_len >= window.window_size =>
            {
                self.forward_windowed(q, k, v, ip, mask, timestep, window)?
            }
            _ => {
                if mask.is_some() && matches!(self.mode.0, AttentionMode::CrossAttention) {
                    return Err(AttentionError::UnsupportedMask);
                }
                let mut out = self.merge_heads(self.attend(q.clone(), k, v, mask, 1.0));
                if let Some((k_ip, v_ip)) = ip {
                    let ip_out = self.merge_heads(scaled_dot_attention(
                        q, k_ip, v_ip, None, None, self.scale,
                    ));
                    out = out + ip_out * self.image_cross_attention_scale;
                }
                out
            }
        };

        Ok(self.dropout.forward(self.to_out.forward(out)))
    }

    /// Long-video aggregation: one global reference pass, per-window
    /// attention with consistency correction, weighted overlap-add blending.
    #[allow(clippy::too_many_arguments)]
    fn forward_windowed(
        &self,
        q: Tensor<B, 3>,
        k: Tensor<B, 3>,
        v: Tensor<B, 3>,
        ip: Option<(Tensor<B, 3>, Tensor<B, 3>)>,
        mask: Option<&Tensor<B, 3, Bool>>,
        timestep: Option<usize>,
        window: &WindowConfig,
    ) -> Result<Tensor<B, 3>, AttentionError> {
        let [bh, total, head_dim] = q.dims();
        window.verify_coverage(total)?;
        let windows = window.partition(total);
        let weights = window.weighting.weights(window.window_size)?;
        debug!(
            total,
            window_size = window.window_size,
            stride = window.stride,
            num_windows = windows.len(),
            "windowed temporal attention"
        );

        // Global long-range pass: the consistency reference, not the output.
        // The query is pre-scaled to compensate for attention-entropy growth
        // beyond the tuned window length.
        let long_out = self.merge_heads(self.attend(
            q.clone(),
            k.clone(),
            v.clone(),
            mask,
            window.entropy_scale(total),
        ));

        let device = q.device();
        let batch = bh / self.heads;
        let inner_dim = self.heads * self.head_dim;
        let mut acc = WindowAccumulator::<B>::new(batch, total, inner_dim, &device);
        let weight_row = Tensor::<B, 1>::from_floats(weights.as_slice(), &device);

        for (window_index, &(t_start, t_end)) in windows.iter().enumerate() {
            let q_w = q.clone().slice([0..bh, t_start..t_end, 0..head_dim]);
            let k_w = k.clone().slice([0..bh, t_start..t_end, 0..head_dim]);
            let v_w = v.clone().slice([0..bh, t_start..t_end, 0..head_dim]);
            let mask_w = mask.map(|m| {
                let mask_batch = m.dims()[0];
                m.clone()
                    .slice([0..mask_batch, t_start..t_end, t_start..t_end])
            });

            let out_w = self.merge_heads(self.attend(q_w, k_w, v_w, mask_w.as_ref(), 1.0));

            let out_w = match timestep {
                Some(t) if correction_active(window_index, t) => {
                    let reference =
                        long_out
                            .clone()
                            .slice([0..batch, t_start..t_end, 0..inner_dim]);
                    consistency_correction(out_w, reference, kept_components(window_index))?
                }
                _ => out_w,
            };

            let span = t_end - t_start;
            let weighted = out_w * weight_row.clone().reshape([1, span, 1]);
            acc.add(t_start, t_end, weighted, weight_row.clone());
        }

        let mut blended = acc.blend();

        // Image tokens, when present, contribute one pass over the full
        // sequence rather than per window.
        if let Some((k_ip, v_ip)) = ip {
            let ip_out =
                self.merge_heads(scaled_dot_attention(q, k_ip, v_ip, None, None, self.scale));
            blended = blended + ip_out * self.image_cross_attention_scale;
        }

        Ok(blended)
    }

    /// One attention pass with optional relative-position bias.
    ///
    /// `query_scale` is an extra multiplier on the query (1.0 outside the
    /// global long-range pass).
    fn attend(
        &self,
        q: Tensor<B, 3>,
        k: Tensor<B, 3>,
        v: Tensor<B, 3>,
        mask: Option<&Tensor<B, 3, Bool>>,
        query_scale: f32,
    ) -> Tensor<B, 3> {
        let [_, len_q, _] = q.dims();
        let len_k = k.dims()[1];
        let q = if query_scale != 1.0 { q * query_scale } else { q };

        let bias = self.relative_position_k.as_ref().map(|table| {
            let embeddings = table.forward(len_q, len_k);
            // (len_q, bh, head_dim) x (len_q, head_dim, len_k) per position
            q.clone()
                .swap_dims(0, 1)
                .matmul(embeddings.swap_dims(1, 2))
                .swap_dims(0, 1)
                * self.scale
        });

        let probs = attention_probs(q, k, bias, mask.cloned(), self.scale);
        let mut out = probs.clone().matmul(v);

        if let Some(table) = &self.relative_position_v {
            let embeddings = table.forward(len_q, len_k);
            out = out + probs.swap_dims(0, 1).matmul(embeddings).swap_dims(0, 1);
        }
        out
    }

    /// `[batch, len, heads * head_dim]` -> `[batch * heads, len, head_dim]`
    fn split_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, len, _] = x.dims();
        x.reshape([batch, len, self.heads, self.head_dim])
            .swap_dims(1, 2)
            .reshape([batch * self.heads, len, self.head_dim])
    }

    /// `[batch * heads, len, head_dim]` -> `[batch, len, heads * head_dim]`
    fn merge_heads(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [bh, len, _] = x.dims();
        let batch = bh / self.heads;
        x.reshape([batch, self.heads, len, self.head_dim])
            .swap_dims(1, 2)
            .reshape([batch, len, self.heads * self.head_dim])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::transformer::causal_mask;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    fn tensor_values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32], tolerance: f32) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tolerance, "{x} != {y}");
        }
    }

    fn random(shape: [usize; 3]) -> Tensor<TestBackend, 3> {
        Tensor::random(shape, Distribution::Uniform(-1.0, 1.0), &Default::default())
    }

    #[test]
    fn probabilities_are_normalized() {
        let q = random([2, 4, 8]);
        let k = random([2, 4, 8]);
        let probs = attention_probs(q, k, None, None, 8.0f32.sqrt().recip());
        let values = tensor_values(probs);
        assert!(values.iter().all(|&p| p >= 0.0));
        for row in values.chunks(4) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
        }
    }

    #[test]
    fn causal_mask_zeroes_future_keys() {
        let device = Default::default();
        let q = random([1, 4, 8]);
        let k = random([1, 4, 8]);
        let mask = causal_mask::<TestBackend>(4, &device);
        let probs = attention_probs(q, k, None, Some(mask), 0.35);
        let values = tensor_values(probs);
        for i in 0..4 {
            for j in 0..4 {
                let p = values[i * 4 + j];
                if j > i {
                    assert_eq!(p, 0.0, "future key ({i},{j}) leaked {p}");
                } else {
                    assert!(p > 0.0);
                }
            }
        }
    }

    #[test]
    fn self_attention_rejects_context() {
        let device = Default::default();
        let layer = CrossAttentionConfig::new(AttentionMode::SelfAttention, 16)
            .with_heads(2)
            .with_head_dim(8)
            .init::<TestBackend>(&device)
            .unwrap();
        let ctx = random([1, 4, 16]);
        let err = layer.forward(random([1, 4, 16]), Some(&ctx), None, None);
        assert!(matches!(err, Err(AttentionError::UnexpectedContext)));
    }

    #[test]
    fn cross_attention_requires_context() {
        let device = Default::default();
        let layer = CrossAttentionConfig::new(AttentionMode::CrossAttention, 16)
            .with_context_dim(Some(24))
            .with_heads(2)
            .with_head_dim(8)
            .init::<TestBackend>(&device)
            .unwrap();
        let err = layer.forward(random([1, 4, 16]), None, None, None);
        assert!(matches!(err, Err(AttentionError::MissingContext)));
    }

    #[test]
    fn cross_attention_validates_context_dim() {
        let device = Default::default();
        let layer = CrossAttentionConfig::new(AttentionMode::CrossAttention, 16)
            .with_context_dim(Some(24))
            .with_heads(2)
            .with_head_dim(8)
            .init::<TestBackend>(&device)
            .unwrap();
        let ctx = random([1, 4, 16]);
        let err = layer.forward(random([1, 4, 16]), Some(&ctx), None, None);
        assert!(matches!(
            err,
            Err(AttentionError::ContextDimMismatch { expected: 24, got: 16 })
        ));
    }

    #[test]
    fn cross_attention_rejects_masks() {
        let device = Default::default();
        let layer = CrossAttentionConfig::new(AttentionMode::CrossAttention, 16)
            .with_heads(2)
            .with_head_dim(8)
            .init::<TestBackend>(&device)
            .unwrap();
        let ctx = random([1, 4, 16]);
        let mask = causal_mask::<TestBackend>(4, &device);
        let err = layer.forward(random([1, 4, 16]), Some(&ctx), Some(&mask), None);
        assert!(matches!(err, Err(AttentionError::UnsupportedMask)));
    }

    #[test]
    fn relative_position_requires_temporal_length() {
        let device = Default::default();
        let err = CrossAttentionConfig::new(AttentionMode::SelfAttention, 16)
            .with_relative_position(true)
            .init::<TestBackend>(&device);
        assert!(matches!(err, Err(AttentionError::MissingTemporalLength)));
    }

    #[test]
    fn zero_image_scale_ignores_image_tokens() {
        let device = Default::default();
        let layer = CrossAttentionConfig::new(AttentionMode::CrossAttention, 16)
            .with_heads(2)
            .with_head_dim(8)
            .with_image_cross_attention(true)
            .with_image_cross_attention_scale(0.0)
            .with_text_context_len(5)
            .init::<TestBackend>(&device)
            .unwrap();

        let x = random([1, 4, 16]);
        let text = random([1, 5, 16]);
        let img_a = random([1, 3, 16]);
        let img_b = random([1, 3, 16]);
        let ctx_a = Tensor::cat(vec![text.clone(), img_a], 1);
        let ctx_b = Tensor::cat(vec![text, img_b], 1);

        let out_a = layer.forward(x.clone(), Some(&ctx_a), None, None).unwrap();
        let out_b = layer.forward(x, Some(&ctx_b), None, None).unwrap();
        assert_close(&tensor_values(out_a), &tensor_values(out_b), 1e-6);
    }

    #[test]
    fn image_cross_attention_needs_image_tokens() {
        let device = Default::default();
        let layer = CrossAttentionConfig::new(AttentionMode::CrossAttention, 16)
            .with_heads(2)
            .with_head_dim(8)
            .with_image_cross_attention(true)
            .with_text_context_len(5)
            .init::<TestBackend>(&device)
            .unwrap();
        let ctx = random([1, 5, 16]);
        let err = layer.forward(random([1, 4, 16]), Some(&ctx), None, None);
        assert!(matches!(err, Err(AttentionError::ImageTokensMissing { .. })));
    }

    #[test]
    fn single_window_matches_plain_attention() {
        // A sequence exactly one window long degenerates to plain attention:
        // one window, uniform weight, no overlap, correction off at window 0.
        let device = Default::default();
        let layer = CrossAttentionConfig::new(AttentionMode::SelfAttention, 16)
            .with_heads(2)
            .with_head_dim(8)
            .with_window(Some(WindowConfig::new().with_window_size(4).with_stride(2)))
            .init::<TestBackend>(&device)
            .unwrap();

        let x = random([1, 4, 16]);
        let windowed = layer.forward(x.clone(), None, None, Some(900)).unwrap();

        let q = layer.split_heads(layer.to_q.forward(x.clone()));
        let k = layer.split_heads(layer.to_k.forward(x.clone()));
        let v = layer.split_heads(layer.to_v.forward(x));
        let plain = layer
            .to_out
            .forward(layer.merge_heads(layer.attend(q, k, v, None, 1.0)));

        assert_close(&tensor_values(windowed), &tensor_values(plain), 1e-5);
    }

    #[test]
    fn windowed_forward_rejects_uncovered_tail() {
        let device = Default::default();
        let layer = CrossAttentionConfig::new(AttentionMode::SelfAttention, 16)
            .with_heads(2)
            .with_head_dim(8)
            .with_window(Some(WindowConfig::new().with_window_size(4).with_stride(3)))
            .init::<TestBackend>(&device)
            .unwrap();
        // 9 frames: windows (0,4), (3,7) and then 7..9 are uncovered.
        let err = layer.forward(random([1, 9, 16]), None, None, Some(900));
        assert!(matches!(err, Err(AttentionError::UncoveredPositions { .. })));
    }

    #[test]
    fn windowed_output_keeps_shape() {
        let device = Default::default();
        let layer = CrossAttentionConfig::new(AttentionMode::SelfAttention, 16)
            .with_heads(2)
            .with_head_dim(8)
            .with_window(Some(WindowConfig::new().with_window_size(4).with_stride(2)))
            .init::<TestBackend>(&device)
            .unwrap();
        let out = layer.forward(random([2, 8, 16]), None, None, Some(700)).unwrap();
        assert_eq!(out.dims(), [2, 8, 16]);
    }
}
