//! Configuration vocabulary for the long-video attention scheme
//!
//! The windowing schedule is a configuration, not a literal: window size and
//! stride live here, and the total temporal length is always taken from the
//! runtime temporal axis.

use burn::config::Config;

use crate::error::AttentionError;

/// Attention dispatch mode, fixed at construction.
///
/// A layer constructed as `SelfAttention` rejects a context tensor at call
/// time; a `CrossAttention` layer requires one. The mode is never inferred
/// from argument presence.
#[derive(Config, Debug, PartialEq)]
pub enum AttentionMode {
    SelfAttention,
    CrossAttention,
}

/// Per-position weighting applied when blending overlapping windows.
#[derive(Config, Debug, PartialEq)]
pub enum WindowWeighting {
    /// Uniform weight of 1 at every window position.
    Uniform,
    /// Caller-supplied weights, one per window position.
    Custom(Vec<f32>),
}

impl WindowWeighting {
    /// Materialize the weight sequence for a window of `window_size` frames.
    pub fn weights(&self, window_size: usize) -> Result<Vec<f32>, AttentionError> {
        match self {
            WindowWeighting::Uniform => Ok(vec![1.0; window_size]),
            WindowWeighting::Custom(weights) => {
                if weights.len() != window_size {
                    return Err(AttentionError::WeightLengthMismatch {
                        expected: window_size,
                        got: weights.len(),
                    });
                }
                Ok(weights.clone())
            }
        }
    }
}

/// Windowing schedule for long-video temporal self-attention.
#[derive(Config, Debug)]
pub struct WindowConfig {
    /// Frames per window (default: 16, the length the model was tuned for)
    #[config(default = 16)]
    pub window_size: usize,

    /// Offset between consecutive window starts (default: 4)
    #[config(default = 4)]
    pub stride: usize,

    /// Blending weights across each window
    #[config(default = "WindowWeighting::Uniform")]
    pub weighting: WindowWeighting,
}

impl WindowConfig {
    /// Ordered list of half-open `[start, end)` windows over `total_length`.
    ///
    /// Empty when the sequence is shorter than one window.
    pub fn partition(&self, total_length: usize) -> Vec<(usize, usize)> {
        if self.stride == 0 || total_length < self.window_size {
            return Vec::new();
        }
        let count = (total_length - self.window_size) / self.stride + 1;
        (0..count)
            .map(|i| (i * self.stride, i * self.stride + self.window_size))
            .collect()
    }

    /// Verify that every position in `[0, total_length)` falls in a window.
    ///
    /// Uncovered trailing positions (non-divisible stride) and interior gaps
    /// (stride larger than the window) are errors, never silent zero-fill.
    pub fn verify_coverage(&self, total_length: usize) -> Result<(), AttentionError> {
        if self.stride == 0 {
            return Err(AttentionError::ZeroStride);
        }
        if self.stride > self.window_size {
            return Err(AttentionError::UncoveredPositions {
                first_uncovered: self.window_size,
                total: total_length,
                window_size: self.window_size,
                stride: self.stride,
            });
        }
        let covered = self
            .partition(total_length)
            .last()
            .map(|&(_, end)| end)
            .unwrap_or(0);
        if covered < total_length {
            return Err(AttentionError::UncoveredPositions {
                first_uncovered: covered,
                total: total_length,
                window_size: self.window_size,
                stride: self.stride,
            });
        }
        Ok(())
    }

    /// Entropy-compensation factor for the global long-range pass.
    ///
    /// Attention entropy grows with context length; queries are pre-scaled by
    /// `sqrt(ln(total) / ln(window_size))` when the effective context exceeds
    /// the window length the model was tuned for.
    pub fn entropy_scale(&self, total_length: usize) -> f32 {
        if total_length <= self.window_size || self.window_size <= 1 {
            return 1.0;
        }
        ((total_length as f32).ln() / (self.window_size as f32).ln()).sqrt()
    }
}
