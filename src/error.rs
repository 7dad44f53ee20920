//! Error types for the attention subsystem
//!
//! Every failure here is a programming or configuration defect: errors are
//! surfaced immediately to the caller and never recovered locally.

/// Errors raised by attention layers and transformer wrappers.
#[derive(Debug, thiserror::Error)]
pub enum AttentionError {
    /// Relative position bias was requested without a maximum distance bound.
    #[error("relative position attention requires a temporal length bound")]
    MissingTemporalLength,

    /// A cross-attention layer was called without a context tensor.
    #[error("cross attention requires a context tensor")]
    MissingContext,

    /// A self-attention layer was called with a context tensor.
    #[error("self attention does not accept a context tensor")]
    UnexpectedContext,

    /// The supplied context does not match the configured context dimension.
    #[error("context channel dimension {got} does not match configured dimension {expected}")]
    ContextDimMismatch { expected: usize, got: usize },

    /// Image cross-attention is configured but the context holds no tokens
    /// past the text segment.
    #[error("context of length {got} holds no image tokens past the {text_len} text tokens")]
    ImageTokensMissing { text_len: usize, got: usize },

    /// Masking was requested on a path that does not support it.
    #[error("attention masking is not supported on this path")]
    UnsupportedMask,

    /// A token sequence does not match the flattened spatial/temporal axes.
    #[error("token sequence length {got} does not match flattened dimensions {expected}")]
    TokenLengthMismatch { expected: usize, got: usize },

    /// The window schedule leaves temporal positions uncovered.
    #[error(
        "window schedule (size={window_size}, stride={stride}) leaves positions \
         [{first_uncovered}, {total}) uncovered"
    )]
    UncoveredPositions {
        first_uncovered: usize,
        total: usize,
        window_size: usize,
        stride: usize,
    },

    /// The window stride must be at least one.
    #[error("window stride must be nonzero")]
    ZeroStride,

    /// A custom per-window weight sequence has the wrong length.
    #[error("window weight sequence has length {got}, expected {expected}")]
    WeightLengthMismatch { expected: usize, got: usize },

    /// The channel count is not divisible by the group-norm group count.
    #[error("{channels} channels not divisible into {groups} normalization groups")]
    GroupCount { channels: usize, groups: usize },

    /// Transferring tensor data to the host failed.
    #[error("tensor data transfer failed: {0}")]
    Data(String),
}
