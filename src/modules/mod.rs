//! Attention modules for long-video diffusion

pub mod attention;
pub mod block;
pub mod feed_forward;
pub mod pca;
pub mod relative_position;
pub mod transformer;
pub mod window;
