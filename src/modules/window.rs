//! Overlap-add window aggregation for long-video attention
//!
//! Per-window attention outputs are blended into a single continuous output
//! through call-local value/count accumulators, and qualifying windows are
//! corrected toward the global long-range pass via PCA fusion.

use burn::prelude::*;
use burn::tensor::TensorData;
use nalgebra::DMatrix;

use crate::error::AttentionError;
use crate::modules::pca::pca_fuse;

/// Diffusion-timestep threshold above which correction applies from the
/// second window onward.
const CORRECTION_TIMESTEP: usize = 250;
/// Later threshold that admits correction once enough windows have been seen.
const LATE_CORRECTION_TIMESTEP: usize = 500;
/// Maximum number of window components retained during fusion.
const MAX_KEPT_COMPONENTS: usize = 3;

/// Whether the consistency correction applies to window `window_index` at
/// diffusion timestep `timestep`.
///
/// The first window and near-clean (low-timestep) steps bypass correction
/// entirely; late windows at very noisy steps always qualify.
pub(crate) fn correction_active(window_index: usize, timestep: usize) -> bool {
    (window_index > 0 && timestep > CORRECTION_TIMESTEP)
        || (window_index > MAX_KEPT_COMPONENTS && timestep > LATE_CORRECTION_TIMESTEP)
}

/// Number of window components retained for window `window_index`.
pub(crate) fn kept_components(window_index: usize) -> usize {
    window_index.min(MAX_KEPT_COMPONENTS)
}

/// Call-local accumulator buffers for weighted overlap-add blending.
///
/// `value` accumulates weighted per-window outputs, `count` accumulates the
/// weights. Both are created zeroed for one forward call and discarded at
/// call end.
pub(crate) struct WindowAccumulator<B: Backend> {
    value: Tensor<B, 3>,
    count: Tensor<B, 3>,
}

impl<B: Backend> WindowAccumulator<B> {
    pub fn new(batch: usize, total_length: usize, dim: usize, device: &B::Device) -> Self {
        Self {
            value: Tensor::zeros([batch, total_length, dim], device),
            count: Tensor::zeros([batch, total_length, dim], device),
        }
    }

    /// Accumulate a weighted window output over `[start, end)`.
    ///
    /// `weighted` is the already-weighted output `[batch, end-start, dim]`;
    /// `weight` is the per-position weight row `[1, end-start, 1]`.
    pub fn add(&mut self, start: usize, end: usize, weighted: Tensor<B, 3>, weight: Tensor<B, 1>) {
        let [batch, _, dim] = self.value.dims();
        let span = end - start;

        let value_slice = self.value.clone().slice([0..batch, start..end, 0..dim]);
        self.value = self
            .value
            .clone()
            .slice_assign([0..batch, start..end, 0..dim], value_slice + weighted);

        let weight = weight.reshape([1, span, 1]).expand([batch, span, dim]);
        let count_slice = self.count.clone().slice([0..batch, start..end, 0..dim]);
        self.count = self
            .count
            .clone()
            .slice_assign([0..batch, start..end, 0..dim], count_slice + weight);
    }

    /// Final blended output: `value / count` where covered, `value` (zero)
    /// elsewhere. Coverage is verified upstream, so the fallback only guards
    /// the division.
    pub fn blend(self) -> Tensor<B, 3> {
        let uncovered = self.count.clone().equal_elem(0.0);
        let safe_count = self.count.mask_fill(uncovered, 1.0);
        self.value / safe_count
    }
}

/// Correct a window's attention output toward the global reference.
///
/// Both tensors are `[batch, window_size, dim]`; the fusion works on host
/// matrices with one `(batch, channel)` temporal profile per row and `keep`
/// window components retained.
pub(crate) fn consistency_correction<B: Backend>(
    window_out: Tensor<B, 3>,
    reference: Tensor<B, 3>,
    keep: usize,
) -> Result<Tensor<B, 3>, AttentionError> {
    let [batch, window_size, dim] = window_out.dims();
    let device = window_out.device();

    let window_matrix = to_profile_matrix(window_out)?;
    let reference_matrix = to_profile_matrix(reference)?;
    let fused = pca_fuse(&window_matrix, &reference_matrix, keep);

    from_profile_matrix(&fused, batch, window_size, dim, &device)
}

/// `[batch, n, dim]` tensor to a `(batch * dim) x n` host matrix, temporal
/// axis last.
fn to_profile_matrix<B: Backend>(tensor: Tensor<B, 3>) -> Result<DMatrix<f32>, AttentionError> {
    let [batch, n, dim] = tensor.dims();
    let data = tensor
        .swap_dims(1, 2)
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| AttentionError::Data(format!("{e:?}")))?;
    Ok(DMatrix::from_row_slice(batch * dim, n, &data))
}

fn from_profile_matrix<B: Backend>(
    matrix: &DMatrix<f32>,
    batch: usize,
    n: usize,
    dim: usize,
    device: &B::Device,
) -> Result<Tensor<B, 3>, AttentionError> {
    let mut data = Vec::with_capacity(batch * dim * n);
    for row in 0..batch * dim {
        for col in 0..n {
            data.push(matrix[(row, col)]);
        }
    }
    let tensor = Tensor::<B, 3>::from_data(TensorData::new(data, [batch, dim, n]), device);
    Ok(tensor.swap_dims(1, 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn tensor_values<const D: usize>(tensor: Tensor<TestBackend, D>) -> Vec<f32> {
        tensor.into_data().convert::<f32>().to_vec::<f32>().unwrap()
    }

    fn assert_close(a: &[f32], b: &[f32], tolerance: f32) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= tolerance, "{x} != {y}");
        }
    }

    #[test]
    fn correction_gating_boundaries() {
        // First window never corrects.
        assert!(!correction_active(0, 1000));
        // Early timesteps never correct.
        assert!(!correction_active(5, 250));
        assert!(!correction_active(1, 100));
        // Second window corrects once past the threshold.
        assert!(correction_active(1, 251));
        assert!(correction_active(4, 501));
        assert!(correction_active(12, 999));
    }

    #[test]
    fn kept_components_cap() {
        assert_eq!(kept_components(1), 1);
        assert_eq!(kept_components(3), 3);
        assert_eq!(kept_components(12), 3);
    }

    #[test]
    fn blend_is_the_mean_over_covering_windows() {
        // T=8, window=4, stride=2 -> windows (0,4), (2,6), (4,8).
        // Constant window outputs 1, 2, 3 with uniform weights:
        // positions 0-1 -> 1, 2-3 -> 1.5, 4-5 -> 2.5, 6-7 -> 3.
        let device = Default::default();
        let mut acc = WindowAccumulator::<TestBackend>::new(1, 8, 2, &device);
        let weight = Tensor::<TestBackend, 1>::ones([4], &device);
        for (index, &(start, end)) in [(0usize, 4usize), (2, 6), (4, 8)].iter().enumerate() {
            let out = Tensor::<TestBackend, 3>::ones([1, 4, 2], &device) * (index as f32 + 1.0);
            acc.add(start, end, out, weight.clone());
        }
        let blended = tensor_values(acc.blend());
        let expected = [1.0, 1.0, 1.0, 1.0, 1.5, 1.5, 1.5, 1.5, 2.5, 2.5, 2.5, 2.5, 3.0, 3.0, 3.0, 3.0];
        assert_close(&blended, &expected, 1e-6);
    }

    #[test]
    fn blend_respects_position_weights() {
        // One window with weight 2 overlapping one with weight 1:
        // overlap output = (2*a + b) / 3.
        let device = Default::default();
        let mut acc = WindowAccumulator::<TestBackend>::new(1, 4, 1, &device);
        let w2 = Tensor::<TestBackend, 1>::from_floats([2.0, 2.0], &device);
        let w1 = Tensor::<TestBackend, 1>::ones([2], &device);
        let a = Tensor::<TestBackend, 3>::ones([1, 2, 1], &device) * 3.0;
        let b = Tensor::<TestBackend, 3>::ones([1, 2, 1], &device) * 6.0;
        acc.add(0, 2, a * w2.clone().reshape([1, 2, 1]), w2);
        acc.add(0, 2, b, w1.clone());
        acc.add(2, 4, Tensor::ones([1, 2, 1], &device), w1);
        let blended = tensor_values(acc.blend());
        assert_close(&blended, &[4.0, 4.0, 1.0, 1.0], 1e-6);
    }

    #[test]
    fn correction_with_identical_reference_is_identity() {
        let device = Default::default();
        let data: Vec<f32> = (0..2 * 6 * 4).map(|i| ((i as f32) * 0.37).sin()).collect();
        let out = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(data.clone(), [2, 6, 4]),
            &device,
        );
        let corrected = consistency_correction(out.clone(), out.clone(), 2).unwrap();
        assert_close(&tensor_values(corrected), &tensor_values(out), 1e-3);
    }

    #[test]
    fn profile_matrix_round_trip() {
        let device = Default::default();
        let data: Vec<f32> = (0..2 * 3 * 5).map(|i| i as f32).collect();
        let tensor = Tensor::<TestBackend, 3>::from_data(
            TensorData::new(data.clone(), [2, 3, 5]),
            &device,
        );
        let matrix = to_profile_matrix(tensor).unwrap();
        assert_eq!(matrix.shape(), (10, 3));
        let back = from_profile_matrix::<TestBackend>(&matrix, 2, 3, 5, &device).unwrap();
        assert_close(&tensor_values(back), &data, 0.0);
    }
}
