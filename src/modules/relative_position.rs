//! Learned relative position bias for temporal attention
//!
//! One embedding per clipped query-key distance, used both as a key-side
//! score bias and a value-side output bias (with independent tables).

use burn::module::{Module, Param};
use burn::nn::Initializer;
use burn::prelude::*;

/// Relative position embedding table.
///
/// Holds `2 * max_relative_position + 1` rows of `num_units` each; distances
/// outside `[-max, max]` are clipped to the boundary rows.
#[derive(Module, Debug)]
pub struct RelativePosition<B: Backend> {
    /// Embedding table, `[2 * max + 1, num_units]`
    table: Param<Tensor<B, 2>>,
    /// Maximum relative distance
    max_relative_position: usize,
    /// Embedding width (head dimension)
    num_units: usize,
}

impl<B: Backend> RelativePosition<B> {
    /// Create a table with uniform fan-in initialization.
    pub fn new(num_units: usize, max_relative_position: usize, device: &B::Device) -> Self {
        let initializer = Initializer::KaimingUniform {
            gain: 1.0 / 3.0f64.sqrt(),
            fan_out_only: false,
        };
        let table = initializer.init_with(
            [2 * max_relative_position + 1, num_units],
            Some(num_units),
            None,
            device,
        );

        Self {
            table,
            max_relative_position,
            num_units,
        }
    }

    /// Bias embeddings for every (query, key) pair.
    ///
    /// # Returns
    /// Embeddings `[len_q, len_k, num_units]`
    pub fn forward(&self, len_q: usize, len_k: usize) -> Tensor<B, 3> {
        let table = self.table.val();
        let device = table.device();
        let max = self.max_relative_position as i64;

        let query_range = Tensor::<B, 1, Int>::arange(0..len_q as i64, &device)
            .reshape([len_q, 1])
            .repeat(&[1, len_k]);
        let key_range = Tensor::<B, 1, Int>::arange(0..len_k as i64, &device)
            .reshape([1, len_k])
            .repeat(&[len_q, 1]);

        let distance = key_range - query_range;
        let index = distance.clamp(-max, max).add_scalar(max).reshape([len_q * len_k]);

        table.select(0, index).reshape([len_q, len_k, self.num_units])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn row(bias: &Tensor<TestBackend, 3>, i: usize, j: usize, units: usize) -> Vec<f32> {
        bias.clone()
            .slice([i..i + 1, j..j + 1, 0..units])
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn output_shape() {
        let device = Default::default();
        let table = RelativePosition::<TestBackend>::new(8, 4, &device);
        assert_eq!(table.forward(5, 7).dims(), [5, 7, 8]);
    }

    #[test]
    fn distances_clip_to_boundary_rows() {
        let device = Default::default();
        let max = 2;
        let table = RelativePosition::<TestBackend>::new(4, max, &device);
        let bias = table.forward(1, 10);

        // For query 0, every key j >= max maps to the same boundary row.
        let boundary = row(&bias, 0, max, 4);
        for j in max + 1..10 {
            assert_eq!(row(&bias, 0, j, 4), boundary, "key {j} escaped the clip");
        }
        // Keys below the boundary use distinct rows.
        assert_ne!(row(&bias, 0, 0, 4), boundary);
    }

    #[test]
    fn negative_distances_clip_symmetrically() {
        let device = Default::default();
        let max = 2;
        let table = RelativePosition::<TestBackend>::new(4, max, &device);
        let bias = table.forward(10, 1);

        // For key 0, every query i >= max maps to distance -max.
        let boundary = row(&bias, max, 0, 4);
        for i in max + 1..10 {
            assert_eq!(row(&bias, i, 0, 4), boundary);
        }
    }
}
