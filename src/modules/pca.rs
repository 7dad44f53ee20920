//! Principal-component consistency fusion (FreePCA)
//!
//! Corrects a window's attention output toward a global long-range reference:
//! both are decomposed in the eigenbasis of the reference's covariance, the
//! components are ranked by cosine similarity between the two projections,
//! and the window keeps only its `keep` most-similar components while the
//! reference contributes the rest.
//!
//! The covariance matrix is symmetric positive semi-definite, so a real
//! symmetric eigensolver is used throughout.

use std::cmp::Ordering;

use nalgebra::{DMatrix, DVector, SymmetricEigen};

/// Fuse a window's features with the global reference in PCA space.
///
/// Both matrices are `(batch * channels) x window_size`, one temporal profile
/// per row. `keep` is the number of top-ranked components retained from the
/// window; the remaining components come from the reference. The reference's
/// per-row mean is restored on the way out.
pub(crate) fn pca_fuse(
    window: &DMatrix<f32>,
    reference: &DMatrix<f32>,
    keep: usize,
) -> DMatrix<f32> {
    let n = window.ncols();
    debug_assert_eq!(reference.ncols(), n);
    debug_assert_eq!(reference.nrows(), window.nrows());

    let window_mean = row_means(window);
    let reference_mean = row_means(reference);
    let window_centered = center_rows(window, &window_mean);
    let reference_centered = center_rows(reference, &reference_mean);

    // Covariance of the reference deviations, (n x n).
    let covariance = (reference_centered.transpose() * &reference_centered) / (n as f32 - 1.0);
    let eigen = SymmetricEigen::new(covariance);
    let basis = eigen.eigenvectors;

    let mut window_pca = &window_centered * &basis;
    let mut reference_pca = &reference_centered * &basis;

    let order = similarity_order(&window_pca, &reference_pca);
    let keep = keep.min(n);
    for &component in &order[..keep] {
        reference_pca.column_mut(component).fill(0.0);
    }
    for &component in &order[keep..] {
        window_pca.column_mut(component).fill(0.0);
    }

    let fused = window_pca + reference_pca;
    let mut out = fused * basis.transpose();
    for (row, mean) in reference_mean.iter().enumerate() {
        out.row_mut(row).add_scalar_mut(*mean);
    }
    out
}

/// Mean of each row across the temporal axis.
fn row_means(matrix: &DMatrix<f32>) -> DVector<f32> {
    let n = matrix.ncols() as f32;
    DVector::from_iterator(matrix.nrows(), matrix.row_iter().map(|row| row.sum() / n))
}

fn center_rows(matrix: &DMatrix<f32>, means: &DVector<f32>) -> DMatrix<f32> {
    let mut centered = matrix.clone();
    for (row, mean) in means.iter().enumerate() {
        centered.row_mut(row).add_scalar_mut(-mean);
    }
    centered
}

/// Component indices ranked by cosine similarity between the two
/// projections, most similar first.
fn similarity_order(window_pca: &DMatrix<f32>, reference_pca: &DMatrix<f32>) -> Vec<usize> {
    let n = window_pca.ncols();
    let similarities: Vec<f32> = (0..n)
        .map(|component| {
            let a = window_pca.column(component);
            let b = reference_pca.column(component);
            let norms = a.norm() * b.norm();
            if norms <= f32::EPSILON {
                0.0
            } else {
                a.dot(&b) / norms
            }
        })
        .collect();

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        similarities[b]
            .partial_cmp(&similarities[a])
            .unwrap_or(Ordering::Equal)
    });
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(rows: usize, cols: usize, seed: f32) -> DMatrix<f32> {
        DMatrix::from_fn(rows, cols, |i, j| {
            ((i as f32 * 0.7 + j as f32 * 1.3 + seed).sin() * 2.0) + (i as f32 * 0.05)
        })
    }

    fn assert_matrix_close(a: &DMatrix<f32>, b: &DMatrix<f32>, tolerance: f32) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < tolerance, "{x} != {y}");
        }
    }

    #[test]
    fn identical_inputs_pass_through() {
        let data = sample(24, 8, 0.3);
        let fused = pca_fuse(&data, &data, 2);
        assert_matrix_close(&fused, &data, 1e-3);
    }

    #[test]
    fn keep_zero_returns_the_reference() {
        let window = sample(24, 8, 0.3);
        let reference = sample(24, 8, 4.1);
        let fused = pca_fuse(&window, &reference, 0);
        assert_matrix_close(&fused, &reference, 1e-3);
    }

    #[test]
    fn keep_is_capped_at_component_count() {
        let window = sample(12, 4, 1.0);
        let reference = sample(12, 4, 2.0);
        // keep >= n retains every window component: reconstruction equals the
        // window deviations around the reference mean.
        let fused = pca_fuse(&window, &reference, 16);
        let expected = {
            let wm = row_means(&window);
            let rm = row_means(&reference);
            let mut out = center_rows(&window, &wm);
            for (row, mean) in rm.iter().enumerate() {
                out.row_mut(row).add_scalar_mut(*mean);
            }
            out
        };
        assert_matrix_close(&fused, &expected, 1e-3);
    }

    #[test]
    fn similarity_order_ranks_aligned_components_first() {
        // Column 1 identical across both, column 0 anti-aligned.
        let a = DMatrix::from_columns(&[
            DVector::from_vec(vec![1.0f32, 2.0, 3.0]),
            DVector::from_vec(vec![1.0f32, 1.0, 1.0]),
        ]);
        let b = DMatrix::from_columns(&[
            DVector::from_vec(vec![-1.0f32, -2.0, -3.0]),
            DVector::from_vec(vec![1.0f32, 1.0, 1.0]),
        ]);
        assert_eq!(similarity_order(&a, &b), vec![1, 0]);
    }
}
