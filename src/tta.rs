//! Test-time augmentation: geometric transforms and result merging.
//!
//! Augmentations are restricted to horizontal and vertical flips. Both are
//! self-inverse, so de-augmenting a prediction is the same transform applied
//! again. The [`Merger`] accumulates de-augmented predictions across the
//! full augmentation x model product and reduces them to an elementwise mean
//! (blended prediction) or population standard deviation (epistemic
//! uncertainty across ensemble members and augmentations).

use crate::error::{Result, TeselaError};
use crate::primitives::Tensor;

/// A self-inverse geometric transform of a `[N, C, H, W]` batch.
///
/// The identity is the empty combination; with TTA enabled the executed set
/// is the full product `{identity, hflip, vflip, hflip + vflip}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Augmentation {
    hflip: bool,
    vflip: bool,
}

impl Augmentation {
    /// The identity transform.
    #[must_use]
    pub fn identity() -> Self {
        Self {
            hflip: false,
            vflip: false,
        }
    }

    /// A combination of horizontal and/or vertical flips.
    #[must_use]
    pub fn flips(hflip: bool, vflip: bool) -> Self {
        Self { hflip, vflip }
    }

    /// True when this is the identity transform.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        !self.hflip && !self.vflip
    }

    /// Apply the transform to a `[N, C, H, W]` batch.
    ///
    /// Flips are involutions, so the same call de-augments predictions back
    /// to canonical orientation.
    ///
    /// # Panics
    ///
    /// Panics if `batch` is not 4-dimensional.
    #[must_use]
    pub fn apply(&self, batch: &Tensor) -> Tensor {
        if self.is_identity() {
            return batch.clone();
        }
        let shape = batch.shape();
        assert_eq!(
            shape.len(),
            4,
            "expected a [N, C, H, W] batch, got shape {shape:?}"
        );
        let (n, c, h, w) = (shape[0], shape[1], shape[2], shape[3]);
        let src = batch.data();
        let mut out = vec![0.0f32; src.len()];

        for b in 0..n {
            for ch in 0..c {
                let base = (b * c + ch) * h * w;
                for r in 0..h {
                    let sr = if self.vflip { h - 1 - r } else { r };
                    for col in 0..w {
                        let sc = if self.hflip { w - 1 - col } else { col };
                        out[base + r * w + col] = src[base + sr * w + sc];
                    }
                }
            }
        }
        Tensor::from_vec(out, shape)
    }
}

/// The set of augmentations the predictor runs.
///
/// With `use_tta` disabled only the implicit identity is executed; enabled,
/// the full flip product is executed (identity first, in fixed order, so
/// repeated runs merge in the same order).
#[must_use]
pub fn augmentation_product(use_tta: bool) -> Vec<Augmentation> {
    if use_tta {
        vec![
            Augmentation::identity(),
            Augmentation::flips(true, false),
            Augmentation::flips(false, true),
            Augmentation::flips(true, true),
        ]
    } else {
        vec![Augmentation::identity()]
    }
}

/// Constant-memory accumulator for merging predictions.
///
/// Keeps a running count, elementwise sum and elementwise sum of squares
/// instead of buffering every appended tensor, so memory is independent of
/// the number of augmentations and models.
///
/// # Examples
///
/// ```
/// use tesela::primitives::Tensor;
/// use tesela::tta::Merger;
///
/// let mut merger = Merger::new();
/// merger.append(&Tensor::from_slice(&[0.2])).unwrap();
/// merger.append(&Tensor::from_slice(&[0.4])).unwrap();
/// merger.append(&Tensor::from_slice(&[0.6])).unwrap();
/// let mean = merger.mean().unwrap();
/// assert!((mean.data()[0] - 0.4).abs() < 1e-6);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Merger {
    count: usize,
    sum: Vec<f32>,
    sum_sq: Vec<f32>,
    shape: Vec<usize>,
}

impl Merger {
    /// Create an empty merger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tensors appended so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when nothing has been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Append one prediction.
    ///
    /// The first append fixes the expected shape.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the tensor's shape differs from the first
    /// appended tensor.
    pub fn append(&mut self, tensor: &Tensor) -> Result<()> {
        if self.count == 0 {
            self.shape = tensor.shape().to_vec();
            self.sum = vec![0.0; tensor.numel()];
            self.sum_sq = vec![0.0; tensor.numel()];
        } else if tensor.shape() != self.shape.as_slice() {
            return Err(TeselaError::shape_mismatch(&self.shape, tensor.shape()));
        }

        for (i, &x) in tensor.data().iter().enumerate() {
            self.sum[i] += x;
            self.sum_sq[i] += x * x;
        }
        self.count += 1;
        Ok(())
    }

    /// Elementwise mean of all appended tensors.
    ///
    /// # Errors
    ///
    /// Returns `EmptyMerge` if nothing was appended.
    pub fn mean(&self) -> Result<Tensor> {
        if self.count == 0 {
            return Err(TeselaError::EmptyMerge);
        }
        let n = self.count as f32;
        let data: Vec<f32> = self.sum.iter().map(|&s| s / n).collect();
        Ok(Tensor::from_vec(data, &self.shape))
    }

    /// Elementwise population standard deviation of all appended tensors.
    ///
    /// The variance `E[x^2] - E[x]^2` is clamped at zero before the square
    /// root to guard against negative floating-point round-off.
    ///
    /// # Errors
    ///
    /// Returns `EmptyMerge` if nothing was appended.
    pub fn std(&self) -> Result<Tensor> {
        if self.count == 0 {
            return Err(TeselaError::EmptyMerge);
        }
        let n = self.count as f32;
        let data: Vec<f32> = self
            .sum
            .iter()
            .zip(self.sum_sq.iter())
            .map(|(&s, &sq)| {
                let mean = s / n;
                (sq / n - mean * mean).max(0.0).sqrt()
            })
            .collect();
        Ok(Tensor::from_vec(data, &self.shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_identity_returns_input() {
        let batch = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let out = Augmentation::identity().apply(&batch);
        assert_eq!(out, batch);
    }

    #[test]
    fn test_hflip_reverses_columns() {
        let batch = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let out = Augmentation::flips(true, false).apply(&batch);
        assert_eq!(out.data(), &[2.0, 1.0, 4.0, 3.0]);
    }

    #[test]
    fn test_vflip_reverses_rows() {
        let batch = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2]);
        let out = Augmentation::flips(false, true).apply(&batch);
        assert_eq!(out.data(), &[3.0, 4.0, 1.0, 2.0]);
    }

    #[test]
    fn test_flips_are_self_inverse() {
        let batch = Tensor::new(
            &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0],
            &[1, 2, 2, 3],
        );
        for aug in augmentation_product(true) {
            let roundtrip = aug.apply(&aug.apply(&batch));
            assert_eq!(roundtrip, batch, "{aug:?} is not self-inverse");
        }
    }

    #[test]
    fn test_product_identity_first() {
        let augs = augmentation_product(true);
        assert_eq!(augs.len(), 4);
        assert!(augs[0].is_identity());
        let off = augmentation_product(false);
        assert_eq!(off.len(), 1);
        assert!(off[0].is_identity());
    }

    #[test]
    fn test_merger_mean_of_known_constants() {
        let mut merger = Merger::new();
        for v in [0.2, 0.4, 0.6] {
            merger
                .append(&Tensor::new(&[v; 4], &[2, 2]))
                .expect("matching shapes");
        }
        let mean = merger.mean().expect("non-empty");
        for &m in mean.data() {
            assert!((m - 0.4).abs() < 1e-6);
        }
    }

    #[test]
    fn test_merger_population_std_of_known_constants() {
        // Population std of {0.2, 0.4, 0.6} is sqrt(2/75) ~ 0.1633.
        let mut merger = Merger::new();
        for v in [0.2, 0.4, 0.6] {
            merger
                .append(&Tensor::new(&[v; 4], &[2, 2]))
                .expect("matching shapes");
        }
        let std = merger.std().expect("non-empty");
        for &s in std.data() {
            assert!((s - 0.163_299_3).abs() < 1e-5);
        }
    }

    #[test]
    fn test_merger_rejects_shape_change() {
        let mut merger = Merger::new();
        merger.append(&Tensor::zeros(&[2, 2])).expect("first");
        let err = merger.append(&Tensor::zeros(&[2, 3])).unwrap_err();
        assert!(matches!(err, TeselaError::ShapeMismatch { .. }));
        // The bad append must not have been counted.
        assert_eq!(merger.len(), 1);
    }

    #[test]
    fn test_merger_empty_reductions_fail() {
        let merger = Merger::new();
        assert!(matches!(merger.mean(), Err(TeselaError::EmptyMerge)));
        assert!(matches!(merger.std(), Err(TeselaError::EmptyMerge)));
    }

    #[test]
    fn test_two_mergers_do_not_cross_contaminate() {
        let mut smx = Merger::new();
        let mut energy = Merger::new();
        smx.append(&Tensor::from_slice(&[1.0])).expect("append");
        energy.append(&Tensor::from_slice(&[100.0])).expect("append");
        assert_eq!(smx.mean().expect("non-empty").data(), &[1.0]);
        assert_eq!(energy.mean().expect("non-empty").data(), &[100.0]);
    }

    proptest! {
        #[test]
        fn prop_merger_mean_within_value_range(values in prop::collection::vec(-10.0f32..10.0, 1..16)) {
            let mut merger = Merger::new();
            for &v in &values {
                merger.append(&Tensor::from_slice(&[v])).expect("append");
            }
            let mean = merger.mean().expect("non-empty").data()[0];
            let lo = values.iter().copied().fold(f32::INFINITY, f32::min);
            let hi = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            prop_assert!(mean >= lo - 1e-4 && mean <= hi + 1e-4);
        }

        #[test]
        fn prop_merger_std_non_negative(values in prop::collection::vec(-10.0f32..10.0, 1..16)) {
            let mut merger = Merger::new();
            for &v in &values {
                merger.append(&Tensor::from_slice(&[v])).expect("append");
            }
            let std = merger.std().expect("non-empty").data()[0];
            prop_assert!(std >= 0.0);
        }
    }
}
