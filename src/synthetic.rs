//! Deterministic synthetic data for tests, benchmarks and examples.
//!
//! Toy models here are pure functions of their input shape or content, so
//! every reconstruction property (blending, TTA invariance, uncertainty)
//! can be checked against hand-computed values.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Result, TeselaError};
use crate::model::{ModelLoader, NormalizationStats, SegmentationModel};
use crate::primitives::Tensor;

/// Seeded random image in `[C, H, W]` layout with values in `[0, 1)`.
#[must_use]
pub fn synthetic_image(channels: usize, height: usize, width: usize, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..channels * height * width)
        .map(|_| rng.gen_range(0.0..1.0))
        .collect();
    Tensor::from_vec(data, &[channels, height, width])
}

/// Model emitting the same per-class logits at every pixel.
///
/// Flip-invariant by construction, which makes it useful for checking that
/// test-time augmentation leaves constant predictions unchanged.
#[derive(Debug, Clone)]
pub struct ConstantModel {
    logits: Vec<f32>,
}

impl ConstantModel {
    /// Create a model from one logit per class.
    #[must_use]
    pub fn new(logits: Vec<f32>) -> Self {
        Self { logits }
    }
}

impl SegmentationModel for ConstantModel {
    fn forward(&self, batch: &Tensor) -> Result<Tensor> {
        let shape = batch.shape();
        if shape.len() != 4 {
            return Err(TeselaError::shape_mismatch(&[0, 0, 0, 0], shape));
        }
        let (n, h, w) = (shape[0], shape[2], shape[3]);
        let classes = self.logits.len();
        let plane = h * w;
        let mut out = vec![0.0f32; n * classes * plane];
        for b in 0..n {
            for (ch, &logit) in self.logits.iter().enumerate() {
                let base = (b * classes + ch) * plane;
                out[base..base + plane].fill(logit);
            }
        }
        Ok(Tensor::from_vec(out, &[n, classes, h, w]))
    }

    fn num_classes(&self) -> usize {
        self.logits.len()
    }
}

/// Model whose logits depend on the pixel position within the tile.
///
/// `logit[ch](r, c) = (ch + 1) * (0.3 * r - 0.2 * c)`, independent of the
/// input values. Orientation-sensitive (flips change it) and tile-local, so
/// two overlapping tiles produce different predictions for the same image
/// pixel; exactly what overlap-blending tests need.
#[derive(Debug, Clone)]
pub struct GradientModel {
    classes: usize,
}

impl GradientModel {
    /// Create a model with the given class count.
    #[must_use]
    pub fn new(classes: usize) -> Self {
        Self { classes }
    }

    /// The logit emitted for `class` at tile-local position `(row, col)`.
    #[must_use]
    pub fn logit_at(&self, class: usize, row: usize, col: usize) -> f32 {
        (class as f32 + 1.0) * (0.3 * row as f32 - 0.2 * col as f32)
    }
}

impl SegmentationModel for GradientModel {
    fn forward(&self, batch: &Tensor) -> Result<Tensor> {
        let shape = batch.shape();
        if shape.len() != 4 {
            return Err(TeselaError::shape_mismatch(&[0, 0, 0, 0], shape));
        }
        let (n, h, w) = (shape[0], shape[2], shape[3]);
        let plane = h * w;
        let mut out = vec![0.0f32; n * self.classes * plane];
        for b in 0..n {
            for ch in 0..self.classes {
                let base = (b * self.classes + ch) * plane;
                for r in 0..h {
                    for c in 0..w {
                        out[base + r * w + c] = self.logit_at(ch, r, c);
                    }
                }
            }
        }
        Ok(Tensor::from_vec(out, &[n, self.classes, h, w]))
    }

    fn num_classes(&self) -> usize {
        self.classes
    }
}

/// In-memory checkpoint loader for tests and examples.
///
/// # Examples
///
/// ```
/// use tesela::model::{ModelPool, NormalizationStats};
/// use tesela::synthetic::{ConstantModel, ToyLoader};
///
/// let stats = NormalizationStats::new(vec![0.5], vec![0.25]);
/// let loader = ToyLoader::new()
///     .with_model("fold1", ConstantModel::new(vec![1.0, 0.0]), stats.clone())
///     .with_model("fold2", ConstantModel::new(vec![0.0, 1.0]), stats);
/// let pool = ModelPool::load(&["fold1", "fold2"], &loader).unwrap();
/// assert_eq!(pool.len(), 2);
/// ```
#[derive(Default)]
pub struct ToyLoader {
    checkpoints: HashMap<String, (Arc<dyn SegmentationModel>, NormalizationStats)>,
}

impl ToyLoader {
    /// Create an empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a checkpoint under `id`.
    #[must_use]
    pub fn with_model(
        mut self,
        id: &str,
        model: impl SegmentationModel + 'static,
        stats: NormalizationStats,
    ) -> Self {
        self.checkpoints
            .insert(id.to_string(), (Arc::new(model), stats));
        self
    }
}

impl ModelLoader for ToyLoader {
    fn load(&self, id: &str) -> Result<(Arc<dyn SegmentationModel>, NormalizationStats)> {
        self.checkpoints
            .get(id)
            .map(|(model, stats)| (Arc::clone(model), stats.clone()))
            .ok_or_else(|| TeselaError::inference(format!("unknown checkpoint '{id}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_image_deterministic() {
        let a = synthetic_image(2, 8, 8, 42);
        let b = synthetic_image(2, 8, 8, 42);
        assert_eq!(a, b);
        let c = synthetic_image(2, 8, 8, 43);
        assert_ne!(a, c);
    }

    #[test]
    fn test_synthetic_image_range() {
        let img = synthetic_image(1, 16, 16, 7);
        assert_eq!(img.shape(), &[1, 16, 16]);
        assert!(img.data().iter().all(|&x| (0.0..1.0).contains(&x)));
    }

    #[test]
    fn test_constant_model_output() {
        let model = ConstantModel::new(vec![1.5, -0.5]);
        let out = model.forward(&Tensor::zeros(&[2, 1, 3, 3])).expect("4-d");
        assert_eq!(out.shape(), &[2, 2, 3, 3]);
        assert!(out.data()[..9].iter().all(|&x| x == 1.5));
        assert!(out.data()[9..18].iter().all(|&x| x == -0.5));
    }

    #[test]
    fn test_gradient_model_position_dependent() {
        let model = GradientModel::new(2);
        let out = model.forward(&Tensor::zeros(&[1, 1, 2, 2])).expect("4-d");
        assert_eq!(out.data()[0], model.logit_at(0, 0, 0));
        assert_eq!(out.data()[3], model.logit_at(0, 1, 1));
        assert_ne!(out.data()[0], out.data()[3]);
    }

    #[test]
    fn test_gradient_model_orientation_sensitive() {
        use crate::tta::Augmentation;
        let model = GradientModel::new(1);
        let out = model.forward(&Tensor::zeros(&[1, 1, 3, 3])).expect("4-d");
        // Flipping the prediction changes it, so TTA genuinely mixes
        // different values for this model.
        assert_ne!(Augmentation::flips(true, false).apply(&out), out);
    }

    #[test]
    fn test_toy_loader_unknown_id() {
        let loader = ToyLoader::new();
        assert!(loader.load("missing").is_err());
    }
}
