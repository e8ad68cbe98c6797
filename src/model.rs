//! Segmentation models, checkpoint loading, and pool validation.
//!
//! The predictor never trains; models enter the pool ready for inference
//! (the Rust rendering of "eval mode": forward takes `&self`, there is no
//! mutable training state to accidentally update) and stay read-only for the
//! pool's lifetime, so a pool is safe to share across threads.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TeselaError};
use crate::primitives::Tensor;

/// Per-channel normalization statistics a model was trained with.
///
/// Every member of a [`ModelPool`] must have been trained with *identical*
/// statistics; equality is exact numeric comparison, not tolerance-based,
/// because mixing preprocessing regimes silently produces meaningless
/// ensembles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    /// Per-channel mean
    pub mean: Vec<f32>,
    /// Per-channel scale (standard deviation)
    pub std: Vec<f32>,
}

impl NormalizationStats {
    /// Create stats from per-channel mean and standard deviation.
    #[must_use]
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Self {
        Self { mean, std }
    }

    /// Number of channels covered by these statistics.
    #[must_use]
    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    /// Standardize a `[N, C, H, W]` batch in place: `x = (x - mean) / std`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the batch is not 4-dimensional or its
    /// channel count differs from the statistics.
    pub fn apply(&self, batch: &mut Tensor) -> Result<()> {
        let shape = batch.shape().to_vec();
        if shape.len() != 4 || shape[1] != self.channels() {
            return Err(TeselaError::shape_mismatch(
                &[0, self.channels(), 0, 0],
                &shape,
            ));
        }
        let (n, c, plane) = (shape[0], shape[1], shape[2] * shape[3]);
        let data = batch.data_mut();
        for b in 0..n {
            for ch in 0..c {
                let mean = self.mean[ch];
                let std = self.std[ch];
                let base = (b * c + ch) * plane;
                for x in &mut data[base..base + plane] {
                    *x = (*x - mean) / std;
                }
            }
        }
        Ok(())
    }
}

/// A trained segmentation model ready for inference.
///
/// `forward` maps a standardized `[N, C_in, H, W]` batch to per-class logits
/// `[N, C, H, W]`. Implementations must be deterministic pure functions of
/// the input (no dropout, no statistics updates) and take `&self` so the
/// pool can be shared read-only across threads.
pub trait SegmentationModel: Send + Sync {
    /// Run inference on a batch of tiles, returning raw logits.
    ///
    /// # Errors
    ///
    /// Returns `Inference` on backend failure; the predictor aborts the
    /// in-flight image rather than persisting a partial reconstruction.
    fn forward(&self, batch: &Tensor) -> Result<Tensor>;

    /// Number of output classes.
    fn num_classes(&self) -> usize;
}

/// Loads a checkpoint identifier into a ready-to-run model plus the
/// normalization statistics it was trained with.
pub trait ModelLoader {
    /// Load one checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint cannot be loaded.
    fn load(&self, id: &str) -> Result<(Arc<dyn SegmentationModel>, NormalizationStats)>;
}

/// A validated group of models sharing identical normalization statistics.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tesela::model::{ModelPool, NormalizationStats};
/// use tesela::synthetic::ConstantModel;
///
/// let stats = NormalizationStats::new(vec![0.5], vec![0.25]);
/// let pool = ModelPool::from_parts(
///     vec![Arc::new(ConstantModel::new(vec![1.0, 0.0]))],
///     stats,
/// )
/// .unwrap();
/// assert_eq!(pool.len(), 1);
/// ```
pub struct ModelPool {
    models: Vec<Arc<dyn SegmentationModel>>,
    stats: NormalizationStats,
}

impl std::fmt::Debug for ModelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelPool")
            .field("models", &self.models.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl ModelPool {
    /// Load every checkpoint in `ids` and validate the pool.
    ///
    /// # Errors
    ///
    /// - `EmptyEnsemble` if `ids` is empty.
    /// - `StatsMismatch` if any model's statistics differ from the first
    ///   loaded model's; no partial pool is returned.
    /// - Any loader error, propagated unchanged.
    pub fn load<L: ModelLoader>(ids: &[&str], loader: &L) -> Result<Self> {
        if ids.is_empty() {
            return Err(TeselaError::EmptyEnsemble);
        }

        let mut models: Vec<Arc<dyn SegmentationModel>> = Vec::with_capacity(ids.len());
        let mut pool_stats: Option<NormalizationStats> = None;
        for id in ids {
            let (model, stats) = loader.load(id)?;
            match &pool_stats {
                None => pool_stats = Some(stats),
                Some(expected) => {
                    if *expected != stats {
                        return Err(TeselaError::StatsMismatch {
                            expected: format!("{expected:?}"),
                            actual: format!("{stats:?}"),
                        });
                    }
                }
            }
            models.push(model);
        }

        Ok(Self {
            models,
            stats: pool_stats.ok_or(TeselaError::EmptyEnsemble)?,
        })
    }

    /// Build a pool directly from loaded models and their shared statistics.
    ///
    /// # Errors
    ///
    /// Returns `EmptyEnsemble` if `models` is empty.
    pub fn from_parts(
        models: Vec<Arc<dyn SegmentationModel>>,
        stats: NormalizationStats,
    ) -> Result<Self> {
        if models.is_empty() {
            return Err(TeselaError::EmptyEnsemble);
        }
        Ok(Self { models, stats })
    }

    /// The loaded models, in load order.
    #[must_use]
    pub fn models(&self) -> &[Arc<dyn SegmentationModel>] {
        &self.models
    }

    /// The shared normalization statistics.
    #[must_use]
    pub fn stats(&self) -> &NormalizationStats {
        &self.stats
    }

    /// Number of models in the pool.
    #[must_use]
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Always false: empty pools cannot be constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{ConstantModel, ToyLoader};

    fn stats_a() -> NormalizationStats {
        NormalizationStats::new(vec![0.5, 0.5], vec![0.25, 0.25])
    }

    fn stats_b() -> NormalizationStats {
        NormalizationStats::new(vec![0.3, 0.5], vec![0.25, 0.25])
    }

    #[test]
    fn test_load_pool_with_matching_stats() {
        let loader = ToyLoader::new()
            .with_model("fold1", ConstantModel::new(vec![1.0, 0.0]), stats_a())
            .with_model("fold2", ConstantModel::new(vec![0.0, 1.0]), stats_a());
        let pool = ModelPool::load(&["fold1", "fold2"], &loader).expect("matching stats");
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.stats(), &stats_a());
    }

    #[test]
    fn test_load_pool_rejects_mismatched_stats() {
        let loader = ToyLoader::new()
            .with_model("fold1", ConstantModel::new(vec![1.0, 0.0]), stats_a())
            .with_model("fold2", ConstantModel::new(vec![0.0, 1.0]), stats_b());
        let err = ModelPool::load(&["fold1", "fold2"], &loader).unwrap_err();
        assert!(matches!(err, TeselaError::StatsMismatch { .. }));
    }

    #[test]
    fn test_load_pool_rejects_empty_ids() {
        let loader = ToyLoader::new();
        let err = ModelPool::load(&[], &loader).unwrap_err();
        assert!(matches!(err, TeselaError::EmptyEnsemble));
    }

    #[test]
    fn test_load_unknown_checkpoint_fails() {
        let loader = ToyLoader::new();
        assert!(ModelPool::load(&["missing"], &loader).is_err());
    }

    #[test]
    fn test_from_parts_rejects_empty() {
        let err = ModelPool::from_parts(vec![], stats_a()).unwrap_err();
        assert!(matches!(err, TeselaError::EmptyEnsemble));
    }

    #[test]
    fn test_stats_exact_equality() {
        // Equality must be exact, not tolerance-based.
        let a = NormalizationStats::new(vec![0.5], vec![0.25]);
        let b = NormalizationStats::new(vec![0.5 + f32::EPSILON], vec![0.25]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_stats_apply_standardizes() {
        let stats = NormalizationStats::new(vec![1.0], vec![2.0]);
        let mut batch = Tensor::new(&[3.0, 5.0, 1.0, -1.0], &[1, 1, 2, 2]);
        stats.apply(&mut batch).expect("matching channels");
        assert_eq!(batch.data(), &[1.0, 2.0, 0.0, -1.0]);
    }

    #[test]
    fn test_stats_apply_rejects_channel_mismatch() {
        let stats = NormalizationStats::new(vec![1.0, 2.0], vec![1.0, 1.0]);
        let mut batch = Tensor::zeros(&[1, 1, 2, 2]);
        assert!(stats.apply(&mut batch).is_err());
    }
}
