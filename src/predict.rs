//! Tiled ensemble prediction and overlap-weighted reconstruction.
//!
//! For one image: every tile batch is run through every augmentation and
//! every model in the pool, the de-augmented predictions are merged, the
//! blended tile results are weighted by the Gaussian importance map and
//! scattered additively into full-image accumulators, and a final division
//! by the accumulated weight turns every pixel into its weighted average
//! across all covering tiles.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{Result, TeselaError};
use crate::functional::{energy_score, mean_channels, softmax_channels};
use crate::model::ModelPool;
use crate::primitives::Tensor;
use crate::store::ResultStore;
use crate::tiling::{TileSource, Window};
use crate::tta::{augmentation_product, Merger};
use crate::weighting::{gaussian_importance_map, uniform_weight_map};

/// Prediction settings.
///
/// All fields are pass-through parameters with the defaults used for
/// whole-slide inference: TTA on, batches of 4 tiles, Gaussian weighting
/// with a sigma scale of 1/8, uncertainty estimation on, energy
/// temperature 1.
///
/// # Examples
///
/// ```
/// use tesela::predict::PredictConfig;
///
/// let config = PredictConfig::default()
///     .with_tta(false)
///     .with_batch_size(8);
/// assert!(!config.use_tta);
/// assert_eq!(config.batch_size, 8);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictConfig {
    /// Run flip test-time augmentation
    pub use_tta: bool,
    /// Tiles per inference batch
    pub batch_size: usize,
    /// Blend with a Gaussian importance map (uniform averaging otherwise)
    pub use_gaussian: bool,
    /// Gaussian sigma as a fraction of the tile axis length
    pub sigma_scale: f32,
    /// Produce uncertainty and energy maps alongside the softmax map
    pub uncertainty_estimates: bool,
    /// Temperature of the energy score
    pub energy_t: f32,
}

impl Default for PredictConfig {
    fn default() -> Self {
        Self {
            use_tta: true,
            batch_size: 4,
            use_gaussian: true,
            sigma_scale: 1.0 / 8.0,
            uncertainty_estimates: true,
            energy_t: 1.0,
        }
    }
}

impl PredictConfig {
    /// Enable or disable test-time augmentation.
    #[must_use]
    pub fn with_tta(mut self, use_tta: bool) -> Self {
        self.use_tta = use_tta;
        self
    }

    /// Set the number of tiles per inference batch.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Enable or disable Gaussian blending.
    #[must_use]
    pub fn with_gaussian(mut self, use_gaussian: bool) -> Self {
        self.use_gaussian = use_gaussian;
        self
    }

    /// Set the Gaussian sigma scale.
    #[must_use]
    pub fn with_sigma_scale(mut self, sigma_scale: f32) -> Self {
        self.sigma_scale = sigma_scale;
        self
    }

    /// Enable or disable uncertainty and energy estimation.
    #[must_use]
    pub fn with_uncertainty(mut self, uncertainty_estimates: bool) -> Self {
        self.uncertainty_estimates = uncertainty_estimates;
        self
    }

    /// Set the energy temperature.
    #[must_use]
    pub fn with_energy_t(mut self, energy_t: f32) -> Self {
        self.energy_t = energy_t;
        self
    }

    /// Validate hyperparameter constraints.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHyperparameter` for a zero batch size or
    /// non-positive sigma scale or energy temperature.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TeselaError::InvalidHyperparameter {
                param: "batch_size".to_string(),
                value: "0".to_string(),
                constraint: ">=1".to_string(),
            });
        }
        if self.sigma_scale <= 0.0 || !self.sigma_scale.is_finite() {
            return Err(TeselaError::InvalidHyperparameter {
                param: "sigma_scale".to_string(),
                value: self.sigma_scale.to_string(),
                constraint: ">0".to_string(),
            });
        }
        if self.energy_t <= 0.0 || !self.energy_t.is_finite() {
            return Err(TeselaError::InvalidHyperparameter {
                param: "energy_t".to_string(),
                value: self.energy_t.to_string(),
                constraint: ">0".to_string(),
            });
        }
        Ok(())
    }

    /// Save the configuration as JSON.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Serialization` on failure.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TeselaError::Serialization(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Io` or `Serialization` on failure.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| TeselaError::Serialization(e.to_string()))
    }
}

/// Immutable reconstruction result for one image.
///
/// Produced by [`EnsemblePredictor::predict`]; the softmax map is always
/// present, the uncertainty and energy maps only when uncertainty
/// estimation was requested.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleResult {
    softmax: Tensor,
    uncertainty: Option<Tensor>,
    energy: Option<Tensor>,
}

impl EnsembleResult {
    /// Reassemble a result from its maps (e.g. when reading from a store).
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if `softmax` is not `[H, W, C]` or an
    /// optional map is not `[H, W]` with matching spatial dimensions.
    pub fn from_maps(
        softmax: Tensor,
        uncertainty: Option<Tensor>,
        energy: Option<Tensor>,
    ) -> Result<Self> {
        let shape = softmax.shape();
        if shape.len() != 3 {
            return Err(TeselaError::shape_mismatch(&[0, 0, 0], shape));
        }
        let spatial = [shape[0], shape[1]];
        for map in [&uncertainty, &energy].into_iter().flatten() {
            if map.shape() != spatial {
                return Err(TeselaError::shape_mismatch(&spatial, map.shape()));
            }
        }
        Ok(Self {
            softmax,
            uncertainty,
            energy,
        })
    }

    /// Normalized per-class probability map, `[H, W, C]`.
    #[must_use]
    pub fn softmax(&self) -> &Tensor {
        &self.softmax
    }

    /// Epistemic-uncertainty map, `[H, W]`, if requested.
    #[must_use]
    pub fn uncertainty(&self) -> Option<&Tensor> {
        self.uncertainty.as_ref()
    }

    /// Negated-energy map, `[H, W]`, if requested. Higher means more
    /// in-distribution.
    #[must_use]
    pub fn energy(&self) -> Option<&Tensor> {
        self.energy.as_ref()
    }

    /// Per-pixel argmax over the class axis, `[H, W]` class indices.
    #[must_use]
    pub fn argmax(&self) -> Vec<usize> {
        let shape = self.softmax.shape();
        let (h, w, c) = (shape[0], shape[1], shape[2]);
        let data = self.softmax.data();
        let mut out = Vec::with_capacity(h * w);
        for p in 0..h * w {
            let pixel = &data[p * c..(p + 1) * c];
            let mut best = 0;
            for (k, &v) in pixel.iter().enumerate() {
                if v > pixel[best] {
                    best = k;
                }
            }
            out.push(best);
        }
        out
    }

    /// Decompose into `(softmax, uncertainty, energy)` maps.
    #[must_use]
    pub fn into_maps(self) -> (Tensor, Option<Tensor>, Option<Tensor>) {
        (self.softmax, self.uncertainty, self.energy)
    }
}

/// Per-image accumulators, created zero-filled, consumed once at the end.
struct Accumulators {
    softmax: Vec<f32>,
    weight: Vec<f32>,
    std: Option<Vec<f32>>,
    energy: Option<Vec<f32>>,
    height: usize,
    width: usize,
    classes: usize,
}

impl Accumulators {
    fn new(height: usize, width: usize, classes: usize, uncertainty: bool) -> Self {
        let plane = height * width;
        Self {
            softmax: vec![0.0; plane * classes],
            weight: vec![0.0; plane],
            std: uncertainty.then(|| vec![0.0; plane]),
            energy: uncertainty.then(|| vec![0.0; plane]),
            height,
            width,
            classes,
        }
    }

    /// Normalize by the accumulated weight and hand the maps over.
    ///
    /// Fails loudly on any pixel with non-positive accumulated weight: the
    /// tiling contract guarantees full coverage, so division by zero here
    /// is a caller contract violation, never silently emitted as NaN.
    fn normalize(mut self) -> Result<EnsembleResult> {
        let plane = self.height * self.width;
        for p in 0..plane {
            let weight = self.weight[p];
            if weight <= 0.0 {
                return Err(TeselaError::CoverageViolation {
                    row: p / self.width,
                    col: p % self.width,
                    weight,
                });
            }
            for ch in 0..self.classes {
                self.softmax[p * self.classes + ch] /= weight;
            }
            if let Some(std) = &mut self.std {
                std[p] /= weight;
            }
            if let Some(energy) = &mut self.energy {
                energy[p] /= weight;
            }
        }

        let spatial = [self.height, self.width];
        EnsembleResult::from_maps(
            Tensor::from_vec(self.softmax, &[self.height, self.width, self.classes]),
            self.std.map(|d| Tensor::from_vec(d, &spatial)),
            self.energy.map(|d| Tensor::from_vec(d, &spatial)),
        )
    }
}

/// Tiled ensemble predictor.
///
/// Owns a validated [`ModelPool`] and a [`PredictConfig`]; models are
/// read-only for the predictor's lifetime.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tesela::model::{ModelPool, NormalizationStats};
/// use tesela::predict::{EnsemblePredictor, PredictConfig};
/// use tesela::synthetic::{synthetic_image, ConstantModel};
/// use tesela::tiling::{ArrayTileSource, TileLayout};
///
/// let pool = ModelPool::from_parts(
///     vec![Arc::new(ConstantModel::new(vec![2.0, 0.0]))],
///     NormalizationStats::new(vec![0.0], vec![1.0]),
/// )
/// .unwrap();
/// let predictor = EnsemblePredictor::new(pool, PredictConfig::default()).unwrap();
///
/// let layout = TileLayout::grid((16, 16), (8, 8), (2, 2), 2).unwrap();
/// let source = ArrayTileSource::new(synthetic_image(1, 16, 16, 7), layout).unwrap();
/// let result = predictor.predict(&source).unwrap();
/// assert_eq!(result.softmax().shape(), &[16, 16, 2]);
/// ```
pub struct EnsemblePredictor {
    pool: ModelPool,
    config: PredictConfig,
}

impl EnsemblePredictor {
    /// Create a predictor from a validated pool and configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHyperparameter` if the configuration is invalid.
    pub fn new(pool: ModelPool, config: PredictConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { pool, config })
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &PredictConfig {
        &self.config
    }

    /// The model pool.
    #[must_use]
    pub fn pool(&self) -> &ModelPool {
        &self.pool
    }

    /// Reconstruct one image from its tile source.
    ///
    /// # Errors
    ///
    /// - `EmptyTiling` for a source with no tiles.
    /// - `ShapeMismatch` if a tile or a model output deviates from the
    ///   layout's tile shape or class count.
    /// - `CoverageViolation` if any pixel ends with non-positive weight.
    /// - Any model `Inference` error, aborting the image.
    pub fn predict<S: TileSource + ?Sized>(&self, source: &S) -> Result<EnsembleResult> {
        let layout = source.layout();
        if layout.is_empty() {
            return Err(TeselaError::EmptyTiling);
        }

        let (img_h, img_w) = layout.image_shape();
        let classes = layout.n_classes();
        let (tile_h, tile_w) = layout.tile_shape();

        // Computed once per predict call, reused for every tile.
        let weight_map = if self.config.use_gaussian {
            gaussian_importance_map((tile_h, tile_w), self.config.sigma_scale)?
        } else {
            uniform_weight_map((tile_h, tile_w))?
        };

        let augmentations = augmentation_product(self.config.use_tta);
        let mut accum = Accumulators::new(img_h, img_w, classes, self.config.uncertainty_estimates);

        let n_tiles = layout.len();
        let batch_size = self.config.batch_size;
        let mut batch_start = 0;
        while batch_start < n_tiles {
            let batch_end = (batch_start + batch_size).min(n_tiles);
            let batch = self.stack_tiles(source, batch_start..batch_end)?;

            let (blend_smx, blend_std, blend_energy) =
                self.run_batch(&batch, &augmentations, classes)?;

            for (offset, tile_idx) in (batch_start..batch_end).enumerate() {
                let slices = &layout.slices()[tile_idx];
                scatter(
                    &mut accum,
                    &weight_map,
                    &blend_smx,
                    blend_std.as_ref(),
                    blend_energy.as_ref(),
                    offset,
                    slices.input,
                    slices.output,
                );
            }
            batch_start = batch_end;
        }

        accum.normalize()
    }

    /// Reconstruct a list of images sequentially, writing each result into
    /// the store keyed by image name.
    ///
    /// Memory stays bounded per image: one image's accumulators exist at a
    /// time. A failing image aborts the run; previously stored images
    /// remain valid, nothing partial is persisted for the failed one.
    ///
    /// # Errors
    ///
    /// Propagates the first prediction or store error.
    pub fn predict_to_store(
        &self,
        images: &[(&str, &dyn TileSource)],
        store: &mut dyn ResultStore,
    ) -> Result<()> {
        for (name, source) in images {
            let result = self.predict(*source)?;
            store.put(name, &result)?;
        }
        Ok(())
    }

    /// Stack tiles `range` into a `[N, C_in, tile_h, tile_w]` batch.
    fn stack_tiles<S: TileSource + ?Sized>(
        &self,
        source: &S,
        range: std::ops::Range<usize>,
    ) -> Result<Tensor> {
        let layout = source.layout();
        let (tile_h, tile_w) = layout.tile_shape();
        let n = range.len();

        let first = source.tile(range.start)?;
        let first_shape = first.shape().to_vec();
        if first_shape.len() != 3 || first_shape[1] != tile_h || first_shape[2] != tile_w {
            return Err(TeselaError::shape_mismatch(
                &[0, tile_h, tile_w],
                &first_shape,
            ));
        }
        let channels = first_shape[0];

        let mut data = Vec::with_capacity(n * channels * tile_h * tile_w);
        data.extend_from_slice(first.data());
        for index in range.start + 1..range.end {
            let tile = source.tile(index)?;
            if tile.shape() != first_shape.as_slice() {
                return Err(TeselaError::shape_mismatch(&first_shape, tile.shape()));
            }
            data.extend_from_slice(tile.data());
        }
        Ok(Tensor::from_vec(data, &[n, channels, tile_h, tile_w]))
    }

    /// Run augmentations x models over one batch and reduce the mergers.
    ///
    /// Returns `(softmax [N,C,H,W], std [N,H,W], energy [N,H,W])`; the
    /// uncertainty maps are `None` unless requested. Model forwards within
    /// one augmentation run on a parallel iterator (order-preserving), but
    /// merging stays sequential and deterministic.
    fn run_batch(
        &self,
        batch: &Tensor,
        augmentations: &[crate::tta::Augmentation],
        classes: usize,
    ) -> Result<(Tensor, Option<Tensor>, Option<Tensor>)> {
        let uncertainty = self.config.uncertainty_estimates;
        let mut smx_merger = Merger::new();
        let mut energy_merger = Merger::new();

        for aug in augmentations {
            let aug_batch = aug.apply(batch);
            let logits_per_model: Vec<Tensor> = self
                .pool
                .models()
                .par_iter()
                .map(|model| model.forward(&aug_batch))
                .collect::<Result<Vec<_>>>()?;

            for logits in &logits_per_model {
                check_logits(batch, logits, classes)?;
                let canonical = aug.apply(logits);
                smx_merger.append(&softmax_channels(&canonical))?;
                if uncertainty {
                    // Negated energy score: higher means more in-distribution.
                    let energy = energy_score(&canonical, self.config.energy_t).map(|e| -e);
                    energy_merger.append(&energy)?;
                }
            }
        }

        let blend_smx = smx_merger.mean()?;
        let blend_std = if uncertainty {
            Some(mean_channels(&smx_merger.std()?))
        } else {
            None
        };
        let blend_energy = if uncertainty {
            Some(energy_merger.mean()?)
        } else {
            None
        };
        Ok((blend_smx, blend_std, blend_energy))
    }

}

/// Weight one tile's blended maps and add them into the accumulators.
///
/// Accumulation is strictly sequential; every pixel's contribution is
/// additive, so tile order does not affect the normalized result.
#[allow(clippy::too_many_arguments)]
fn scatter(
    accum: &mut Accumulators,
    weight_map: &Tensor,
    blend_smx: &Tensor,
    blend_std: Option<&Tensor>,
    blend_energy: Option<&Tensor>,
    batch_offset: usize,
    input: Window,
    output: Window,
) {
    let (tile_h, tile_w) = (weight_map.shape()[0], weight_map.shape()[1]);
    let classes = accum.classes;
    let img_w = accum.width;
    let weights = weight_map.data();
    let smx = blend_smx.data();
    let plane = tile_h * tile_w;
    let smx_base = batch_offset * classes * plane;
    let unc_base = batch_offset * plane;

    for (local_r, img_r) in input.rows().zip(output.rows()) {
        for (local_c, img_c) in input.cols().zip(output.cols()) {
            let local = local_r * tile_w + local_c;
            let pixel = img_r * img_w + img_c;
            let weight = weights[local];

            for ch in 0..classes {
                accum.softmax[pixel * classes + ch] += smx[smx_base + ch * plane + local] * weight;
            }
            accum.weight[pixel] += weight;
            if let (Some(std_accum), Some(std)) = (&mut accum.std, blend_std) {
                std_accum[pixel] += std.data()[unc_base + local] * weight;
            }
            if let (Some(energy_accum), Some(energy)) = (&mut accum.energy, blend_energy) {
                energy_accum[pixel] += energy.data()[unc_base + local] * weight;
            }
        }
    }
}

/// Validate that a model produced `[N, classes, H, W]` logits for the batch.
fn check_logits(batch: &Tensor, logits: &Tensor, classes: usize) -> Result<()> {
    let in_shape = batch.shape();
    let expected = [in_shape[0], classes, in_shape[2], in_shape[3]];
    if logits.shape() != expected {
        return Err(TeselaError::shape_mismatch(&expected, logits.shape()));
    }
    Ok(())
}

#[cfg(test)]
#[path = "predict_tests.rs"]
mod tests;
