//! Convenience re-exports for common usage.
//!
//! # Usage
//!
//! ```
//! use tesela::prelude::*;
//! ```

pub use crate::error::{Result, TeselaError};
pub use crate::model::{ModelLoader, ModelPool, NormalizationStats, SegmentationModel};
pub use crate::predict::{EnsemblePredictor, EnsembleResult, PredictConfig};
pub use crate::primitives::Tensor;
pub use crate::store::{DirectoryStore, MemoryStore, ResultStore};
pub use crate::tiling::{ArrayTileSource, TileLayout, TileSlices, TileSource, Window};
pub use crate::tta::{augmentation_product, Augmentation, Merger};
pub use crate::weighting::{gaussian_importance_map, uniform_weight_map};
