//! Tesela: tiled ensemble inference and overlap-weighted reconstruction.
//!
//! Tesela reconstructs full-image semantic segmentation maps from
//! overlapping tile predictions. An ensemble of models, optionally wrapped
//! in flip test-time augmentation, is run over every tile; the merged
//! predictions are blended with a Gaussian importance map and scattered
//! back into image space, where a final weight normalization yields a
//! per-pixel probability map plus optional uncertainty and energy maps.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use tesela::prelude::*;
//! use tesela::synthetic::{synthetic_image, ConstantModel};
//!
//! // An ensemble of one toy model, shared normalization statistics.
//! let pool = ModelPool::from_parts(
//!     vec![Arc::new(ConstantModel::new(vec![2.0, 0.0]))],
//!     NormalizationStats::new(vec![0.0], vec![1.0]),
//! )
//! .unwrap();
//! let predictor = EnsemblePredictor::new(pool, PredictConfig::default()).unwrap();
//!
//! // 512-tile geometry scaled down: 16x16 image, 8x8 tiles, 2 px overlap.
//! let layout = TileLayout::grid((16, 16), (8, 8), (2, 2), 2).unwrap();
//! let source = ArrayTileSource::new(synthetic_image(1, 16, 16, 7), layout).unwrap();
//!
//! let result = predictor.predict(&source).unwrap();
//! assert_eq!(result.softmax().shape(), &[16, 16, 2]);
//! assert!(result.uncertainty().is_some());
//! ```
//!
//! # Modules
//!
//! - [`primitives`]: The dense `Tensor` type all maps and batches use
//! - [`functional`]: Softmax, log-sum-exp and the energy score
//! - [`weighting`]: Gaussian and uniform tile importance maps
//! - [`tta`]: Flip augmentations and the running prediction merger
//! - [`model`]: The model contract, normalization statistics, model pool
//! - [`tiling`]: Tile slice tables and tile sources
//! - [`predict`]: The ensemble predictor and its configuration
//! - [`store`]: Result stores keyed by image name
//! - [`synthetic`]: Deterministic toy data and models for tests and benches
//! - [`error`]: Crate-wide error type
//! - [`prelude`]: Convenience re-exports

pub mod error;
pub mod functional;
pub mod model;
pub mod predict;
pub mod prelude;
pub mod primitives;
pub mod store;
pub mod synthetic;
pub mod tiling;
pub mod tta;
pub mod weighting;
