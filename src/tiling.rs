//! Tile slice bookkeeping and the tile source contract.
//!
//! The predictor's contract with the tiling collaborator is an explicit
//! value-type table: per tile, an *input* window (the region of the tile
//! array to keep after de-padding, in tile-local coordinates) and an
//! *output* window (the region of the full image it writes to). Tiles may
//! overlap; the collaborator guarantees the output windows cover every image
//! pixel at least once.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use crate::error::{Result, TeselaError};
use crate::model::NormalizationStats;
use crate::primitives::Tensor;

/// A rectangular window as half-open row and column ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// First row (inclusive)
    pub row_start: usize,
    /// Past-the-end row
    pub row_end: usize,
    /// First column (inclusive)
    pub col_start: usize,
    /// Past-the-end column
    pub col_end: usize,
}

impl Window {
    /// Create a window from row and column ranges.
    #[must_use]
    pub fn new(rows: Range<usize>, cols: Range<usize>) -> Self {
        Self {
            row_start: rows.start,
            row_end: rows.end,
            col_start: cols.start,
            col_end: cols.end,
        }
    }

    /// Row range.
    #[must_use]
    pub fn rows(&self) -> Range<usize> {
        self.row_start..self.row_end
    }

    /// Column range.
    #[must_use]
    pub fn cols(&self) -> Range<usize> {
        self.col_start..self.col_end
    }

    /// Number of rows.
    #[must_use]
    pub fn height(&self) -> usize {
        self.row_end.saturating_sub(self.row_start)
    }

    /// Number of columns.
    #[must_use]
    pub fn width(&self) -> usize {
        self.col_end.saturating_sub(self.col_start)
    }

    fn fits_within(&self, height: usize, width: usize) -> bool {
        self.row_start < self.row_end
            && self.col_start < self.col_end
            && self.row_end <= height
            && self.col_end <= width
    }
}

/// The input/output slice pair of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileSlices {
    /// Region of the tile array to keep, in tile-local coordinates
    pub input: Window,
    /// Region of the full image this tile writes to
    pub output: Window,
}

/// Explicit slice table describing how tiles map onto one image.
///
/// # Examples
///
/// ```
/// use tesela::tiling::TileLayout;
///
/// // 512x512 tiles over a whole-slide image, 64 px overlap, 3 classes.
/// let layout = TileLayout::grid((2048, 1536), (512, 512), (64, 64), 3).unwrap();
/// assert!(layout.len() > 1);
/// assert_eq!(layout.image_shape(), (2048, 1536));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileLayout {
    image_shape: (usize, usize),
    tile_shape: (usize, usize),
    n_classes: usize,
    slices: Vec<TileSlices>,
}

impl TileLayout {
    /// Create a layout from an explicit slice table.
    ///
    /// # Errors
    ///
    /// - `EmptyTiling` if `slices` is empty.
    /// - `InvalidHyperparameter` for zero tile dimensions or zero classes.
    /// - `ShapeMismatch` if any input window exceeds the tile bounds, any
    ///   output window exceeds the image bounds, or an input/output pair
    ///   has differing sizes.
    pub fn new(
        image_shape: (usize, usize),
        tile_shape: (usize, usize),
        n_classes: usize,
        slices: Vec<TileSlices>,
    ) -> Result<Self> {
        if tile_shape.0 == 0 || tile_shape.1 == 0 || image_shape.0 == 0 || image_shape.1 == 0 {
            return Err(TeselaError::InvalidHyperparameter {
                param: "tile_shape/image_shape".to_string(),
                value: format!("{tile_shape:?}/{image_shape:?}"),
                constraint: "positive dimensions".to_string(),
            });
        }
        if n_classes == 0 {
            return Err(TeselaError::InvalidHyperparameter {
                param: "n_classes".to_string(),
                value: "0".to_string(),
                constraint: ">=1".to_string(),
            });
        }
        if slices.is_empty() {
            return Err(TeselaError::EmptyTiling);
        }
        for pair in &slices {
            if !pair.input.fits_within(tile_shape.0, tile_shape.1) {
                return Err(TeselaError::shape_mismatch(
                    &[tile_shape.0, tile_shape.1],
                    &[pair.input.row_end, pair.input.col_end],
                ));
            }
            if !pair.output.fits_within(image_shape.0, image_shape.1) {
                return Err(TeselaError::shape_mismatch(
                    &[image_shape.0, image_shape.1],
                    &[pair.output.row_end, pair.output.col_end],
                ));
            }
            if pair.input.height() != pair.output.height()
                || pair.input.width() != pair.output.width()
            {
                return Err(TeselaError::shape_mismatch(
                    &[pair.output.height(), pair.output.width()],
                    &[pair.input.height(), pair.input.width()],
                ));
            }
        }
        Ok(Self {
            image_shape,
            tile_shape,
            n_classes,
            slices,
        })
    }

    /// Build a regular grid layout with the given per-axis overlap.
    ///
    /// Interior tiles advance by `tile - overlap`; the last tile of each
    /// axis is shifted back so it ends exactly at the image border, which
    /// may increase its overlap with the previous tile. An image smaller
    /// than the tile along an axis yields a single zero-padded tile there,
    /// with the input window recording the valid (unpadded) region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHyperparameter` if the overlap is not smaller than
    /// the tile along each axis, or for zero-sized shapes or classes.
    pub fn grid(
        image_shape: (usize, usize),
        tile_shape: (usize, usize),
        overlap: (usize, usize),
        n_classes: usize,
    ) -> Result<Self> {
        if overlap.0 >= tile_shape.0 || overlap.1 >= tile_shape.1 {
            return Err(TeselaError::InvalidHyperparameter {
                param: "overlap".to_string(),
                value: format!("{overlap:?}"),
                constraint: format!("smaller than tile shape {tile_shape:?}"),
            });
        }
        let rows = axis_positions(image_shape.0, tile_shape.0, overlap.0);
        let cols = axis_positions(image_shape.1, tile_shape.1, overlap.1);

        let mut slices = Vec::with_capacity(rows.len() * cols.len());
        for &(r0, rh) in &rows {
            for &(c0, cw) in &cols {
                slices.push(TileSlices {
                    input: Window::new(0..rh, 0..cw),
                    output: Window::new(r0..r0 + rh, c0..c0 + cw),
                });
            }
        }
        Self::new(image_shape, tile_shape, n_classes, slices)
    }

    /// Native spatial shape `(height, width)` of the image.
    #[must_use]
    pub fn image_shape(&self) -> (usize, usize) {
        self.image_shape
    }

    /// Spatial shape of one tile array.
    #[must_use]
    pub fn tile_shape(&self) -> (usize, usize) {
        self.tile_shape
    }

    /// Number of segmentation classes.
    #[must_use]
    pub fn n_classes(&self) -> usize {
        self.n_classes
    }

    /// The slice table, tile index order.
    #[must_use]
    pub fn slices(&self) -> &[TileSlices] {
        &self.slices
    }

    /// Number of tiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Always false: empty layouts cannot be constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }
}

/// Tile start positions and valid lengths along one axis.
fn axis_positions(image_len: usize, tile_len: usize, overlap: usize) -> Vec<(usize, usize)> {
    if image_len <= tile_len {
        return vec![(0, image_len)];
    }
    let step = tile_len - overlap;
    let last = image_len - tile_len;
    let mut positions = Vec::new();
    let mut pos = 0;
    loop {
        positions.push((pos, tile_len));
        if pos == last {
            break;
        }
        pos = (pos + step).min(last);
    }
    positions
}

/// Supplies tile pixel data for one image, already in model-input layout.
pub trait TileSource {
    /// The slice table for this image.
    fn layout(&self) -> &TileLayout;

    /// The tile at `index` as a `[C_in, tile_h, tile_w]` tensor.
    ///
    /// # Errors
    ///
    /// Returns an error if the tile cannot be produced.
    fn tile(&self, index: usize) -> Result<Tensor>;
}

/// In-memory tile source over a `[C, H, W]` image tensor.
///
/// Border tiles whose output window is smaller than the tile shape are
/// zero-padded; the layout's input window records the valid region.
pub struct ArrayTileSource {
    image: Tensor,
    layout: TileLayout,
}

impl ArrayTileSource {
    /// Create a source over an image.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the image is not `[C, H, W]` with spatial
    /// dimensions matching the layout's image shape.
    pub fn new(image: Tensor, layout: TileLayout) -> Result<Self> {
        let shape = image.shape();
        let (h, w) = layout.image_shape();
        if shape.len() != 3 || shape[1] != h || shape[2] != w {
            return Err(TeselaError::shape_mismatch(&[0, h, w], shape));
        }
        Ok(Self { image, layout })
    }

    /// Create a source over an image, standardizing it with `stats` first.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` for a non-`[C, H, W]` image, mismatched
    /// spatial dimensions, or a channel count differing from the stats.
    pub fn standardized(
        image: Tensor,
        layout: TileLayout,
        stats: &NormalizationStats,
    ) -> Result<Self> {
        let shape = image.shape().to_vec();
        if shape.len() != 3 {
            return Err(TeselaError::shape_mismatch(&[0, 0, 0], &shape));
        }
        let mut batch = Tensor::from_vec(image.into_data(), &[1, shape[0], shape[1], shape[2]]);
        stats.apply(&mut batch)?;
        let image = Tensor::from_vec(batch.into_data(), &shape);
        Self::new(image, layout)
    }
}

impl TileSource for ArrayTileSource {
    fn layout(&self) -> &TileLayout {
        &self.layout
    }

    fn tile(&self, index: usize) -> Result<Tensor> {
        let slices = self
            .layout
            .slices()
            .get(index)
            .ok_or_else(|| TeselaError::shape_mismatch(&[self.layout.len()], &[index]))?;
        let (th, tw) = self.layout.tile_shape();
        let channels = self.image.shape()[0];
        let (_, img_h, img_w) = (channels, self.image.shape()[1], self.image.shape()[2]);

        let mut tile = vec![0.0f32; channels * th * tw];
        let src = self.image.data();
        for ch in 0..channels {
            let src_base = ch * img_h * img_w;
            let dst_base = ch * th * tw;
            for (local_r, img_r) in slices.input.rows().zip(slices.output.rows()) {
                for (local_c, img_c) in slices.input.cols().zip(slices.output.cols()) {
                    tile[dst_base + local_r * tw + local_c] = src[src_base + img_r * img_w + img_c];
                }
            }
        }
        Ok(Tensor::from_vec(tile, &[channels, th, tw]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_dimensions() {
        let win = Window::new(2..5, 1..7);
        assert_eq!(win.height(), 3);
        assert_eq!(win.width(), 6);
        assert_eq!(win.rows(), 2..5);
        assert_eq!(win.cols(), 1..7);
    }

    #[test]
    fn test_grid_exact_fit_no_overlap() {
        let layout = TileLayout::grid((8, 8), (4, 4), (0, 0), 2).expect("valid grid");
        assert_eq!(layout.len(), 4);
        // Every tile is full-size with a full input window.
        for pair in layout.slices() {
            assert_eq!(pair.input, Window::new(0..4, 0..4));
            assert_eq!(pair.output.height(), 4);
            assert_eq!(pair.output.width(), 4);
        }
    }

    #[test]
    fn test_grid_covers_every_pixel() {
        let layout = TileLayout::grid((37, 53), (16, 16), (4, 4), 2).expect("valid grid");
        let (h, w) = layout.image_shape();
        let mut covered = vec![0usize; h * w];
        for pair in layout.slices() {
            for r in pair.output.rows() {
                for c in pair.output.cols() {
                    covered[r * w + c] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&n| n >= 1));
    }

    #[test]
    fn test_grid_last_tile_clamped_to_border() {
        let layout = TileLayout::grid((10, 4), (4, 4), (0, 0), 2).expect("valid grid");
        let last = layout.slices().last().expect("non-empty");
        assert_eq!(last.output.rows(), 6..10);
    }

    #[test]
    fn test_grid_image_smaller_than_tile_pads() {
        let layout = TileLayout::grid((3, 3), (5, 5), (0, 0), 2).expect("valid grid");
        assert_eq!(layout.len(), 1);
        let only = layout.slices()[0];
        assert_eq!(only.input, Window::new(0..3, 0..3));
        assert_eq!(only.output, Window::new(0..3, 0..3));
    }

    #[test]
    fn test_grid_rejects_overlap_not_below_tile() {
        assert!(TileLayout::grid((8, 8), (4, 4), (4, 0), 2).is_err());
    }

    #[test]
    fn test_layout_rejects_empty_slices() {
        let err = TileLayout::new((8, 8), (4, 4), 2, vec![]).unwrap_err();
        assert!(matches!(err, TeselaError::EmptyTiling));
    }

    #[test]
    fn test_layout_rejects_out_of_bounds_output() {
        let slices = vec![TileSlices {
            input: Window::new(0..4, 0..4),
            output: Window::new(6..10, 0..4),
        }];
        assert!(TileLayout::new((8, 8), (4, 4), 2, slices).is_err());
    }

    #[test]
    fn test_layout_rejects_size_mismatch() {
        let slices = vec![TileSlices {
            input: Window::new(0..3, 0..4),
            output: Window::new(0..4, 0..4),
        }];
        assert!(TileLayout::new((8, 8), (4, 4), 2, slices).is_err());
    }

    #[test]
    fn test_layout_rejects_zero_classes() {
        let layout = TileLayout::grid((8, 8), (4, 4), (0, 0), 0);
        assert!(layout.is_err());
    }

    #[test]
    fn test_array_source_extracts_interior_tile() {
        // 1-channel 4x4 image with values 0..16 row-major.
        let image = Tensor::from_vec((0..16).map(|i| i as f32).collect(), &[1, 4, 4]);
        let layout = TileLayout::grid((4, 4), (2, 2), (0, 0), 2).expect("valid grid");
        let source = ArrayTileSource::new(image, layout).expect("matching shapes");
        // Tile 3 is the bottom-right 2x2 block.
        let tile = source.tile(3).expect("in range");
        assert_eq!(tile.shape(), &[1, 2, 2]);
        assert_eq!(tile.data(), &[10.0, 11.0, 14.0, 15.0]);
    }

    #[test]
    fn test_array_source_pads_undersized_image() {
        let image = Tensor::from_vec(vec![1.0; 9], &[1, 3, 3]);
        let layout = TileLayout::grid((3, 3), (5, 5), (0, 0), 2).expect("valid grid");
        let source = ArrayTileSource::new(image, layout).expect("matching shapes");
        let tile = source.tile(0).expect("in range");
        assert_eq!(tile.shape(), &[1, 5, 5]);
        let valid: f32 = tile.data().iter().sum();
        assert_eq!(valid, 9.0); // 3x3 ones, zero padding elsewhere
        assert_eq!(tile.data()[4], 0.0); // beyond the valid columns
    }

    #[test]
    fn test_array_source_rejects_wrong_spatial_shape() {
        let image = Tensor::zeros(&[1, 4, 4]);
        let layout = TileLayout::grid((8, 8), (4, 4), (0, 0), 2).expect("valid grid");
        assert!(ArrayTileSource::new(image, layout).is_err());
    }

    #[test]
    fn test_array_source_standardized() {
        let image = Tensor::from_vec(vec![3.0; 16], &[1, 4, 4]);
        let layout = TileLayout::grid((4, 4), (4, 4), (0, 0), 2).expect("valid grid");
        let stats = NormalizationStats::new(vec![1.0], vec![2.0]);
        let source = ArrayTileSource::standardized(image, layout, &stats).expect("valid");
        let tile = source.tile(0).expect("in range");
        assert!(tile.data().iter().all(|&x| x == 1.0));
    }

    #[test]
    fn test_layout_serde_roundtrip() {
        let layout = TileLayout::grid((16, 16), (8, 8), (2, 2), 3).expect("valid grid");
        let json = serde_json::to_string(&layout).expect("serialize");
        let back: TileLayout = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(layout, back);
    }
}
