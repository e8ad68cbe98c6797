//! Tile blending weights for overlap-add reconstruction.
//!
//! Border pixels of a tile sit inside the receptive-field artifact zone of a
//! convolutional model, so overlapping tiles are blended with a Gaussian
//! importance map that trusts tile centers more than tile borders. With
//! weighting disabled the map degenerates to uniform ones (plain averaging).

use crate::error::{Result, TeselaError};
use crate::primitives::Tensor;

/// Build a Gaussian importance map for a tile of the given `(height, width)`.
///
/// A unit impulse at the geometric center is convolved with a separable
/// Gaussian whose per-axis standard deviation is `axis_len * sigma_scale`,
/// then the map is rescaled so its peak is exactly 1. Exact zeros (possible
/// far from the center for small sigma) are clamped to the smallest strictly
/// positive entry so the map can safely be used as a divisor.
///
/// # Errors
///
/// Returns `InvalidHyperparameter` for a zero-sized shape or a non-positive
/// `sigma_scale`.
///
/// # Examples
///
/// ```
/// use tesela::weighting::gaussian_importance_map;
///
/// let map = gaussian_importance_map((9, 9), 1.0 / 8.0).unwrap();
/// assert_eq!(map.shape(), &[9, 9]);
/// assert_eq!(map.max(), 1.0);
/// assert!(map.data().iter().all(|&w| w > 0.0));
/// ```
pub fn gaussian_importance_map(shape: (usize, usize), sigma_scale: f32) -> Result<Tensor> {
    let (height, width) = shape;
    validate_shape(shape)?;
    if sigma_scale <= 0.0 || !sigma_scale.is_finite() {
        return Err(TeselaError::InvalidHyperparameter {
            param: "sigma_scale".to_string(),
            value: sigma_scale.to_string(),
            constraint: ">0".to_string(),
        });
    }

    // Unit impulse at the geometric center.
    let mut map = vec![0.0f32; height * width];
    map[(height / 2) * width + width / 2] = 1.0;

    let kernel_rows = gaussian_kernel_1d(height as f32 * sigma_scale);
    let kernel_cols = gaussian_kernel_1d(width as f32 * sigma_scale);
    let map = convolve_rows(&map, height, width, &kernel_rows);
    let mut map = convolve_cols(&map, height, width, &kernel_cols);

    let peak = map.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    for w in &mut map {
        *w /= peak;
    }

    // The map cannot contain zeros, otherwise normalization divides by zero.
    let min_positive = map
        .iter()
        .copied()
        .filter(|&w| w > 0.0)
        .fold(f32::INFINITY, f32::min);
    for w in &mut map {
        if *w == 0.0 {
            *w = min_positive;
        }
    }

    Ok(Tensor::from_vec(map, &[height, width]))
}

/// Build a uniform all-ones weight map (Gaussian weighting disabled).
///
/// # Errors
///
/// Returns `InvalidHyperparameter` for a zero-sized shape.
pub fn uniform_weight_map(shape: (usize, usize)) -> Result<Tensor> {
    validate_shape(shape)?;
    Ok(Tensor::ones(&[shape.0, shape.1]))
}

fn validate_shape(shape: (usize, usize)) -> Result<()> {
    if shape.0 == 0 || shape.1 == 0 {
        return Err(TeselaError::InvalidHyperparameter {
            param: "tile_shape".to_string(),
            value: format!("({}, {})", shape.0, shape.1),
            constraint: "positive dimensions".to_string(),
        });
    }
    Ok(())
}

/// Normalized 1-D Gaussian kernel, truncated at radius `round(4 * sigma)`.
fn gaussian_kernel_1d(sigma: f32) -> Vec<f32> {
    let radius = (4.0 * sigma + 0.5) as usize;
    let mut kernel = Vec::with_capacity(2 * radius + 1);
    for i in 0..=2 * radius {
        let x = i as f32 - radius as f32;
        kernel.push((-0.5 * x * x / (sigma * sigma)).exp());
    }
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// 1-D convolution along rows with zero padding at the boundary.
fn convolve_rows(data: &[f32], height: usize, width: usize, kernel: &[f32]) -> Vec<f32> {
    let radius = kernel.len() / 2;
    let mut out = vec![0.0f32; height * width];
    for r in 0..height {
        for c in 0..width {
            let mut acc = 0.0;
            for (k, &kv) in kernel.iter().enumerate() {
                let src = r as isize + k as isize - radius as isize;
                if src >= 0 && (src as usize) < height {
                    acc += kv * data[src as usize * width + c];
                }
            }
            out[r * width + c] = acc;
        }
    }
    out
}

/// 1-D convolution along columns with zero padding at the boundary.
fn convolve_cols(data: &[f32], height: usize, width: usize, kernel: &[f32]) -> Vec<f32> {
    let radius = kernel.len() / 2;
    let mut out = vec![0.0f32; height * width];
    for r in 0..height {
        for c in 0..width {
            let mut acc = 0.0;
            for (k, &kv) in kernel.iter().enumerate() {
                let src = c as isize + k as isize - radius as isize;
                if src >= 0 && (src as usize) < width {
                    acc += kv * data[r * width + src as usize];
                }
            }
            out[r * width + c] = acc;
        }
    }
    out
}
