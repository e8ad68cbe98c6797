//! Stateless numeric operations on logits and probability tensors.
//!
//! All class-axis reductions operate on `[N, C, H, W]` batches and are
//! implemented with max-shifted exponentials so large-magnitude logits never
//! overflow.

use crate::primitives::Tensor;

/// Softmax on a 1D slice of f32 values.
///
/// Equation: softmax(x)\_i = exp(x\_i - max) / sum\_j exp(x\_j - max)
#[must_use]
pub fn softmax_1d(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    exp.iter().map(|&x| x / sum).collect()
}

/// Log-sum-exp on a 1D slice of f32 values.
///
/// Equation: logsumexp(x) = max + log(sum\_j exp(x\_j - max))
#[must_use]
pub fn logsumexp_1d(logits: &[f32]) -> f32 {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max.is_infinite() {
        return max;
    }
    max + logits.iter().map(|&x| (x - max).exp()).sum::<f32>().ln()
}

/// Softmax along the class axis of a `[N, C, H, W]` logits batch.
///
/// # Panics
///
/// Panics if `logits` is not 4-dimensional.
#[must_use]
pub fn softmax_channels(logits: &Tensor) -> Tensor {
    let (n, c, plane) = batch_dims(logits);
    let src = logits.data();
    let mut out = vec![0.0f32; src.len()];
    let mut scratch = vec![0.0f32; c];

    for b in 0..n {
        let base = b * c * plane;
        for p in 0..plane {
            for (ch, v) in scratch.iter_mut().enumerate() {
                *v = src[base + ch * plane + p];
            }
            let probs = softmax_1d(&scratch);
            for (ch, &v) in probs.iter().enumerate() {
                out[base + ch * plane + p] = v;
            }
        }
    }
    Tensor::from_vec(out, logits.shape())
}

/// Energy score of a `[N, C, H, W]` logits batch along the class axis.
///
/// Returns `-T * logsumexp(logits / T)` per pixel as proposed by
/// Liu, Weitang, et al. (2020): lower (more negative) energy means higher
/// in-distribution confidence. Output shape is `[N, H, W]`.
///
/// Note: the predictor merges and stores the *negated* energy score so that
/// higher stored values consistently mean "more confident", matching the
/// sign convention of the softmax and uncertainty channels. This inverts
/// the usual OOD convention on purpose.
///
/// # Panics
///
/// Panics if `logits` is not 4-dimensional.
#[must_use]
pub fn energy_score(logits: &Tensor, t: f32) -> Tensor {
    let (n, c, plane) = batch_dims(logits);
    let src = logits.data();
    let mut out = vec![0.0f32; n * plane];
    let mut scratch = vec![0.0f32; c];

    for b in 0..n {
        let base = b * c * plane;
        for p in 0..plane {
            for (ch, v) in scratch.iter_mut().enumerate() {
                *v = src[base + ch * plane + p] / t;
            }
            out[b * plane + p] = -t * logsumexp_1d(&scratch);
        }
    }
    let shape = logits.shape();
    Tensor::from_vec(out, &[shape[0], shape[2], shape[3]])
}

/// Mean over the class axis of a `[N, C, H, W]` batch, giving `[N, H, W]`.
///
/// # Panics
///
/// Panics if `x` is not 4-dimensional.
#[must_use]
pub fn mean_channels(x: &Tensor) -> Tensor {
    let (n, c, plane) = batch_dims(x);
    let src = x.data();
    let mut out = vec![0.0f32; n * plane];

    for b in 0..n {
        let base = b * c * plane;
        for p in 0..plane {
            let mut sum = 0.0;
            for ch in 0..c {
                sum += src[base + ch * plane + p];
            }
            out[b * plane + p] = sum / c as f32;
        }
    }
    let shape = x.shape();
    Tensor::from_vec(out, &[shape[0], shape[2], shape[3]])
}

fn batch_dims(x: &Tensor) -> (usize, usize, usize) {
    let shape = x.shape();
    assert_eq!(
        shape.len(),
        4,
        "expected a [N, C, H, W] batch, got shape {shape:?}"
    );
    (shape[0], shape[1], shape[2] * shape[3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_1d_sums_to_one() {
        let probs = softmax_1d(&[1.0, 2.0, 3.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_softmax_1d_large_logits_stable() {
        let probs = softmax_1d(&[1000.0, 1000.0]);
        assert!((probs[0] - 0.5).abs() < 1e-6);
        assert!(probs.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_logsumexp_matches_naive_for_small_values() {
        let x = [0.5f32, -0.25, 1.5];
        let naive = x.iter().map(|v| v.exp()).sum::<f32>().ln();
        assert!((logsumexp_1d(&x) - naive).abs() < 1e-6);
    }

    #[test]
    fn test_logsumexp_large_logits_stable() {
        let lse = logsumexp_1d(&[500.0, 500.0]);
        assert!((lse - (500.0 + 2.0f32.ln())).abs() < 1e-3);
    }

    #[test]
    fn test_softmax_channels_per_pixel() {
        // [1, 2, 1, 2]: two pixels, two classes
        let logits = Tensor::new(&[0.0, 2.0, 1.0, 0.0], &[1, 2, 1, 2]);
        let probs = softmax_channels(&logits);
        // pixel 0: classes (0.0, 1.0); pixel 1: classes (2.0, 0.0)
        let p0 = softmax_1d(&[0.0, 1.0]);
        let p1 = softmax_1d(&[2.0, 0.0]);
        let expected = Tensor::new(&[p0[0], p1[0], p0[1], p1[1]], &[1, 2, 1, 2]);
        assert!(probs.allclose(&expected, 1e-6));
    }

    #[test]
    fn test_energy_score_confident_is_more_negative() {
        // Confident logits [10, 0] vs uninformative [1, 1] at T=1.
        let logits = Tensor::new(&[10.0, 1.0, 0.0, 1.0], &[1, 2, 1, 2]);
        let energy = energy_score(&logits, 1.0);
        assert_eq!(energy.shape(), &[1, 1, 2]);
        let confident = energy.data()[0];
        let uniform = energy.data()[1];
        assert!(confident < uniform);
        assert!((confident - (-10.0)).abs() < 1e-3);
        assert!((uniform - (-(1.0 + 2.0f32.ln()))).abs() < 1e-5);
    }

    #[test]
    fn test_energy_score_temperature_scaling() {
        let logits = Tensor::new(&[4.0, 2.0], &[1, 2, 1, 1]);
        let e1 = energy_score(&logits, 1.0).data()[0];
        let e2 = energy_score(&logits, 2.0).data()[0];
        // -T*logsumexp(x/T) ≈ -(mean + T·log C) for large T, so raising T
        // pushes the score further negative
        assert!(e2 < e1);
        assert!((e1 - (-(4.0 + (1.0f32 + (-2.0f32).exp()).ln()))).abs() < 1e-5);
    }

    #[test]
    fn test_mean_channels() {
        let x = Tensor::new(&[1.0, 2.0, 3.0, 4.0], &[1, 2, 1, 2]);
        let m = mean_channels(&x);
        assert_eq!(m.shape(), &[1, 1, 2]);
        assert_eq!(m.data(), &[2.0, 3.0]);
    }
}
