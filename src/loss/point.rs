//! Dense point losses: squared, absolute and variance-normalized errors.

use super::{DenseOperands, LossOutput, Reduction};
use crate::error::Se3Result;
use crate::points::{PixelMap, PointCloud};
use serde::{Deserialize, Serialize};

/// Smallest variance of the normalized losses (2 mm).
pub const MIN_SIGMA: f64 = 2e-3;

/// Where the variance of [`bi_norm_mse_sqrt_loss`] is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VarianceNorm {
    /// σ = max(0.5·|y|, 2e-3) for every element.
    #[default]
    PerElement,
    /// σ = max(0.5·‖y‖, 2e-3) shared by the channels of a point.
    PerPoint,
}

/// Sign with a zero sub-gradient at 0.
pub(crate) fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// `0.5·Σ((x − y)·w)²`, averaged by the weight sum or element count.
pub fn bi_mse_loss(
    input: &PointCloud,
    target: &PointCloud,
    weights: Option<&PixelMap>,
    reduction: Reduction,
) -> Se3Result<LossOutput<PointCloud>> {
    let operands = DenseOperands::check(input, target, weights, "bi_mse_loss")?;
    let norm = operands.normalizer(input, reduction);

    let mut grad_input = input.zeros_like();
    let mut value = 0.0_f64;
    for b in 0..input.batch_size() {
        for c in 0..input.channels() {
            for pix in 0..input.num_pixels() {
                let w = operands.weight(b, pix);
                let diff = input.value(b, c, pix) - target.value(b, c, pix);
                value += 0.5 * (diff * w).powi(2);
                *grad_input.value_mut(b, c, pix) = diff * w * w / norm;
            }
        }
    }
    let grad_target = negated(&grad_input);
    Ok(LossOutput {
        value: value / norm,
        grad_input,
        grad_target,
    })
}

/// `Σ|x − y|·w`, averaged like [`bi_mse_loss`].
pub fn bi_abs_loss(
    input: &PointCloud,
    target: &PointCloud,
    weights: Option<&PixelMap>,
    reduction: Reduction,
) -> Se3Result<LossOutput<PointCloud>> {
    let operands = DenseOperands::check(input, target, weights, "bi_abs_loss")?;
    let norm = operands.normalizer(input, reduction);

    let mut grad_input = input.zeros_like();
    let mut value = 0.0_f64;
    for b in 0..input.batch_size() {
        for c in 0..input.channels() {
            for pix in 0..input.num_pixels() {
                let w = operands.weight(b, pix);
                let diff = input.value(b, c, pix) - target.value(b, c, pix);
                value += diff.abs() * w;
                *grad_input.value_mut(b, c, pix) = sign(diff) * w / norm;
            }
        }
    }
    let grad_target = negated(&grad_input);
    Ok(LossOutput {
        value: value / norm,
        grad_input,
        grad_target,
    })
}

/// `0.5·Σ((x − y)·w)²/σ` with σ derived from the target magnitude.
///
/// The target receives gradient both through the difference and through σ
/// wherever σ is above its floor.
pub fn bi_norm_mse_sqrt_loss(
    input: &PointCloud,
    target: &PointCloud,
    weights: Option<&PixelMap>,
    variance: VarianceNorm,
    reduction: Reduction,
) -> Se3Result<LossOutput<PointCloud>> {
    let operands = DenseOperands::check(input, target, weights, "bi_norm_mse_sqrt_loss")?;
    let norm = operands.normalizer(input, reduction);
    let scale = 1.0 / norm;

    let mut grad_input = input.zeros_like();
    let mut grad_target = input.zeros_like();
    let mut value = 0.0_f64;
    for b in 0..input.batch_size() {
        for pix in 0..input.num_pixels() {
            let w = operands.weight(b, pix);
            value += accumulate_point(
                input,
                target,
                b,
                pix,
                w,
                variance,
                scale,
                &mut grad_input,
                &mut grad_target,
            );
        }
    }
    Ok(LossOutput {
        value: value / norm,
        grad_input,
        grad_target,
    })
}

/// Unnormalized normalized-variance error of one pixel, writing its
/// gradients scaled by `scale`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn accumulate_point(
    input: &PointCloud,
    target: &PointCloud,
    b: usize,
    pix: usize,
    w: f64,
    variance: VarianceNorm,
    scale: f64,
    grad_input: &mut PointCloud,
    grad_target: &mut PointCloud,
) -> f64 {
    let channels = input.channels();
    match variance {
        VarianceNorm::PerElement => {
            let mut value = 0.0_f64;
            for c in 0..channels {
                let x = input.value(b, c, pix);
                let y = target.value(b, c, pix);
                let diff = x - y;
                let half = 0.5 * y.abs();
                let (sigma, d_sigma) = if half > MIN_SIGMA {
                    (half, 0.5 * sign(y))
                } else {
                    (MIN_SIGMA, 0.0)
                };
                let term = 0.5 * (diff * w).powi(2) / sigma;
                let g = diff * w * w / sigma * scale;
                *grad_input.value_mut(b, c, pix) = g;
                *grad_target.value_mut(b, c, pix) = -g - term / sigma * d_sigma * scale;
                value += term;
            }
            value
        }
        VarianceNorm::PerPoint => {
            let target_norm = (0..channels)
                .map(|c| target.value(b, c, pix).powi(2))
                .sum::<f64>()
                .sqrt();
            let half = 0.5 * target_norm;
            let sigma = half.max(MIN_SIGMA);
            let mut value = 0.0_f64;
            for c in 0..channels {
                let diff = input.value(b, c, pix) - target.value(b, c, pix);
                value += 0.5 * (diff * w).powi(2) / sigma;
                let g = diff * w * w / sigma * scale;
                *grad_input.value_mut(b, c, pix) = g;
                *grad_target.value_mut(b, c, pix) = -g;
            }
            if half > MIN_SIGMA {
                // ∂σ/∂y = 0.5·y/‖y‖
                let d_value_d_sigma = -value / sigma;
                for c in 0..channels {
                    let y = target.value(b, c, pix);
                    *grad_target.value_mut(b, c, pix) +=
                        d_value_d_sigma * 0.5 * y / target_norm * scale;
                }
            }
            value
        }
    }
}

pub(crate) fn negated(grad: &PointCloud) -> PointCloud {
    let mut out = grad.clone();
    out.data_mut().iter_mut().for_each(|v| *v = -*v);
    out
}
