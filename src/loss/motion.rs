//! Losses normalized by the number of moving points of each example.
//!
//! A pixel is moving when `Σ_c |motion_c| > threshold`. The per-example count
//! (weighted by the optional per-pixel weights) is clamped from below at
//! `min_points`, so examples where nothing moves never divide by zero.

use super::point::{VarianceNorm, accumulate_point, sign};
use super::{DenseOperands, LossOutput, LossType};
use crate::error::Se3Result;
use crate::points::{PixelMap, PointCloud};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Floor of the cosine denominator of [`normal_loss`].
const COSINE_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionNormalization {
    /// Minimum L1 displacement of a moving point.
    pub threshold: f64,
    /// Lower bound of the per-example moving count.
    pub min_points: f64,
}

impl Default for MotionNormalization {
    fn default() -> Self {
        Self {
            threshold: 2.5e-3,
            min_points: 100.0,
        }
    }
}

impl MotionNormalization {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_min_points(mut self, min_points: f64) -> Self {
        self.min_points = min_points;
        self
    }

    /// Clamped moving-point count of every example.
    fn moving_counts(&self, motion: &PointCloud, operands: &DenseOperands<'_>) -> Vec<f64> {
        (0..motion.batch_size())
            .map(|b| {
                let count: f64 = (0..motion.num_pixels())
                    .filter(|&pix| {
                        let l1: f64 = (0..motion.channels())
                            .map(|c| motion.value(b, c, pix).abs())
                            .sum();
                        l1 > self.threshold
                    })
                    .map(|pix| operands.weight(b, pix))
                    .sum();
                count.max(self.min_points)
            })
            .collect()
    }
}

/// Point loss where each example's error is divided by its moving count and
/// the result averaged over the batch.
pub fn motion_normalized_loss_3d(
    input: &PointCloud,
    target: &PointCloud,
    motion: &PointCloud,
    weights: Option<&PixelMap>,
    loss_type: LossType,
    normalization: &MotionNormalization,
) -> Se3Result<LossOutput<PointCloud>> {
    let op = "motion_normalized_loss_3d";
    let operands = DenseOperands::check(input, target, weights, op)?;
    input.ensure_same_shape(motion, op)?;

    let counts = normalization.moving_counts(motion, &operands);
    trace!("{op}: moving counts {:?}", counts);
    let batch = input.batch_size() as f64;

    let mut grad_input = input.zeros_like();
    let mut grad_target = input.zeros_like();
    let mut value = 0.0_f64;
    for (b, count) in counts.iter().enumerate() {
        let scale = 1.0 / (count * batch);
        let mut error = 0.0_f64;
        for pix in 0..input.num_pixels() {
            let w = operands.weight(b, pix);
            match loss_type {
                LossType::Mse | LossType::Abs => {
                    for c in 0..input.channels() {
                        let diff = input.value(b, c, pix) - target.value(b, c, pix);
                        let g = if loss_type == LossType::Mse {
                            error += 0.5 * (diff * w).powi(2);
                            diff * w * w * scale
                        } else {
                            error += diff.abs() * w;
                            sign(diff) * w * scale
                        };
                        *grad_input.value_mut(b, c, pix) = g;
                        *grad_target.value_mut(b, c, pix) = -g;
                    }
                }
                LossType::NormMseSqrt | LossType::NormMseSqrtPt => {
                    let variance = if loss_type == LossType::NormMseSqrtPt {
                        VarianceNorm::PerPoint
                    } else {
                        VarianceNorm::PerElement
                    };
                    error += accumulate_point(
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
        }
        value += error * scale;
    }
    Ok(LossOutput {
        value,
        grad_input,
        grad_target,
    })
}

/// `1 − cos(x, y)` between the channel vectors of every pixel, weighted.
///
/// Without `motion` the result is the mean over all pixels; with it each
/// example is divided by its moving count and the batch is averaged.
pub fn normal_loss(
    input: &PointCloud,
    target: &PointCloud,
    weights: Option<&PixelMap>,
    motion: Option<&PointCloud>,
    normalization: &MotionNormalization,
) -> Se3Result<LossOutput<PointCloud>> {
    let op = "normal_loss";
    let operands = DenseOperands::check(input, target, weights, op)?;
    let scales: Vec<f64> = match motion {
        Some(motion) => {
            input.ensure_same_shape(motion, op)?;
            let batch = input.batch_size() as f64;
            normalization
                .moving_counts(motion, &operands)
                .into_iter()
                .map(|count| 1.0 / (count * batch))
                .collect()
        }
        None => {
            let total = (input.batch_size() * input.num_pixels()).max(1) as f64;
            vec![1.0 / total; input.batch_size()]
        }
    };

    let channels = input.channels();
    let mut grad_input = input.zeros_like();
    let mut grad_target = input.zeros_like();
    let mut value = 0.0_f64;
    for (b, scale) in scales.iter().enumerate() {
        for pix in 0..input.num_pixels() {
            let w = operands.weight(b, pix);
            let x: Vec<f64> = (0..channels).map(|c| input.value(b, c, pix)).collect();
            let y: Vec<f64> = (0..channels).map(|c| target.value(b, c, pix)).collect();
            let dot: f64 = x.iter().zip(&y).map(|(a, b)| a * b).sum();
            let nx2: f64 = x.iter().map(|v| v * v).sum();
            let ny2: f64 = y.iter().map(|v| v * v).sum();
            let denom = (nx2 * ny2).sqrt();

            let (cos, clamped) = if denom > COSINE_EPS {
                (dot / denom, false)
            } else {
                (dot / COSINE_EPS, true)
            };
            value += w * (1.0 - cos) * scale;

            for c in 0..channels {
                let (d_cos_dx, d_cos_dy) = if clamped {
                    (y[c] / COSINE_EPS, x[c] / COSINE_EPS)
                } else {
                    (y[c] / denom - cos * x[c] / nx2, x[c] / denom - cos * y[c] / ny2)
                };
                *grad_input.value_mut(b, c, pix) = -w * d_cos_dx * scale;
                *grad_target.value_mut(b, c, pix) = -w * d_cos_dy * scale;
            }
        }
    }
    Ok(LossOutput {
        value,
        grad_input,
        grad_target,
    })
}
