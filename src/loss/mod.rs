//! Point and pose losses with gradients for both arguments.
//!
//! Both sides of a comparison may be model outputs (a transition-predicted
//! pose against an encoder pose, say), so every loss returns `∂L/∂input` and
//! `∂L/∂target`. Optional weights are per-pixel scalars (`B × 1 × H × W`)
//! broadcast across channels; with weights, averaging divides by the sum of
//! the broadcast weights instead of the element count.

use crate::error::{Se3Error, Se3Result};
use crate::points::{ImageBatch, PixelMap, PointCloud};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod motion;
pub mod point;
pub mod pose;
pub mod transform;

pub use motion::{MotionNormalization, motion_normalized_loss_3d, normal_loss};
pub use point::{VarianceNorm, bi_abs_loss, bi_mse_loss, bi_norm_mse_sqrt_loss};
pub use pose::{dissimilarity_loss, pose_abs_loss, pose_consistency_loss, pose_mse_loss};
pub use transform::{TransformLossOutput, weighted_3d_transform_loss};

/// Floor for normalizers built from weight sums.
pub(crate) const MIN_NORMALIZER: f64 = 1e-12;

/// Scalar loss value and its gradients with respect to both operands.
#[derive(Debug, Clone, PartialEq)]
pub struct LossOutput<G> {
    pub value: f64,
    pub grad_input: G,
    pub grad_target: G,
}

/// How per-element terms are reduced to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Reduction {
    #[default]
    Mean,
    Sum,
}

/// Point loss selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LossType {
    #[default]
    Mse,
    Abs,
    NormMseSqrt,
    NormMseSqrtPt,
}

impl LossType {
    pub fn name(self) -> &'static str {
        match self {
            LossType::Mse => "mse",
            LossType::Abs => "abs",
            LossType::NormMseSqrt => "normmsesqrt",
            LossType::NormMseSqrtPt => "normmsesqrtpt",
        }
    }
}

impl fmt::Display for LossType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for LossType {
    type Err = Se3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mse" => Ok(LossType::Mse),
            "abs" => Ok(LossType::Abs),
            "normmsesqrt" => Ok(LossType::NormMseSqrt),
            "normmsesqrtpt" => Ok(LossType::NormMseSqrtPt),
            _ => Err(Se3Error::unknown("loss type", s)),
        }
    }
}

/// 3D point loss with mean reduction.
pub fn loss_3d(
    input: &PointCloud,
    target: &PointCloud,
    weights: Option<&PixelMap>,
    loss_type: LossType,
) -> Se3Result<LossOutput<PointCloud>> {
    match loss_type {
        LossType::Mse => bi_mse_loss(input, target, weights, Reduction::Mean),
        LossType::Abs => bi_abs_loss(input, target, weights, Reduction::Mean),
        LossType::NormMseSqrt => bi_norm_mse_sqrt_loss(
            input,
            target,
            weights,
            VarianceNorm::PerElement,
            Reduction::Mean,
        ),
        LossType::NormMseSqrtPt => bi_norm_mse_sqrt_loss(
            input,
            target,
            weights,
            VarianceNorm::PerPoint,
            Reduction::Mean,
        ),
    }
}

/// Validated operands of a dense loss.
pub(crate) struct DenseOperands<'a> {
    weights: Option<&'a PixelMap>,
}

impl<'a> DenseOperands<'a> {
    pub(crate) fn check(
        input: &ImageBatch,
        target: &ImageBatch,
        weights: Option<&'a PixelMap>,
        op: &'static str,
    ) -> Se3Result<Self> {
        input.ensure_same_shape(target, op)?;
        if let Some(w) = weights {
            w.ensure_channels(1, op)?;
            input.ensure_same_grid(w, op)?;
        }
        Ok(Self { weights })
    }

    /// Weight of pixel `pix` of example `b` (1 without weights).
    pub(crate) fn weight(&self, b: usize, pix: usize) -> f64 {
        self.weights.map_or(1.0, |w| w.value(b, 0, pix))
    }

    /// Divisor for `Reduction::Mean`: broadcast weight sum or element count.
    pub(crate) fn normalizer(&self, input: &ImageBatch, reduction: Reduction) -> f64 {
        match (reduction, self.weights) {
            (Reduction::Sum, _) => 1.0,
            (Reduction::Mean, None) => input.len() as f64,
            (Reduction::Mean, Some(w)) => {
                let total: f64 = w.data().iter().sum();
                (total * input.channels() as f64).max(MIN_NORMALIZER)
            }
        }
    }
}
