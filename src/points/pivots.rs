//! Pivot and centroid statistics over point clouds.
//!
//! Only pixels with a usable depth (non-zero, finite z) contribute to any
//! average. Averages divide by a clamped count or weight so that an empty
//! selection yields the zero vector rather than NaN.

use super::{Mask, PointCloud, add_point_in, has_depth, point_in};
use crate::batch::{PivotBatch, Rt, TransformBatch, translation_of};
use crate::error::{Se3Error, Se3Result};
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Smallest total mask weight used as a divisor.
pub const MIN_MASK_WEIGHT: f64 = 1e-12;

/// Where per-body pivots come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PivotSource {
    /// Mean of all points with depth, shared by every body.
    PointMean,
    /// Mask-weighted mean of the points, per body.
    #[default]
    MaskMean,
    /// As `MaskMean`, but no gradient reaches the masks.
    MaskMeanNoGrad,
    /// Translation column of each body's pose.
    PoseCenter,
}

impl PivotSource {
    pub fn propagates_mask_gradient(self) -> bool {
        matches!(self, PivotSource::MaskMean)
    }
}

impl fmt::Display for PivotSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PivotSource::PointMean => "ptmean",
            PivotSource::MaskMean => "maskmean",
            PivotSource::MaskMeanNoGrad => "maskmeannograd",
            PivotSource::PoseCenter => "posecenter",
        };
        write!(f, "{name}")
    }
}

impl FromStr for PivotSource {
    type Err = Se3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ptmean" => Ok(PivotSource::PointMean),
            "maskmean" => Ok(PivotSource::MaskMean),
            "maskmeannograd" => Ok(PivotSource::MaskMeanNoGrad),
            "posecenter" => Ok(PivotSource::PoseCenter),
            _ => Err(Se3Error::unknown("pivot source", s)),
        }
    }
}

/// How predicted pose centers are adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PoseCenterMode {
    /// Keep the predicted translation.
    #[default]
    Predicted,
    /// Add the mask-weighted centroid of the points.
    MaskMean,
    /// As `MaskMean`, but no gradient reaches the masks.
    MaskMeanNoGrad,
}

impl fmt::Display for PoseCenterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoseCenterMode::Predicted => "pred",
            PoseCenterMode::MaskMean => "predwmaskmean",
            PoseCenterMode::MaskMeanNoGrad => "predwmaskmeannograd",
        };
        write!(f, "{name}")
    }
}

impl FromStr for PoseCenterMode {
    type Err = Se3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pred" => Ok(PoseCenterMode::Predicted),
            "predwmaskmean" => Ok(PoseCenterMode::MaskMean),
            "predwmaskmeannograd" => Ok(PoseCenterMode::MaskMeanNoGrad),
            _ => Err(Se3Error::unknown("pose center mode", s)),
        }
    }
}

/// Gradients produced by the pivot statistics; inputs that receive no
/// gradient are `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PivotGradients {
    pub points: Option<PointCloud>,
    pub masks: Option<Mask>,
    pub poses: Option<TransformBatch>,
}

/// Output of [`update_pose_centers`].
#[derive(Debug, Clone, PartialEq)]
pub struct PoseCenterUpdate {
    pub poses: TransformBatch,
    /// Predicted translations before the update.
    pub pose_centers: Option<PivotBatch>,
    /// Mask centroids that were added.
    pub mask_centers: Option<PivotBatch>,
}

fn validate_masks(points: &PointCloud, masks: &Mask, op: &'static str) -> Se3Result<()> {
    points.ensure_channels(3, op)?;
    points.ensure_same_grid(masks, op)
}

/// Per-body mask-weighted centroid `cₖ = Σ mₖ·p / max(Σ mₖ, ε)` over
/// pixels with depth.
pub fn weighted_average_points(points: &PointCloud, masks: &Mask) -> Se3Result<PivotBatch> {
    validate_masks(points, masks, "weighted_average_points")?;
    let pixels = points.num_pixels();

    Ok(PivotBatch::from_fn(points.batch_size(), masks.channels(), |b, k| {
        let example = points.example(b);
        let weights = &masks.example(b)[k * pixels..(k + 1) * pixels];
        let mut sum = Vector3::zeros();
        let mut total = 0.0_f64;
        for (pix, &m) in weights.iter().enumerate() {
            let p = point_in(example, pixels, pix);
            if has_depth(&p) {
                sum += m * p;
                total += m;
            }
        }
        sum / total.max(MIN_MASK_WEIGHT)
    }))
}

/// Gradients of [`weighted_average_points`] with respect to points and masks.
pub fn weighted_average_points_backward(
    points: &PointCloud,
    masks: &Mask,
    grad_centroids: &PivotBatch,
) -> Se3Result<(PointCloud, Mask)> {
    validate_masks(points, masks, "weighted_average_points_backward")?;
    if grad_centroids.batch_size() != masks.batch_size()
        || grad_centroids.num_bodies() != masks.channels()
    {
        return Err(Se3Error::shape(
            "weighted_average_points_backward",
            format!("{}x{} centroid gradients", masks.batch_size(), masks.channels()),
            grad_centroids.shape_string(),
        ));
    }

    let pixels = points.num_pixels();
    let mut grad_points = points.zeros_like();
    let mut grad_masks = masks.zeros_like();

    for b in 0..points.batch_size() {
        let example = points.example(b);
        let depth: Vec<bool> = (0..pixels)
            .map(|pix| has_depth(&point_in(example, pixels, pix)))
            .collect();

        for k in 0..masks.channels() {
            let weights = &masks.example(b)[k * pixels..(k + 1) * pixels];
            let mut sum = Vector3::zeros();
            let mut total = 0.0_f64;
            for pix in (0..pixels).filter(|&pix| depth[pix]) {
                sum += weights[pix] * point_in(example, pixels, pix);
                total += weights[pix];
            }
            let clamped = total < MIN_MASK_WEIGHT;
            let divisor = total.max(MIN_MASK_WEIGHT);
            let centroid = sum / divisor;
            let g = grad_centroids.get(b, k);

            for pix in (0..pixels).filter(|&pix| depth[pix]) {
                let p = point_in(example, pixels, pix);
                let share = g * (weights[pix] / divisor);
                add_point_in(grad_points.example_mut(b), pixels, pix, &share);
                // The divisor is constant once clamped.
                let offset = if clamped { p } else { p - centroid };
                *grad_masks.value_mut(b, k, pix) = g.dot(&offset) / divisor;
            }
        }
    }
    Ok((grad_points, grad_masks))
}

fn point_mean(points: &PointCloud, b: usize) -> (Vector3<f64>, f64) {
    let pixels = points.num_pixels();
    let example = points.example(b);
    let mut sum = Vector3::zeros();
    let mut count = 0.0_f64;
    for pix in 0..pixels {
        let p = point_in(example, pixels, pix);
        if has_depth(&p) {
            sum += p;
            count += 1.0;
        }
    }
    let count = count.max(1.0);
    (sum / count, count)
}

fn check_body_count(
    op: &'static str,
    num_bodies: usize,
    masks: Option<&Mask>,
    poses: Option<&TransformBatch>,
) -> Se3Result<()> {
    if let Some(m) = masks.filter(|m| m.channels() != num_bodies) {
        return Err(Se3Error::shape(
            op,
            format!("{num_bodies} mask channels"),
            format!("{} mask channels", m.channels()),
        ));
    }
    if let Some(p) = poses.filter(|p| p.num_bodies() != num_bodies) {
        return Err(Se3Error::shape(
            op,
            format!("{num_bodies} poses per example"),
            format!("{} poses per example", p.num_bodies()),
        ));
    }
    Ok(())
}

/// Per-body pivots from the selected source.
///
/// `masks` is required by the mask-based sources and `poses` by
/// [`PivotSource::PoseCenter`].
pub fn compute_pivots(
    source: PivotSource,
    points: &PointCloud,
    masks: Option<&Mask>,
    poses: Option<&TransformBatch>,
    num_bodies: usize,
) -> Se3Result<PivotBatch> {
    points.ensure_channels(3, "compute_pivots")?;
    check_body_count("compute_pivots", num_bodies, masks, poses)?;
    debug!("computing {} pivots for {} bodies", source, num_bodies);

    match source {
        PivotSource::PointMean => {
            let means: Vec<Vector3<f64>> = (0..points.batch_size())
                .map(|b| point_mean(points, b).0)
                .collect();
            Ok(PivotBatch::from_fn(points.batch_size(), num_bodies, |b, _| means[b]))
        }
        PivotSource::MaskMean | PivotSource::MaskMeanNoGrad => {
            let masks = masks.ok_or(Se3Error::MissingInput {
                op: "compute_pivots",
                input: "masks",
            })?;
            weighted_average_points(points, masks)
        }
        PivotSource::PoseCenter => {
            let poses = poses.ok_or(Se3Error::MissingInput {
                op: "compute_pivots",
                input: "poses",
            })?;
            if poses.batch_size() != points.batch_size() {
                return Err(Se3Error::shape(
                    "compute_pivots",
                    format!("batch {}", points.batch_size()),
                    format!("batch {}", poses.batch_size()),
                ));
            }
            Ok(poses.map(translation_of))
        }
    }
}

/// Gradients of [`compute_pivots`].
pub fn compute_pivots_backward(
    source: PivotSource,
    points: &PointCloud,
    masks: Option<&Mask>,
    poses: Option<&TransformBatch>,
    grad_pivots: &PivotBatch,
) -> Se3Result<PivotGradients> {
    points.ensure_channels(3, "compute_pivots_backward")?;
    if grad_pivots.batch_size() != points.batch_size() {
        return Err(Se3Error::shape(
            "compute_pivots_backward",
            format!("batch {}", points.batch_size()),
            format!("batch {}", grad_pivots.batch_size()),
        ));
    }
    check_body_count(
        "compute_pivots_backward",
        grad_pivots.num_bodies(),
        masks,
        poses,
    )?;

    match source {
        PivotSource::PointMean => {
            let pixels = points.num_pixels();
            let mut grad_points = points.zeros_like();
            for b in 0..points.batch_size() {
                let (_, count) = point_mean(points, b);
                let total: Vector3<f64> = grad_pivots.example(b).iter().sum();
                let share = total / count;
                for pix in 0..pixels {
                    if has_depth(&points.point(b, pix)) {
                        add_point_in(grad_points.example_mut(b), pixels, pix, &share);
                    }
                }
            }
            Ok(PivotGradients {
                points: Some(grad_points),
                ..Default::default()
            })
        }
        PivotSource::MaskMean | PivotSource::MaskMeanNoGrad => {
            let masks = masks.ok_or(Se3Error::MissingInput {
                op: "compute_pivots_backward",
                input: "masks",
            })?;
            let (grad_points, grad_masks) =
                weighted_average_points_backward(points, masks, grad_pivots)?;
            Ok(PivotGradients {
                points: Some(grad_points),
                masks: source.propagates_mask_gradient().then_some(grad_masks),
                poses: None,
            })
        }
        PivotSource::PoseCenter => {
            let poses = poses.ok_or(Se3Error::MissingInput {
                op: "compute_pivots_backward",
                input: "poses",
            })?;
            let grad_poses = poses.zip_map(grad_pivots, "compute_pivots_backward", |_, g| {
                let mut grad = Rt::zeros();
                grad.set_column(3, g);
                grad
            })?;
            Ok(PivotGradients {
                poses: Some(grad_poses),
                ..Default::default()
            })
        }
    }
}

/// Shift predicted pose translations by the mask centroid of each body.
pub fn update_pose_centers(
    points: &PointCloud,
    masks: Option<&Mask>,
    poses: &TransformBatch,
    mode: PoseCenterMode,
) -> Se3Result<PoseCenterUpdate> {
    if mode == PoseCenterMode::Predicted {
        return Ok(PoseCenterUpdate {
            poses: poses.clone(),
            pose_centers: None,
            mask_centers: None,
        });
    }
    let masks = masks.ok_or(Se3Error::MissingInput {
        op: "update_pose_centers",
        input: "masks",
    })?;
    check_body_count("update_pose_centers", poses.num_bodies(), Some(masks), None)?;

    let mask_centers = weighted_average_points(points, masks)?;
    let pose_centers = poses.map(translation_of);
    let updated = poses.zip_map(&mask_centers, "update_pose_centers", |pose, center| {
        let mut out = *pose;
        out.set_column(3, &(translation_of(pose) + center));
        out
    })?;
    Ok(PoseCenterUpdate {
        poses: updated,
        pose_centers: Some(pose_centers),
        mask_centers: Some(mask_centers),
    })
}

/// Gradients of [`update_pose_centers`] for upstream `grad_poses`.
pub fn update_pose_centers_backward(
    points: &PointCloud,
    masks: Option<&Mask>,
    poses: &TransformBatch,
    mode: PoseCenterMode,
    grad_poses: &TransformBatch,
) -> Se3Result<PivotGradients> {
    poses.ensure_same_shape(grad_poses, "update_pose_centers_backward")?;
    if mode == PoseCenterMode::Predicted {
        return Ok(PivotGradients {
            poses: Some(grad_poses.clone()),
            ..Default::default()
        });
    }
    let masks = masks.ok_or(Se3Error::MissingInput {
        op: "update_pose_centers_backward",
        input: "masks",
    })?;
    let grad_centers = grad_poses.map(translation_of);
    let (grad_points, grad_masks) = weighted_average_points_backward(points, masks, &grad_centers)?;
    Ok(PivotGradients {
        points: Some(grad_points),
        masks: (mode == PoseCenterMode::MaskMean).then_some(grad_masks),
        poses: Some(grad_poses.clone()),
    })
}
