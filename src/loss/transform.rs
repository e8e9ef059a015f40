//! Mask-weighted rigid transform loss.
//!
//! L = 0.5·Σ_pixels Σₖ mₖ·‖Rₖ·p + tₖ − y‖²
//!
//! Every body's transformed point is compared with the target on its own and
//! the squared errors are weighted by the mask. Blending with
//! [`ntfm3d`](crate::points::ntfm3d) first and comparing the blend gives a
//! different loss unless the masks are one-hot. [`Reduction::Mean`] divides
//! by the number of point coordinates. All pixels take part, including
//! points without depth.

use super::Reduction;
use crate::batch::{Rt, TransformBatch, rotation_of, rt_from_parts, translation_of};
use crate::error::Se3Result;
use crate::points::ntfm3d::validate_operands;
use crate::points::{Mask, PointCloud, add_point_in, point_in};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use tracing::trace;

/// Value of [`weighted_3d_transform_loss`] with gradients for every operand.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformLossOutput {
    pub value: f64,
    pub grad_points: PointCloud,
    pub grad_masks: Mask,
    pub grad_transforms: TransformBatch,
    pub grad_target: PointCloud,
}

struct ExampleLoss {
    value: f64,
    points: Vec<f64>,
    masks: Vec<f64>,
    transforms: Vec<Rt>,
    target: Vec<f64>,
}

fn example_loss(
    points: &[f64],
    masks: &[f64],
    transforms: &[Rt],
    target: &[f64],
    pixels: usize,
    scale: f64,
) -> ExampleLoss {
    let blocks: Vec<(Matrix3<f64>, Vector3<f64>)> = transforms
        .iter()
        .map(|rt| (rotation_of(rt), translation_of(rt)))
        .collect();
    let mut value = 0.0_f64;
    let mut grad_points = vec![0.0; 3 * pixels];
    let mut grad_masks = vec![0.0; blocks.len() * pixels];
    let mut grad_target = vec![0.0; 3 * pixels];
    let mut grad_rotations = vec![Matrix3::<f64>::zeros(); blocks.len()];
    let mut grad_translations = vec![Vector3::<f64>::zeros(); blocks.len()];

    for pix in 0..pixels {
        let p = point_in(points, pixels, pix);
        let y = point_in(target, pixels, pix);
        let mut g_p = Vector3::zeros();
        let mut g_y = Vector3::zeros();
        for (k, (r, t)) in blocks.iter().enumerate() {
            let m = masks[k * pixels + pix];
            let err = r * p + t - y;
            let half_sq = 0.5 * err.norm_squared();
            value += m * half_sq;
            grad_masks[k * pixels + pix] = half_sq * scale;
            if m == 0.0 {
                continue;
            }
            let g = m * scale * err;
            g_p += r.transpose() * g;
            g_y -= g;
            grad_rotations[k] += g * p.transpose();
            grad_translations[k] += g;
        }
        add_point_in(&mut grad_points, pixels, pix, &g_p);
        add_point_in(&mut grad_target, pixels, pix, &g_y);
    }

    ExampleLoss {
        value,
        points: grad_points,
        masks: grad_masks,
        transforms: grad_rotations
            .iter()
            .zip(&grad_translations)
            .map(|(g_r, g_t)| rt_from_parts(g_r, g_t))
            .collect(),
        target: grad_target,
    }
}

/// Mask-weighted squared error of every body's transform against `target`.
pub fn weighted_3d_transform_loss(
    points: &PointCloud,
    masks: &Mask,
    transforms: &TransformBatch,
    target: &PointCloud,
    reduction: Reduction,
) -> Se3Result<TransformLossOutput> {
    validate_operands(points, masks, transforms, "weighted_3d_transform_loss")?;
    points.ensure_same_shape(target, "weighted_3d_transform_loss")?;
    trace!(
        "weighted 3d transform loss over {} transforms",
        transforms.shape_string()
    );

    let scale = match reduction {
        Reduction::Mean => 1.0 / points.len().max(1) as f64,
        Reduction::Sum => 1.0,
    };
    let pixels = points.num_pixels();
    let per_example: Vec<ExampleLoss> = (0..points.batch_size())
        .into_par_iter()
        .map(|b| {
            example_loss(
                points.example(b),
                masks.example(b),
                transforms.example(b),
                target.example(b),
                pixels,
                scale,
            )
        })
        .collect();

    let mut value = 0.0_f64;
    let mut grad_points = points.zeros_like();
    let mut grad_masks = masks.zeros_like();
    let mut grad_target = target.zeros_like();
    let mut grad_transforms = Vec::with_capacity(transforms.len());
    for (b, example) in per_example.into_iter().enumerate() {
        value += example.value;
        grad_points.example_mut(b).copy_from_slice(&example.points);
        grad_masks.example_mut(b).copy_from_slice(&example.masks);
        grad_target.example_mut(b).copy_from_slice(&example.target);
        grad_transforms.extend(example.transforms);
    }

    Ok(TransformLossOutput {
        value: value * scale,
        grad_points,
        grad_masks,
        grad_transforms: TransformBatch::new(
            transforms.batch_size(),
            transforms.num_bodies(),
            grad_transforms,
        )?,
        grad_target,
    })
}
