//! Mask-weighted blending of per-body rigid transforms over a point cloud.
//!
//! For every pixel with point p and weights mₖ:
//!
//! Position: p' = Σₖ mₖ·(Rₖ·p + tₖ)
//!
//! Delta:    p' = p + Σₖ mₖ·(Rₖ·p + tₖ − p)
//!
//! The two agree when the weights sum to one. Pixels whose point is exactly
//! zero produce a zero output and take no part in any gradient.
//!
//! Examples are processed in parallel with rayon.

use super::{Mask, PointCloud, add_point_in, is_missing_point, point_in, set_point_in};
use crate::batch::{Rt, TransformBatch, rotation_of, rt_from_parts, translation_of};
use crate::error::{Se3Error, Se3Result};
use nalgebra::{Matrix3, Vector3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

/// How per-body motions are blended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    /// Blend transformed positions.
    #[default]
    Position,
    /// Blend displacements and add them to the input point.
    Delta,
}

impl fmt::Display for BlendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlendMode::Position => write!(f, "ntfm3d"),
            BlendMode::Delta => write!(f, "ntfm3ddelta"),
        }
    }
}

impl FromStr for BlendMode {
    type Err = Se3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ntfm3d" | "position" => Ok(BlendMode::Position),
            "ntfm3ddelta" | "delta" => Ok(BlendMode::Delta),
            _ => Err(Se3Error::unknown("blend mode", s)),
        }
    }
}

/// Gradients of [`ntfm3d`] with respect to each of its inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct NTfm3DGradients {
    pub points: PointCloud,
    pub masks: Mask,
    pub transforms: TransformBatch,
}

pub(crate) fn validate_operands(
    points: &PointCloud,
    masks: &Mask,
    transforms: &TransformBatch,
    op: &'static str,
) -> Se3Result<()> {
    points.ensure_channels(3, op)?;
    points.ensure_same_grid(masks, op)?;
    if masks.channels() != transforms.num_bodies() || masks.batch_size() != transforms.batch_size()
    {
        return Err(Se3Error::shape(
            op,
            format!(
                "{}x{} transforms for masks {}",
                masks.batch_size(),
                masks.channels(),
                masks.shape_string()
            ),
            format!("{} transforms", transforms.shape_string()),
        ));
    }
    Ok(())
}

fn split_transforms(transforms: &[Rt]) -> Vec<(Matrix3<f64>, Vector3<f64>)> {
    transforms
        .iter()
        .map(|rt| (rotation_of(rt), translation_of(rt)))
        .collect()
}

fn forward_example(
    points: &[f64],
    masks: &[f64],
    transforms: &[Rt],
    pixels: usize,
    mode: BlendMode,
) -> Vec<f64> {
    let blocks = split_transforms(transforms);
    let mut out = vec![0.0; 3 * pixels];
    for pix in 0..pixels {
        let p = point_in(points, pixels, pix);
        if is_missing_point(&p) {
            continue;
        }
        let mut acc = match mode {
            BlendMode::Position => Vector3::zeros(),
            BlendMode::Delta => p,
        };
        for (k, (r, t)) in blocks.iter().enumerate() {
            let m = masks[k * pixels + pix];
            if m == 0.0 {
                continue;
            }
            let moved = r * p + t;
            acc += match mode {
                BlendMode::Position => m * moved,
                BlendMode::Delta => m * (moved - p),
            };
        }
        set_point_in(&mut out, pixels, pix, &acc);
    }
    out
}

/// Blend per-body transforms over every point.
pub fn ntfm3d(
    points: &PointCloud,
    masks: &Mask,
    transforms: &TransformBatch,
    mode: BlendMode,
) -> Se3Result<PointCloud> {
    validate_operands(points, masks, transforms, "ntfm3d")?;
    trace!(
        "ntfm3d {} over {} transforms",
        mode,
        transforms.shape_string()
    );

    let pixels = points.num_pixels();
    let data: Vec<f64> = (0..points.batch_size())
        .into_par_iter()
        .map(|b| {
            forward_example(
                points.example(b),
                masks.example(b),
                transforms.example(b),
                pixels,
                mode,
            )
        })
        .collect::<Vec<_>>()
        .concat();
    PointCloud::new(
        points.batch_size(),
        3,
        points.height(),
        points.width(),
        data,
    )
}

struct ExampleGradients {
    points: Vec<f64>,
    masks: Vec<f64>,
    transforms: Vec<Rt>,
}

fn backward_example(
    points: &[f64],
    masks: &[f64],
    transforms: &[Rt],
    grad_output: &[f64],
    pixels: usize,
    mode: BlendMode,
) -> ExampleGradients {
    let blocks = split_transforms(transforms);
    let num_bodies = blocks.len();
    let mut grad_points = vec![0.0; 3 * pixels];
    let mut grad_masks = vec![0.0; num_bodies * pixels];
    let mut grad_rotations = vec![Matrix3::<f64>::zeros(); num_bodies];
    let mut grad_translations = vec![Vector3::<f64>::zeros(); num_bodies];

    for pix in 0..pixels {
        let p = point_in(points, pixels, pix);
        if is_missing_point(&p) {
            continue;
        }
        let g = point_in(grad_output, pixels, pix);
        let mut g_p = match mode {
            BlendMode::Position => Vector3::zeros(),
            BlendMode::Delta => g,
        };

        for (k, (r, t)) in blocks.iter().enumerate() {
            let m = masks[k * pixels + pix];
            let moved = r * p + t;
            grad_masks[k * pixels + pix] = match mode {
                BlendMode::Position => g.dot(&moved),
                BlendMode::Delta => g.dot(&(moved - p)),
            };
            if m == 0.0 {
                continue;
            }
            g_p += match mode {
                BlendMode::Position => m * (r.transpose() * g),
                BlendMode::Delta => m * (r.transpose() * g - g),
            };
            grad_rotations[k] += m * g * p.transpose();
            grad_translations[k] += m * g;
        }
        add_point_in(&mut grad_points, pixels, pix, &g_p);
    }

    ExampleGradients {
        points: grad_points,
        masks: grad_masks,
        transforms: grad_rotations
            .iter()
            .zip(&grad_translations)
            .map(|(g_r, g_t)| rt_from_parts(g_r, g_t))
            .collect(),
    }
}

/// Gradients of [`ntfm3d`] for upstream `grad_output`.
pub fn ntfm3d_backward(
    points: &PointCloud,
    masks: &Mask,
    transforms: &TransformBatch,
    mode: BlendMode,
    grad_output: &PointCloud,
) -> Se3Result<NTfm3DGradients> {
    validate_operands(points, masks, transforms, "ntfm3d_backward")?;
    points.ensure_same_shape(grad_output, "ntfm3d_backward")?;

    let pixels = points.num_pixels();
    let per_example: Vec<ExampleGradients> = (0..points.batch_size())
        .into_par_iter()
        .map(|b| {
            backward_example(
                points.example(b),
                masks.example(b),
                transforms.example(b),
                grad_output.example(b),
                pixels,
                mode,
            )
        })
        .collect();

    let mut grad_points = points.zeros_like();
    let mut grad_masks = masks.zeros_like();
    let mut grad_transforms = Vec::with_capacity(transforms.len());
    for (b, example) in per_example.into_iter().enumerate() {
        grad_points.example_mut(b).copy_from_slice(&example.points);
        grad_masks.example_mut(b).copy_from_slice(&example.masks);
        grad_transforms.extend(example.transforms);
    }

    Ok(NTfm3DGradients {
        points: grad_points,
        masks: grad_masks,
        transforms: TransformBatch::new(
            transforms.batch_size(),
            transforms.num_bodies(),
            grad_transforms,
        )?,
    })
}
