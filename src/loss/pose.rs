//! Pose losses over batches of 3×4 transforms.

use super::point::sign;
use super::{LossOutput, MIN_NORMALIZER, Reduction};
use crate::batch::{Rt, TransformBatch, rotation_of, rt_from_parts, translation_of};
use crate::error::Se3Result;
use crate::transform::algebra::{
    compose_rt_pair, compose_rt_pair_backward, rt_inverse, rt_inverse_backward,
};
use nalgebra::{Matrix3, Vector3};

/// Disagreement between two pose batches through `Δ = input ∘ target⁻¹`.
///
/// With `cosθ = 0.5·(tr(R_Δ) − 1)` the loss is `Σ‖t_Δ‖ + Σ|cosθ − 1|`,
/// each sum divided by the number of poses for [`Reduction::Mean`].
pub fn pose_consistency_loss(
    input: &TransformBatch,
    target: &TransformBatch,
    reduction: Reduction,
) -> Se3Result<LossOutput<TransformBatch>> {
    input.ensure_same_shape(target, "pose_consistency_loss")?;
    let scale = match reduction {
        Reduction::Mean => 1.0 / input.len().max(1) as f64,
        Reduction::Sum => 1.0,
    };

    let mut value = 0.0_f64;
    let mut grad_input = Vec::with_capacity(input.len());
    let mut grad_target = Vec::with_capacity(input.len());
    for (a, b) in input.iter().zip(target.iter()) {
        let target_inv = rt_inverse(b);
        let delta = compose_rt_pair(a, &target_inv);
        let t = translation_of(&delta);
        let cos = 0.5 * (rotation_of(&delta).trace() - 1.0);
        let t_norm = t.norm();
        value += t_norm + (cos - 1.0).abs();

        // ‖t‖ = 0 takes the zero sub-gradient.
        let g_t = if t_norm > 0.0 {
            t / t_norm * scale
        } else {
            Vector3::zeros()
        };
        let g_r = Matrix3::identity() * (0.5 * sign(cos - 1.0) * scale);
        let grad_delta: Rt = rt_from_parts(&g_r, &g_t);

        let (g_a, g_inv) = compose_rt_pair_backward(a, &target_inv, &grad_delta);
        grad_input.push(g_a);
        grad_target.push(rt_inverse_backward(b, &g_inv));
    }
    Ok(LossOutput {
        value: value * scale,
        grad_input: TransformBatch::new(input.batch_size(), input.num_bodies(), grad_input)?,
        grad_target: TransformBatch::new(input.batch_size(), input.num_bodies(), grad_target)?,
    })
}

/// `exp(−‖x − y‖)` over the whole batch, in (0, 1]; zero target if absent.
///
/// [`Reduction::Mean`] divides by the element count. Without a target the
/// returned target gradient is zero.
pub fn dissimilarity_loss(
    input: &TransformBatch,
    target: Option<&TransformBatch>,
    reduction: Reduction,
) -> Se3Result<LossOutput<TransformBatch>> {
    let diff = match target {
        Some(target) => input.zip_map(target, "dissimilarity_loss", |a, b| a - b)?,
        None => input.clone(),
    };
    let norm = diff.iter().map(|d| d.norm_squared()).sum::<f64>().sqrt();
    let scale = match reduction {
        Reduction::Mean => 1.0 / (input.len() * 12).max(1) as f64,
        Reduction::Sum => 1.0,
    };
    let value = (-norm).exp() * scale;

    let factor = if norm > MIN_NORMALIZER {
        -value / norm
    } else {
        0.0
    };
    let grad_input = diff.map(|d| d * factor);
    let grad_target = match target {
        Some(_) => grad_input.map(|g| -g),
        None => grad_input.map(|_| Rt::zeros()),
    };
    Ok(LossOutput {
        value,
        grad_input,
        grad_target,
    })
}

/// Elementwise comparison of two pose batches; `elem` maps a difference to
/// its loss term and derivative.
fn elementwise_pose_loss(
    input: &TransformBatch,
    target: &TransformBatch,
    reduction: Reduction,
    op: &'static str,
    elem: impl Fn(f64) -> (f64, f64),
) -> Se3Result<LossOutput<TransformBatch>> {
    input.ensure_same_shape(target, op)?;
    let scale = match reduction {
        Reduction::Mean => 1.0 / (input.len() * 12).max(1) as f64,
        Reduction::Sum => 1.0,
    };

    let mut value = 0.0_f64;
    let grad_input = input.zip_map(target, op, |a, b| {
        (a - b).map(|d| {
            let (v, g) = elem(d);
            value += v;
            g * scale
        })
    })?;
    Ok(LossOutput {
        value: value * scale,
        grad_target: grad_input.map(|g| -g),
        grad_input,
    })
}

/// `0.5·Σ(x − y)²` over the entries of two pose batches.
///
/// [`Reduction::Mean`] divides by the number of matrix entries.
pub fn pose_mse_loss(
    input: &TransformBatch,
    target: &TransformBatch,
    reduction: Reduction,
) -> Se3Result<LossOutput<TransformBatch>> {
    elementwise_pose_loss(input, target, reduction, "pose_mse_loss", |d| {
        (0.5 * d * d, d)
    })
}

/// `Σ|x − y|` over the entries of two pose batches, averaged like
/// [`pose_mse_loss`].
pub fn pose_abs_loss(
    input: &TransformBatch,
    target: &TransformBatch,
    reduction: Reduction,
) -> Se3Result<LossOutput<TransformBatch>> {
    elementwise_pose_loss(input, target, reduction, "pose_abs_loss", |d| {
        (d.abs(), sign(d))
    })
}
