//! Applying a predicted delta transform to the current pose.
//!
//! A global-frame delta is applied on the left (`next = delta ∘ pose`); a
//! body-frame delta on the right (`next = pose ∘ delta`). In both cases the
//! delta is also reported in the global frame, which for the local case is
//! `next ∘ pose⁻¹ = pose·delta·pose⁻¹`.

use crate::batch::TransformBatch;
use crate::error::{Se3Error, Se3Result};
use crate::transform::algebra::{
    compose_pair_batch, compose_pair_batch_backward, inverse_batch, inverse_batch_backward,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Frame in which a predicted delta is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeltaFrame {
    #[default]
    Global,
    Local,
}

impl fmt::Display for DeltaFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeltaFrame::Global => write!(f, "global"),
            DeltaFrame::Local => write!(f, "local"),
        }
    }
}

impl FromStr for DeltaFrame {
    type Err = Se3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "global" => Ok(DeltaFrame::Global),
            "local" => Ok(DeltaFrame::Local),
            _ => Err(Se3Error::unknown("delta frame", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutput {
    pub next_pose: TransformBatch,
    /// The applied delta expressed in the global frame.
    pub delta_global: TransformBatch,
}

pub fn apply_delta(
    pose: &TransformBatch,
    delta: &TransformBatch,
    frame: DeltaFrame,
) -> Se3Result<TransitionOutput> {
    match frame {
        DeltaFrame::Global => Ok(TransitionOutput {
            next_pose: compose_pair_batch(delta, pose)?,
            delta_global: delta.clone(),
        }),
        DeltaFrame::Local => {
            let next_pose = compose_pair_batch(pose, delta)?;
            let delta_global = compose_pair_batch(&next_pose, &inverse_batch(pose))?;
            Ok(TransitionOutput {
                next_pose,
                delta_global,
            })
        }
    }
}

/// Gradients of [`apply_delta`] with respect to `(pose, delta)`.
///
/// `grad_delta_global` may be omitted when only the next pose feeds a loss.
pub fn apply_delta_backward(
    pose: &TransformBatch,
    delta: &TransformBatch,
    frame: DeltaFrame,
    grad_next_pose: &TransformBatch,
    grad_delta_global: Option<&TransformBatch>,
) -> Se3Result<(TransformBatch, TransformBatch)> {
    pose.ensure_same_shape(delta, "apply_delta_backward")?;
    if let Some(g) = grad_delta_global {
        pose.ensure_same_shape(g, "apply_delta_backward")?;
    }

    match frame {
        DeltaFrame::Global => {
            let (mut grad_delta, grad_pose) =
                compose_pair_batch_backward(delta, pose, grad_next_pose)?;
            if let Some(g) = grad_delta_global {
                for (acc, extra) in grad_delta.items_mut().iter_mut().zip(g.iter()) {
                    *acc += extra;
                }
            }
            Ok((grad_pose, grad_delta))
        }
        DeltaFrame::Local => {
            let mut grad_next = grad_next_pose.clone();
            let mut grad_pose_via_inverse = None;
            if let Some(g) = grad_delta_global {
                let next_pose = compose_pair_batch(pose, delta)?;
                let pose_inv = inverse_batch(pose);
                let (g_next, g_inv) = compose_pair_batch_backward(&next_pose, &pose_inv, g)?;
                for (acc, extra) in grad_next.items_mut().iter_mut().zip(g_next.iter()) {
                    *acc += extra;
                }
                grad_pose_via_inverse = Some(inverse_batch_backward(pose, &g_inv)?);
            }

            let (mut grad_pose, grad_delta) = compose_pair_batch_backward(pose, delta, &grad_next)?;
            if let Some(extra) = grad_pose_via_inverse {
                for (acc, e) in grad_pose.items_mut().iter_mut().zip(extra.iter()) {
                    *acc += e;
                }
            }
            Ok((grad_pose, grad_delta))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Rt, rt_from_parts};
    use crate::test_utils::{FD_TOLERANCE, assert_slices_close, dot, numeric_gradient, random_weights};
    use nalgebra::{Rotation3, Vector3};

    const TOLERANCE: f64 = 1e-10;

    fn random_batch(seed: u64) -> TransformBatch {
        TransformBatch::from_fn(1, 2, |_, k| {
            let w = random_weights(6, seed + k as u64);
            rt_from_parts(
                Rotation3::from_scaled_axis(Vector3::new(w[0], w[1], w[2])).matrix(),
                &Vector3::new(w[3], w[4], w[5]),
            )
        })
    }

    fn flatten(batch: &TransformBatch) -> Vec<f64> {
        batch.iter().flat_map(|m| m.as_slice().to_vec()).collect()
    }

    fn unflatten(values: &[f64]) -> TransformBatch {
        TransformBatch::new(1, 2, values.chunks(12).map(Rt::from_column_slice).collect()).unwrap()
    }

    #[test]
    fn test_local_delta_global_form() {
        let pose = random_batch(1);
        let delta = random_batch(5);
        let out = apply_delta(&pose, &delta, DeltaFrame::Local).unwrap();
        // delta_global ∘ pose must reproduce next_pose
        let replay = compose_pair_batch(&out.delta_global, &pose).unwrap();
        for (a, b) in replay.iter().zip(out.next_pose.iter()) {
            assert!((a - b).norm() < TOLERANCE);
        }
    }

    #[test]
    fn test_global_delta_is_left_multiplied() {
        let pose = random_batch(2);
        let delta = random_batch(6);
        let out = apply_delta(&pose, &delta, DeltaFrame::Global).unwrap();
        assert_eq!(out.next_pose, compose_pair_batch(&delta, &pose).unwrap());
        assert_eq!(out.delta_global, delta);
    }

    #[test]
    fn test_delta_frame_parsing() {
        assert_eq!("LOCAL".parse::<DeltaFrame>().unwrap(), DeltaFrame::Local);
        assert!("body".parse::<DeltaFrame>().is_err());
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        for frame in [DeltaFrame::Global, DeltaFrame::Local] {
            let pose = random_batch(10);
            let delta = random_batch(20);
            let w_next = random_weights(24, 30);
            let w_global = random_weights(24, 31);

            let objective = |p: &[f64], d: &[f64]| {
                let out = apply_delta(&unflatten(p), &unflatten(d), frame).unwrap();
                dot(&w_next, &flatten(&out.next_pose)) + dot(&w_global, &flatten(&out.delta_global))
            };
            let flat_pose = flatten(&pose);
            let flat_delta = flatten(&delta);
            let numeric_pose = numeric_gradient(|x| objective(x, &flat_delta), &flat_pose);
            let numeric_delta = numeric_gradient(|x| objective(&flat_pose, x), &flat_delta);

            let (grad_pose, grad_delta) = apply_delta_backward(
                &pose,
                &delta,
                frame,
                &unflatten(&w_next),
                Some(&unflatten(&w_global)),
            )
            .unwrap();
            let label = frame.to_string();
            assert_slices_close(&flatten(&grad_pose), &numeric_pose, FD_TOLERANCE, &label);
            assert_slices_close(&flatten(&grad_delta), &numeric_delta, FD_TOLERANCE, &label);
        }
    }
}
