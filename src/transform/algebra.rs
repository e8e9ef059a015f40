//! Inverse and composition of rigid transforms, single and batched, with
//! closed-form gradients.
//!
//! # Inverse
//! [R | t]⁻¹ = [Rᵀ | −Rᵀ·t]
//!
//! ∂R = (∂Rₒ)ᵀ − t·(∂tₒ)ᵀ,   ∂t = −R·∂tₒ
//!
//! # Composition ("apply B first, then A")
//! A ∘ B = [Ra·Rb | Ra·tb + ta]
//!
//! ∂Ra = ∂R·Rbᵀ + ∂t·tbᵀ,  ∂ta = ∂t,  ∂Rb = Raᵀ·∂R,  ∂tb = Raᵀ·∂t
//!
//! Operand order is significant: `compose_rt_pair(delta, pose)` applies a
//! global-frame delta, `compose_rt_pair(pose, delta)` a body-frame one.

use crate::batch::{Rt, TransformBatch, rotation_of, rt_from_parts, translation_of};
use crate::error::{Se3Error, Se3Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

/// Direction in which a kinematic chain accumulates its links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CompositionOrder {
    /// `outₙ = outₙ₋₁ ∘ inₙ`
    #[default]
    LeftToRight,
    /// `outₙ = inₙ ∘ outₙ₋₁`
    RightToLeft,
}

impl CompositionOrder {
    pub fn from_right_to_left(right_to_left: bool) -> Self {
        if right_to_left {
            CompositionOrder::RightToLeft
        } else {
            CompositionOrder::LeftToRight
        }
    }
}

impl fmt::Display for CompositionOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositionOrder::LeftToRight => write!(f, "left_to_right"),
            CompositionOrder::RightToLeft => write!(f, "right_to_left"),
        }
    }
}

impl FromStr for CompositionOrder {
    type Err = Se3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "left_to_right" | "lefttoright" | "ltr" => Ok(CompositionOrder::LeftToRight),
            "right_to_left" | "righttoleft" | "rtl" => Ok(CompositionOrder::RightToLeft),
            _ => Err(Se3Error::unknown("composition order", s)),
        }
    }
}

pub fn rt_inverse(rt: &Rt) -> Rt {
    let r_t = rotation_of(rt).transpose();
    rt_from_parts(&r_t, &(-r_t * translation_of(rt)))
}

/// Gradient of [`rt_inverse`] with respect to its input.
pub fn rt_inverse_backward(rt: &Rt, grad_output: &Rt) -> Rt {
    let r = rotation_of(rt);
    let t = translation_of(rt);
    let g_r = rotation_of(grad_output);
    let g_t = translation_of(grad_output);
    rt_from_parts(&(g_r.transpose() - t * g_t.transpose()), &(-r * g_t))
}

pub fn compose_rt_pair(a: &Rt, b: &Rt) -> Rt {
    let r_a = rotation_of(a);
    rt_from_parts(
        &(r_a * rotation_of(b)),
        &(r_a * translation_of(b) + translation_of(a)),
    )
}

/// Gradients of [`compose_rt_pair`] with respect to `(a, b)`.
pub fn compose_rt_pair_backward(a: &Rt, b: &Rt, grad_output: &Rt) -> (Rt, Rt) {
    let r_a = rotation_of(a);
    let r_b = rotation_of(b);
    let t_b = translation_of(b);
    let g_r = rotation_of(grad_output);
    let g_t = translation_of(grad_output);

    let grad_a = rt_from_parts(&(g_r * r_b.transpose() + g_t * t_b.transpose()), &g_t);
    let grad_b = rt_from_parts(&(r_a.transpose() * g_r), &(r_a.transpose() * g_t));
    (grad_a, grad_b)
}

/// Inverse of every transform of a batch.
pub fn inverse_batch(transforms: &TransformBatch) -> TransformBatch {
    trace!("inverting {} transforms", transforms.len());
    transforms.map(rt_inverse)
}

pub fn inverse_batch_backward(
    transforms: &TransformBatch,
    grad_output: &TransformBatch,
) -> Se3Result<TransformBatch> {
    transforms.zip_map(grad_output, "rt_inverse_backward", rt_inverse_backward)
}

/// Element-wise `a ∘ b` over two equally shaped batches.
pub fn compose_pair_batch(a: &TransformBatch, b: &TransformBatch) -> Se3Result<TransformBatch> {
    a.zip_map(b, "compose_rt_pair", compose_rt_pair)
}

pub fn compose_pair_batch_backward(
    a: &TransformBatch,
    b: &TransformBatch,
    grad_output: &TransformBatch,
) -> Se3Result<(TransformBatch, TransformBatch)> {
    a.ensure_same_shape(b, "compose_rt_pair_backward")?;
    a.ensure_same_shape(grad_output, "compose_rt_pair_backward")?;

    let pairs: Vec<(Rt, Rt)> = a
        .iter()
        .zip(b.iter())
        .zip(grad_output.iter())
        .map(|((x, y), g)| compose_rt_pair_backward(x, y, g))
        .collect();
    let (grad_a, grad_b): (Vec<Rt>, Vec<Rt>) = pairs.into_iter().unzip();
    Ok((
        TransformBatch::new(a.batch_size(), a.num_bodies(), grad_a)?,
        TransformBatch::new(a.batch_size(), a.num_bodies(), grad_b)?,
    ))
}

/// Cumulative transforms along the body axis of each example.
///
/// `out₀ = in₀`; every later link is folded in according to `order`.
pub fn compose_chain(transforms: &TransformBatch, order: CompositionOrder) -> TransformBatch {
    let mut output = transforms.clone();
    for example in 0..output.batch_size() {
        let chain = output.example_mut(example);
        for n in 1..chain.len() {
            chain[n] = match order {
                CompositionOrder::LeftToRight => compose_rt_pair(&chain[n - 1], &chain[n]),
                CompositionOrder::RightToLeft => compose_rt_pair(&chain[n], &chain[n - 1]),
            };
        }
    }
    output
}

/// Gradient of [`compose_chain`] with respect to its input links.
///
/// `output` must be the forward result for `transforms`; links are walked in
/// reverse so each cumulative gradient is complete before it is split.
pub fn compose_chain_backward(
    transforms: &TransformBatch,
    output: &TransformBatch,
    grad_output: &TransformBatch,
    order: CompositionOrder,
) -> Se3Result<TransformBatch> {
    transforms.ensure_same_shape(output, "compose_chain_backward")?;
    transforms.ensure_same_shape(grad_output, "compose_chain_backward")?;

    let mut grad_input = TransformBatch::from_fn(
        transforms.batch_size(),
        transforms.num_bodies(),
        |_, _| Rt::zeros(),
    );
    for example in 0..transforms.batch_size() {
        let links = transforms.example(example);
        let cumulative = output.example(example);
        let mut grad_cumulative = grad_output.example(example).to_vec();
        let grad_links = grad_input.example_mut(example);

        for n in (1..links.len()).rev() {
            match order {
                CompositionOrder::LeftToRight => {
                    let (g_prev, g_link) =
                        compose_rt_pair_backward(&cumulative[n - 1], &links[n], &grad_cumulative[n]);
                    grad_links[n] = g_link;
                    grad_cumulative[n - 1] += g_prev;
                }
                CompositionOrder::RightToLeft => {
                    let (g_link, g_prev) =
                        compose_rt_pair_backward(&links[n], &cumulative[n - 1], &grad_cumulative[n]);
                    grad_links[n] = g_link;
                    grad_cumulative[n - 1] += g_prev;
                }
            }
        }
        if let Some(first) = grad_cumulative.first() {
            grad_links[0] = *first;
        }
    }
    Ok(grad_input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::axis_angle::rotation_and_translation_map;
    use crate::rotation::DEFAULT_SMALL_ANGLE_THRESHOLD;
    use crate::test_utils::{FD_TOLERANCE, assert_slices_close, dot, numeric_gradient, random_weights};
    use nalgebra::Vector3;

    const TOLERANCE: f64 = 1e-12;

    fn rigid(omega: [f64; 3], t: [f64; 3]) -> Rt {
        let (r, _) =
            rotation_and_translation_map(&Vector3::from(omega), DEFAULT_SMALL_ANGLE_THRESHOLD);
        rt_from_parts(&r, &Vector3::from(t))
    }

    fn random_rt(seed: u64) -> Rt {
        let w = random_weights(6, seed);
        rigid([w[0], w[1], w[2]], [w[3], w[4], w[5]])
    }

    fn chain_batch(order_seed: u64) -> TransformBatch {
        TransformBatch::from_fn(2, 3, |b, k| random_rt(order_seed + (b * 3 + k) as u64))
    }

    #[test]
    fn test_inverse_twice_is_identity_map() {
        let t = random_rt(1);
        assert!((rt_inverse(&rt_inverse(&t)) - t).norm() < TOLERANCE);
    }

    #[test]
    fn test_compose_with_inverse_is_identity() {
        let t = random_rt(2);
        let composed = compose_rt_pair(&t, &rt_inverse(&t));
        assert!((composed - Rt::identity()).norm() < 1e-10);
        let composed = compose_rt_pair(&rt_inverse(&t), &t);
        assert!((composed - Rt::identity()).norm() < 1e-10);
    }

    #[test]
    fn test_compose_is_associative() {
        let (a, b, c) = (random_rt(3), random_rt(4), random_rt(5));
        let left = compose_rt_pair(&compose_rt_pair(&a, &b), &c);
        let right = compose_rt_pair(&a, &compose_rt_pair(&b, &c));
        assert!((left - right).norm() < 1e-10);
    }

    #[test]
    fn test_compose_order_global_vs_local() {
        // 90° about z and a unit translation along x
        let rotation = rigid([0.0, 0.0, std::f64::consts::FRAC_PI_2], [0.0, 0.0, 0.0]);
        let shift = rigid([0.0, 0.0, 0.0], [1.0, 0.0, 0.0]);

        // Shift expressed in the rotated frame: moves along +y
        let local = compose_rt_pair(&rotation, &shift);
        assert!((translation_of(&local) - Vector3::new(0.0, 1.0, 0.0)).norm() < TOLERANCE);

        // Shift applied after rotating: stays along +x
        let global = compose_rt_pair(&shift, &rotation);
        assert!((translation_of(&global) - Vector3::new(1.0, 0.0, 0.0)).norm() < TOLERANCE);
    }

    #[test]
    fn test_compose_pair_batch_shape_mismatch() {
        let a = TransformBatch::identity(2, 3);
        let b = TransformBatch::identity(2, 4);
        assert!(matches!(
            compose_pair_batch(&a, &b),
            Err(Se3Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_chain_left_to_right() {
        let input = chain_batch(10);
        let output = compose_chain(&input, CompositionOrder::LeftToRight);
        for b in 0..2 {
            let expected_1 = compose_rt_pair(input.get(b, 0), input.get(b, 1));
            let expected_2 = compose_rt_pair(&expected_1, input.get(b, 2));
            assert_eq!(output.get(b, 0), input.get(b, 0));
            assert!((output.get(b, 1) - expected_1).norm() < TOLERANCE);
            assert!((output.get(b, 2) - expected_2).norm() < TOLERANCE);
        }
    }

    #[test]
    fn test_chain_right_to_left() {
        let input = chain_batch(20);
        let output = compose_chain(&input, CompositionOrder::RightToLeft);
        let expected_1 = compose_rt_pair(input.get(0, 1), input.get(0, 0));
        let expected_2 = compose_rt_pair(input.get(0, 2), &expected_1);
        assert!((output.get(0, 2) - expected_2).norm() < TOLERANCE);
    }

    #[test]
    fn test_composition_order_parsing() {
        assert_eq!(
            "right_to_left".parse::<CompositionOrder>().unwrap(),
            CompositionOrder::RightToLeft
        );
        assert_eq!(
            CompositionOrder::from_right_to_left(false),
            CompositionOrder::LeftToRight
        );
        assert!("sideways".parse::<CompositionOrder>().is_err());
    }

    #[test]
    fn test_inverse_backward_matches_finite_differences() {
        let t = random_rt(30);
        let w = Rt::from_column_slice(&random_weights(12, 31));
        let numeric = numeric_gradient(
            |x| w.dot(&rt_inverse(&Rt::from_column_slice(x))),
            t.as_slice(),
        );
        let analytic = rt_inverse_backward(&t, &w);
        assert_slices_close(analytic.as_slice(), &numeric, FD_TOLERANCE, "inverse");
    }

    #[test]
    fn test_compose_backward_matches_finite_differences() {
        // Affine blocks exercise the formulas without orthonormality.
        let a = Rt::from_column_slice(&random_weights(12, 40));
        let b = Rt::from_column_slice(&random_weights(12, 41));
        let w = Rt::from_column_slice(&random_weights(12, 42));
        let (grad_a, grad_b) = compose_rt_pair_backward(&a, &b, &w);

        let numeric_a = numeric_gradient(
            |x| w.dot(&compose_rt_pair(&Rt::from_column_slice(x), &b)),
            a.as_slice(),
        );
        let numeric_b = numeric_gradient(
            |x| w.dot(&compose_rt_pair(&a, &Rt::from_column_slice(x))),
            b.as_slice(),
        );
        assert_slices_close(grad_a.as_slice(), &numeric_a, FD_TOLERANCE, "compose lhs");
        assert_slices_close(grad_b.as_slice(), &numeric_b, FD_TOLERANCE, "compose rhs");
    }

    #[test]
    fn test_chain_backward_matches_finite_differences() {
        for order in [CompositionOrder::LeftToRight, CompositionOrder::RightToLeft] {
            let input = chain_batch(50);
            let weights = random_weights(input.len() * 12, 51);
            let flat: Vec<f64> = input.iter().flat_map(|m| m.as_slice().to_vec()).collect();

            let objective = |x: &[f64]| {
                let links: Vec<Rt> = x.chunks(12).map(Rt::from_column_slice).collect();
                let batch = TransformBatch::new(2, 3, links).unwrap();
                let out = compose_chain(&batch, order);
                let out_flat: Vec<f64> = out.iter().flat_map(|m| m.as_slice().to_vec()).collect();
                dot(&weights, &out_flat)
            };
            let numeric = numeric_gradient(objective, &flat);

            let output = compose_chain(&input, order);
            let grad_output = TransformBatch::new(
                2,
                3,
                weights.chunks(12).map(Rt::from_column_slice).collect(),
            )
            .unwrap();
            let analytic = compose_chain_backward(&input, &output, &grad_output, order).unwrap();
            let analytic_flat: Vec<f64> =
                analytic.iter().flat_map(|m| m.as_slice().to_vec()).collect();
            assert_slices_close(&analytic_flat, &numeric, FD_TOLERANCE, &order.to_string());
        }
    }

    #[test]
    fn test_single_body_chain_passes_gradient_through() {
        let input = TransformBatch::identity(1, 1);
        let output = compose_chain(&input, CompositionOrder::LeftToRight);
        let grad = TransformBatch::from_fn(1, 1, |_, _| Rt::from_element(0.5));
        let back = compose_chain_backward(&input, &output, &grad, CompositionOrder::LeftToRight).unwrap();
        assert_eq!(back, grad);
    }
}
