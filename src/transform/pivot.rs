//! Rotation about a pivot point.
//!
//! A transform-with-pivot `[R | t | p]` rotates about `p` instead of the
//! origin, i.e. `x ↦ R·(x − p) + p + t`. Collapsing folds the pivot into the
//! translation: `[R | t + p − R·p]`.

use crate::batch::{
    PivotBatch, PivotTransformBatch, Rt, RtPivot, TransformBatch, rotation_of, translation_of,
};
use crate::error::Se3Result;
use nalgebra::{Matrix3, Vector3};

fn split(rt_pivot: &RtPivot) -> (Matrix3<f64>, Vector3<f64>, Vector3<f64>) {
    (
        rt_pivot.fixed_view::<3, 3>(0, 0).into_owned(),
        rt_pivot.column(3).into_owned(),
        rt_pivot.column(4).into_owned(),
    )
}

/// Assemble `[R | t | p]` from a rigid transform and a pivot.
pub fn with_pivot(rt: &Rt, pivot: &Vector3<f64>) -> RtPivot {
    let mut out = RtPivot::zeros();
    out.fixed_view_mut::<3, 4>(0, 0).copy_from(rt);
    out.set_column(4, pivot);
    out
}

pub fn collapse_rt_pivot(rt_pivot: &RtPivot) -> Rt {
    let (r, t, p) = split(rt_pivot);
    let mut out = rt_pivot.fixed_view::<3, 4>(0, 0).into_owned();
    out.set_column(3, &(t + p - r * p));
    out
}

/// Gradient of [`collapse_rt_pivot`]:
/// `∂R = ∂Rₒ − ∂tₒ·pᵀ`, `∂t = ∂tₒ`, `∂p = ∂tₒ − Rᵀ·∂tₒ`.
pub fn collapse_rt_pivot_backward(rt_pivot: &RtPivot, grad_output: &Rt) -> RtPivot {
    let (r, _, p) = split(rt_pivot);
    let g_r = rotation_of(grad_output);
    let g_t = translation_of(grad_output);

    let mut grad = RtPivot::zeros();
    grad.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(g_r - g_t * p.transpose()));
    grad.set_column(3, &g_t);
    grad.set_column(4, &(g_t - r.transpose() * g_t));
    grad
}

pub fn collapse_rt_pivots(transforms: &PivotTransformBatch) -> TransformBatch {
    transforms.map(collapse_rt_pivot)
}

pub fn collapse_rt_pivots_backward(
    transforms: &PivotTransformBatch,
    grad_output: &TransformBatch,
) -> Se3Result<PivotTransformBatch> {
    transforms.zip_map(grad_output, "collapse_rt_pivots_backward", collapse_rt_pivot_backward)
}

/// Attach externally computed pivots to rigid transforms.
pub fn attach_pivots(
    transforms: &TransformBatch,
    pivots: &PivotBatch,
) -> Se3Result<PivotTransformBatch> {
    transforms.zip_map(pivots, "attach_pivots", with_pivot)
}

/// Split a `[R | t | p]` gradient back onto the transform and the pivot.
pub fn attach_pivots_backward(grad_output: &PivotTransformBatch) -> (TransformBatch, PivotBatch) {
    (
        grad_output.map(|g| g.fixed_view::<3, 4>(0, 0).into_owned()),
        grad_output.map(|g| g.column(4).into_owned()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::rt_from_parts;
    use crate::test_utils::{FD_TOLERANCE, assert_slices_close, numeric_gradient, random_weights};
    use nalgebra::Rotation3;

    const TOLERANCE: f64 = 1e-12;

    fn sample() -> RtPivot {
        let r = Rotation3::from_scaled_axis(Vector3::new(0.3, -0.5, 0.8));
        let rt = rt_from_parts(r.matrix(), &Vector3::new(0.1, 0.2, -0.4));
        with_pivot(&rt, &Vector3::new(1.5, -0.7, 2.0))
    }

    #[test]
    fn test_collapse_zero_pivot_is_noop() {
        let rt = rt_from_parts(
            Rotation3::from_scaled_axis(Vector3::new(0.1, 0.2, 0.3)).matrix(),
            &Vector3::new(1.0, 2.0, 3.0),
        );
        let collapsed = collapse_rt_pivot(&with_pivot(&rt, &Vector3::zeros()));
        assert!((collapsed - rt).norm() < TOLERANCE);
    }

    #[test]
    fn test_collapse_fixes_pivot_point() {
        // Pure rotation about p leaves p in place.
        let mut rt_pivot = sample();
        rt_pivot.set_column(3, &Vector3::zeros());
        let collapsed = collapse_rt_pivot(&rt_pivot);
        let p = rt_pivot.column(4).into_owned();
        let moved = rotation_of(&collapsed) * p + translation_of(&collapsed);
        assert!((moved - p).norm() < 1e-10);
    }

    #[test]
    fn test_collapse_backward_matches_finite_differences() {
        let input = sample();
        let w = Rt::from_column_slice(&random_weights(12, 7));
        let numeric = numeric_gradient(
            |x| w.dot(&collapse_rt_pivot(&RtPivot::from_column_slice(x))),
            input.as_slice(),
        );
        let analytic = collapse_rt_pivot_backward(&input, &w);
        assert_slices_close(analytic.as_slice(), &numeric, FD_TOLERANCE, "collapse");
    }

    #[test]
    fn test_attach_pivots_shape_check() {
        let transforms = TransformBatch::identity(2, 2);
        let pivots = PivotBatch::from_fn(2, 3, |_, _| Vector3::zeros());
        assert!(attach_pivots(&transforms, &pivots).is_err());
    }

    #[test]
    fn test_attach_pivots_backward_splits_columns() {
        let grad = PivotTransformBatch::from_fn(1, 1, |_, _| sample());
        let (g_rt, g_p) = attach_pivots_backward(&grad);
        assert_eq!(g_p.get(0, 0), &Vector3::new(1.5, -0.7, 2.0));
        assert_eq!(g_rt.get(0, 0).column(3), sample().column(3));
    }
}
