//! Degenerate inputs that must stay finite
//!
//! Zero angles, zero points, empty masks, identical loss operands and
//! motionless examples are all handled by branches and clamps; none of them
//! may produce NaN or infinity in values or gradients.

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]

use nalgebra::{DVector, Matrix3, Vector3};
use se3_layers::batch::{PivotBatch, rt_from_parts};
use se3_layers::loss::{
    MotionNormalization, Reduction, bi_mse_loss, dissimilarity_loss, motion_normalized_loss_3d,
    normal_loss, pose_consistency_loss,
};
use se3_layers::mask::{MaskDecoder, MaskMode, TrainingClock};
use se3_layers::points::{
    BlendMode, PivotSource, compute_pivots, compute_pivots_backward, ntfm3d, ntfm3d_backward,
};
use se3_layers::rotation::RodriguesCoefficients;
use se3_layers::transform::{Se3ToRt, attach_pivots, collapse_rt_pivots};
use se3_layers::{
    Mask, ParamBatch, PixelMap, PointCloud, RotationConverter, RotationKind, TransformBatch,
};

use pipeline_test_utils::*;

#[test]
fn test_zero_angle_coefficients() {
    let coefficients = RodriguesCoefficients::new(0.0, 1e-12);
    assert_eq!(coefficients.a, 1.0);
    assert_eq!(coefficients.b, 0.5);
    assert_eq!(coefficients.c, 1.0 / 6.0);
    assert!(coefficients.da.is_finite() && coefficients.db.is_finite() && coefficients.dc.is_finite());
}

#[test]
fn test_zero_axis_angle_forward_and_backward() {
    let converter = RotationConverter::new(RotationKind::AxisAngle);
    let map = converter.convert(&[0.0, 0.0, 0.0]).unwrap();
    assert_eq!(map.rotation, Matrix3::identity());
    assert_eq!(map.translation_map, Some(Matrix3::identity()));

    let grad = converter
        .backward(&[0.0, 0.0, 0.0], &Matrix3::from_element(1.0), Some(&Matrix3::from_element(1.0)))
        .unwrap();
    assert!(all_finite(grad.as_slice()));

    // Just above and below the small-angle threshold.
    for scale in [1e-7, 1e-6, 1e-3] {
        let params = [scale, -scale, 0.5 * scale];
        let map = converter.convert(&params).unwrap();
        assert!(all_finite(map.rotation.as_slice()));
        let grad = converter
            .backward(&params, &Matrix3::from_element(1.0), None)
            .unwrap();
        assert!(all_finite(grad.as_slice()));
    }
}

#[test]
fn test_degenerate_quaternion_is_finite() {
    let converter = RotationConverter::new(RotationKind::Quaternion);
    let map = converter.convert(&[0.0, 0.0, 0.0, 0.0]).unwrap();
    assert!(all_finite(map.rotation.as_slice()));
    let grad = converter
        .backward(&[0.0, 0.0, 0.0, 0.0], &Matrix3::from_element(1.0), None)
        .unwrap();
    assert!(all_finite(grad.as_slice()));
}

#[test]
fn test_wrong_parameter_width_is_rejected() {
    let assembler = Se3ToRt::new(RotationKind::Quaternion, false);
    let params = ParamBatch::from_fn(1, 2, |_, _| DVector::zeros(6));
    assert!(matches!(
        assembler.forward(&params),
        Err(se3_layers::Se3Error::InvalidParameterWidth { expected: 7, actual: 6, .. })
    ));
}

#[test]
fn test_zero_pivot_collapse_is_identity() {
    let transforms = random_transforms(1, 2, 3);
    let pivots = PivotBatch::from_fn(2, 3, |_, _| Vector3::zeros());
    let collapsed = collapse_rt_pivots(&attach_pivots(&transforms, &pivots).unwrap());
    assert_eq!(collapsed, transforms);
}

#[test]
fn test_zero_points_transform_to_zero() {
    let points = PointCloud::zeros(2, 3, 3, 4);
    let masks = Mask::from_fn(2, 3, 3, 4, |_, _, _| 0.7);
    let transforms = random_transforms(2, 2, 3);
    for mode in [BlendMode::Position, BlendMode::Delta] {
        let output = ntfm3d(&points, &masks, &transforms, mode).unwrap();
        assert!(output.data().iter().all(|v| *v == 0.0));

        let upstream = PointCloud::from_fn(2, 3, 3, 4, |_, _, _| 1.0);
        let grads = ntfm3d_backward(&points, &masks, &transforms, mode, &upstream).unwrap();
        assert!(grads.points.data().iter().all(|v| *v == 0.0));
        assert!(all_finite(grads.masks.data()));
        assert!(all_finite(&flatten(&grads.transforms)));
    }
}

#[test]
fn test_empty_mask_pivots_are_finite() {
    let points = plane_points(1, 3, 3);
    let masks = Mask::zeros(1, 2, 3, 3);
    let pivots = compute_pivots(PivotSource::MaskMean, &points, Some(&masks), None, 2).unwrap();
    assert!(pivots.iter().all(|p| all_finite(p.as_slice())));

    let grad = PivotBatch::from_fn(1, 2, |_, _| Vector3::new(1.0, 1.0, 1.0));
    let grads =
        compute_pivots_backward(PivotSource::MaskMean, &points, Some(&masks), None, &grad).unwrap();
    assert!(all_finite(grads.masks.expect("mask gradient").data()));
}

#[test]
fn test_missing_depth_point_mean_is_finite() {
    let points = PointCloud::zeros(1, 3, 2, 2);
    let pivots = compute_pivots(PivotSource::PointMean, &points, None, None, 3).unwrap();
    assert!(pivots.iter().all(|p| *p == Vector3::zeros()));
}

#[test]
fn test_identical_mse_operands() {
    let x = plane_points(2, 3, 4);
    let weights = PixelMap::from_fn(2, 1, 3, 4, |_, _, pix| (pix % 2) as f64);
    for w in [None, Some(&weights)] {
        let out = bi_mse_loss(&x, &x, w, Reduction::Mean).unwrap();
        assert_eq!(out.value, 0.0);
        assert!(out.grad_input.data().iter().all(|g| *g == 0.0));
        assert!(out.grad_target.data().iter().all(|g| *g == 0.0));
    }
}

#[test]
fn test_motionless_example_uses_min_points() {
    let (h, w) = (4, 4);
    let input = plane_points(1, h, w);
    let target = PointCloud::zeros(1, 3, h, w);
    let motion = PointCloud::zeros(1, 3, h, w);
    let normalization = MotionNormalization::default();
    let out = motion_normalized_loss_3d(
        &input,
        &target,
        &motion,
        None,
        se3_layers::loss::LossType::Mse,
        &normalization,
    )
    .unwrap();
    let squared: f64 = input.data().iter().map(|v| v * v).sum();
    assert!((out.value - 0.5 * squared / normalization.min_points).abs() < 1e-12);
    assert!(all_finite(out.grad_input.data()));

    let normals = normal_loss(&input, &target, None, Some(&motion), &normalization).unwrap();
    assert!(normals.value.is_finite());
    assert!(all_finite(normals.grad_target.data()));
}

#[test]
fn test_identical_poses_have_finite_consistency_gradient() {
    let poses = TransformBatch::identity(2, 2);
    let out = pose_consistency_loss(&poses, &poses, Reduction::Mean).unwrap();
    assert_eq!(out.value, 0.0);
    assert!(all_finite(&flatten(&out.grad_input)));
    assert!(all_finite(&flatten(&out.grad_target)));

    let same = dissimilarity_loss(&poses, Some(&poses), Reduction::Sum).unwrap();
    assert_eq!(same.value, 1.0);
    assert!(flatten(&same.grad_input).iter().all(|g| *g == 0.0));
}

#[test]
fn test_extreme_logits_sharpen_finitely() {
    let logits = Mask::from_fn(1, 3, 2, 2, |_, k, pix| {
        if k == pix % 3 { 500.0 } else { -500.0 }
    });
    let grad = Mask::from_fn(1, 3, 2, 2, |_, _, _| 1.0);
    for mode in [MaskMode::Softmax, MaskMode::Sigmoid, MaskMode::Sharpened] {
        let decoder = MaskDecoder::new(mode);
        let decoded = decoder
            .decode(&logits, &TrainingClock::resume(1_000_000), true, &mut rng(3))
            .unwrap();
        assert!(all_finite(decoded.masks.data()), "{mode}");
        let back = decoder.backward(&logits, &decoded, &grad).unwrap();
        assert!(all_finite(back.data()), "{mode}");
    }
}

#[test]
fn test_translation_only_transforms() {
    let t = rt_from_parts(&Matrix3::identity(), &Vector3::new(0.1, 0.0, -0.2));
    let transforms = TransformBatch::from_fn(1, 2, |_, _| t);
    let points = plane_points(1, 2, 2);
    let masks = Mask::from_fn(1, 2, 2, 2, |_, _, _| 0.5);
    let output = ntfm3d(&points, &masks, &transforms, BlendMode::Delta).unwrap();
    for pix in 0..4 {
        let expected = points.point(0, pix) + Vector3::new(0.1, 0.0, -0.2);
        assert!((output.point(0, pix) - expected).norm() < TOLERANCE);
    }
}
