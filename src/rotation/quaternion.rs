//! Quaternion and stereographic (scaled) quaternion rotations.
//!
//! Quaternions are stored as `[x, y, z, w]` and normalized before use, so any
//! non-zero 4-vector is accepted. The scaled quaternion is the stereographic
//! projection v ↦ q = [2v, 1 − ‖v‖²] / (1 + ‖v‖²), which is a unit quaternion
//! for every v ∈ R³.

use nalgebra::{Matrix3, Vector3};

/// Smallest norm used when normalizing a quaternion.
const MIN_QUATERNION_NORM: f64 = 1e-12;

/// Rotation matrix of a unit quaternion `[x, y, z, w]`.
fn unit_quaternion_matrix(q: &[f64; 4]) -> Matrix3<f64> {
    let [x, y, z, w] = *q;
    Matrix3::new(
        1.0 - 2.0 * (y * y + z * z),
        2.0 * (x * y - z * w),
        2.0 * (x * z + y * w),
        2.0 * (x * y + z * w),
        1.0 - 2.0 * (x * x + z * z),
        2.0 * (y * z - x * w),
        2.0 * (x * z - y * w),
        2.0 * (y * z + x * w),
        1.0 - 2.0 * (x * x + y * y),
    )
}

/// `∂L/∂q` of [`unit_quaternion_matrix`] for upstream `∂L/∂R`.
fn unit_quaternion_matrix_backward(q: &[f64; 4], g: &Matrix3<f64>) -> [f64; 4] {
    let [x, y, z, w] = *q;
    let s01 = g[(0, 1)] + g[(1, 0)];
    let s02 = g[(0, 2)] + g[(2, 0)];
    let s12 = g[(1, 2)] + g[(2, 1)];
    let d21 = g[(2, 1)] - g[(1, 2)];
    let d02 = g[(0, 2)] - g[(2, 0)];
    let d10 = g[(1, 0)] - g[(0, 1)];
    [
        2.0 * (y * s01 + z * s02 + w * d21) - 4.0 * x * (g[(1, 1)] + g[(2, 2)]),
        2.0 * (x * s01 + z * s12 + w * d02) - 4.0 * y * (g[(0, 0)] + g[(2, 2)]),
        2.0 * (x * s02 + y * s12 + w * d10) - 4.0 * z * (g[(0, 0)] + g[(1, 1)]),
        2.0 * (x * d21 + y * d02 + z * d10),
    ]
}

fn normalize(q: &[f64; 4]) -> ([f64; 4], f64) {
    let norm = q.iter().map(|v| v * v).sum::<f64>().sqrt().max(MIN_QUATERNION_NORM);
    (q.map(|v| v / norm), norm)
}

/// Rotation matrix of quaternion `[x, y, z, w]` after normalization.
pub fn quaternion_to_rotation(q: &[f64; 4]) -> Matrix3<f64> {
    let (unit, _) = normalize(q);
    unit_quaternion_matrix(&unit)
}

/// Gradient with respect to the unnormalized quaternion.
///
/// With q̂ = q/‖q‖: `∂L/∂q = (g − q̂·(q̂·g)) / ‖q‖`.
pub fn quaternion_backward(q: &[f64; 4], grad_rotation: &Matrix3<f64>) -> [f64; 4] {
    let (unit, norm) = normalize(q);
    let g = unit_quaternion_matrix_backward(&unit, grad_rotation);
    let radial: f64 = unit.iter().zip(&g).map(|(a, b)| a * b).sum();
    std::array::from_fn(|i| (g[i] - unit[i] * radial) / norm)
}

/// Unit quaternion `[x, y, z, w]` from its stereographic coordinates.
pub fn scaled_quaternion(v: &Vector3<f64>) -> [f64; 4] {
    let n2 = v.norm_squared();
    let denom = 1.0 + n2;
    [
        2.0 * v.x / denom,
        2.0 * v.y / denom,
        2.0 * v.z / denom,
        (1.0 - n2) / denom,
    ]
}

pub fn scaled_quaternion_to_rotation(v: &Vector3<f64>) -> Matrix3<f64> {
    unit_quaternion_matrix(&scaled_quaternion(v))
}

/// Gradient with respect to the stereographic coordinates.
///
/// ∂qᵢ/∂vⱼ = 2δᵢⱼ/(1 + ‖v‖²) − 4vᵢvⱼ/(1 + ‖v‖²)²,  ∂q_w/∂vⱼ = −4vⱼ/(1 + ‖v‖²)²
pub fn scaled_quaternion_backward(v: &Vector3<f64>, grad_rotation: &Matrix3<f64>) -> Vector3<f64> {
    let q = scaled_quaternion(v);
    let g = unit_quaternion_matrix_backward(&q, grad_rotation);
    let denom = 1.0 + v.norm_squared();
    let g_vec = Vector3::new(g[0], g[1], g[2]);
    g_vec * (2.0 / denom) - v * (4.0 * (v.dot(&g_vec) + g[3]) / (denom * denom))
}
