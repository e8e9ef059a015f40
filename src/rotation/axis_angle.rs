//! Axis-angle (Rodrigues) rotation and its translation map.
//!
//! With s = θ² = ‖ω‖² and K = [ω]ₓ:
//!
//! R = I + A·K + B·K²,   V = I + B·K + C·K²
//!
//! A = sin θ / θ,   B = (1 − cos θ)/θ²,   C = (1 − A)/θ²
//!
//! For s below the small-angle threshold the coefficients take their limits
//! A = 1, B = 1/2, C = 1/6, and their derivatives with respect to s take the
//! limits −1/6, −1/24, −1/120. The branch itself is not differentiated.

use super::{skew_adjoint, skew_symmetric};
use nalgebra::{Matrix3, Vector3};

/// Below this s the cancellation in C and in the coefficient derivatives
/// dominates, so truncated series are used instead of the closed forms.
const SERIES_CUTOFF: f64 = 1e-4;

/// Rodrigues coefficients and their derivatives with respect to s = θ².
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RodriguesCoefficients {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub da: f64,
    pub db: f64,
    pub dc: f64,
}

impl RodriguesCoefficients {
    /// Coefficients for squared angle `theta_squared`.
    pub fn new(theta_squared: f64, small_angle_threshold: f64) -> Self {
        let s = theta_squared;
        if s < small_angle_threshold {
            return Self {
                a: 1.0,
                b: 0.5,
                c: 1.0 / 6.0,
                da: -1.0 / 6.0,
                db: -1.0 / 24.0,
                dc: -1.0 / 120.0,
            };
        }

        let theta = s.sqrt();
        let (sin_theta, cos_theta) = theta.sin_cos();
        let half_sin = (0.5 * theta).sin();

        let a = sin_theta / theta;
        let b = 2.0 * half_sin * half_sin / s;

        if s < SERIES_CUTOFF {
            return Self {
                a,
                b,
                c: 1.0 / 6.0 - s / 120.0 + s * s / 5040.0,
                da: -1.0 / 6.0 + s / 60.0 - s * s / 1680.0,
                db: -1.0 / 24.0 + s / 360.0 - s * s / 13440.0,
                dc: -1.0 / 120.0 + s / 2520.0 - s * s / 120960.0,
            };
        }

        let c = (1.0 - a) / s;
        let da = (theta * cos_theta - sin_theta) / (2.0 * theta * s);
        let db = (theta * sin_theta - 2.0 * (1.0 - cos_theta)) / (2.0 * s * s);
        let dc = (-da - c) / s;
        Self { a, b, c, da, db, dc }
    }
}

/// Rotation matrix R and translation map V for axis-angle `omega`.
pub fn rotation_and_translation_map(
    omega: &Vector3<f64>,
    small_angle_threshold: f64,
) -> (Matrix3<f64>, Matrix3<f64>) {
    let coeffs = RodriguesCoefficients::new(omega.norm_squared(), small_angle_threshold);
    let k = skew_symmetric(omega);
    let k2 = k * k;
    let identity = Matrix3::identity();
    let rotation = identity + coeffs.a * k + coeffs.b * k2;
    let v = identity + coeffs.b * k + coeffs.c * k2;
    (rotation, v)
}

/// Gradient with respect to `omega` given `∂L/∂R` and optionally `∂L/∂V`.
pub fn backward(
    omega: &Vector3<f64>,
    small_angle_threshold: f64,
    grad_rotation: &Matrix3<f64>,
    grad_translation_map: Option<&Matrix3<f64>>,
) -> Vector3<f64> {
    let coeffs = RodriguesCoefficients::new(omega.norm_squared(), small_angle_threshold);
    let k = skew_symmetric(omega);
    let k2 = k * k;
    let g_r = grad_rotation;
    let g_v = grad_translation_map.copied().unwrap_or_else(Matrix3::zeros);

    // Scalar coefficient gradients
    let g_a = g_r.dot(&k);
    let g_b = g_r.dot(&k2) + g_v.dot(&k);
    let g_c = g_v.dot(&k2);

    // d(K²) = dK·K + K·dK  ⇒  <G, d(K²)> = <G·Kᵀ + Kᵀ·G, dK>
    let g_quad = coeffs.b * g_r + coeffs.c * g_v;
    let k_t = k.transpose();
    let g_k = coeffs.a * g_r + coeffs.b * g_v + g_quad * k_t + k_t * g_quad;

    let ds = g_a * coeffs.da + g_b * coeffs.db + g_c * coeffs.dc;
    skew_adjoint(&g_k) + 2.0 * ds * omega
}
