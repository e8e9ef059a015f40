//! Euler angles (α, β, γ) about x, y and z, composed as R = Rz(γ)·Ry(β)·Rx(α).

use nalgebra::{Matrix3, Vector3};

fn rot_x(angle: f64) -> (Matrix3<f64>, Matrix3<f64>) {
    let (s, c) = angle.sin_cos();
    let r = Matrix3::new(1.0, 0.0, 0.0, 0.0, c, -s, 0.0, s, c);
    let dr = Matrix3::new(0.0, 0.0, 0.0, 0.0, -s, -c, 0.0, c, -s);
    (r, dr)
}

fn rot_y(angle: f64) -> (Matrix3<f64>, Matrix3<f64>) {
    let (s, c) = angle.sin_cos();
    let r = Matrix3::new(c, 0.0, s, 0.0, 1.0, 0.0, -s, 0.0, c);
    let dr = Matrix3::new(-s, 0.0, c, 0.0, 0.0, 0.0, -c, 0.0, -s);
    (r, dr)
}

fn rot_z(angle: f64) -> (Matrix3<f64>, Matrix3<f64>) {
    let (s, c) = angle.sin_cos();
    let r = Matrix3::new(c, -s, 0.0, s, c, 0.0, 0.0, 0.0, 1.0);
    let dr = Matrix3::new(-s, -c, 0.0, c, -s, 0.0, 0.0, 0.0, 0.0);
    (r, dr)
}

pub fn euler_to_rotation(angles: &Vector3<f64>) -> Matrix3<f64> {
    let (rx, _) = rot_x(angles.x);
    let (ry, _) = rot_y(angles.y);
    let (rz, _) = rot_z(angles.z);
    rz * ry * rx
}

/// Gradient with respect to (α, β, γ) given `∂L/∂R`.
pub fn backward(angles: &Vector3<f64>, grad_rotation: &Matrix3<f64>) -> Vector3<f64> {
    let (rx, drx) = rot_x(angles.x);
    let (ry, dry) = rot_y(angles.y);
    let (rz, drz) = rot_z(angles.z);
    Vector3::new(
        grad_rotation.dot(&(rz * ry * drx)),
        grad_rotation.dot(&(rz * dry * rx)),
        grad_rotation.dot(&(drz * ry * rx)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;
    use std::f64::consts::FRAC_PI_2;

    const TOLERANCE: f64 = 1e-12;

    #[test]
    fn test_euler_matches_nalgebra_roll_pitch_yaw() {
        let angles = Vector3::new(0.3, -0.7, 1.9);
        let expected = Rotation3::from_euler_angles(angles.x, angles.y, angles.z);
        assert!((euler_to_rotation(&angles) - expected.matrix()).norm() < TOLERANCE);
    }

    #[test]
    fn test_euler_yaw_only() {
        let r = euler_to_rotation(&Vector3::new(0.0, 0.0, FRAC_PI_2));
        let x = r * Vector3::x();
        assert!((x - Vector3::y()).norm() < TOLERANCE);
    }
}
