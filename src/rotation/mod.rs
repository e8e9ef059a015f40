//! Rotation parameterizations and their conversion to 3×3 matrices.
//!
//! Each motion parameter vector carries a rotation block whose width depends
//! on the parameterization:
//!
//! Kind              | name        | width | matrix
//! ----------------- | ----------- | ----- | ---------------------------------------
//! Axis-angle        | `se3aa`     | 3     | R = I + A·[ω]ₓ + B·[ω]ₓ²  (Rodrigues)
//! Euler             | `se3euler`  | 3     | R = Rz(γ)·Ry(β)·Rx(α)
//! Quaternion        | `se3quat`   | 4     | [x, y, z, w], normalized before use
//! Scaled quaternion | `se3spquat` | 3     | stereographic v ↦ [2v, 1 − ‖v‖²]/(1 + ‖v‖²)
//! Affine            | `affine`    | 9     | row-major 3×3, not orthonormalized
//!
//! Axis-angle additionally yields the matrix V = I + B·[ω]ₓ + C·[ω]ₓ² that
//! maps the translation block to the rigid-body translation `t = V·u`.
//!
//! Every conversion has a closed-form backward pass taking `∂L/∂R` (and
//! `∂L/∂V` for axis-angle) to `∂L/∂params`.

use crate::error::{Se3Error, Se3Result};
use nalgebra::{DVector, Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod axis_angle;
pub mod euler;
pub mod quaternion;

pub use axis_angle::RodriguesCoefficients;

/// Squared angle below which Rodrigues coefficients take their θ → 0 limits.
pub const DEFAULT_SMALL_ANGLE_THRESHOLD: f64 = 1e-12;

/// Supported rotation parameterizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RotationKind {
    AxisAngle,
    Euler,
    Quaternion,
    ScaledQuaternion,
    Affine,
}

impl RotationKind {
    /// Number of rotation parameters per body.
    pub fn width(self) -> usize {
        match self {
            RotationKind::AxisAngle | RotationKind::Euler | RotationKind::ScaledQuaternion => 3,
            RotationKind::Quaternion => 4,
            RotationKind::Affine => 9,
        }
    }

    /// Canonical configuration name.
    pub fn name(self) -> &'static str {
        match self {
            RotationKind::AxisAngle => "se3aa",
            RotationKind::Euler => "se3euler",
            RotationKind::Quaternion => "se3quat",
            RotationKind::ScaledQuaternion => "se3spquat",
            RotationKind::Affine => "affine",
        }
    }

    /// Whether the produced matrix is guaranteed orthonormal.
    pub fn is_rigid(self) -> bool {
        !matches!(self, RotationKind::Affine)
    }

    /// Rotation parameters for the identity rotation.
    pub fn identity_params(self) -> DVector<f64> {
        match self {
            RotationKind::Quaternion => DVector::from_column_slice(&[0.0, 0.0, 0.0, 1.0]),
            RotationKind::Affine => {
                DVector::from_column_slice(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
            }
            _ => DVector::zeros(self.width()),
        }
    }
}

impl fmt::Display for RotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for RotationKind {
    type Err = Se3Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "se3aa" | "axis_angle" | "axisangle" | "aa" => Ok(RotationKind::AxisAngle),
            "se3euler" | "euler" => Ok(RotationKind::Euler),
            "se3quat" | "quaternion" | "quat" => Ok(RotationKind::Quaternion),
            "se3spquat" | "scaled_quaternion" | "spquat" => Ok(RotationKind::ScaledQuaternion),
            "affine" => Ok(RotationKind::Affine),
            _ => Err(Se3Error::unknown("rotation kind", s)),
        }
    }
}

/// Output of a rotation conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct RotationMap {
    pub rotation: Matrix3<f64>,
    /// Translation map V, present for axis-angle only.
    pub translation_map: Option<Matrix3<f64>>,
}

/// Converts rotation parameter blocks into rotation matrices and back-propagates
/// matrix gradients onto the parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotationConverter {
    kind: RotationKind,
    small_angle_threshold: f64,
}

impl RotationConverter {
    pub fn new(kind: RotationKind) -> Self {
        Self {
            kind,
            small_angle_threshold: DEFAULT_SMALL_ANGLE_THRESHOLD,
        }
    }

    /// Override the squared-angle threshold of the axis-angle small-angle branch.
    pub fn with_small_angle_threshold(mut self, threshold: f64) -> Self {
        self.small_angle_threshold = threshold;
        self
    }

    pub fn kind(&self) -> RotationKind {
        self.kind
    }

    pub fn small_angle_threshold(&self) -> f64 {
        self.small_angle_threshold
    }

    fn check_width(&self, params: &[f64]) -> Se3Result<()> {
        if params.len() != self.kind.width() {
            return Err(Se3Error::InvalidParameterWidth {
                kind: self.kind.to_string(),
                expected: self.kind.width(),
                actual: params.len(),
            });
        }
        Ok(())
    }

    /// Rotation matrix (and V for axis-angle) for one rotation block.
    pub fn convert(&self, params: &[f64]) -> Se3Result<RotationMap> {
        self.check_width(params)?;
        let map = match self.kind {
            RotationKind::AxisAngle => {
                let omega = Vector3::new(params[0], params[1], params[2]);
                let (rotation, v) =
                    axis_angle::rotation_and_translation_map(&omega, self.small_angle_threshold);
                RotationMap {
                    rotation,
                    translation_map: Some(v),
                }
            }
            RotationKind::Euler => RotationMap {
                rotation: euler::euler_to_rotation(&Vector3::new(params[0], params[1], params[2])),
                translation_map: None,
            },
            RotationKind::Quaternion => RotationMap {
                rotation: quaternion::quaternion_to_rotation(&[
                    params[0], params[1], params[2], params[3],
                ]),
                translation_map: None,
            },
            RotationKind::ScaledQuaternion => RotationMap {
                rotation: quaternion::scaled_quaternion_to_rotation(&Vector3::new(
                    params[0], params[1], params[2],
                )),
                translation_map: None,
            },
            RotationKind::Affine => RotationMap {
                rotation: Matrix3::from_row_slice(params),
                translation_map: None,
            },
        };
        Ok(map)
    }

    /// Gradient with respect to the rotation block given `∂L/∂R` and, for
    /// axis-angle, `∂L/∂V`. A `None` V-gradient is treated as zero.
    pub fn backward(
        &self,
        params: &[f64],
        grad_rotation: &Matrix3<f64>,
        grad_translation_map: Option<&Matrix3<f64>>,
    ) -> Se3Result<DVector<f64>> {
        self.check_width(params)?;
        let grad = match self.kind {
            RotationKind::AxisAngle => {
                let omega = Vector3::new(params[0], params[1], params[2]);
                let g = axis_angle::backward(
                    &omega,
                    self.small_angle_threshold,
                    grad_rotation,
                    grad_translation_map,
                );
                DVector::from_column_slice(g.as_slice())
            }
            RotationKind::Euler => {
                let g = euler::backward(&Vector3::new(params[0], params[1], params[2]), grad_rotation);
                DVector::from_column_slice(g.as_slice())
            }
            RotationKind::Quaternion => {
                let g = quaternion::quaternion_backward(
                    &[params[0], params[1], params[2], params[3]],
                    grad_rotation,
                );
                DVector::from_column_slice(&g)
            }
            RotationKind::ScaledQuaternion => {
                let g = quaternion::scaled_quaternion_backward(
                    &Vector3::new(params[0], params[1], params[2]),
                    grad_rotation,
                );
                DVector::from_column_slice(g.as_slice())
            }
            RotationKind::Affine => DVector::from_row_slice(grad_rotation.transpose().as_slice()),
        };
        Ok(grad)
    }
}

/// Skew-symmetric matrix `[v]ₓ` with `[v]ₓ·a = v × a`.
pub fn skew_symmetric(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Adjoint of [`skew_symmetric`] under the Frobenius inner product:
/// `<G, [v]ₓ> = skew_adjoint(G)·v`.
pub fn skew_adjoint(g: &Matrix3<f64>) -> Vector3<f64> {
    Vector3::new(
        g[(2, 1)] - g[(1, 2)],
        g[(0, 2)] - g[(2, 0)],
        g[(1, 0)] - g[(0, 1)],
    )
}
