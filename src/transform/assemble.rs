//! Motion parameters to rigid transforms (SE3ToRt).
//!
//! Each body's parameter vector is laid out as
//! `[u (3) | rotation params (w) | pivot (3)?]`. The translation is `t = V·u`
//! for axis-angle and `t = u` for every other parameterization.

use crate::batch::{ParamBatch, PivotTransformBatch, Rt, TransformBatch, rt_from_parts};
use crate::error::{Se3Error, Se3Result};
use crate::rotation::{RotationConverter, RotationKind};
use crate::transform::pivot::with_pivot;
use nalgebra::{DVector, Matrix3, Vector3};
use tracing::debug;

/// Transforms produced by [`Se3ToRt::forward`].
#[derive(Debug, Clone, PartialEq)]
pub enum AssembledTransforms {
    Rigid(TransformBatch),
    WithPivot(PivotTransformBatch),
}

impl AssembledTransforms {
    pub fn batch_size(&self) -> usize {
        match self {
            AssembledTransforms::Rigid(b) => b.batch_size(),
            AssembledTransforms::WithPivot(b) => b.batch_size(),
        }
    }

    pub fn num_bodies(&self) -> usize {
        match self {
            AssembledTransforms::Rigid(b) => b.num_bodies(),
            AssembledTransforms::WithPivot(b) => b.num_bodies(),
        }
    }

    pub fn as_rigid(&self) -> Option<&TransformBatch> {
        match self {
            AssembledTransforms::Rigid(b) => Some(b),
            AssembledTransforms::WithPivot(_) => None,
        }
    }

    pub fn as_with_pivot(&self) -> Option<&PivotTransformBatch> {
        match self {
            AssembledTransforms::WithPivot(b) => Some(b),
            AssembledTransforms::Rigid(_) => None,
        }
    }
}

/// Assembles `[R | t]` or `[R | t | p]` from per-body motion parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Se3ToRt {
    converter: RotationConverter,
    use_pivot: bool,
}

impl Se3ToRt {
    pub fn new(kind: RotationKind, use_pivot: bool) -> Self {
        Self::from_converter(RotationConverter::new(kind), use_pivot)
    }

    pub fn from_converter(converter: RotationConverter, use_pivot: bool) -> Self {
        Self {
            converter,
            use_pivot,
        }
    }

    pub fn converter(&self) -> &RotationConverter {
        &self.converter
    }

    pub fn use_pivot(&self) -> bool {
        self.use_pivot
    }

    /// Parameters per body: 3 + rotation width (+ 3 with a pivot).
    pub fn param_width(&self) -> usize {
        3 + self.converter.kind().width() + if self.use_pivot { 3 } else { 0 }
    }

    /// Identity motion for one body (zero translation, identity rotation, zero pivot).
    pub fn identity_params(&self) -> DVector<f64> {
        let mut params = DVector::zeros(self.param_width());
        let rotation = self.converter.kind().identity_params();
        params.rows_mut(3, rotation.len()).copy_from(&rotation);
        params
    }

    fn check_widths(&self, params: &ParamBatch) -> Se3Result<()> {
        let expected = self.param_width();
        if let Some(bad) = params.iter().find(|p| p.len() != expected) {
            return Err(Se3Error::InvalidParameterWidth {
                kind: self.describe(),
                expected,
                actual: bad.len(),
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        if self.use_pivot {
            format!("{}+pivot", self.converter.kind())
        } else {
            self.converter.kind().to_string()
        }
    }

    fn assemble_one(&self, params: &DVector<f64>) -> Se3Result<(Rt, Option<Vector3<f64>>)> {
        let width = self.converter.kind().width();
        let u = Vector3::new(params[0], params[1], params[2]);
        let map = self.converter.convert(&params.as_slice()[3..3 + width])?;
        let t = match &map.translation_map {
            Some(v) => v * u,
            None => u,
        };
        let pivot = self.use_pivot.then(|| {
            Vector3::new(params[3 + width], params[4 + width], params[5 + width])
        });
        Ok((rt_from_parts(&map.rotation, &t), pivot))
    }

    pub fn forward(&self, params: &ParamBatch) -> Se3Result<AssembledTransforms> {
        self.check_widths(params)?;
        debug!(
            "assembling {} transforms from {} parameters",
            params.shape_string(),
            self.describe()
        );

        let assembled = params
            .iter()
            .map(|p| self.assemble_one(p))
            .collect::<Se3Result<Vec<_>>>()?;
        let (b, k) = (params.batch_size(), params.num_bodies());

        if self.use_pivot {
            let items = assembled
                .iter()
                .map(|(rt, pivot)| with_pivot(rt, &pivot.unwrap_or_else(Vector3::zeros)))
                .collect();
            Ok(AssembledTransforms::WithPivot(PivotTransformBatch::new(b, k, items)?))
        } else {
            let items = assembled.into_iter().map(|(rt, _)| rt).collect();
            Ok(AssembledTransforms::Rigid(TransformBatch::new(b, k, items)?))
        }
    }

    /// Gradient with respect to the motion parameters.
    ///
    /// For axis-angle `∂u = Vᵀ·∂t` and `∂V = ∂t·uᵀ` flows into the rotation
    /// block; the pivot gradient is passed through unchanged.
    pub fn backward(
        &self,
        params: &ParamBatch,
        grad_output: &AssembledTransforms,
    ) -> Se3Result<ParamBatch> {
        self.check_widths(params)?;
        let width = self.converter.kind().width();

        let grads: Vec<(Matrix3<f64>, Vector3<f64>, Option<Vector3<f64>>)> =
            match (grad_output, self.use_pivot) {
                (AssembledTransforms::Rigid(g), false) => {
                    params.ensure_same_shape(g, "Se3ToRt::backward")?;
                    g.iter()
                        .map(|m| {
                            (
                                m.fixed_view::<3, 3>(0, 0).into_owned(),
                                m.column(3).into_owned(),
                                None,
                            )
                        })
                        .collect()
                }
                (AssembledTransforms::WithPivot(g), true) => {
                    params.ensure_same_shape(g, "Se3ToRt::backward")?;
                    g.iter()
                        .map(|m| {
                            (
                                m.fixed_view::<3, 3>(0, 0).into_owned(),
                                m.column(3).into_owned(),
                                Some(m.column(4).into_owned()),
                            )
                        })
                        .collect()
                }
                _ => {
                    return Err(Se3Error::shape(
                        "Se3ToRt::backward",
                        if self.use_pivot { "3x5 gradients" } else { "3x4 gradients" },
                        if self.use_pivot { "3x4 gradients" } else { "3x5 gradients" },
                    ));
                }
            };

        let mut out = Vec::with_capacity(params.len());
        for (p, (g_r, g_t, g_pivot)) in params.iter().zip(grads) {
            let u = Vector3::new(p[0], p[1], p[2]);
            let rotation_params = &p.as_slice()[3..3 + width];
            let map = self.converter.convert(rotation_params)?;

            let mut grad = DVector::zeros(self.param_width());
            let (g_u, g_v) = match &map.translation_map {
                Some(v) => (v.transpose() * g_t, Some(g_t * u.transpose())),
                None => (g_t, None),
            };
            grad.rows_mut(0, 3).copy_from(&g_u);
            let g_rot = self.converter.backward(rotation_params, &g_r, g_v.as_ref())?;
            grad.rows_mut(3, width).copy_from(&g_rot);
            if let Some(g_pivot) = g_pivot {
                grad.rows_mut(3 + width, 3).copy_from(&g_pivot);
            }
            out.push(grad);
        }
        ParamBatch::new(params.batch_size(), params.num_bodies(), out)
    }
}
