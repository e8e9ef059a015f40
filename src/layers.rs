//! Stateful layers wrapping the differentiable operations.
//!
//! A layer keeps exactly the forward context its backward pass needs. Calling
//! `backward` before `forward` fails with [`Se3Error::MissingForwardContext`];
//! a second `forward` replaces the retained context, so backward passes of a
//! pipeline must run in reverse order before the next forward.

use crate::batch::{ParamBatch, PivotTransformBatch, TransformBatch};
use crate::config::PoseModelConfig;
use crate::error::{Se3Error, Se3Result};
use crate::points::{
    BlendMode, Mask, NTfm3DGradients, PivotSource, PointCloud, compute_pivots,
    compute_pivots_backward, ntfm3d, ntfm3d_backward,
};
use crate::rotation::{RotationConverter, RotationKind};
use crate::transform::{
    AssembledTransforms, CompositionOrder, DeltaFrame, Se3ToRt, TransitionOutput, apply_delta,
    apply_delta_backward, attach_pivots, attach_pivots_backward, collapse_rt_pivots,
    collapse_rt_pivots_backward, compose_chain, compose_chain_backward, compose_pair_batch,
    compose_pair_batch_backward, inverse_batch, inverse_batch_backward,
};
use std::fmt;
use tracing::debug;

/// A differentiable operation with retained forward context.
pub trait Layer: fmt::Debug {
    /// Forward operands, taken by value so they can be retained
    type Input;
    /// Forward result; gradients flowing back have the same type
    type Output;
    /// Gradients with respect to the inputs
    type Gradient;

    fn forward(&mut self, input: Self::Input) -> Se3Result<Self::Output>;

    fn backward(&self, grad_output: &Self::Output) -> Se3Result<Self::Gradient>;
}

fn missing(layer: &'static str) -> Se3Error {
    Se3Error::MissingForwardContext(layer)
}

/// Motion parameters to `[R | t]` or `[R | t | p]`.
#[derive(Debug, Clone)]
pub struct Se3ToRtLayer {
    assembler: Se3ToRt,
    params: Option<ParamBatch>,
}

impl Se3ToRtLayer {
    pub fn new(kind: RotationKind, use_pivot: bool) -> Self {
        Self::from_assembler(Se3ToRt::new(kind, use_pivot))
    }

    pub fn from_assembler(assembler: Se3ToRt) -> Self {
        Self {
            assembler,
            params: None,
        }
    }

    pub fn assembler(&self) -> &Se3ToRt {
        &self.assembler
    }
}

impl Layer for Se3ToRtLayer {
    type Input = ParamBatch;
    type Output = AssembledTransforms;
    type Gradient = ParamBatch;

    fn forward(&mut self, params: ParamBatch) -> Se3Result<AssembledTransforms> {
        let output = self.assembler.forward(&params)?;
        self.params = Some(params);
        Ok(output)
    }

    fn backward(&self, grad_output: &AssembledTransforms) -> Se3Result<ParamBatch> {
        let params = self.params.as_ref().ok_or_else(|| missing("Se3ToRtLayer"))?;
        self.assembler.backward(params, grad_output)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RtInverseLayer {
    input: Option<TransformBatch>,
}

impl RtInverseLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for RtInverseLayer {
    type Input = TransformBatch;
    type Output = TransformBatch;
    type Gradient = TransformBatch;

    fn forward(&mut self, input: TransformBatch) -> Se3Result<TransformBatch> {
        let output = inverse_batch(&input);
        self.input = Some(input);
        Ok(output)
    }

    fn backward(&self, grad_output: &TransformBatch) -> Se3Result<TransformBatch> {
        let input = self.input.as_ref().ok_or_else(|| missing("RtInverseLayer"))?;
        inverse_batch_backward(input, grad_output)
    }
}

/// `A ∘ B` for a pair of batches: apply B first, then A.
#[derive(Debug, Clone, Default)]
pub struct ComposeRtPairLayer {
    operands: Option<(TransformBatch, TransformBatch)>,
}

impl ComposeRtPairLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for ComposeRtPairLayer {
    type Input = (TransformBatch, TransformBatch);
    type Output = TransformBatch;
    type Gradient = (TransformBatch, TransformBatch);

    fn forward(&mut self, (a, b): (TransformBatch, TransformBatch)) -> Se3Result<TransformBatch> {
        let output = compose_pair_batch(&a, &b)?;
        self.operands = Some((a, b));
        Ok(output)
    }

    fn backward(&self, grad_output: &TransformBatch) -> Se3Result<(TransformBatch, TransformBatch)> {
        let (a, b) = self.operands.as_ref().ok_or_else(|| missing("ComposeRtPairLayer"))?;
        compose_pair_batch_backward(a, b, grad_output)
    }
}

/// Cumulative transforms along a kinematic chain.
#[derive(Debug, Clone)]
pub struct ComposeRtLayer {
    order: CompositionOrder,
    context: Option<(TransformBatch, TransformBatch)>,
}

impl ComposeRtLayer {
    pub fn new(order: CompositionOrder) -> Self {
        Self {
            order,
            context: None,
        }
    }

    pub fn order(&self) -> CompositionOrder {
        self.order
    }
}

impl Layer for ComposeRtLayer {
    type Input = TransformBatch;
    type Output = TransformBatch;
    type Gradient = TransformBatch;

    fn forward(&mut self, input: TransformBatch) -> Se3Result<TransformBatch> {
        let output = compose_chain(&input, self.order);
        self.context = Some((input, output.clone()));
        Ok(output)
    }

    fn backward(&self, grad_output: &TransformBatch) -> Se3Result<TransformBatch> {
        let (input, output) = self.context.as_ref().ok_or_else(|| missing("ComposeRtLayer"))?;
        compose_chain_backward(input, output, grad_output, self.order)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollapseRtPivotsLayer {
    input: Option<PivotTransformBatch>,
}

impl CollapseRtPivotsLayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Layer for CollapseRtPivotsLayer {
    type Input = PivotTransformBatch;
    type Output = TransformBatch;
    type Gradient = PivotTransformBatch;

    fn forward(&mut self, input: PivotTransformBatch) -> Se3Result<TransformBatch> {
        let output = collapse_rt_pivots(&input);
        self.input = Some(input);
        Ok(output)
    }

    fn backward(&self, grad_output: &TransformBatch) -> Se3Result<PivotTransformBatch> {
        let input = self.input.as_ref().ok_or_else(|| missing("CollapseRtPivotsLayer"))?;
        collapse_rt_pivots_backward(input, grad_output)
    }
}

/// Operands of [`NTfm3DLayer`].
#[derive(Debug, Clone)]
pub struct NTfm3DInput {
    pub points: PointCloud,
    pub masks: Mask,
    pub transforms: TransformBatch,
}

/// Mask-weighted rigid transform of a point cloud.
#[derive(Debug, Clone)]
pub struct NTfm3DLayer {
    mode: BlendMode,
    input: Option<NTfm3DInput>,
}

impl NTfm3DLayer {
    pub fn new(mode: BlendMode) -> Self {
        Self { mode, input: None }
    }

    pub fn mode(&self) -> BlendMode {
        self.mode
    }
}

impl Layer for NTfm3DLayer {
    type Input = NTfm3DInput;
    type Output = PointCloud;
    type Gradient = NTfm3DGradients;

    fn forward(&mut self, input: NTfm3DInput) -> Se3Result<PointCloud> {
        let output = ntfm3d(&input.points, &input.masks, &input.transforms, self.mode)?;
        self.input = Some(input);
        Ok(output)
    }

    fn backward(&self, grad_output: &PointCloud) -> Se3Result<NTfm3DGradients> {
        let input = self.input.as_ref().ok_or_else(|| missing("NTfm3DLayer"))?;
        ntfm3d_backward(
            &input.points,
            &input.masks,
            &input.transforms,
            self.mode,
            grad_output,
        )
    }
}

/// Operands of [`TransitionLayer`].
#[derive(Debug, Clone)]
pub struct TransitionInput {
    pub poses: TransformBatch,
    pub deltas: TransformBatch,
    /// Required whenever a pivot source is set
    pub points: Option<PointCloud>,
    /// Required by the mask-based pivot sources
    pub masks: Option<Mask>,
}

/// Gradients of [`TransitionLayer`]; points and masks only receive
/// gradient through the pivots.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionGradients {
    pub poses: TransformBatch,
    pub deltas: TransformBatch,
    pub points: Option<PointCloud>,
    pub masks: Option<Mask>,
}

#[derive(Debug, Clone)]
struct TransitionContext {
    input: TransitionInput,
    pivoted: Option<PivotTransformBatch>,
    applied: TransformBatch,
}

/// Applies per-body deltas to the current poses.
///
/// With a pivot source the deltas rotate about the pivots, i.e. each delta is
/// attached to its body's pivot and collapsed before it is applied in the
/// configured frame.
#[derive(Debug, Clone)]
pub struct TransitionLayer {
    frame: DeltaFrame,
    pivot_source: Option<PivotSource>,
    context: Option<TransitionContext>,
}

impl TransitionLayer {
    pub fn new(frame: DeltaFrame, pivot_source: Option<PivotSource>) -> Self {
        Self {
            frame,
            pivot_source,
            context: None,
        }
    }

    pub fn from_config(config: &PoseModelConfig) -> Self {
        debug!(
            "transition: {} frame, pivots={:?}",
            config.delta_frame, config.pivot_source
        );
        Self::new(config.delta_frame, config.pivot_source)
    }

    pub fn frame(&self) -> DeltaFrame {
        self.frame
    }

    pub fn pivot_source(&self) -> Option<PivotSource> {
        self.pivot_source
    }
}

fn pivot_points(input: &TransitionInput) -> Se3Result<&PointCloud> {
    input.points.as_ref().ok_or(Se3Error::MissingInput {
        op: "TransitionLayer",
        input: "points",
    })
}

impl Layer for TransitionLayer {
    type Input = TransitionInput;
    type Output = TransitionOutput;
    type Gradient = TransitionGradients;

    fn forward(&mut self, input: TransitionInput) -> Se3Result<TransitionOutput> {
        let (pivoted, applied) = match self.pivot_source {
            Some(source) => {
                let pivots = compute_pivots(
                    source,
                    pivot_points(&input)?,
                    input.masks.as_ref(),
                    Some(&input.poses),
                    input.deltas.num_bodies(),
                )?;
                let pivoted = attach_pivots(&input.deltas, &pivots)?;
                let applied = collapse_rt_pivots(&pivoted);
                (Some(pivoted), applied)
            }
            None => (None, input.deltas.clone()),
        };
        let output = apply_delta(&input.poses, &applied, self.frame)?;
        self.context = Some(TransitionContext {
            input,
            pivoted,
            applied,
        });
        Ok(output)
    }

    fn backward(&self, grad_output: &TransitionOutput) -> Se3Result<TransitionGradients> {
        let context = self.context.as_ref().ok_or_else(|| missing("TransitionLayer"))?;
        let input = &context.input;
        let (mut grad_poses, grad_applied) = apply_delta_backward(
            &input.poses,
            &context.applied,
            self.frame,
            &grad_output.next_pose,
            Some(&grad_output.delta_global),
        )?;

        let (Some(source), Some(pivoted)) = (self.pivot_source, context.pivoted.as_ref()) else {
            return Ok(TransitionGradients {
                poses: grad_poses,
                deltas: grad_applied,
                points: None,
                masks: None,
            });
        };
        let grad_pivoted = collapse_rt_pivots_backward(pivoted, &grad_applied)?;
        let (grad_deltas, grad_pivots) = attach_pivots_backward(&grad_pivoted);
        let pivot_grads = compute_pivots_backward(
            source,
            pivot_points(input)?,
            input.masks.as_ref(),
            Some(&input.poses),
            &grad_pivots,
        )?;
        if let Some(extra) = pivot_grads.poses {
            for (acc, e) in grad_poses.items_mut().iter_mut().zip(extra.iter()) {
                *acc += e;
            }
        }
        Ok(TransitionGradients {
            poses: grad_poses,
            deltas: grad_deltas,
            points: pivot_grads.points,
            masks: pivot_grads.masks,
        })
    }
}

/// Motion parameters to per-body poses: assemble, collapse pivots, then
/// optionally accumulate along a kinematic chain.
#[derive(Debug, Clone)]
pub struct PoseDecoder {
    assemble: Se3ToRtLayer,
    collapse: Option<CollapseRtPivotsLayer>,
    chain: Option<ComposeRtLayer>,
    /// Whether the last forward carried pivots; `None` before any forward
    assembled_with_pivot: Option<bool>,
}

impl PoseDecoder {
    pub fn new(assembler: Se3ToRt, chain: Option<CompositionOrder>) -> Self {
        Self {
            collapse: assembler.use_pivot().then(CollapseRtPivotsLayer::new),
            assemble: Se3ToRtLayer::from_assembler(assembler),
            chain: chain.map(ComposeRtLayer::new),
            assembled_with_pivot: None,
        }
    }

    pub fn from_config(config: &PoseModelConfig) -> Se3Result<Self> {
        config.validate()?;
        let converter = RotationConverter::new(config.rotation)
            .with_small_angle_threshold(config.small_angle_threshold);
        let chain = config.kinematic_chain.then_some(config.composition_order);
        debug!(
            "pose decoder: {} bodies, {}, pivot={}, chain={:?}",
            config.num_bodies, config.rotation, config.use_pivot, chain
        );
        Ok(Self::new(
            Se3ToRt::from_converter(converter, config.use_pivot),
            chain,
        ))
    }

    pub fn assembler(&self) -> &Se3ToRt {
        self.assemble.assembler()
    }

    pub fn chain_order(&self) -> Option<CompositionOrder> {
        self.chain.as_ref().map(ComposeRtLayer::order)
    }
}

impl Layer for PoseDecoder {
    type Input = ParamBatch;
    type Output = TransformBatch;
    type Gradient = ParamBatch;

    fn forward(&mut self, params: ParamBatch) -> Se3Result<TransformBatch> {
        let assembled = self.assemble.forward(params)?;
        let poses = match (assembled, self.collapse.as_mut()) {
            (AssembledTransforms::WithPivot(pivoted), Some(collapse)) => {
                self.assembled_with_pivot = Some(true);
                collapse.forward(pivoted)?
            }
            (AssembledTransforms::Rigid(rigid), None) => {
                self.assembled_with_pivot = Some(false);
                rigid
            }
            _ => {
                return Err(Se3Error::InvalidConfig(
                    "assembler and pivot collapse disagree on pivots".to_string(),
                ));
            }
        };
        match self.chain.as_mut() {
            Some(chain) => chain.forward(poses),
            None => Ok(poses),
        }
    }

    fn backward(&self, grad_output: &TransformBatch) -> Se3Result<ParamBatch> {
        let with_pivot = self
            .assembled_with_pivot
            .ok_or_else(|| missing("PoseDecoder"))?;
        let grad_poses = match &self.chain {
            Some(chain) => chain.backward(grad_output)?,
            None => grad_output.clone(),
        };
        let grad_assembled = match (&self.collapse, with_pivot) {
            (Some(collapse), true) => {
                AssembledTransforms::WithPivot(collapse.backward(&grad_poses)?)
            }
            _ => AssembledTransforms::Rigid(grad_poses),
        };
        self.assemble.backward(&grad_assembled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Rt, rt_from_parts};
    use crate::test_utils::{
        FD_TOLERANCE, assert_slices_close, dot, numeric_gradient, random_weights,
    };
    use nalgebra::{DVector, Rotation3, Vector3};

    const TOLERANCE: f64 = 1e-12;

    fn poses(seed: u64) -> TransformBatch {
        let raw = random_weights(18, seed);
        TransformBatch::from_fn(2, 3, |b, k| {
            let i = (b * 3 + k) * 3;
            let r = Rotation3::new(Vector3::new(raw[i], raw[i + 1], raw[i + 2]));
            rt_from_parts(r.matrix(), &Vector3::new(raw[i + 1], raw[i + 2], raw[i]))
        })
    }

    fn params(width: usize, seed: u64) -> ParamBatch {
        let raw = random_weights(2 * 3 * width, seed);
        ParamBatch::from_fn(2, 3, |b, k| {
            let start = (b * 3 + k) * width;
            DVector::from_column_slice(&raw[start..start + width])
        })
    }

    fn flatten_params(batch: &ParamBatch) -> Vec<f64> {
        batch.iter().flat_map(|p| p.iter().copied()).collect()
    }

    fn unflatten_params(values: &[f64], width: usize) -> ParamBatch {
        ParamBatch::from_fn(2, 3, |b, k| {
            let start = (b * 3 + k) * width;
            DVector::from_column_slice(&values[start..start + width])
        })
    }

    fn upstream(seed: u64) -> TransformBatch {
        let raw = random_weights(2 * 3 * 12, seed);
        TransformBatch::from_fn(2, 3, |b, k| {
            Rt::from_column_slice(&raw[(b * 3 + k) * 12..(b * 3 + k + 1) * 12])
        })
    }

    fn flatten(batch: &TransformBatch) -> Vec<f64> {
        batch.iter().flat_map(|m| m.iter().copied()).collect()
    }

    fn unflatten(values: &[f64]) -> TransformBatch {
        TransformBatch::from_fn(2, 3, |b, k| {
            Rt::from_column_slice(&values[(b * 3 + k) * 12..(b * 3 + k + 1) * 12])
        })
    }

    #[test]
    fn test_backward_before_forward() {
        let grad = TransformBatch::identity(1, 1);
        assert!(matches!(
            RtInverseLayer::new().backward(&grad),
            Err(Se3Error::MissingForwardContext("RtInverseLayer"))
        ));
        assert!(matches!(
            ComposeRtLayer::new(CompositionOrder::LeftToRight).backward(&grad),
            Err(Se3Error::MissingForwardContext(_))
        ));
        let decoder = PoseDecoder::from_config(&PoseModelConfig::default()).unwrap();
        assert!(matches!(
            decoder.backward(&grad),
            Err(Se3Error::MissingForwardContext("PoseDecoder"))
        ));
    }

    #[test]
    fn test_inverse_layer_round_trip() {
        let input = poses(1);
        let mut first = RtInverseLayer::new();
        let mut second = RtInverseLayer::new();
        let back = second.forward(first.forward(input.clone()).unwrap()).unwrap();
        for (a, b) in back.iter().zip(input.iter()) {
            assert!((a - b).norm() < 1e-10);
        }
    }

    #[test]
    fn test_compose_pair_layer_matches_function() {
        let (a, b) = (poses(2), poses(3));
        let grad = upstream(4);
        let mut layer = ComposeRtPairLayer::new();
        let output = layer.forward((a.clone(), b.clone())).unwrap();
        assert_eq!(output, compose_pair_batch(&a, &b).unwrap());

        let (ga, gb) = layer.backward(&grad).unwrap();
        let (fa, fb) = compose_pair_batch_backward(&a, &b, &grad).unwrap();
        assert_eq!(ga, fa);
        assert_eq!(gb, fb);
    }

    #[test]
    fn test_ntfm3d_layer_identity() {
        let points = PointCloud::new(2, 3, 2, 2, random_weights(24, 5)).unwrap();
        let masks = Mask::from_fn(2, 3, 2, 2, |_, _, _| 1.0 / 3.0);
        let mut layer = NTfm3DLayer::new(BlendMode::Position);
        let output = layer
            .forward(NTfm3DInput {
                points: points.clone(),
                masks,
                transforms: TransformBatch::identity(2, 3),
            })
            .unwrap();
        for (a, b) in output.data().iter().zip(points.data()) {
            assert!((a - b).abs() < TOLERANCE);
        }
        let grads = layer.backward(&points).unwrap();
        assert_eq!(grads.transforms.num_bodies(), 3);
    }

    fn transition_points() -> PointCloud {
        let raw = random_weights(24, 11);
        PointCloud::from_fn(2, 3, 2, 2, |b, c, pix| {
            let v = raw[b * 12 + c * 4 + pix];
            if c == 2 { v + 3.0 } else { v }
        })
    }

    fn transition_masks() -> Mask {
        let raw = random_weights(24, 12);
        Mask::from_fn(2, 3, 2, 2, |b, k, pix| 0.6 + 0.4 * raw[b * 12 + k * 4 + pix])
    }

    #[test]
    fn test_transition_layer_from_config() {
        let config = PoseModelConfig::new()
            .with_delta_frame(DeltaFrame::Local)
            .with_pivot_source(PivotSource::PoseCenter);
        let layer = TransitionLayer::from_config(&config);
        assert_eq!(layer.frame(), DeltaFrame::Local);
        assert_eq!(layer.pivot_source(), Some(PivotSource::PoseCenter));
        assert_eq!(
            TransitionLayer::from_config(&PoseModelConfig::default()).pivot_source(),
            None
        );
    }

    #[test]
    fn test_transition_without_pivots_matches_apply_delta() {
        let (pose, delta) = (poses(13), poses(14));
        let mut layer = TransitionLayer::new(DeltaFrame::Local, None);
        let output = layer
            .forward(TransitionInput {
                poses: pose.clone(),
                deltas: delta.clone(),
                points: None,
                masks: None,
            })
            .unwrap();
        assert_eq!(output, apply_delta(&pose, &delta, DeltaFrame::Local).unwrap());
    }

    #[test]
    fn test_transition_pose_center_pivot_keeps_center() {
        // A pure rotation about the pose center leaves that center in place.
        let pose = poses(15);
        let deltas = poses(16).map(|rt| {
            let mut pure = *rt;
            pure.set_column(3, &Vector3::zeros());
            pure
        });
        let mut layer = TransitionLayer::new(DeltaFrame::Global, Some(PivotSource::PoseCenter));
        let output = layer
            .forward(TransitionInput {
                poses: pose.clone(),
                deltas,
                points: Some(transition_points()),
                masks: None,
            })
            .unwrap();
        for (before, after) in pose.iter().zip(output.next_pose.iter()) {
            assert!((before.column(3) - after.column(3)).norm() < 1e-10);
        }
    }

    #[test]
    fn test_transition_requires_points_for_pivots() {
        let mut layer = TransitionLayer::new(DeltaFrame::Global, Some(PivotSource::MaskMean));
        let result = layer.forward(TransitionInput {
            poses: poses(17),
            deltas: poses(18),
            points: None,
            masks: Some(transition_masks()),
        });
        assert!(matches!(result, Err(Se3Error::MissingInput { input: "points", .. })));
    }

    #[test]
    fn test_transition_gradients() {
        let (pose, delta) = (poses(19), poses(20));
        let points = transition_points();
        let masks = transition_masks();
        let (g_next, g_global) = (upstream(21), upstream(22));
        let grad = TransitionOutput {
            next_pose: g_next.clone(),
            delta_global: g_global.clone(),
        };

        for frame in [DeltaFrame::Global, DeltaFrame::Local] {
            for source in [None, Some(PivotSource::PoseCenter), Some(PivotSource::MaskMean)] {
                let run = |pose: TransformBatch,
                           delta: TransformBatch,
                           points: PointCloud,
                           masks: Mask|
                 -> f64 {
                    let mut layer = TransitionLayer::new(frame, source);
                    let out = layer
                        .forward(TransitionInput {
                            poses: pose,
                            deltas: delta,
                            points: Some(points),
                            masks: Some(masks),
                        })
                        .unwrap();
                    dot(&flatten(&g_next), &flatten(&out.next_pose))
                        + dot(&flatten(&g_global), &flatten(&out.delta_global))
                };
                let label = format!("{frame} {source:?}");

                let mut layer = TransitionLayer::new(frame, source);
                layer
                    .forward(TransitionInput {
                        poses: pose.clone(),
                        deltas: delta.clone(),
                        points: Some(points.clone()),
                        masks: Some(masks.clone()),
                    })
                    .unwrap();
                let analytic = layer.backward(&grad).unwrap();

                let numeric_poses = numeric_gradient(
                    |x| run(unflatten(x), delta.clone(), points.clone(), masks.clone()),
                    &flatten(&pose),
                );
                assert_slices_close(
                    &flatten(&analytic.poses),
                    &numeric_poses,
                    FD_TOLERANCE,
                    &format!("{label} poses"),
                );

                let numeric_deltas = numeric_gradient(
                    |x| run(pose.clone(), unflatten(x), points.clone(), masks.clone()),
                    &flatten(&delta),
                );
                assert_slices_close(
                    &flatten(&analytic.deltas),
                    &numeric_deltas,
                    FD_TOLERANCE,
                    &format!("{label} deltas"),
                );

                if source == Some(PivotSource::MaskMean) {
                    let numeric_points = numeric_gradient(
                        |x| {
                            let p = PointCloud::new(2, 3, 2, 2, x.to_vec()).unwrap();
                            run(pose.clone(), delta.clone(), p, masks.clone())
                        },
                        points.data(),
                    );
                    let grad_points = analytic.points.as_ref().unwrap();
                    assert_slices_close(
                        grad_points.data(),
                        &numeric_points,
                        FD_TOLERANCE,
                        &format!("{label} points"),
                    );

                    let numeric_masks = numeric_gradient(
                        |x| {
                            let m = Mask::new(2, 3, 2, 2, x.to_vec()).unwrap();
                            run(pose.clone(), delta.clone(), points.clone(), m)
                        },
                        masks.data(),
                    );
                    let grad_masks = analytic.masks.as_ref().unwrap();
                    assert_slices_close(
                        grad_masks.data(),
                        &numeric_masks,
                        FD_TOLERANCE,
                        &format!("{label} masks"),
                    );
                }
            }
        }
    }

    #[test]
    fn test_pose_decoder_identity_params() {
        let config = PoseModelConfig::new()
            .with_num_bodies(3)
            .with_pivot(true)
            .with_kinematic_chain(CompositionOrder::LeftToRight);
        let mut decoder = PoseDecoder::from_config(&config).unwrap();
        let identity = decoder.assembler().identity_params();
        let output = decoder
            .forward(ParamBatch::from_fn(2, 3, |_, _| identity.clone()))
            .unwrap();
        for rt in output.iter() {
            assert!((rt - Rt::identity()).norm() < TOLERANCE);
        }
    }

    #[test]
    fn test_pose_decoder_gradients() {
        let grad = upstream(7);
        for (kind, use_pivot, chain) in [
            (RotationKind::AxisAngle, false, None),
            (RotationKind::AxisAngle, true, Some(CompositionOrder::LeftToRight)),
            (RotationKind::Quaternion, false, Some(CompositionOrder::RightToLeft)),
            (RotationKind::Euler, true, None),
        ] {
            let mut decoder = PoseDecoder::new(Se3ToRt::new(kind, use_pivot), chain);
            let width = decoder.assembler().param_width();
            let input = params(width, 8);

            decoder.forward(input.clone()).unwrap();
            let analytic = decoder.backward(&grad).unwrap();

            let numeric = numeric_gradient(
                |x| {
                    let mut perturbed = PoseDecoder::new(Se3ToRt::new(kind, use_pivot), chain);
                    let out = perturbed.forward(unflatten_params(x, width)).unwrap();
                    dot(&flatten(&grad), &flatten(&out))
                },
                &flatten_params(&input),
            );
            assert_slices_close(
                &flatten_params(&analytic),
                &numeric,
                FD_TOLERANCE,
                &format!("{kind} pivot={use_pivot} chain={chain:?}"),
            );
        }
    }
}
