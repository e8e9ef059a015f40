//! Model configuration shared by the decoders, layers and the CLI.

use crate::error::{Se3Error, Se3Result};
use crate::loss::{LossType, MotionNormalization};
use crate::mask::{MaskMode, SharpeningSchedule};
use crate::points::{BlendMode, PivotSource};
use crate::rotation::{DEFAULT_SMALL_ANGLE_THRESHOLD, RotationKind};
use crate::transform::DeltaFrame;
use serde::{Deserialize, Serialize};

pub use crate::transform::CompositionOrder;

/// Configuration of the SE(3) pose and mask model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseModelConfig {
    /// Number of rigid bodies K
    pub num_bodies: usize,
    /// Rotation parameterization of the motion parameters
    pub rotation: RotationKind,
    /// Whether motion parameters carry a pivot
    pub use_pivot: bool,
    /// Fold the bodies along a kinematic chain
    pub kinematic_chain: bool,
    pub composition_order: CompositionOrder,
    pub mask_mode: MaskMode,
    pub sharpening: SharpeningSchedule,
    /// θ² below which Rodrigues uses its small-angle branch
    pub small_angle_threshold: f64,
    /// Frame of the transition deltas
    pub delta_frame: DeltaFrame,
    /// Pivots the transition deltas rotate about; `None` rotates about the origin
    pub pivot_source: Option<PivotSource>,
    pub blend_mode: BlendMode,
    pub loss_type: LossType,
    pub motion_normalization: MotionNormalization,
}

impl Default for PoseModelConfig {
    fn default() -> Self {
        Self {
            num_bodies: 8,
            rotation: RotationKind::AxisAngle,
            use_pivot: false,
            kinematic_chain: false,
            composition_order: CompositionOrder::default(),
            mask_mode: MaskMode::default(),
            sharpening: SharpeningSchedule::default(),
            small_angle_threshold: DEFAULT_SMALL_ANGLE_THRESHOLD,
            delta_frame: DeltaFrame::default(),
            pivot_source: None,
            blend_mode: BlendMode::default(),
            loss_type: LossType::default(),
            motion_normalization: MotionNormalization::default(),
        }
    }
}

impl PoseModelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_num_bodies(mut self, num_bodies: usize) -> Self {
        self.num_bodies = num_bodies;
        self
    }

    pub fn with_rotation(mut self, rotation: RotationKind) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_pivot(mut self, use_pivot: bool) -> Self {
        self.use_pivot = use_pivot;
        self
    }

    /// Enable the kinematic chain with the given accumulation order
    pub fn with_kinematic_chain(mut self, order: CompositionOrder) -> Self {
        self.kinematic_chain = true;
        self.composition_order = order;
        self
    }

    pub fn with_mask_mode(mut self, mask_mode: MaskMode) -> Self {
        self.mask_mode = mask_mode;
        self
    }

    pub fn with_sharpening(mut self, sharpening: SharpeningSchedule) -> Self {
        self.sharpening = sharpening;
        self
    }

    pub fn with_small_angle_threshold(mut self, threshold: f64) -> Self {
        self.small_angle_threshold = threshold;
        self
    }

    pub fn with_delta_frame(mut self, delta_frame: DeltaFrame) -> Self {
        self.delta_frame = delta_frame;
        self
    }

    pub fn with_pivot_source(mut self, pivot_source: PivotSource) -> Self {
        self.pivot_source = Some(pivot_source);
        self
    }

    pub fn with_blend_mode(mut self, blend_mode: BlendMode) -> Self {
        self.blend_mode = blend_mode;
        self
    }

    pub fn with_loss_type(mut self, loss_type: LossType) -> Self {
        self.loss_type = loss_type;
        self
    }

    pub fn with_motion_normalization(mut self, normalization: MotionNormalization) -> Self {
        self.motion_normalization = normalization;
        self
    }

    /// Width of one body's motion parameter vector.
    pub fn param_width(&self) -> usize {
        3 + self.rotation.width() + if self.use_pivot { 3 } else { 0 }
    }

    /// Check value ranges that the types alone do not enforce.
    pub fn validate(&self) -> Se3Result<()> {
        if self.num_bodies == 0 {
            return Err(Se3Error::InvalidConfig(
                "num_bodies must be at least 1".to_string(),
            ));
        }
        if !(self.small_angle_threshold.is_finite() && self.small_angle_threshold > 0.0) {
            return Err(Se3Error::InvalidConfig(format!(
                "small_angle_threshold must be positive, got {}",
                self.small_angle_threshold
            )));
        }
        if !(self.sharpening.rate.is_finite() && self.sharpening.rate >= 0.0) {
            return Err(Se3Error::InvalidConfig(format!(
                "sharpening rate must be non-negative, got {}",
                self.sharpening.rate
            )));
        }
        let motion = &self.motion_normalization;
        if !(motion.threshold >= 0.0 && motion.min_points > 0.0) {
            return Err(Se3Error::InvalidConfig(format!(
                "motion normalization needs threshold >= 0 and min_points > 0, got {} and {}",
                motion.threshold, motion.min_points
            )));
        }
        Ok(())
    }
}
