//! Differentiable SE(3) layers for learning rigid-body motion from point clouds.
//!
//! Motion parameters become 3×4 transforms ([`transform::Se3ToRt`]), which
//! are composed, inverted and applied to point clouds under soft per-body
//! masks ([`points::ntfm3d`]). Losses compare the results with either side
//! differentiable. Every operation has a closed-form backward pass, available
//! as a free function and through the stateful [`layers::Layer`] types.

pub mod batch;
pub mod config;
pub mod error;
pub mod layers;
pub mod logger;
pub mod loss;
pub mod mask;
pub mod points;
pub mod rotation;
pub mod transform;

#[cfg(test)]
mod test_utils;

pub use batch::{Batch, ParamBatch, PivotBatch, PivotTransformBatch, Rt, RtPivot, TransformBatch};
pub use config::PoseModelConfig;
pub use error::{Se3Error, Se3Result};
pub use layers::Layer;
pub use logger::{init_logger, init_logger_with_level};
pub use points::{ImageBatch, Mask, PixelMap, PointCloud};
pub use rotation::{RotationConverter, RotationKind};
