//! Pinhole back-projection of depth images into point clouds.
//!
//! For pixel (i, j) with depth z: x = (j − cx)/fx·z, y = (i − cy)/fy·z.

use super::{PixelMap, PointCloud};
use crate::error::{Se3Error, Se3Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self { fx, fy, cx, cy }
    }

    /// Intrinsics of an image scaled by `factor` (e.g. 0.5 for half resolution).
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            fx: self.fx * factor,
            fy: self.fy * factor,
            cx: self.cx * factor,
            cy: self.cy * factor,
        }
    }

    pub fn validate(&self) -> Se3Result<()> {
        if self.fx == 0.0 || self.fy == 0.0 || !self.fx.is_finite() || !self.fy.is_finite() {
            return Err(Se3Error::InvalidConfig(format!(
                "focal lengths must be finite and non-zero, got fx={} fy={}",
                self.fx, self.fy
            )));
        }
        Ok(())
    }

    /// Ray direction (x/z, y/z) through pixel (row, col).
    fn ray(&self, row: usize, col: usize) -> (f64, f64) {
        (
            (col as f64 - self.cx) / self.fx,
            (row as f64 - self.cy) / self.fy,
        )
    }
}

pub fn depth_to_points(depth: &PixelMap, intrinsics: &CameraIntrinsics) -> Se3Result<PointCloud> {
    depth.ensure_channels(1, "depth_to_points")?;
    intrinsics.validate()?;

    let width = depth.width();
    Ok(PointCloud::from_fn(
        depth.batch_size(),
        3,
        depth.height(),
        width,
        |b, c, pix| {
            let z = depth.value(b, 0, pix);
            let (rx, ry) = intrinsics.ray(pix / width, pix % width);
            match c {
                0 => rx * z,
                1 => ry * z,
                _ => z,
            }
        },
    ))
}

/// Gradient of [`depth_to_points`] with respect to the depth image.
pub fn depth_to_points_backward(
    depth: &PixelMap,
    intrinsics: &CameraIntrinsics,
    grad_points: &PointCloud,
) -> Se3Result<PixelMap> {
    depth.ensure_channels(1, "depth_to_points_backward")?;
    grad_points.ensure_channels(3, "depth_to_points_backward")?;
    depth.ensure_same_grid(grad_points, "depth_to_points_backward")?;
    intrinsics.validate()?;

    let width = depth.width();
    Ok(PixelMap::from_fn(
        depth.batch_size(),
        1,
        depth.height(),
        width,
        |b, _, pix| {
            let (rx, ry) = intrinsics.ray(pix / width, pix % width);
            let g = grad_points.point(b, pix);
            rx * g.x + ry * g.y + g.z
        },
    ))
}
