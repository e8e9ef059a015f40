//! Dense per-pixel buffers: point clouds, masks and scalar maps.
//!
//! All buffers share one planar layout `B × C × H × W` (channel-major per
//! example). A point cloud has C = 3, a mask has one channel per body and a
//! pixel map has C = 1. A point equal to the zero vector marks a pixel with
//! no depth return.

use crate::error::{Se3Error, Se3Result};
use nalgebra::Vector3;

pub mod depth;
pub mod ntfm3d;
pub mod pivots;

pub use depth::{CameraIntrinsics, depth_to_points, depth_to_points_backward};
pub use ntfm3d::{BlendMode, NTfm3DGradients, ntfm3d, ntfm3d_backward};
pub use pivots::{
    PivotGradients, PivotSource, PoseCenterMode, PoseCenterUpdate, compute_pivots,
    compute_pivots_backward, update_pose_centers, update_pose_centers_backward,
    weighted_average_points, weighted_average_points_backward,
};

/// Planar `B × C × H × W` buffer of `f64`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageBatch {
    batch_size: usize,
    channels: usize,
    height: usize,
    width: usize,
    data: Vec<f64>,
}

/// `B × 3 × H × W` points.
pub type PointCloud = ImageBatch;

/// `B × K × H × W` per-body weights.
pub type Mask = ImageBatch;

/// `B × 1 × H × W` scalar map (depth, per-pixel weights).
pub type PixelMap = ImageBatch;

impl ImageBatch {
    pub fn new(
        batch_size: usize,
        channels: usize,
        height: usize,
        width: usize,
        data: Vec<f64>,
    ) -> Se3Result<Self> {
        let expected = batch_size * channels * height * width;
        if data.len() != expected {
            return Err(Se3Error::shape(
                "ImageBatch::new",
                format!("{batch_size}x{channels}x{height}x{width} = {expected} values"),
                format!("{} values", data.len()),
            ));
        }
        Ok(Self {
            batch_size,
            channels,
            height,
            width,
            data,
        })
    }

    pub fn zeros(batch_size: usize, channels: usize, height: usize, width: usize) -> Self {
        Self {
            batch_size,
            channels,
            height,
            width,
            data: vec![0.0; batch_size * channels * height * width],
        }
    }

    /// Zero buffer with the same shape as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.batch_size, self.channels, self.height, self.width)
    }

    /// Fill every value from `f(example, channel, pixel)`.
    pub fn from_fn(
        batch_size: usize,
        channels: usize,
        height: usize,
        width: usize,
        mut f: impl FnMut(usize, usize, usize) -> f64,
    ) -> Self {
        let mut out = Self::zeros(batch_size, channels, height, width);
        let pixels = height * width;
        for b in 0..batch_size {
            for c in 0..channels {
                for pix in 0..pixels {
                    out.data[(b * channels + c) * pixels + pix] = f(b, c, pix);
                }
            }
        }
        out
    }

    /// Point cloud filled from `f(example, pixel)`.
    pub fn points_from_fn(
        batch_size: usize,
        height: usize,
        width: usize,
        mut f: impl FnMut(usize, usize) -> Vector3<f64>,
    ) -> PointCloud {
        let mut out = Self::zeros(batch_size, 3, height, width);
        for b in 0..batch_size {
            for pix in 0..height * width {
                out.set_point(b, pix, &f(b, pix));
            }
        }
        out
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn num_pixels(&self) -> usize {
        self.height * self.width
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Values of one example, `C × H × W`.
    pub fn example(&self, b: usize) -> &[f64] {
        let size = self.channels * self.num_pixels();
        &self.data[b * size..(b + 1) * size]
    }

    pub fn example_mut(&mut self, b: usize) -> &mut [f64] {
        let size = self.channels * self.num_pixels();
        &mut self.data[b * size..(b + 1) * size]
    }

    pub fn value(&self, b: usize, c: usize, pix: usize) -> f64 {
        self.data[(b * self.channels + c) * self.num_pixels() + pix]
    }

    pub fn value_mut(&mut self, b: usize, c: usize, pix: usize) -> &mut f64 {
        let idx = (b * self.channels + c) * self.num_pixels() + pix;
        &mut self.data[idx]
    }

    /// Point at `pix` of example `b` (channels 0..3).
    pub fn point(&self, b: usize, pix: usize) -> Vector3<f64> {
        point_in(self.example(b), self.num_pixels(), pix)
    }

    pub fn set_point(&mut self, b: usize, pix: usize, p: &Vector3<f64>) {
        let pixels = self.num_pixels();
        set_point_in(self.example_mut(b), pixels, pix, p);
    }

    pub(crate) fn ensure_channels(&self, expected: usize, op: &'static str) -> Se3Result<()> {
        if self.channels != expected {
            return Err(Se3Error::shape(
                op,
                format!("{expected} channels"),
                format!("{} channels", self.channels),
            ));
        }
        Ok(())
    }

    /// Batch size and spatial extent must agree; channels may differ.
    pub(crate) fn ensure_same_grid(&self, other: &ImageBatch, op: &'static str) -> Se3Result<()> {
        if self.batch_size != other.batch_size
            || self.height != other.height
            || self.width != other.width
        {
            return Err(Se3Error::shape(op, self.shape_string(), other.shape_string()));
        }
        Ok(())
    }

    pub(crate) fn ensure_same_shape(&self, other: &ImageBatch, op: &'static str) -> Se3Result<()> {
        if self.channels != other.channels {
            return Err(Se3Error::shape(op, self.shape_string(), other.shape_string()));
        }
        self.ensure_same_grid(other, op)
    }

    pub(crate) fn shape_string(&self) -> String {
        format!(
            "{}x{}x{}x{}",
            self.batch_size, self.channels, self.height, self.width
        )
    }
}

/// Point `pix` of a planar `3 × N` slice.
pub(crate) fn point_in(example: &[f64], pixels: usize, pix: usize) -> Vector3<f64> {
    Vector3::new(
        example[pix],
        example[pixels + pix],
        example[2 * pixels + pix],
    )
}

pub(crate) fn set_point_in(example: &mut [f64], pixels: usize, pix: usize, p: &Vector3<f64>) {
    example[pix] = p.x;
    example[pixels + pix] = p.y;
    example[2 * pixels + pix] = p.z;
}

pub(crate) fn add_point_in(example: &mut [f64], pixels: usize, pix: usize, p: &Vector3<f64>) {
    example[pix] += p.x;
    example[pixels + pix] += p.y;
    example[2 * pixels + pix] += p.z;
}

/// Whether a point is the "no depth return" marker.
pub fn is_missing_point(p: &Vector3<f64>) -> bool {
    p.x == 0.0 && p.y == 0.0 && p.z == 0.0
}

/// Whether a point carries a usable depth: all coordinates finite, z non-zero.
pub fn has_depth(p: &Vector3<f64>) -> bool {
    p.iter().all(|v| v.is_finite()) && p.z != 0.0
}
