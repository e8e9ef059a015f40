//! Dense (example × body) containers for transforms, pivots and motion parameters.
//!
//! Items are stored row-major over `(batch, body)`, so the body order of one
//! example is contiguous. Body order matters: kinematic chains fold along it.

use crate::error::{Se3Error, Se3Result};
use nalgebra::{DVector, Matrix3, Matrix3x4, Matrix3x5, Vector3};
use std::fmt;

/// A 3×4 rigid transform `[R | t]` acting as `p' = R·p + t`.
pub type Rt = Matrix3x4<f64>;

/// A 3×5 transform-with-pivot `[R | t | p]`, collapsed by
/// [`collapse_rt_pivots`](crate::transform::pivot::collapse_rt_pivots).
pub type RtPivot = Matrix3x5<f64>;

/// Batch of rigid transforms indexed by (example, body).
pub type TransformBatch = Batch<Rt>;

/// Batch of transforms that still carry their pivot column.
pub type PivotTransformBatch = Batch<RtPivot>;

/// Batch of raw motion parameter vectors, one per body.
pub type ParamBatch = Batch<DVector<f64>>;

/// Batch of per-body 3D points (pivots, centroids).
pub type PivotBatch = Batch<Vector3<f64>>;

/// Dense collection of per-body items for every example of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch<T> {
    batch_size: usize,
    num_bodies: usize,
    items: Vec<T>,
}

impl<T> Batch<T> {
    /// Wrap `items` laid out as `batch_size × num_bodies`.
    pub fn new(batch_size: usize, num_bodies: usize, items: Vec<T>) -> Se3Result<Self> {
        if items.len() != batch_size * num_bodies {
            return Err(Se3Error::shape(
                "Batch::new",
                format!("{batch_size}x{num_bodies} = {} items", batch_size * num_bodies),
                format!("{} items", items.len()),
            ));
        }
        Ok(Self {
            batch_size,
            num_bodies,
            items,
        })
    }

    /// Build a batch by evaluating `f(example, body)` for every slot.
    pub fn from_fn(
        batch_size: usize,
        num_bodies: usize,
        mut f: impl FnMut(usize, usize) -> T,
    ) -> Self {
        let mut items = Vec::with_capacity(batch_size * num_bodies);
        for b in 0..batch_size {
            for k in 0..num_bodies {
                items.push(f(b, k));
            }
        }
        Self {
            batch_size,
            num_bodies,
            items,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn num_bodies(&self) -> usize {
        self.num_bodies
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [T] {
        &mut self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// Item for `body` of `example`.
    ///
    /// # Panics
    /// Panics if either index is out of range.
    pub fn get(&self, example: usize, body: usize) -> &T {
        &self.items[self.index(example, body)]
    }

    pub fn get_mut(&mut self, example: usize, body: usize) -> &mut T {
        let idx = self.index(example, body);
        &mut self.items[idx]
    }

    /// All bodies of one example, in chain order.
    pub fn example(&self, example: usize) -> &[T] {
        let start = example * self.num_bodies;
        &self.items[start..start + self.num_bodies]
    }

    pub fn example_mut(&mut self, example: usize) -> &mut [T] {
        let start = example * self.num_bodies;
        &mut self.items[start..start + self.num_bodies]
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Apply `f` element-wise, keeping the layout.
    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Batch<U> {
        Batch {
            batch_size: self.batch_size,
            num_bodies: self.num_bodies,
            items: self.items.iter().map(f).collect(),
        }
    }

    /// Combine two equally shaped batches element-wise.
    pub fn zip_map<U, V>(
        &self,
        other: &Batch<U>,
        op: &'static str,
        mut f: impl FnMut(&T, &U) -> V,
    ) -> Se3Result<Batch<V>> {
        self.ensure_same_shape(other, op)?;
        Ok(Batch {
            batch_size: self.batch_size,
            num_bodies: self.num_bodies,
            items: self
                .items
                .iter()
                .zip(other.items.iter())
                .map(|(a, b)| f(a, b))
                .collect(),
        })
    }

    /// Fail with `ShapeMismatch` unless both batches are `B × K` with the same B and K.
    pub fn ensure_same_shape<U>(&self, other: &Batch<U>, op: &'static str) -> Se3Result<()> {
        if self.batch_size != other.batch_size || self.num_bodies != other.num_bodies {
            return Err(Se3Error::shape(
                op,
                self.shape_string(),
                other.shape_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn shape_string(&self) -> String {
        format!("{}x{}", self.batch_size, self.num_bodies)
    }

    fn index(&self, example: usize, body: usize) -> usize {
        assert!(
            example < self.batch_size && body < self.num_bodies,
            "index ({example}, {body}) out of range for batch {}",
            self.shape_string()
        );
        example * self.num_bodies + body
    }
}

impl Batch<Rt> {
    /// `B × K` identity transforms `[I | 0]`.
    pub fn identity(batch_size: usize, num_bodies: usize) -> Self {
        Self::from_fn(batch_size, num_bodies, |_, _| identity_rt())
    }
}

impl<T: fmt::Display> fmt::Display for Batch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Batch({})", self.shape_string())?;
        for b in 0..self.batch_size {
            for k in 0..self.num_bodies {
                writeln!(f, "[{b}, {k}]: {}", self.items[b * self.num_bodies + k])?;
            }
        }
        Ok(())
    }
}

/// The identity transform `[I | 0]`.
pub fn identity_rt() -> Rt {
    Rt::identity()
}

/// Build `[R | t]` from its blocks.
pub fn rt_from_parts(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Rt {
    let mut rt = Rt::zeros();
    rt.fixed_view_mut::<3, 3>(0, 0).copy_from(rotation);
    rt.set_column(3, translation);
    rt
}

/// Rotation block of `[R | t]`.
pub fn rotation_of(rt: &Rt) -> Matrix3<f64> {
    rt.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Translation column of `[R | t]`.
pub fn translation_of(rt: &Rt) -> Vector3<f64> {
    rt.column(3).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_new_rejects_wrong_length() {
        let result = Batch::new(2, 3, vec![0.0_f64; 5]);
        assert!(matches!(result, Err(Se3Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_batch_layout_is_body_major_per_example() {
        let batch = Batch::from_fn(2, 3, |b, k| b * 10 + k);
        assert_eq!(batch.items(), &[0, 1, 2, 10, 11, 12]);
        assert_eq!(*batch.get(1, 2), 12);
        assert_eq!(batch.example(1), &[10, 11, 12]);
    }

    #[test]
    fn test_identity_rt() {
        let identity = TransformBatch::identity(1, 2);
        for rt in identity.iter() {
            assert_eq!(rotation_of(rt), Matrix3::identity());
            assert_eq!(translation_of(rt), Vector3::zeros());
        }
    }

    #[test]
    fn test_rt_from_parts_roundtrip_blocks() {
        let rotation = Matrix3::new(0.0, -1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let translation = Vector3::new(1.0, 2.0, 3.0);
        let rt = rt_from_parts(&rotation, &translation);
        assert_eq!(rotation_of(&rt), rotation);
        assert_eq!(translation_of(&rt), translation);
    }

    #[test]
    fn test_zip_map_shape_check() {
        let a = Batch::from_fn(2, 2, |_, _| 1.0);
        let b = Batch::from_fn(2, 3, |_, _| 1.0);
        assert!(a.zip_map(&b, "test", |x: &f64, y: &f64| x + y).is_err());
    }
}
