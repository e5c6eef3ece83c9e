//! Axis-aligned extent of a point subset.
//!
//! The box centre is the midpoint of the range on each axis, `(max + min) / 2`,
//! not the mean of the points, so it does not drift towards the densely
//! sampled side of an object.

use segfuse_types::Vec3;

/// An axis-aligned bounding box, defined by its minimum and maximum corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BoundingBox {
    /// Smallest box containing every point yielded by `points`.
    ///
    /// Returns `None` when `points` is empty.
    pub fn from_points<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = [f64; 3]>,
    {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut min = first;
        let mut max = first;
        for p in iter {
            for axis in 0..3 {
                min[axis] = min[axis].min(p[axis]);
                max[axis] = max[axis].max(p[axis]);
            }
        }
        Some(Self {
            min: Vec3::new(min[0], min[1], min[2]),
            max: Vec3::new(max[0], max[1], max[2]),
        })
    }

    /// Return the centre point of the box.
    pub fn centre(&self) -> Vec3 {
        Vec3::new(
            (self.max.x + self.min.x) / 2.0,
            (self.max.y + self.min.y) / 2.0,
            (self.max.z + self.min.z) / 2.0,
        )
    }

    /// Extent along each axis (`max − min`, never negative).
    pub fn size(&self) -> Vec3 {
        Vec3::new(
            self.max.x - self.min.x,
            self.max.y - self.min.y,
            self.max.z - self.min.z,
        )
    }
}
