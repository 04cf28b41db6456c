/// N-dimensional box addressed by an origin and an extent
///
/// Regions are the unit of every read, write, merge and finalize in the
/// scanner. Coordinates are always relative to the volume (or slab) the region
/// is applied to.

use std::fmt;

use ndarray::Slice;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Region {
    pub origin: Vec<usize>,
    pub extent: Vec<usize>,
}

impl Region {
    pub fn new(origin: Vec<usize>, extent: Vec<usize>) -> Self {
        debug_assert_eq!(origin.len(), extent.len());
        Self { origin, extent }
    }

    /// Region covering a whole shape
    pub fn full(shape: &[usize]) -> Self {
        Self {
            origin: vec![0; shape.len()],
            extent: shape.to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.origin.len()
    }

    pub fn voxel_count(&self) -> usize {
        self.extent.iter().product()
    }

    /// Exclusive far corner
    pub fn end(&self) -> Vec<usize> {
        self.origin
            .iter()
            .zip(&self.extent)
            .map(|(o, e)| o + e)
            .collect()
    }

    /// True when the region has the same rank as `shape` and lies inside it
    pub fn fits_within(&self, shape: &[usize]) -> bool {
        self.rank() == shape.len()
            && self
                .origin
                .iter()
                .zip(&self.extent)
                .zip(shape)
                .all(|((o, e), s)| o.checked_add(*e).map_or(false, |end| end <= *s))
    }

    /// Prepend an axis, e.g. a channel axis or a stacked chunk index
    pub fn with_leading(&self, origin: usize, extent: usize) -> Self {
        let mut o = Vec::with_capacity(self.rank() + 1);
        o.push(origin);
        o.extend_from_slice(&self.origin);
        let mut e = Vec::with_capacity(self.rank() + 1);
        e.push(extent);
        e.extend_from_slice(&self.extent);
        Self::new(o, e)
    }

    /// Slice along `axis`, for use with `slice_each_axis`
    pub fn axis_slice(&self, axis: usize) -> Slice {
        let start = self.origin[axis] as isize;
        Slice::from(start..start + self.extent[axis] as isize)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (axis, (o, e)) in self.origin.iter().zip(&self.extent).enumerate() {
            if axis > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}..{}", o, o + e)?;
        }
        write!(f, "]")
    }
}
