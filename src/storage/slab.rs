/// Chunk views over stacked volumes
///
/// A stacked volume holds independent sub-volumes along its outermost axis.
/// A slab fixes that index and presents the remaining axes as a volume of its
/// own, so the scanner can run on one chunk in chunk-local coordinates.

use ndarray::{ArrayD, ArrayViewD, Axis};

use crate::error::ScanResult;
use crate::region::Region;
use crate::storage::{Element, MappedVolume, VolumeRead, VolumeWrite};

/// Read-only view of one chunk
#[derive(Debug, Clone, Copy)]
pub struct Slab<'a, T: Element> {
    volume: &'a MappedVolume<T>,
    index: usize,
}

impl<'a, T: Element> Slab<'a, T> {
    pub(crate) fn new(volume: &'a MappedVolume<T>, index: usize) -> Self {
        Self { volume, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl<'a, T: Element> VolumeRead for Slab<'a, T> {
    type Elem = T;

    fn shape(&self) -> &[usize] {
        &self.volume.shape()[1..]
    }

    fn read_region(&self, region: &Region) -> ScanResult<ArrayD<T>> {
        let data = self.volume.read_region(&region.with_leading(self.index, 1))?;
        Ok(data.index_axis_move(Axis(0), 0))
    }
}

/// Writable view of one chunk
#[derive(Debug)]
pub struct SlabMut<'a, T: Element> {
    volume: &'a mut MappedVolume<T>,
    index: usize,
}

impl<'a, T: Element> SlabMut<'a, T> {
    pub(crate) fn new(volume: &'a mut MappedVolume<T>, index: usize) -> Self {
        Self { volume, index }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl<'a, T: Element> VolumeWrite for SlabMut<'a, T> {
    type Elem = T;

    fn shape(&self) -> &[usize] {
        &self.volume.shape()[1..]
    }

    fn write_region(&mut self, region: &Region, data: ArrayViewD<'_, T>) -> ScanResult<()> {
        self.volume
            .write_region(&region.with_leading(self.index, 1), data.insert_axis(Axis(0)))
    }

    fn flush(&mut self) -> ScanResult<()> {
        self.volume.flush()
    }
}
