//! Out-of-core volume storage
//!
//! Volumes live in NPY containers that are memory-mapped rather than read:
//! a region read copies only the voxels inside the requested box, and a region
//! write touches only the mapped pages that back it. Nothing here ever
//! materializes a whole volume.

pub mod element;
pub mod npy;
pub mod slab;

pub use element::{Dtype, Element};
pub use npy::NpyHeader;
pub use slab::{Slab, SlabMut};

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapMut, MmapOptions};
use ndarray::{ArrayD, ArrayViewD, IxDyn};

use crate::error::{storage_error, IoResultExt, ScanError, ScanResult};
use crate::region::Region;

/// How a volume file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read-only
    Read,
    /// New file with a declared shape, zero-filled
    Create,
    /// Existing file opened for random-region writes
    ReadWrite,
}

/// Read access to a dense N-dimensional volume
pub trait VolumeRead: Sync {
    type Elem: Element;

    fn shape(&self) -> &[usize];

    fn read_region(&self, region: &Region) -> ScanResult<ArrayD<Self::Elem>>;
}

/// Write access to a dense N-dimensional volume
pub trait VolumeWrite {
    type Elem: Element;

    fn shape(&self) -> &[usize];

    fn write_region(&mut self, region: &Region, data: ArrayViewD<'_, Self::Elem>) -> ScanResult<()>;

    fn flush(&mut self) -> ScanResult<()>;
}

enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::ReadOnly(mmap) => &mmap[..],
            Mapping::Writable(mmap) => &mmap[..],
        }
    }
}

/// Memory-mapped NPY volume with element type `T`
pub struct MappedVolume<T: Element> {
    path: PathBuf,
    mode: OpenMode,
    shape: Vec<usize>,
    strides: Vec<usize>,
    data_offset: usize,
    data_len: usize,
    mapping: Mapping,
    _file: File,
    _marker: PhantomData<T>,
}

impl<T: Element> std::fmt::Debug for MappedVolume<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedVolume")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("dtype", &T::DTYPE)
            .field("shape", &self.shape)
            .finish()
    }
}

impl<T: Element> MappedVolume<T> {
    /// Open a volume. `shape` is required for `Create` and rejected otherwise.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode, shape: Option<&[usize]>) -> ScanResult<Self> {
        let path = path.as_ref();
        match (mode, shape) {
            (OpenMode::Create, Some(shape)) => Self::create(path, shape),
            (OpenMode::Create, None) => Err(storage_error(path, "a shape is required to create a volume")),
            (_, Some(_)) => Err(storage_error(
                path,
                "a shape may only be declared when creating a volume",
            )),
            (mode, None) => Self::open_existing(path, mode),
        }
    }

    /// Create a zero-filled volume with the declared shape, replacing any
    /// existing file
    pub fn create(path: impl AsRef<Path>, shape: &[usize]) -> ScanResult<Self> {
        let path = path.as_ref();
        check_host_endianness(path)?;
        if shape.is_empty() || shape.iter().any(|&d| d == 0) {
            return Err(storage_error(
                path,
                format!("shape {:?} must have at least one axis and positive extents", shape),
            ));
        }

        let header = NpyHeader::encode(T::DTYPE, shape);
        let data_len = npy::byte_len(T::DTYPE, shape)
            .ok_or_else(|| storage_error(path, format!("shape {:?} overflows the address space", shape)))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_path(path)?;
        file.write_all(&header).with_path(path)?;
        file.set_len((header.len() + data_len) as u64).with_path(path)?;

        // SAFETY: the file was just created and sized by us; the mapping stays
        // valid for the lifetime of `file`, which this struct owns. Concurrent
        // writers on other handles must keep to disjoint regions.
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }.with_path(path)?;

        log::debug!("Created volume {} with shape {:?} ({})", path.display(), shape, T::DTYPE);

        Ok(Self {
            path: path.to_path_buf(),
            mode: OpenMode::Create,
            strides: row_major_strides(shape),
            shape: shape.to_vec(),
            data_offset: header.len(),
            data_len,
            mapping: Mapping::Writable(mmap),
            _file: file,
            _marker: PhantomData,
        })
    }

    fn open_existing(path: &Path, mode: OpenMode) -> ScanResult<Self> {
        check_host_endianness(path)?;
        let writable = mode == OpenMode::ReadWrite;
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => storage_error(path, "volume file does not exist"),
                _ => ScanError::Io {
                    path: path.to_path_buf(),
                    source: e,
                },
            })?;

        // SAFETY: the file handle is owned by the returned volume, so the
        // mapping cannot outlive it. The file must not be truncated by other
        // processes while mapped.
        let mapping = if writable {
            Mapping::Writable(unsafe { MmapOptions::new().map_mut(&file) }.with_path(path)?)
        } else {
            Mapping::ReadOnly(unsafe { MmapOptions::new().map(&file) }.with_path(path)?)
        };

        let header = NpyHeader::parse(mapping.bytes(), path)?;
        if header.dtype != T::DTYPE {
            return Err(storage_error(
                path,
                format!("dtype mismatch: file holds {}, requested {}", header.dtype, T::DTYPE),
            ));
        }

        let volume = Self {
            path: path.to_path_buf(),
            mode,
            strides: row_major_strides(&header.shape),
            data_len: header.data_len,
            shape: header.shape,
            data_offset: header.data_offset,
            mapping,
            _file: file,
            _marker: PhantomData,
        };
        // Validate alignment once so later reads cannot fail on it
        volume.elements()?;
        Ok(volume)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn dtype(&self) -> Dtype {
        T::DTYPE
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn elements(&self) -> ScanResult<&[T]> {
        let bytes = &self.mapping.bytes()[self.data_offset..self.data_offset + self.data_len];
        bytemuck::try_cast_slice(bytes)
            .map_err(|e| storage_error(&self.path, format!("data block cannot be viewed as {}: {}", T::DTYPE, e)))
    }

    fn elements_mut(&mut self) -> ScanResult<&mut [T]> {
        let range = self.data_offset..self.data_offset + self.data_len;
        let path = &self.path;
        match &mut self.mapping {
            Mapping::Writable(mmap) => bytemuck::try_cast_slice_mut(&mut mmap[range])
                .map_err(|e| storage_error(path, format!("data block cannot be viewed as {}: {}", T::DTYPE, e))),
            Mapping::ReadOnly(_) => Err(storage_error(path, "volume is opened read-only")),
        }
    }

    fn check_bounds(&self, region: &Region) -> ScanResult<()> {
        if region.fits_within(&self.shape) {
            Ok(())
        } else {
            Err(ScanError::Bounds {
                path: self.path.clone(),
                region: region.clone(),
                shape: self.shape.clone(),
            })
        }
    }

    /// Copy the voxels inside `region` into an owned array
    pub fn read_region(&self, region: &Region) -> ScanResult<ArrayD<T>> {
        self.check_bounds(region)?;
        let src = self.elements()?;
        let mut out = Vec::with_capacity(region.voxel_count());
        for_each_run(&self.shape, &self.strides, region, |offset, len| {
            out.extend_from_slice(&src[offset..offset + len]);
        });
        ArrayD::from_shape_vec(IxDyn(&region.extent), out)
            .map_err(|e| storage_error(&self.path, format!("region {} could not be shaped: {}", region, e)))
    }

    /// Write `data` into `region`; `data` must have exactly the region's extent
    pub fn write_region(&mut self, region: &Region, data: ArrayViewD<'_, T>) -> ScanResult<()> {
        self.check_bounds(region)?;
        if data.shape() != region.extent.as_slice() {
            return Err(ScanError::Bounds {
                path: self.path.clone(),
                region: Region::new(region.origin.clone(), data.shape().to_vec()),
                shape: self.shape.clone(),
            });
        }

        let data = data.as_standard_layout();
        let src = data
            .as_slice()
            .ok_or_else(|| storage_error(&self.path, "region data is not contiguous"))?;
        let shape = self.shape.clone();
        let strides = self.strides.clone();
        let dst = self.elements_mut()?;

        let mut cursor = 0;
        for_each_run(&shape, &strides, region, |offset, len| {
            dst[offset..offset + len].copy_from_slice(&src[cursor..cursor + len]);
            cursor += len;
        });
        Ok(())
    }

    pub fn flush(&mut self) -> ScanResult<()> {
        match &self.mapping {
            Mapping::Writable(mmap) => mmap.flush().with_path(&self.path),
            Mapping::ReadOnly(_) => Ok(()),
        }
    }

    /// Read view of one entry along the outermost axis
    pub fn slab(&self, index: usize) -> ScanResult<Slab<'_, T>> {
        self.check_slab_index(index)?;
        Ok(Slab::new(self, index))
    }

    /// Write view of one entry along the outermost axis
    pub fn slab_mut(&mut self, index: usize) -> ScanResult<SlabMut<'_, T>> {
        self.check_slab_index(index)?;
        Ok(SlabMut::new(self, index))
    }

    fn check_slab_index(&self, index: usize) -> ScanResult<()> {
        if self.shape.len() < 2 {
            return Err(storage_error(&self.path, "slabs need a volume with at least two axes"));
        }
        let mut extent = self.shape.clone();
        extent[0] = 1;
        let mut origin = vec![0; self.shape.len()];
        origin[0] = index;
        self.check_bounds(&Region::new(origin, extent))
    }
}

impl<T: Element> VolumeRead for MappedVolume<T> {
    type Elem = T;

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn read_region(&self, region: &Region) -> ScanResult<ArrayD<T>> {
        MappedVolume::read_region(self, region)
    }
}

impl<T: Element> VolumeWrite for MappedVolume<T> {
    type Elem = T;

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn write_region(&mut self, region: &Region, data: ArrayViewD<'_, T>) -> ScanResult<()> {
        MappedVolume::write_region(self, region, data)
    }

    fn flush(&mut self) -> ScanResult<()> {
        MappedVolume::flush(self)
    }
}

fn check_host_endianness(path: &Path) -> ScanResult<()> {
    if cfg!(target_endian = "big") {
        return Err(storage_error(path, "little-endian volumes cannot be mapped on a big-endian host"));
    }
    Ok(())
}

pub(crate) fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }
    strides
}

/// Visit the contiguous element runs of `region` in row-major order
///
/// Trailing axes that the region covers completely are folded into a single
/// run, so a region spanning whole rows costs one call per outer index.
fn for_each_run(shape: &[usize], strides: &[usize], region: &Region, mut f: impl FnMut(usize, usize)) {
    let rank = shape.len();
    if rank == 0 {
        f(0, 1);
        return;
    }
    if region.voxel_count() == 0 {
        return;
    }

    let mut run_axis = rank - 1;
    while run_axis > 0 && region.origin[run_axis] == 0 && region.extent[run_axis] == shape[run_axis] {
        run_axis -= 1;
    }
    let run_len: usize = region.extent[run_axis..].iter().product();
    let run_start = region.origin[run_axis] * strides[run_axis];

    let mut index = vec![0usize; run_axis];
    loop {
        let offset: usize = index
            .iter()
            .enumerate()
            .map(|(axis, i)| (region.origin[axis] + i) * strides[axis])
            .sum::<usize>()
            + run_start;
        f(offset, run_len);

        // Odometer over the outer axes, last one fastest
        let mut axis = run_axis;
        loop {
            if axis == 0 {
                return;
            }
            axis -= 1;
            index[axis] += 1;
            if index[axis] < region.extent[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use tempfile::TempDir;

    fn ramp(shape: &[usize]) -> ArrayD<f32> {
        let n: usize = shape.iter().product();
        Array::from_shape_vec(IxDyn(shape), (0..n).map(|v| v as f32).collect())
            .expect("Failed to build ramp")
    }

    #[test]
    fn test_create_requires_shape() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("out.npy");
        let err = MappedVolume::<f32>::open(&path, OpenMode::Create, None).expect_err("create without shape");
        assert!(matches!(err, ScanError::Storage { .. }));
    }

    #[test]
    fn test_read_rejects_shape_and_missing_file() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("missing.npy");
        let err = MappedVolume::<f32>::open(&path, OpenMode::Read, None).expect_err("missing file");
        assert!(matches!(err, ScanError::Storage { .. }));

        MappedVolume::<f32>::create(&path, &[2, 2]).expect("Failed to create volume");
        let err = MappedVolume::<f32>::open(&path, OpenMode::Read, Some(&[2, 2])).expect_err("shape on read");
        assert!(matches!(err, ScanError::Storage { .. }));
    }

    #[test]
    fn test_dtype_mismatch() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("f64.npy");
        MappedVolume::<f64>::create(&path, &[4, 4]).expect("Failed to create volume");

        let err = MappedVolume::<f32>::open(&path, OpenMode::Read, None).expect_err("dtype mismatch");
        match err {
            ScanError::Storage { reason, .. } => assert!(reason.contains("dtype mismatch")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_corrupt_header() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("corrupt.npy");
        std::fs::write(&path, b"definitely not numpy").expect("Failed to write file");
        let err = MappedVolume::<f32>::open(&path, OpenMode::Read, None).expect_err("corrupt header");
        assert!(matches!(err, ScanError::Storage { .. }));
    }

    #[test]
    fn test_overflowing_header_shape_is_storage_error() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("huge.npy");
        let dict = "{'descr': '<f4', 'fortran_order': False, 'shape': (4294967296, 4294967296, 4294967296), }";
        let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
        bytes.extend_from_slice(&(128u16 - 10).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.resize(127, b' ');
        bytes.push(b'\n');
        bytes.extend_from_slice(&[0; 16]);
        std::fs::write(&path, &bytes).expect("Failed to write file");

        let err = MappedVolume::<f32>::open(&path, OpenMode::Read, None).expect_err("overflowing shape");
        assert!(matches!(err, ScanError::Storage { .. }));
    }

    #[test]
    fn test_region_round_trip_is_bit_exact() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("volume.npy");
        let mut volume = MappedVolume::<f32>::create(&path, &[6, 7, 8]).expect("Failed to create volume");

        let region = Region::new(vec![1, 2, 3], vec![4, 3, 5]);
        let data = ramp(&region.extent).mapv(|v| v * 0.1 + f32::EPSILON);
        volume.write_region(&region, data.view()).expect("Failed to write region");
        volume.flush().expect("Failed to flush");
        drop(volume);

        let volume = MappedVolume::<f32>::open(&path, OpenMode::Read, None).expect("Failed to reopen");
        let back = volume.read_region(&region).expect("Failed to read region");
        for (a, b) in data.iter().zip(back.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }

        // Untouched voxels stay zero
        let corner = volume.read_region(&Region::new(vec![0, 0, 0], vec![1, 7, 8])).expect("Failed to read");
        assert!(corner.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_full_rows_fold_into_single_runs() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("rows.npy");
        let mut volume = MappedVolume::<f32>::create(&path, &[5, 4, 3]).expect("Failed to create volume");
        let all = ramp(&[5, 4, 3]);
        volume.write_region(&Region::full(&[5, 4, 3]), all.view()).expect("Failed to write");

        let region = Region::new(vec![2, 0, 0], vec![2, 4, 3]);
        let slab = volume.read_region(&region).expect("Failed to read");
        let expected: Vec<f32> = (24..48).map(|v| v as f32).collect();
        assert_eq!(slab.iter().copied().collect::<Vec<_>>(), expected);

        let mut runs = Vec::new();
        for_each_run(&[5, 4, 3], &row_major_strides(&[5, 4, 3]), &region, |o, l| runs.push((o, l)));
        assert_eq!(runs, vec![(24, 24)]);
    }

    #[test]
    fn test_out_of_bounds_and_shape_mismatch() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("bounds.npy");
        let mut volume = MappedVolume::<f32>::create(&path, &[4, 4, 4]).expect("Failed to create volume");

        let outside = Region::new(vec![2, 0, 0], vec![3, 4, 4]);
        assert!(matches!(volume.read_region(&outside), Err(ScanError::Bounds { .. })));

        let region = Region::new(vec![0, 0, 0], vec![2, 2, 2]);
        let wrong = ArrayD::<f32>::zeros(IxDyn(&[2, 2, 3]));
        assert!(matches!(volume.write_region(&region, wrong.view()), Err(ScanError::Bounds { .. })));

        let fits = ArrayD::<f32>::ones(IxDyn(&[3, 4, 4]));
        assert!(matches!(volume.write_region(&outside, fits.view()), Err(ScanError::Bounds { .. })));
        let untouched = volume.read_region(&Region::full(&[4, 4, 4])).expect("Failed to read volume");
        assert!(untouched.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_read_only_volume_rejects_writes() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("ro.npy");
        MappedVolume::<f32>::create(&path, &[2, 2]).expect("Failed to create volume");

        let mut volume = MappedVolume::<f32>::open(&path, OpenMode::Read, None).expect("Failed to open");
        let data = ArrayD::<f32>::ones(IxDyn(&[2, 2]));
        let err = volume.write_region(&Region::full(&[2, 2]), data.view()).expect_err("read-only write");
        assert!(matches!(err, ScanError::Storage { .. }));
    }

    #[test]
    fn test_read_write_handles_share_the_file() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("shared.npy");
        MappedVolume::<f64>::create(&path, &[2, 3]).expect("Failed to create volume");

        let mut a = MappedVolume::<f64>::open(&path, OpenMode::ReadWrite, None).expect("Failed to open");
        let mut b = MappedVolume::<f64>::open(&path, OpenMode::ReadWrite, None).expect("Failed to open");
        let row = ArrayD::<f64>::from_elem(IxDyn(&[1, 3]), 1.5);
        a.write_region(&Region::new(vec![0, 0], vec![1, 3]), row.view()).expect("Failed to write");
        b.write_region(&Region::new(vec![1, 0], vec![1, 3]), (&row * 2.0).view()).expect("Failed to write");
        a.flush().expect("Failed to flush");
        b.flush().expect("Failed to flush");

        let volume = MappedVolume::<f64>::open(&path, OpenMode::Read, None).expect("Failed to open");
        let all = volume.read_region(&Region::full(&[2, 3])).expect("Failed to read");
        assert_eq!(all.iter().copied().collect::<Vec<_>>(), vec![1.5, 1.5, 1.5, 3.0, 3.0, 3.0]);
    }
}
