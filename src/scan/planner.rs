/// Patch origin planning
///
/// Origins are produced per axis and combined in row-major order (outermost
/// axis varies slowest). The last origin on every axis is clamped so the final
/// patch ends exactly on the volume's far edge.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{invalid_config, ScanResult};
use crate::scan::BlendKernel;

/// Stride along one axis
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisStride {
    /// Fraction of the patch shared with the neighbor, in [0, 1)
    Overlap(f64),
    /// Explicit step in voxels
    Voxels(usize),
}

impl AxisStride {
    /// Step in voxels for a patch of `extent` voxels
    pub fn step(&self, extent: usize) -> ScanResult<usize> {
        let step = match *self {
            AxisStride::Overlap(overlap) => {
                if !(0.0..1.0).contains(&overlap) {
                    return Err(invalid_config(format!("overlap {} is outside [0, 1)", overlap)));
                }
                ((extent as f64) * (1.0 - overlap)).round() as usize
            }
            AxisStride::Voxels(step) => step,
        };
        if step == 0 {
            return Err(invalid_config(format!(
                "{:?} gives a zero stride for a patch extent of {}",
                self, extent
            )));
        }
        Ok(step)
    }
}

/// Per-axis strides plus the kernel used to blend overlapping patches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StridePolicy {
    pub axes: Vec<AxisStride>,
    #[serde(default)]
    pub blend: BlendKernel,
}

impl StridePolicy {
    pub fn new(axes: Vec<AxisStride>, blend: BlendKernel) -> Self {
        Self { axes, blend }
    }

    /// Same fractional overlap on every axis
    pub fn uniform_overlap(rank: usize, overlap: f64, blend: BlendKernel) -> Self {
        Self::new(vec![AxisStride::Overlap(overlap); rank], blend)
    }
}

/// Deterministic set of patch origins for one volume
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPlan {
    volume_shape: Vec<usize>,
    extent: Vec<usize>,
    axis_origins: Arc<[Vec<usize>]>,
}

impl ScanPlan {
    pub fn volume_shape(&self) -> &[usize] {
        &self.volume_shape
    }

    /// Patch extent actually read and written, `min(patch, volume)` per axis
    pub fn effective_extent(&self) -> &[usize] {
        &self.extent
    }

    pub fn axis_origins(&self, axis: usize) -> &[usize] {
        &self.axis_origins[axis]
    }

    pub fn len(&self) -> usize {
        self.axis_origins.iter().map(Vec::len).product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh cursor at the start of the sequence
    pub fn cursor(&self) -> ScanCursor {
        ScanCursor {
            axis_origins: Arc::clone(&self.axis_origins),
            position: vec![0; self.axis_origins.len()],
            remaining: self.len(),
            last: None,
        }
    }
}

/// Build the scan plan for `volume_shape` with patches of `patch_extent`
pub fn plan(volume_shape: &[usize], patch_extent: &[usize], stride: &StridePolicy) -> ScanResult<ScanPlan> {
    let rank = volume_shape.len();
    if rank == 0 {
        return Err(invalid_config("cannot scan a zero-dimensional volume"));
    }
    if patch_extent.len() != rank || stride.axes.len() != rank {
        return Err(invalid_config(format!(
            "rank mismatch: volume {:?}, patch {:?}, {} stride axes",
            volume_shape,
            patch_extent,
            stride.axes.len()
        )));
    }
    if volume_shape.iter().chain(patch_extent).any(|&d| d == 0) {
        return Err(invalid_config(format!(
            "volume {:?} and patch {:?} need positive extents",
            volume_shape, patch_extent
        )));
    }

    let mut extent = Vec::with_capacity(rank);
    let mut axis_origins = Vec::with_capacity(rank);
    for axis in 0..rank {
        let e = patch_extent[axis].min(volume_shape[axis]);
        let step = stride.axes[axis].step(e)?;
        if step > e {
            log::warn!(
                "Stride {} exceeds patch extent {} on axis {}; voxels between patches will not be covered",
                step,
                e,
                axis
            );
        }
        axis_origins.push(axis_candidates(volume_shape[axis], e, step));
        extent.push(e);
    }

    let plan = ScanPlan {
        volume_shape: volume_shape.to_vec(),
        extent,
        axis_origins: axis_origins.into(),
    };
    log::debug!(
        "Planned {} patches of {:?} over {:?}",
        plan.len(),
        plan.extent,
        plan.volume_shape
    );
    Ok(plan)
}

/// `0, step, 2*step, ...` below the clamped last origin, then the last origin
fn axis_candidates(axis_len: usize, extent: usize, step: usize) -> Vec<usize> {
    let last = axis_len.saturating_sub(extent);
    let mut origins: Vec<usize> = (0..last).step_by(step).collect();
    origins.push(last);
    origins
}

/// Enumeration state over a plan's origins
#[derive(Debug, Clone)]
pub struct ScanCursor {
    axis_origins: Arc<[Vec<usize>]>,
    /// Index into each axis' origin list
    position: Vec<usize>,
    remaining: usize,
    last: Option<Vec<usize>>,
}

impl ScanCursor {
    /// Most recently emitted origin
    pub fn last_emitted(&self) -> Option<&[usize]> {
        self.last.as_deref()
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl Iterator for ScanCursor {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.remaining == 0 {
            return None;
        }

        let origin: Vec<usize> = self
            .position
            .iter()
            .zip(self.axis_origins.iter())
            .map(|(&i, origins)| origins[i])
            .collect();

        self.remaining -= 1;
        for axis in (0..self.position.len()).rev() {
            self.position[axis] += 1;
            if self.position[axis] < self.axis_origins[axis].len() {
                break;
            }
            self.position[axis] = 0;
        }

        self.last = Some(origin.clone());
        Some(origin)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for ScanCursor {}
