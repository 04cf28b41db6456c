/// Blending weights for overlapping patches
///
/// A weight field is a pure function of the patch extent and the kernel, so a
/// scan computes it once and reuses it for every patch.

use std::sync::Arc;

use ndarray::{ArrayD, Axis, IxDyn};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Lower bound of a single axis profile. Keeps the product over all axes far
/// above the smallest positive f64 for any realistic rank.
pub const BUMP_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlendKernel {
    /// Every voxel weighs 1: plain averaging of overlapping predictions
    Uniform,
    /// Smooth taper, 1 at the patch center and close to 0 at its faces
    #[default]
    Bump,
}

/// Bump profile along one axis of `n` voxels, peak normalized to 1
pub fn bump_profile(n: usize) -> Vec<f64> {
    let center = (n as f64 - 1.0) / 2.0;
    let half = n as f64 / 2.0;
    let raw: Vec<f64> = (0..n)
        .map(|x| {
            let r = (x as f64 - center) / half;
            (1.0 - 1.0 / (1.0 - r * r)).exp()
        })
        .collect();
    let peak = raw.iter().cloned().fold(f64::MIN_POSITIVE, f64::max);
    raw.into_iter().map(|w| (w / peak).max(BUMP_FLOOR)).collect()
}

/// Weight field for a patch of `extent` voxels
pub fn weights(extent: &[usize], kernel: BlendKernel) -> ArrayD<f64> {
    match kernel {
        BlendKernel::Uniform => ArrayD::ones(IxDyn(extent)),
        BlendKernel::Bump => {
            // Outer product of the per-axis profiles
            let mut field = ArrayD::ones(IxDyn(extent));
            for (axis, &n) in extent.iter().enumerate() {
                let profile = bump_profile(n);
                for (i, mut lane) in field.axis_iter_mut(Axis(axis)).enumerate() {
                    lane *= profile[i];
                }
            }
            field
        }
    }
}

/// Caches weight fields by extent for one kernel
#[derive(Debug)]
pub struct BlendWeighter {
    kernel: BlendKernel,
    cache: FxHashMap<Vec<usize>, Arc<ArrayD<f64>>>,
}

impl BlendWeighter {
    pub fn new(kernel: BlendKernel) -> Self {
        Self {
            kernel,
            cache: FxHashMap::default(),
        }
    }

    pub fn kernel(&self) -> BlendKernel {
        self.kernel
    }

    pub fn weights(&mut self, extent: &[usize]) -> Arc<ArrayD<f64>> {
        let kernel = self.kernel;
        Arc::clone(
            self.cache
                .entry(extent.to_vec())
                .or_insert_with(|| Arc::new(weights(extent, kernel))),
        )
    }
}
