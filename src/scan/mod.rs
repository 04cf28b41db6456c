//! Forward scanning engine
//!
//! Plans overlapping patches over a volume, runs an injected inference
//! function on each one and blends the predictions back into a dense output
//! volume.

pub mod accumulator;
pub mod blend;
pub mod forward;
pub mod planner;
pub mod prefetch;

pub use accumulator::Accumulator;
pub use blend::{BlendKernel, BlendWeighter};
pub use forward::{ForwardScanner, ScanReport, ScanState};
pub use planner::{plan, AxisStride, ScanCursor, ScanPlan, StridePolicy};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{invalid_config, ScanResult};

/// Default number of patches read ahead of the inference call
pub const DEFAULT_PREFETCH_DEPTH: usize = 1;

/// The model boundary: one patch in, one prediction out
///
/// The patch is laid out as `[input channels] + extent` and the prediction
/// must be `[output channels] + extent`. Activation, device placement and
/// weights all belong to the implementor.
pub trait Inference {
    fn infer(&mut self, patch: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>>;
}

impl<F> Inference for F
where
    F: FnMut(ArrayD<f32>) -> anyhow::Result<ArrayD<f32>>,
{
    fn infer(&mut self, patch: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        self(patch)
    }
}

fn one() -> usize {
    1
}

/// Named patch description: channel count plus spatial extent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSpec {
    pub name: String,
    #[serde(default = "one")]
    pub channels: usize,
    pub extent: Vec<usize>,
}

impl PatchSpec {
    pub fn new(name: impl Into<String>, channels: usize, extent: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            channels,
            extent,
        }
    }
}

/// Which prediction channels reach the output volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSelection {
    /// Every channel; the output volume has a leading channel axis
    #[default]
    All,
    /// One channel; the output volume has the bare spatial shape
    Single(usize),
}

/// When finalized voxels are written to the output volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitPolicy {
    /// One write of the full extent after the last patch
    #[default]
    WholeChunk,
    /// Rows along the outermost axis are written as soon as no later patch
    /// can touch them; buffers stay one patch deep
    Streaming,
}

/// Everything the scanner needs besides the volumes and the model
#[derive(Debug, Clone, PartialEq)]
pub struct ScanSpec {
    pub input: PatchSpec,
    pub output: PatchSpec,
    pub stride: StridePolicy,
    pub channels: ChannelSelection,
    pub commit: CommitPolicy,
    pub prefetch_depth: usize,
    /// Multiplier applied to raw input intensities before inference
    pub input_scale: Option<f32>,
}

impl ScanSpec {
    pub fn new(input: PatchSpec, output: PatchSpec, stride: StridePolicy) -> ScanResult<Self> {
        let spec = Self {
            input,
            output,
            stride,
            channels: ChannelSelection::default(),
            commit: CommitPolicy::default(),
            prefetch_depth: DEFAULT_PREFETCH_DEPTH,
            input_scale: None,
        };
        spec.validate()?;
        Ok(spec)
    }

    pub fn with_channels(mut self, channels: ChannelSelection) -> ScanResult<Self> {
        self.channels = channels;
        self.validate()?;
        Ok(self)
    }

    pub fn with_commit(mut self, commit: CommitPolicy) -> Self {
        self.commit = commit;
        self
    }

    pub fn with_prefetch_depth(mut self, depth: usize) -> Self {
        self.prefetch_depth = depth;
        self
    }

    pub fn with_input_scale(mut self, scale: Option<f32>) -> Self {
        self.input_scale = scale;
        self
    }

    pub fn spatial_rank(&self) -> usize {
        self.input.extent.len()
    }

    /// Number of channels the accumulator keeps
    pub fn kept_channels(&self) -> usize {
        match self.channels {
            ChannelSelection::All => self.output.channels,
            ChannelSelection::Single(_) => 1,
        }
    }

    /// Output shape for a given spatial shape
    pub fn output_shape(&self, spatial: &[usize]) -> Vec<usize> {
        match self.channels {
            ChannelSelection::All => {
                let mut shape = vec![self.output.channels];
                shape.extend_from_slice(spatial);
                shape
            }
            ChannelSelection::Single(_) => spatial.to_vec(),
        }
    }

    pub fn validate(&self) -> ScanResult<()> {
        if self.input.extent.is_empty() {
            return Err(invalid_config(format!("patch '{}' has no spatial axes", self.input.name)));
        }
        if self.input.extent != self.output.extent {
            return Err(invalid_config(format!(
                "patch '{}' extent {:?} differs from patch '{}' extent {:?}",
                self.input.name, self.input.extent, self.output.name, self.output.extent
            )));
        }
        if self.stride.axes.len() != self.input.extent.len() {
            return Err(invalid_config(format!(
                "stride policy has {} axes for a {}-dimensional patch",
                self.stride.axes.len(),
                self.input.extent.len()
            )));
        }
        if self.input.channels == 0 || self.output.channels == 0 {
            return Err(invalid_config("patch channel counts must be positive"));
        }
        if let ChannelSelection::Single(c) = self.channels {
            if c >= self.output.channels {
                return Err(invalid_config(format!(
                    "channel {} selected but '{}' has {} channels",
                    c, self.output.name, self.output.channels
                )));
            }
        }
        Ok(())
    }
}
