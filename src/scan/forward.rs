/// Forward scanning of a volume with an injected inference function
///
/// One scanner performs one pass: plan, then read, infer and merge patch by
/// patch, then finalize and commit. The scanner borrows its volumes and the
/// model only for the duration of `run`.

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info};
use ndarray::{ArrayD, Axis, Slice};

use crate::error::{ScanError, ScanResult};
use crate::region::Region;
use crate::scan::{
    planner, prefetch, Accumulator, BlendWeighter, ChannelSelection, CommitPolicy, Inference,
    ScanSpec,
};
use crate::storage::{Element, VolumeRead, VolumeWrite};

/// Lifecycle of a scanner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Scanning,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "idle",
            ScanState::Scanning => "scanning",
            ScanState::Finalizing => "finalizing",
            ScanState::Done => "done",
            ScanState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Summary of a completed scan
#[derive(Debug, Clone, PartialEq)]
pub struct ScanReport {
    pub chunk: Option<usize>,
    pub patches: usize,
    pub writes: usize,
    pub elapsed: Duration,
}

/// How the input volume maps onto `[channels] + spatial`
#[derive(Debug, Clone)]
pub(crate) struct InputLayout {
    pub(crate) spatial: Vec<usize>,
    channel_axis: bool,
    channels: usize,
}

impl InputLayout {
    pub(crate) fn resolve(shape: &[usize], spec: &ScanSpec) -> ScanResult<Self> {
        let rank = spec.spatial_rank();
        if shape.len() == rank && spec.input.channels == 1 {
            return Ok(Self {
                spatial: shape.to_vec(),
                channel_axis: false,
                channels: 1,
            });
        }
        if shape.len() == rank + 1 && shape[0] == spec.input.channels {
            return Ok(Self {
                spatial: shape[1..].to_vec(),
                channel_axis: true,
                channels: shape[0],
            });
        }

        let mut expected = vec![spec.input.channels];
        expected.extend(std::iter::repeat(0).take(rank));
        Err(ScanError::ShapeMismatch {
            context: format!(
                "input volume for patch '{}' ({} channels, {} spatial axes; 0 = any)",
                spec.input.name, spec.input.channels, rank
            ),
            expected,
            found: shape.to_vec(),
        })
    }

    fn region(&self, origin: &[usize], extent: &[usize]) -> Region {
        let spatial = Region::new(origin.to_vec(), extent.to_vec());
        if self.channel_axis {
            spatial.with_leading(0, self.channels)
        } else {
            spatial
        }
    }
}

pub struct ForwardScanner {
    spec: ScanSpec,
    state: ScanState,
    chunk: Option<usize>,
    weighter: BlendWeighter,
}

impl ForwardScanner {
    pub fn new(spec: ScanSpec) -> Self {
        let weighter = BlendWeighter::new(spec.stride.blend);
        Self {
            spec,
            state: ScanState::Idle,
            chunk: None,
            weighter,
        }
    }

    /// Tag errors and logs with the index of the chunk being scanned
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = Some(chunk);
        self
    }

    pub fn spec(&self) -> &ScanSpec {
        &self.spec
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Scan `input` and write blended predictions into `output`
    ///
    /// Shapes are checked before the first patch is read. Any failure leaves
    /// the scanner in `Failed`; a scanner only ever runs once.
    pub fn run<S, D, I>(&mut self, input: &S, output: &mut D, inference: &mut I) -> ScanResult<ScanReport>
    where
        S: VolumeRead,
        D: VolumeWrite,
        I: Inference + ?Sized,
    {
        if self.state != ScanState::Idle {
            return Err(ScanError::ScannerState {
                state: self.state.to_string(),
            });
        }

        let result = self.scan(input, output, inference);
        self.state = match result {
            Ok(_) => ScanState::Done,
            Err(_) => ScanState::Failed,
        };
        result
    }

    fn scan<S, D, I>(&mut self, input: &S, output: &mut D, inference: &mut I) -> ScanResult<ScanReport>
    where
        S: VolumeRead,
        D: VolumeWrite,
        I: Inference + ?Sized,
    {
        let start = Instant::now();
        let layout = InputLayout::resolve(input.shape(), &self.spec)?;

        let expected = self.spec.output_shape(&layout.spatial);
        if output.shape() != expected.as_slice() {
            return Err(ScanError::ShapeMismatch {
                context: format!("output volume for patch '{}'", self.spec.output.name),
                expected,
                found: output.shape().to_vec(),
            });
        }

        let plan = planner::plan(&layout.spatial, &self.spec.input.extent, &self.spec.stride)?;
        let extent = plan.effective_extent().to_vec();
        let weights = self.weighter.weights(&extent);

        let kept = self.spec.kept_channels();
        let mut accumulator = match self.spec.commit {
            CommitPolicy::WholeChunk => Accumulator::new(kept, &layout.spatial),
            CommitPolicy::Streaming => Accumulator::windowed(kept, &layout.spatial, extent[0]),
        }
        .with_chunk(self.chunk);

        let chunk = self.chunk;
        let selection = self.spec.channels;
        let commit = self.spec.commit;
        let scale = self.spec.input_scale;
        let mut prediction_shape = vec![self.spec.output.channels];
        prediction_shape.extend_from_slice(&extent);

        debug!(
            "Scanning {:?} with {} patches of {:?}{}",
            layout.spatial,
            plan.len(),
            extent,
            chunk.map(|c| format!(" (chunk {})", c)).unwrap_or_default()
        );
        self.state = ScanState::Scanning;

        let mut patches = 0usize;
        let mut writes = 0usize;

        let read = |origin: &[usize]| -> ScanResult<ArrayD<f32>> {
            let raw = input.read_region(&layout.region(origin, &extent))?;
            let patch = match scale {
                Some(scale) => raw.mapv(|v| v.to_f32() * scale),
                None => raw.mapv(|v| v.to_f32()),
            };
            Ok(if layout.channel_axis {
                patch
            } else {
                patch.insert_axis(Axis(0))
            })
        };

        prefetch::for_each_patch(&plan, self.spec.prefetch_depth, read, |origin, patch| {
            let prediction = inference.infer(patch).map_err(|source| ScanError::Inference {
                chunk,
                origin: origin.clone(),
                source,
            })?;
            if prediction.shape() != prediction_shape.as_slice() {
                return Err(ScanError::Inference {
                    chunk,
                    origin,
                    source: anyhow::anyhow!(
                        "prediction has shape {:?}, expected {:?}",
                        prediction.shape(),
                        prediction_shape
                    ),
                });
            }

            if commit == CommitPolicy::Streaming {
                if let Some((region, data)) = accumulator.drain_rows::<D::Elem>(origin[0])? {
                    write_committed(&mut *output, selection, kept, &region, data)?;
                    writes += 1;
                }
            }

            let selected = match selection {
                ChannelSelection::All => prediction.view(),
                ChannelSelection::Single(c) => prediction.slice_axis(Axis(0), Slice::from(c..c + 1)),
            };
            accumulator.merge(&origin, selected, weights.view())?;
            patches += 1;
            Ok(())
        })?;

        self.state = ScanState::Finalizing;
        match commit {
            CommitPolicy::WholeChunk => {
                let region = Region::full(&layout.spatial);
                let data = accumulator.finalize::<D::Elem>(&region)?;
                write_committed(output, selection, kept, &region, data)?;
                writes += 1;
            }
            CommitPolicy::Streaming => {
                if let Some((region, data)) = accumulator.drain_rows::<D::Elem>(layout.spatial[0])? {
                    write_committed(output, selection, kept, &region, data)?;
                    writes += 1;
                }
            }
        }
        output.flush()?;

        let elapsed = start.elapsed();
        info!(
            "Scanned {} patches into {} write(s) in {:.2?}{}",
            patches,
            writes,
            elapsed,
            chunk.map(|c| format!(" (chunk {})", c)).unwrap_or_default()
        );
        Ok(ScanReport {
            chunk,
            patches,
            writes,
            elapsed,
        })
    }
}

/// Write finalized `[kept] + region` data at `region` of the output volume
fn write_committed<D, T>(
    output: &mut D,
    selection: ChannelSelection,
    kept: usize,
    region: &Region,
    data: ArrayD<T>,
) -> ScanResult<()>
where
    D: VolumeWrite<Elem = T>,
    T: Element,
{
    match selection {
        ChannelSelection::All => output.write_region(&region.with_leading(0, kept), data.view()),
        ChannelSelection::Single(_) => output.write_region(region, data.index_axis_move(Axis(0), 0).view()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::{AxisStride, BlendKernel, PatchSpec, StridePolicy};
    use ndarray::IxDyn;

    /// In-memory volume that counts writes
    struct MemoryVolume {
        data: ArrayD<f32>,
        writes: usize,
    }

    impl MemoryVolume {
        fn new(shape: &[usize]) -> Self {
            Self {
                data: ArrayD::zeros(IxDyn(shape)),
                writes: 0,
            }
        }
    }

    impl VolumeRead for MemoryVolume {
        type Elem = f32;

        fn shape(&self) -> &[usize] {
            self.data.shape()
        }

        fn read_region(&self, region: &Region) -> ScanResult<ArrayD<f32>> {
            Ok(self
                .data
                .slice_each_axis(|ax| region.axis_slice(ax.axis.index()))
                .to_owned())
        }
    }

    impl VolumeWrite for MemoryVolume {
        type Elem = f32;

        fn shape(&self) -> &[usize] {
            self.data.shape()
        }

        fn write_region(&mut self, region: &Region, data: ndarray::ArrayViewD<'_, f32>) -> ScanResult<()> {
            self.data
                .slice_each_axis_mut(|ax| region.axis_slice(ax.axis.index()))
                .assign(&data);
            self.writes += 1;
            Ok(())
        }

        fn flush(&mut self) -> ScanResult<()> {
            Ok(())
        }
    }

    fn spec(extent: Vec<usize>, overlap: f64, blend: BlendKernel) -> ScanSpec {
        let rank = extent.len();
        ScanSpec::new(
            PatchSpec::new("input", 1, extent.clone()),
            PatchSpec::new("output", 1, extent),
            StridePolicy::uniform_overlap(rank, overlap, blend),
        )
        .expect("Failed to build scan spec")
    }

    fn ramp(shape: &[usize]) -> MemoryVolume {
        let count: usize = shape.iter().product();
        let data = ArrayD::from_shape_vec(IxDyn(shape), (0..count).map(|v| v as f32 * 0.25).collect())
            .expect("Failed to build ramp");
        MemoryVolume { data, writes: 0 }
    }

    fn identity(patch: ArrayD<f32>) -> anyhow::Result<ArrayD<f32>> {
        Ok(patch)
    }

    #[test]
    fn test_identity_reproduces_input_with_single_write() {
        let input = ramp(&[12, 10]);
        let mut output = MemoryVolume::new(&[1, 12, 10]);
        let mut scanner = ForwardScanner::new(spec(vec![5, 4], 0.5, BlendKernel::Bump));

        let report = scanner
            .run(&input, &mut output, &mut identity)
            .expect("Failed to scan");

        assert_eq!(scanner.state(), ScanState::Done);
        assert_eq!(report.writes, 1);
        assert_eq!(output.writes, 1);
        for (a, b) in input.data.iter().zip(output.data.iter()) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_second_run_is_rejected() {
        let input = ramp(&[4, 4]);
        let mut output = MemoryVolume::new(&[1, 4, 4]);
        let mut scanner = ForwardScanner::new(spec(vec![4, 4], 0.0, BlendKernel::Uniform));
        scanner.run(&input, &mut output, &mut identity).expect("Failed to scan");

        let err = scanner.run(&input, &mut output, &mut identity).unwrap_err();
        assert!(matches!(err, ScanError::ScannerState { .. }));
    }

    #[test]
    fn test_shape_mismatch_before_any_inference() {
        let input = ramp(&[8, 8]);
        let mut output = MemoryVolume::new(&[1, 8, 7]);
        let mut calls = 0usize;
        let mut counting = |patch: ArrayD<f32>| -> anyhow::Result<ArrayD<f32>> {
            calls += 1;
            Ok(patch)
        };
        let mut scanner = ForwardScanner::new(spec(vec![4, 4], 0.5, BlendKernel::Bump));

        let err = scanner.run(&input, &mut output, &mut counting).unwrap_err();
        assert!(matches!(err, ScanError::ShapeMismatch { .. }));
        assert_eq!(scanner.state(), ScanState::Failed);
        assert_eq!(calls, 0);
        assert_eq!(output.writes, 0);
    }

    #[test]
    fn test_inference_error_carries_origin() {
        let input = ramp(&[8, 8]);
        let mut output = MemoryVolume::new(&[1, 8, 8]);
        let mut failing = |patch: ArrayD<f32>| -> anyhow::Result<ArrayD<f32>> {
            if patch[[0, 0, 0]] > 8.0 {
                anyhow::bail!("device lost");
            }
            Ok(patch)
        };
        let mut scanner = ForwardScanner::new(spec(vec![4, 4], 0.5, BlendKernel::Bump)).with_chunk(2);

        match scanner.run(&input, &mut output, &mut failing) {
            Err(ScanError::Inference { chunk, origin, .. }) => {
                assert_eq!(chunk, Some(2));
                // First origin whose corner value exceeds 8.0
                assert_eq!(origin, vec![4, 2]);
            }
            other => panic!("expected inference error, got {:?}", other),
        }
        assert_eq!(scanner.state(), ScanState::Failed);
        assert_eq!(output.writes, 0);
    }

    #[test]
    fn test_wrong_prediction_shape_is_inference_error() {
        let input = ramp(&[8, 8]);
        let mut output = MemoryVolume::new(&[1, 8, 8]);
        let mut shrinking = |patch: ArrayD<f32>| -> anyhow::Result<ArrayD<f32>> {
            Ok(patch.slice_axis(Axis(1), Slice::from(..2)).to_owned())
        };
        let mut scanner = ForwardScanner::new(spec(vec![4, 4], 0.5, BlendKernel::Bump));
        let err = scanner.run(&input, &mut output, &mut shrinking).unwrap_err();
        assert!(matches!(err, ScanError::Inference { .. }));
    }

    #[test]
    fn test_gap_stride_reports_incomplete_coverage() {
        let input = ramp(&[10]);
        let mut output = MemoryVolume::new(&[1, 10]);
        let spec = ScanSpec::new(
            PatchSpec::new("input", 1, vec![3]),
            PatchSpec::new("output", 1, vec![3]),
            StridePolicy::new(vec![AxisStride::Voxels(5)], BlendKernel::Uniform),
        )
        .expect("Failed to build scan spec");
        let mut scanner = ForwardScanner::new(spec);

        let err = scanner.run(&input, &mut output, &mut identity).unwrap_err();
        match err {
            ScanError::IncompleteCoverage { first, .. } => assert_eq!(first, vec![3]),
            other => panic!("expected incomplete coverage, got {:?}", other),
        }
        assert_eq!(output.writes, 0);
    }

    #[test]
    fn test_streaming_matches_whole_chunk() {
        let input = ramp(&[20, 6]);
        let base = spec(vec![6, 4], 0.5, BlendKernel::Bump);

        let mut whole = MemoryVolume::new(&[1, 20, 6]);
        ForwardScanner::new(base.clone())
            .run(&input, &mut whole, &mut identity)
            .expect("Failed to scan whole chunk");

        let mut streamed = MemoryVolume::new(&[1, 20, 6]);
        let report = ForwardScanner::new(base.with_commit(CommitPolicy::Streaming))
            .run(&input, &mut streamed, &mut identity)
            .expect("Failed to scan streaming");

        assert!(report.writes > 1);
        for (a, b) in whole.data.iter().zip(streamed.data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_single_channel_selection_drops_channel_axis() {
        let input = ramp(&[6, 6]);
        let mut output = MemoryVolume::new(&[6, 6]);
        let spec = ScanSpec::new(
            PatchSpec::new("input", 1, vec![4, 4]),
            PatchSpec::new("output", 2, vec![4, 4]),
            StridePolicy::uniform_overlap(2, 0.5, BlendKernel::Bump),
        )
        .and_then(|s| s.with_channels(ChannelSelection::Single(1)))
        .expect("Failed to build scan spec");
        let mut two_channels = |patch: ArrayD<f32>| -> anyhow::Result<ArrayD<f32>> {
            Ok(ndarray::concatenate(Axis(0), &[patch.view(), (&patch * -1.0).view()])?)
        };

        ForwardScanner::new(spec)
            .run(&input, &mut output, &mut two_channels)
            .expect("Failed to scan");
        for (a, b) in input.data.iter().zip(output.data.iter()) {
            assert!((a + b).abs() < 1e-4);
        }
    }
}
