/// Weighted accumulation of overlapping patch predictions
///
/// Buffers cover a band of rows along the outermost spatial axis. With the band
/// as deep as the region, this is the plain whole-region accumulator; with a
/// band one patch deep, rows are drained as soon as the scan has moved past
/// them, which bounds resident memory independently of the volume depth.

use std::ops::Range;

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};

use crate::error::{ScanError, ScanResult};
use crate::region::Region;
use crate::storage::Element;

#[derive(Debug)]
pub struct Accumulator {
    channels: usize,
    /// Spatial shape of the whole output region
    shape: Vec<usize>,
    /// Rows along axis 0 currently held in the buffers
    window: Range<usize>,
    /// `[channels] + window` weighted sums
    sum: ArrayD<f64>,
    /// `window` weight totals
    weight: ArrayD<f64>,
    /// Chunk index reported in coverage errors
    chunk: Option<usize>,
}

impl Accumulator {
    /// Accumulator holding the whole region
    pub fn new(channels: usize, shape: &[usize]) -> Self {
        Self::windowed(channels, shape, shape.first().copied().unwrap_or(0))
    }

    /// Accumulator holding `rows` rows of axis 0 at a time
    pub fn windowed(channels: usize, shape: &[usize], rows: usize) -> Self {
        let rows = rows.min(shape.first().copied().unwrap_or(0));
        let mut band = shape.to_vec();
        if let Some(first) = band.first_mut() {
            *first = rows;
        }
        let mut sum_shape = Vec::with_capacity(band.len() + 1);
        sum_shape.push(channels);
        sum_shape.extend_from_slice(&band);

        Self {
            channels,
            shape: shape.to_vec(),
            window: 0..rows,
            sum: ArrayD::zeros(IxDyn(&sum_shape)),
            weight: ArrayD::zeros(IxDyn(&band)),
            chunk: None,
        }
    }

    pub fn with_chunk(mut self, chunk: Option<usize>) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn window(&self) -> Range<usize> {
        self.window.clone()
    }

    /// Spatial region relative to the window's first row
    fn local(&self, region: &Region) -> Region {
        let mut origin = region.origin.clone();
        origin[0] -= self.window.start;
        Region::new(origin, region.extent.clone())
    }

    fn check_window(&self, region: &Region) -> ScanResult<()> {
        let fits = region.fits_within(&self.shape)
            && region.origin[0] >= self.window.start
            && region.origin[0] + region.extent[0] <= self.window.end;
        if fits {
            Ok(())
        } else {
            Err(ScanError::Bounds {
                path: "<accumulator>".into(),
                region: region.clone(),
                shape: self.shape.clone(),
            })
        }
    }

    /// Add `prediction * weights` and `weights` at `origin`
    ///
    /// `prediction` is `[channels] + extent`, `weights` is `extent`.
    pub fn merge(
        &mut self,
        origin: &[usize],
        prediction: ArrayViewD<'_, f32>,
        weights: ArrayViewD<'_, f64>,
    ) -> ScanResult<()> {
        let region = Region::new(origin.to_vec(), weights.shape().to_vec());
        self.check_window(&region)?;
        if prediction.ndim() != weights.ndim() + 1
            || prediction.shape()[0] != self.channels
            || &prediction.shape()[1..] != weights.shape()
        {
            let mut expected = vec![self.channels];
            expected.extend_from_slice(weights.shape());
            return Err(ScanError::ShapeMismatch {
                context: "prediction merged into accumulator".to_string(),
                expected,
                found: prediction.shape().to_vec(),
            });
        }

        let local = self.local(&region);
        let mut weight = self.weight.slice_each_axis_mut(|ax| local.axis_slice(ax.axis.index()));
        weight += &weights;

        let mut sum = self
            .sum
            .slice_each_axis_mut(|ax| match ax.axis.index() {
                0 => Slice::from(..),
                a => local.axis_slice(a - 1),
            });
        for (mut sum_c, pred_c) in sum.outer_iter_mut().zip(prediction.outer_iter()) {
            Zip::from(&mut sum_c)
                .and(&pred_c)
                .and(&weights)
                .for_each(|s, &p, &w| *s += p as f64 * w);
        }
        Ok(())
    }

    /// `sum / weight` over `region`, as `[channels] + region.extent`
    pub fn finalize<T: Element>(&self, region: &Region) -> ScanResult<ArrayD<T>> {
        self.check_window(region)?;
        let local = self.local(region);
        let weight = self.weight.slice_each_axis(|ax| local.axis_slice(ax.axis.index()));

        let mut uncovered = 0usize;
        let mut first: Option<Vec<usize>> = None;
        for (index, &w) in weight.indexed_iter() {
            if !(w > 0.0) {
                uncovered += 1;
                if first.is_none() {
                    first = Some((0..region.rank()).map(|a| index[a] + region.origin[a]).collect());
                }
            }
        }
        if let Some(first) = first {
            return Err(ScanError::IncompleteCoverage {
                chunk: self.chunk,
                region: region.clone(),
                uncovered,
                first,
            });
        }

        let sum = self.sum.slice_each_axis(|ax| match ax.axis.index() {
            0 => Slice::from(..),
            a => local.axis_slice(a - 1),
        });
        let mut out_shape = vec![self.channels];
        out_shape.extend_from_slice(&region.extent);
        let mut out = ArrayD::<T>::default(IxDyn(&out_shape));
        for (mut out_c, sum_c) in out.outer_iter_mut().zip(sum.outer_iter()) {
            Zip::from(&mut out_c)
                .and(&sum_c)
                .and(&weight)
                .for_each(|o, &s, &w| *o = T::from_f64(s / w));
        }
        Ok(out)
    }

    /// Finalize rows `window.start..upto` and slide the window so it starts at
    /// `upto`. Returns `None` when there is nothing to drain.
    ///
    /// Rows past the current window were never buffered, so draining beyond
    /// it reports them as uncovered.
    pub fn drain_rows<T: Element>(&mut self, upto: usize) -> ScanResult<Option<(Region, ArrayD<T>)>> {
        let upto = upto.min(self.shape[0]);
        if upto <= self.window.start {
            return Ok(None);
        }

        let buffered_end = upto.min(self.window.end);
        let mut extent = self.shape.clone();
        extent[0] = buffered_end - self.window.start;
        let mut origin = vec![0; self.shape.len()];
        origin[0] = self.window.start;
        let region = Region::new(origin, extent);
        let data = self.finalize::<T>(&region)?;

        if upto > self.window.end {
            let mut origin = vec![0; self.shape.len()];
            origin[0] = self.window.end;
            let mut extent = self.shape.clone();
            extent[0] = upto - self.window.end;
            let gap = Region::new(origin.clone(), extent);
            return Err(ScanError::IncompleteCoverage {
                chunk: self.chunk,
                uncovered: gap.voxel_count(),
                region: gap,
                first: origin,
            });
        }

        self.advance(upto);
        Ok(Some((region, data)))
    }

    fn advance(&mut self, start: usize) {
        let rows = self.window.len();
        let shift = start - self.window.start;
        let keep = rows.saturating_sub(shift);
        let end = (start + rows).min(self.shape[0]);
        let new_rows = end - start;

        let mut band = self.shape.clone();
        band[0] = new_rows;
        let mut sum_shape = vec![self.channels];
        sum_shape.extend_from_slice(&band);

        let mut weight = ArrayD::zeros(IxDyn(&band));
        let mut sum = ArrayD::zeros(IxDyn(&sum_shape));
        if keep > 0 {
            let kept = keep.min(new_rows);
            weight
                .slice_axis_mut(Axis(0), Slice::from(..kept))
                .assign(&self.weight.slice_axis(Axis(0), Slice::from(shift..shift + kept)));
            sum.slice_axis_mut(Axis(1), Slice::from(..kept))
                .assign(&self.sum.slice_axis(Axis(1), Slice::from(shift..shift + kept)));
        }

        self.weight = weight;
        self.sum = sum;
        self.window = start..end;
    }
}
