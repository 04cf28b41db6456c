//! Chunked forward passes over stacked volumes
//!
//! A stacked volume holds independent sub-volumes along its outermost axis.
//! Each chunk is scanned on its own with a fresh scanner; the output volume
//! is created once with the same leading axis and every chunk writes only its
//! own slab.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::bounded;
use log::{error, info};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::error::{invalid_config, ScanError, ScanResult};
use crate::scan::forward::InputLayout;
use crate::scan::{ForwardScanner, Inference, ScanReport, ScanSpec};
use crate::storage::{Element, MappedVolume, OpenMode};

/// Shared flag that stops a run before its next chunk
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a chunked run, one scan report per chunk in chunk order
#[derive(Debug, Clone)]
pub struct RunReport {
    pub output: PathBuf,
    pub chunks: Vec<ScanReport>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn patches(&self) -> usize {
        self.chunks.iter().map(|c| c.patches).sum()
    }
}

/// Runs one forward scan per chunk of a stacked input volume
#[derive(Debug, Clone)]
pub struct ChunkRunner {
    spec: ScanSpec,
    workers: usize,
    stack_size: Option<usize>,
    cancel: CancelToken,
}

impl ChunkRunner {
    pub fn new(spec: ScanSpec) -> Self {
        Self {
            spec,
            workers: 1,
            stack_size: None,
            cancel: CancelToken::new(),
        }
    }

    /// Worker threads for `run_parallel`; clamped to at least 1
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_stack_size(mut self, stack_size: Option<usize>) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Shape of the stacked output for a stacked input of `input_shape`
    ///
    /// The per-chunk layout is checked here, so a mismatched input is
    /// rejected before the output file is created.
    pub fn output_shape(&self, input_shape: &[usize]) -> ScanResult<Vec<usize>> {
        let rank = self.spec.spatial_rank();
        if input_shape.len() < rank + 1 {
            let mut expected = vec![0; rank + 1];
            expected[1..].copy_from_slice(&self.spec.input.extent);
            return Err(ScanError::ShapeMismatch {
                context: format!("stacked input needs a chunk axis plus {} spatial axes", rank),
                expected,
                found: input_shape.to_vec(),
            });
        }

        let layout = InputLayout::resolve(&input_shape[1..], &self.spec)?;
        let mut shape = vec![input_shape[0]];
        shape.extend(self.spec.output_shape(&layout.spatial));
        Ok(shape)
    }

    /// Scan every chunk in order on the calling thread
    pub fn run_sequential<T, U, I>(
        &self,
        input: &MappedVolume<T>,
        output_path: impl AsRef<Path>,
        inference: &mut I,
    ) -> ScanResult<RunReport>
    where
        T: Element,
        U: Element,
        I: Inference + ?Sized,
    {
        let start = Instant::now();
        let mut output = self.create_output::<T, U>(input, output_path.as_ref())?;
        let total = input.shape()[0];

        let mut chunks = Vec::with_capacity(total);
        for index in 0..total {
            if self.cancel.is_cancelled() {
                return Err(ScanError::Cancelled { chunk: index });
            }
            let slab = input.slab(index)?;
            let mut out = output.slab_mut(index)?;
            let report = ForwardScanner::new(self.spec.clone())
                .with_chunk(index)
                .run(&slab, &mut out, inference)?;
            log_chunk(index, total, &report);
            chunks.push(report);
        }

        let elapsed = start.elapsed();
        info!("Total time: {:.2} minutes", elapsed.as_secs_f64() / 60.0);
        Ok(RunReport {
            output: output.path().to_path_buf(),
            chunks,
            elapsed,
        })
    }

    /// Scan chunks concurrently on a dedicated thread pool
    ///
    /// `make_inference` is called once per worker with the worker index.
    /// Chunks write disjoint slabs through their own read-write mapping of
    /// the output file. The first failing chunk stops chunks that have not
    /// started yet and its error is the one returned; the runner's cancel
    /// token is left untouched.
    pub fn run_parallel<T, U, I, F>(
        &self,
        input: &MappedVolume<T>,
        output_path: impl AsRef<Path>,
        make_inference: F,
    ) -> ScanResult<RunReport>
    where
        T: Element,
        U: Element,
        I: Inference + Send,
        F: Fn(usize) -> anyhow::Result<I>,
    {
        let start = Instant::now();
        let output_path = {
            let mut output = self.create_output::<T, U>(input, output_path.as_ref())?;
            output.flush()?;
            output.path().to_path_buf()
        };
        let total = input.shape()[0];

        let (release, acquire) = bounded::<I>(self.workers);
        for worker in 0..self.workers {
            let model = make_inference(worker)
                .with_context(|| format!("failed to create model for worker {}", worker))
                .map_err(|source| ScanError::Inference {
                    chunk: None,
                    origin: Vec::new(),
                    source,
                })?;
            // Capacity equals the worker count
            let _ = release.send(model);
        }

        let mut builder = ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|idx| format!("chunk-worker-{}", idx));
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let pool = builder
            .build()
            .map_err(|e| invalid_config(format!("failed to build chunk worker pool: {}", e)))?;

        let failed = AtomicBool::new(false);
        let results: Vec<ScanResult<ScanReport>> = pool.install(|| {
            (0..total)
                .into_par_iter()
                .map(|index| {
                    if self.cancel.is_cancelled() || failed.load(Ordering::SeqCst) {
                        return Err(ScanError::Cancelled { chunk: index });
                    }
                    let Ok(mut model) = acquire.recv() else {
                        return Err(ScanError::Cancelled { chunk: index });
                    };
                    let result = self.scan_chunk::<T, U, I>(input, &output_path, index, &mut model);
                    let _ = release.send(model);

                    match result {
                        Ok(report) => {
                            log_chunk(index, total, &report);
                            Ok(report)
                        }
                        Err(e) => {
                            error!("Chunk {} failed: {}", index, e);
                            failed.store(true, Ordering::SeqCst);
                            Err(e)
                        }
                    }
                })
                .collect()
        });
        let chunks = first_failure(results)?;

        let elapsed = start.elapsed();
        info!(
            "Total time: {:.2} minutes ({} workers)",
            elapsed.as_secs_f64() / 60.0,
            self.workers
        );
        Ok(RunReport {
            output: output_path,
            chunks,
            elapsed,
        })
    }

    fn scan_chunk<T, U, I>(
        &self,
        input: &MappedVolume<T>,
        output_path: &Path,
        index: usize,
        inference: &mut I,
    ) -> ScanResult<ScanReport>
    where
        T: Element,
        U: Element,
        I: Inference,
    {
        let mut output = MappedVolume::<U>::open(output_path, OpenMode::ReadWrite, None)?;
        let slab = input.slab(index)?;
        let mut out = output.slab_mut(index)?;
        ForwardScanner::new(self.spec.clone())
            .with_chunk(index)
            .run(&slab, &mut out, inference)
    }

    fn create_output<T: Element, U: Element>(
        &self,
        input: &MappedVolume<T>,
        path: &Path,
    ) -> ScanResult<MappedVolume<U>> {
        let shape = self.output_shape(input.shape())?;
        info!(
            "Scanning {} chunks of {:?} into {} {:?}",
            input.shape()[0],
            &input.shape()[1..],
            path.display(),
            shape
        );
        MappedVolume::<U>::create(path, &shape)
    }
}

/// Reports in chunk order, or the root-cause error of a failed run
///
/// Chunks skipped after another chunk failed report `Cancelled`; those are
/// only returned when nothing else went wrong.
fn first_failure(results: Vec<ScanResult<ScanReport>>) -> ScanResult<Vec<ScanReport>> {
    let mut reports = Vec::with_capacity(results.len());
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(e @ ScanError::Cancelled { .. }) => {
                if cancelled.is_none() {
                    cancelled = Some(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
    match cancelled {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}

fn log_chunk(index: usize, total: usize, report: &ScanReport) {
    info!(
        "Chunk {}/{}: {} patches, {:.2} minutes",
        index + 1,
        total,
        report.patches,
        report.elapsed.as_secs_f64() / 60.0
    );
}
