/// Chunked forward pass over a stacked volume
///
/// Usage:
///   voxel-forward <config.toml> [identity|sigmoid]
///   voxel-forward --default-config
///
/// The bundled models are stand-ins for a real network: they pass the first
/// input channel through an activation and repeat it across the output
/// channels. Linking a real model means implementing `Inference`.

use anyhow::{bail, Context, Result};
use log::info;
use ndarray::{ArrayD, Axis};

use voxel_forward::{ChunkRunner, Inference, MappedVolume, OpenMode, ScanConfig};

#[derive(Debug, Clone, Copy)]
enum Activation {
    Identity,
    Sigmoid,
}

#[derive(Debug, Clone)]
struct StubModel {
    activation: Activation,
    channels: usize,
}

impl Inference for StubModel {
    fn infer(&mut self, patch: ArrayD<f32>) -> Result<ArrayD<f32>> {
        let first = patch.index_axis(Axis(0), 0);
        let activated = match self.activation {
            Activation::Identity => first.to_owned(),
            Activation::Sigmoid => first.mapv(|v| 1.0 / (1.0 + (-v).exp())),
        };
        let views = vec![activated.view(); self.channels];
        Ok(ndarray::stack(Axis(0), &views)?)
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, activation) = match args.as_slice() {
        [flag] if flag == "--default-config" => {
            print!("{}", ScanConfig::default().to_toml()?);
            return Ok(());
        }
        [path] => (path, Activation::Sigmoid),
        [path, model] => {
            let activation = match model.as_str() {
                "identity" => Activation::Identity,
                "sigmoid" => Activation::Sigmoid,
                other => bail!("unknown model '{}', expected identity or sigmoid", other),
            };
            (path, activation)
        }
        _ => bail!("usage: voxel-forward <config.toml> [identity|sigmoid] | --default-config"),
    };

    let config = ScanConfig::from_file(config_path)
        .with_context(|| format!("Failed to load config {}", config_path))?;
    let spec = config.to_spec()?;
    let model = StubModel {
        activation,
        channels: spec.output.channels,
    };

    let input = MappedVolume::<f32>::open(&config.input, OpenMode::Read, None)
        .with_context(|| format!("Failed to open input volume {}", config.input.display()))?;
    info!(
        "Input {} has shape {:?} ({} chunks)",
        config.input.display(),
        input.shape(),
        input.shape().first().copied().unwrap_or(0)
    );

    let workers = config.worker_count();
    let runner = ChunkRunner::new(spec).with_workers(workers);
    let report = if workers > 1 {
        runner.run_parallel::<f32, f32, _, _>(&input, &config.output, |_| Ok(model.clone()))?
    } else {
        let mut model = model;
        runner.run_sequential::<f32, f32, _>(&input, &config.output, &mut model)?
    };

    info!(
        "Wrote {} ({} chunks, {} patches) in {:.2} minutes",
        report.output.display(),
        report.chunks.len(),
        report.patches(),
        report.elapsed.as_secs_f64() / 60.0
    );
    Ok(())
}
