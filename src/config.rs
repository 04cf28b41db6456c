//! Run configuration
//!
//! A forward run is described by a TOML file naming the input and output
//! volumes, the patch shapes, the stride policy and how results are
//! committed. Relative paths resolve against the directory of the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{invalid_config, IoResultExt, ScanResult};
use crate::scan::{
    BlendKernel, ChannelSelection, CommitPolicy, PatchSpec, ScanSpec, StridePolicy,
    DEFAULT_PREFETCH_DEPTH,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Stacked input volume, chunks along the outermost axis
    pub input: PathBuf,
    /// Stacked output volume, created with the input's chunk count
    pub output: PathBuf,
    /// Multiplier applied to raw input values before inference
    pub input_scale: Option<f32>,
    /// Chunk workers; 0 means one per CPU
    pub workers: usize,
    pub prefetch_depth: usize,
    pub commit: CommitPolicy,
    pub channels: ChannelSelection,
    pub input_patch: PatchSpec,
    pub output_patch: PatchSpec,
    pub stride: StridePolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::from("input.npy"),
            output: PathBuf::from("output.npy"),
            input_scale: None,
            workers: 1,
            prefetch_depth: DEFAULT_PREFETCH_DEPTH,
            commit: CommitPolicy::WholeChunk,
            channels: ChannelSelection::Single(0),
            input_patch: PatchSpec::new("input", 1, vec![18, 160, 160]),
            output_patch: PatchSpec::new("psd", 1, vec![18, 160, 160]),
            stride: StridePolicy::uniform_overlap(3, 0.5, BlendKernel::Bump),
        }
    }
}

impl ScanConfig {
    /// Load and validate a config file
    pub fn from_file(path: impl AsRef<Path>) -> ScanResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).with_path(path)?;
        let mut config = Self::from_toml(&raw)
            .map_err(|e| invalid_config(format!("{}: {}", path.display(), e)))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> ScanResult<Self> {
        toml::from_str(raw).map_err(|e| invalid_config(e.to_string()))
    }

    pub fn to_toml(&self) -> ScanResult<String> {
        toml::to_string_pretty(self).map_err(|e| invalid_config(e.to_string()))
    }

    /// Make relative volume paths relative to `base`
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.input.is_relative() {
            self.input = base.join(&self.input);
        }
        if self.output.is_relative() {
            self.output = base.join(&self.output);
        }
    }

    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn validate(&self) -> ScanResult<()> {
        if let Some(scale) = self.input_scale {
            if !scale.is_finite() || scale == 0.0 {
                return Err(invalid_config(format!("input_scale must be finite and non-zero, got {}", scale)));
            }
        }
        if self.input == self.output {
            return Err(invalid_config(format!(
                "input and output both point at {}",
                self.input.display()
            )));
        }
        self.to_spec().map(|_| ())
    }

    pub fn to_spec(&self) -> ScanResult<ScanSpec> {
        let spec = ScanSpec::new(
            self.input_patch.clone(),
            self.output_patch.clone(),
            self.stride.clone(),
        )?
        .with_channels(self.channels)?
        .with_commit(self.commit)
        .with_prefetch_depth(self.prefetch_depth)
        .with_input_scale(self.input_scale);
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScanError;
    use crate::scan::AxisStride;
    use tempfile::TempDir;

    const RUN_CONFIG: &str = r#"
input = "volumes/raw.npy"
output = "/data/psd.npy"
input_scale = 0.0005
workers = 2
commit = "streaming"
channels = { single = 0 }

[input_patch]
name = "input"
extent = [18, 160, 160]

[output_patch]
name = "psd"
channels = 3
extent = [18, 160, 160]

[stride]
blend = "bump"
axes = [{ overlap = 0.5 }, { overlap = 0.5 }, { voxels = 80 }]
"#;

    #[test]
    fn test_parse_run_config() {
        let config = ScanConfig::from_toml(RUN_CONFIG).expect("Failed to parse config");
        assert_eq!(config.input_scale, Some(0.0005));
        assert_eq!(config.workers, 2);
        assert_eq!(config.prefetch_depth, DEFAULT_PREFETCH_DEPTH);
        assert_eq!(config.commit, CommitPolicy::Streaming);
        assert_eq!(config.channels, ChannelSelection::Single(0));
        assert_eq!(config.input_patch.channels, 1);
        assert_eq!(config.output_patch.channels, 3);
        assert_eq!(config.stride.axes[2], AxisStride::Voxels(80));
        assert_eq!(config.stride.blend, BlendKernel::Bump);

        let spec = config.to_spec().expect("Failed to build spec");
        assert_eq!(spec.kept_channels(), 1);
        assert_eq!(spec.input_scale, Some(0.0005));
    }

    #[test]
    fn test_defaults_round_trip_through_toml() {
        let config = ScanConfig::default();
        let raw = config.to_toml().expect("Failed to serialize config");
        let back = ScanConfig::from_toml(&raw).expect("Failed to parse serialized config");
        assert_eq!(config, back);
        config.validate().expect("Default config should be valid");
    }

    #[test]
    fn test_from_file_resolves_relative_paths() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let path = temp_dir.path().join("run.toml");
        std::fs::write(&path, RUN_CONFIG).expect("Failed to write config");

        let config = ScanConfig::from_file(&path).expect("Failed to load config");
        assert_eq!(config.input, temp_dir.path().join("volumes/raw.npy"));
        assert_eq!(config.output, PathBuf::from("/data/psd.npy"));
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let mismatched = RUN_CONFIG.replace("extent = [18, 160, 160]\n\n[stride]", "extent = [18, 160, 128]\n\n[stride]");
        assert!(matches!(
            ScanConfig::from_toml(&mismatched).and_then(|c| c.validate()),
            Err(ScanError::InvalidConfig { .. })
        ));

        let zero_scale = RUN_CONFIG.replace("input_scale = 0.0005", "input_scale = 0.0");
        assert!(ScanConfig::from_toml(&zero_scale).and_then(|c| c.validate()).is_err());

        assert!(ScanConfig::from_toml("workers = \"many\"").is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory for test");
        let err = ScanConfig::from_file(temp_dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ScanError::Io { .. }));
    }
}
