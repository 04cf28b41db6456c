pub mod chunked;
pub mod config;
pub mod error;
pub mod region;
pub mod scan;
pub mod storage;

pub use chunked::{CancelToken, ChunkRunner, RunReport};
pub use config::ScanConfig;
pub use error::{ScanError, ScanResult};
pub use region::Region;
pub use scan::{
    AxisStride, BlendKernel, ChannelSelection, CommitPolicy, ForwardScanner, Inference, PatchSpec,
    ScanReport, ScanSpec, ScanState, StridePolicy,
};
pub use storage::{Dtype, Element, MappedVolume, OpenMode, VolumeRead, VolumeWrite};
