//! KDL configuration parsing for Kiln.
//!
//! The server reads one KDL file describing where jobs and logs are stored,
//! which executor backend runs tasks, how output is cut into segments and the
//! limits applied to every job.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    CutterConfig, ExecutorBackend, ExecutorConfig, JobSettings, LogFormat, ServerSettings,
    StorageBackend, StorageConfig, SystemConfig, load_system_config, parse_system_config,
};
