//! Engine configuration loaded from an INI file.
//!
//! ```ini
//! [resources]
//! max_memory = 4GB
//! max_cpu_cores = 8
//!
//! [concurrency]
//! transform = 4
//! analysis_export = 8
//! ```
//!
//! A missing file yields [`EngineConfig::default`], whose CPU-dependent values
//! derive from the host's available parallelism.

mod defaults;
mod file;
mod parser;
mod settings;
mod size;
mod writer;

pub use defaults::{
    num_cpus, DEFAULT_LOG_DIRECTORY, DEFAULT_LOG_FILE, DEFAULT_MAX_MEMORY,
    DEFAULT_USAGE_ALERT_FRACTION,
};
pub use file::ConfigFileError;
pub use settings::{
    ConcurrencySettings, EngineConfig, ExportSettings, LoggingSettings, ProcessorSettings,
    ResourceSettings, SchedulerSettings,
};
pub use size::{format_size, parse_size, SizeParseError};
