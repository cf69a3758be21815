//! Engine configuration: serde types and the YAML loader.

mod loader;
mod types;

pub use types::{
    BackendsConfig, Config, FileBackendConfig, GeneralConfig, RecordFormat, TelemetryConfig,
    MAX_BATCH_SIZE, MAX_BATCH_TIME,
};
