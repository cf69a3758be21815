use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the CDR engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Engine behavior knobs.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Backends the daemon registers at startup.
    #[serde(default)]
    pub backends: BackendsConfig,
}

/// The `general` section. Key names match the classic config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Master switch.
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Verbose per-event engine tracing.
    #[serde(default)]
    pub debug: bool,

    /// Post single-party records whose disposition is below ANSWERED.
    #[serde(default)]
    pub unanswered: bool,

    /// Keep CONGESTION as its own disposition instead of FAILED.
    #[serde(default)]
    pub congestion: bool,

    /// Finalize timestamps when a record enters the terminal state, so the
    /// hangup extension observes them.
    #[serde(default)]
    pub endbeforehexten: bool,

    /// Round billsec up when the millisecond remainder is >= 500.
    #[serde(default)]
    pub initiatedseconds: bool,

    /// Buffer records and deliver them in batches.
    #[serde(default)]
    pub batch: bool,

    /// Batch size trigger.
    #[serde(default = "default_batch_size")]
    pub size: u32,

    /// Batch time trigger, in seconds.
    #[serde(default = "default_batch_time")]
    pub time: u64,

    /// Drain inline on the scheduler tick instead of spawning a worker.
    #[serde(default)]
    pub scheduleronly: bool,

    /// Drain synchronously on teardown so no batch is lost on exit.
    #[serde(default = "default_true")]
    pub safeshutdown: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            enable: true,
            debug: false,
            unanswered: false,
            congestion: false,
            endbeforehexten: false,
            initiatedseconds: false,
            batch: false,
            size: default_batch_size(),
            time: default_batch_time(),
            scheduleronly: false,
            safeshutdown: true,
        }
    }
}

pub const MAX_BATCH_SIZE: u32 = 1000;
pub const MAX_BATCH_TIME: u64 = 86400;

fn default_true() -> bool {
    true
}

fn default_batch_size() -> u32 {
    100
}

fn default_batch_time() -> u64 {
    300
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON logs instead of the pretty format.
    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Backends registered by the daemon binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendsConfig {
    /// Optional flat-file sink.
    #[serde(default)]
    pub file: Option<FileBackendConfig>,
}

/// Flat-file backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBackendConfig {
    /// Where records are appended.
    pub path: PathBuf,

    /// Output format.
    #[serde(default)]
    pub format: RecordFormat,
}

/// On-disk record format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    /// One JSON object per line.
    #[default]
    Jsonl,
    /// Classic CSV billing columns.
    Csv,
}
