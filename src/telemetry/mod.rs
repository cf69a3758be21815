//! Logging initialization.

mod tracing;

pub use self::tracing::{init_tracing, TracingConfig};
