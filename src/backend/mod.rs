//! Pluggable record sinks.
//!
//! Backends register with a unique name and receive every posted record
//! once. A failing backend is isolated: its error is logged and the record
//! still reaches the others. There are no retries.

mod file;
pub(crate) mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::cdr::ExternalRecord;

/// Longest allowed backend name.
pub const MAX_NAME_LEN: usize = 20;

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("backend not available")]
    Unavailable,
}

/// Registration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("backend name is empty")]
    EmptyName,

    #[error("backend name exceeds {MAX_NAME_LEN} characters")]
    NameTooLong,

    #[error("backend '{0}' is already registered")]
    Duplicate(String),
}

/// A record sink.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    /// Deliver one record. The record must not be retained past return.
    async fn post(&self, record: &ExternalRecord) -> Result<(), BackendError>;

    /// Flush pending writes.
    async fn flush(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct BackendEntry {
    name: String,
    description: String,
    backend: Arc<dyn Backend>,
}

/// The set of registered sinks. Names are unique case-insensitively.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    entries: RwLock<Vec<BackendEntry>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink under a unique name.
    pub fn register(
        &self,
        name: &str,
        description: &str,
        backend: Arc<dyn Backend>,
    ) -> Result<(), RegistryError> {
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(RegistryError::NameTooLong);
        }

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.iter().any(|e| e.name.eq_ignore_ascii_case(name)) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        entries.push(BackendEntry {
            name: name.to_string(),
            description: description.to_string(),
            backend,
        });
        info!(backend = name, "registered CDR backend");
        Ok(())
    }

    /// Remove a sink by name. Returns whether anything was removed.
    pub fn unregister(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|e| !e.name.eq_ignore_ascii_case(name));
        let removed = entries.len() != before;
        if removed {
            info!(backend = name, "unregistered CDR backend");
        }
        removed
    }

    /// Registered names, in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }

    /// Registered `(name, description)` pairs.
    pub fn descriptions(&self) -> Vec<(String, String)> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| (e.name.clone(), e.description.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    fn snapshot(&self) -> Vec<(String, Arc<dyn Backend>)> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| (e.name.clone(), Arc::clone(&e.backend)))
            .collect()
    }

    /// Hand one record to every registered sink.
    pub async fn post(&self, record: &ExternalRecord) {
        for (name, backend) in self.snapshot() {
            if let Err(error) = backend.post(record).await {
                warn!(backend = %name, %error, "backend failed to post CDR");
            }
        }
    }

    /// Flush every sink.
    pub async fn flush(&self) {
        for (name, backend) in self.snapshot() {
            if let Err(error) = backend.flush().await {
                warn!(backend = %name, %error, "backend failed to flush");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_rejects_duplicates_case_insensitively() {
        let registry = BackendRegistry::new();
        let backend = Arc::new(MemoryBackend::new(16));
        registry.register("csv", "CSV sink", backend.clone()).unwrap();
        assert_eq!(
            registry.register("CSV", "again", backend.clone()),
            Err(RegistryError::Duplicate("CSV".to_string()))
        );
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let registry = BackendRegistry::new();
        let backend = Arc::new(MemoryBackend::new(16));
        assert_eq!(
            registry.register("", "empty", backend.clone()),
            Err(RegistryError::EmptyName)
        );
        assert_eq!(
            registry.register("a-very-long-backend-name-indeed", "long", backend),
            Err(RegistryError::NameTooLong)
        );
    }

    #[test]
    fn test_unregister() {
        let registry = BackendRegistry::new();
        let backend = Arc::new(MemoryBackend::new(16));
        registry.register("mem", "memory", backend).unwrap();
        assert!(registry.unregister("MEM"));
        assert!(!registry.unregister("mem"));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_post_reaches_all_backends() {
        let registry = BackendRegistry::new();
        let first = Arc::new(MemoryBackend::new(16));
        let second = Arc::new(MemoryBackend::new(16));
        registry.register("first", "", first.clone()).unwrap();
        registry.register("second", "", second.clone()).unwrap();

        let record = crate::backend::memory::tests::sample_record();
        registry.post(&record).await;

        assert_eq!(first.count(), 1);
        assert_eq!(second.count(), 1);
    }
}
