//! The CDR engine.
//!
//! A constructed value owning the indices, the backend registry, the batch
//! dispatcher, and the record sequence. Upstream publishes events through
//! [`Engine::handle_event`]; dialplan and console callers use the public
//! API; embedders tear the engine down with [`Engine::shutdown`].

mod indices;
mod router;

pub use indices::{BridgeIndex, ChannelIndex};

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::{Backend, BackendRegistry, RegistryError};
use crate::batch::{BatchDispatcher, BatchHandle, BatchState};
use crate::cdr::{
    is_readonly_var, CdrProperty, ExternalRecord, ForkOptions, ResetOptions, Sequence,
};
use crate::config::{Config, GeneralConfig};

/// Errors surfaced by the public API.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The channel name has no chain.
    #[error("no CDR for channel {0}")]
    NotFound(String),

    /// Attempt to set a standard property as a variable.
    #[error("variable '{0}' is a read-only CDR property")]
    ReadOnly(String),

    /// Fork refused because the chain's newest record is finalized.
    #[error("CDR chain for channel {0} is already finalized")]
    Finalized(String),
}

/// Point-in-time engine statistics for the status command.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub enabled: bool,
    pub debug: bool,
    pub batch_mode: bool,
    pub unanswered: bool,
    pub congestion: bool,
    pub safe_shutdown: bool,
    pub scheduler_only: bool,
    pub batch_size: usize,
    pub max_batch_size: u32,
    pub max_batch_time: u64,
    pub next_flush_secs: Option<u64>,
    pub backends: Vec<(String, String)>,
}

/// The engine. Construct with [`Engine::new`], share as `Arc<Engine>`.
pub struct Engine {
    config: watch::Sender<Arc<Config>>,
    pub(crate) sequence: Sequence,
    pub(crate) channels: ChannelIndex,
    pub(crate) bridges: BridgeIndex,
    registry: Arc<BackendRegistry>,
    batch_state: Arc<BatchState>,
    batch_handle: BatchHandle,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine and start its batch dispatcher. Must be called from
    /// within a tokio runtime.
    pub fn new(config: Config) -> Arc<Self> {
        let (config_tx, config_rx) = watch::channel(Arc::new(config));
        let registry = Arc::new(BackendRegistry::new());
        let batch_state = Arc::new(BatchState::default());

        let (dispatcher, batch_handle) = BatchDispatcher::new(
            Arc::clone(&batch_state),
            Arc::clone(&registry),
            config_rx,
        );
        let dispatcher = tokio::spawn(dispatcher.run());

        let engine = Arc::new(Self {
            config: config_tx,
            sequence: Sequence::default(),
            channels: ChannelIndex::default(),
            bridges: BridgeIndex::default(),
            registry,
            batch_state,
            batch_handle,
            dispatcher: Mutex::new(Some(dispatcher)),
        });

        let general = engine.settings();
        if general.enable {
            if general.batch {
                info!(
                    size = general.size,
                    time = general.time,
                    "CDR batch mode logging enabled"
                );
            } else {
                info!("CDR simple logging enabled");
            }
        } else {
            info!("CDR logging disabled");
        }

        engine
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.borrow())
    }

    pub(crate) fn settings(&self) -> GeneralConfig {
        self.config.borrow().general.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.borrow().general.enable
    }

    pub fn debug_enabled(&self) -> bool {
        self.config.borrow().general.debug
    }

    /// Toggle verbose engine tracing at runtime.
    pub fn set_debug(&self, on: bool) {
        self.config.send_modify(|config| {
            let mut updated = (**config).clone();
            updated.general.debug = on;
            *config = Arc::new(updated);
        });
    }

    /// Swap in a new configuration. Turning batch mode off drains whatever
    /// is pending under the old mode.
    pub fn reload(&self, new_config: Config) {
        let old = self.settings();
        if old.batch && !new_config.general.batch {
            self.batch_handle.submit();
        }

        let general = new_config.general.clone();
        self.config.send_replace(Arc::new(new_config));

        if general.enable {
            if general.batch {
                info!(
                    size = general.size,
                    time = general.time,
                    "CDR batch mode logging enabled"
                );
            } else {
                info!("CDR simple logging enabled");
            }
        } else {
            info!("CDR logging disabled, data will be lost");
        }
    }

    /// Register a backend sink.
    pub fn register_backend(
        &self,
        name: &str,
        description: &str,
        backend: Arc<dyn Backend>,
    ) -> Result<(), RegistryError> {
        self.registry.register(name, description, backend)
    }

    /// Remove a backend sink by name.
    pub fn unregister_backend(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    /// Force an immediate batch drain.
    pub fn submit_batch(&self) {
        self.batch_handle.submit();
    }

    /// Engine statistics for the status command.
    pub fn status(&self) -> EngineStatus {
        let config = self.config();
        let general = &config.general;
        EngineStatus {
            enabled: general.enable,
            debug: general.debug,
            batch_mode: general.batch,
            unanswered: general.unanswered,
            congestion: general.congestion,
            safe_shutdown: general.safeshutdown,
            scheduler_only: general.scheduleronly,
            batch_size: self.batch_state.len(),
            max_batch_size: general.size,
            max_batch_time: general.time,
            next_flush_secs: self.batch_state.seconds_until_flush(),
            backends: self.registry.descriptions(),
        }
    }

    /// Finalize and dispatch every live chain, then stop the dispatcher.
    /// Pending batches drain synchronously when safe shutdown is on.
    pub async fn shutdown(&self) {
        info!(chains = self.channels.len(), "CDR engine shutting down");

        let settings = self.settings();
        let mut outgoing = Vec::new();
        for chain in self.channels.all() {
            chain.finalize_all(true, &settings);
            outgoing.push(chain.externalize(&settings));
            self.channels.remove(chain.name());
            self.bridges.remove_chain(chain.name());
        }
        for records in outgoing {
            self.detach(records).await;
        }

        self.batch_handle.shutdown().await;
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Route finalized records toward the backends: inline when batching
    /// is off, through the queue otherwise.
    pub(crate) async fn detach(&self, records: Vec<ExternalRecord>) {
        if records.is_empty() {
            return;
        }

        let config = self.config();
        let general = &config.general;

        if !general.enable {
            debug!(records = records.len(), "dropping CDRs, engine disabled");
            return;
        }

        if !general.batch {
            crate::batch::post_batch(&self.registry, &config, records).await;
            return;
        }

        let queued = self.batch_state.push(records);
        if queued >= general.size as usize {
            self.batch_handle.submit();
        }
    }

    // Public API over chains.

    /// Read a standard property or variable from a channel's newest record.
    pub fn get_var(&self, channel: &str, name: &str) -> Result<String, EngineError> {
        let chain = self
            .channels
            .get(channel)
            .ok_or_else(|| EngineError::NotFound(channel.to_string()))?;
        Ok(chain.get_var(name, &self.settings()))
    }

    /// Set (or with `None` delete) a variable everywhere `channel` is one
    /// of the parties of a non-finalized record.
    pub fn set_var(
        &self,
        channel: &str,
        name: &str,
        value: Option<&str>,
    ) -> Result<(), EngineError> {
        if is_readonly_var(name) {
            return Err(EngineError::ReadOnly(name.to_string()));
        }

        let mut found = self.channels.get(channel).is_some();
        for chain in self.channels.all() {
            found |= chain.set_var(channel, name, value) > 0;
        }
        if !found {
            return Err(EngineError::NotFound(channel.to_string()));
        }
        Ok(())
    }

    /// Copy a userfield to every non-finalized record that involves
    /// `channel`, on whichever side it appears.
    pub fn set_userfield(&self, channel: &str, userfield: &str) -> Result<(), EngineError> {
        let owner = self.channels.get(channel);
        if let Some(chain) = owner.as_ref() {
            chain.set_userfield_party_a(userfield);
        }
        for chain in self.channels.all() {
            chain.set_userfield_party_b(channel, userfield);
        }
        owner
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(channel.to_string()))
    }

    /// Set a flag on every non-finalized record of the channel's chain.
    pub fn set_property(&self, channel: &str, property: CdrProperty) -> Result<(), EngineError> {
        let chain = self
            .channels
            .get(channel)
            .ok_or_else(|| EngineError::NotFound(channel.to_string()))?;
        chain.set_property(property, true);
        Ok(())
    }

    /// Clear a flag on every non-finalized record of the channel's chain.
    pub fn clear_property(&self, channel: &str, property: CdrProperty) -> Result<(), EngineError> {
        let chain = self
            .channels
            .get(channel)
            .ok_or_else(|| EngineError::NotFound(channel.to_string()))?;
        chain.set_property(property, false);
        Ok(())
    }

    /// Restart the chain's clock, optionally keeping variables.
    pub fn reset(&self, channel: &str, options: ResetOptions) -> Result<(), EngineError> {
        let chain = self
            .channels
            .get(channel)
            .ok_or_else(|| EngineError::NotFound(channel.to_string()))?;
        chain.reset(options, &self.settings());
        Ok(())
    }

    /// Append a new chain element continuing the newest record.
    pub fn fork(&self, channel: &str, options: ForkOptions) -> Result<(), EngineError> {
        let chain = self
            .channels
            .get(channel)
            .ok_or_else(|| EngineError::NotFound(channel.to_string()))?;
        if !chain.fork(options, &self.sequence, &self.settings()) {
            return Err(EngineError::Finalized(channel.to_string()));
        }
        Ok(())
    }

    /// Concatenate all variables and properties of every record in the
    /// chain.
    pub fn serialize_variables(
        &self,
        channel: &str,
        delim: char,
        sep: char,
    ) -> Result<String, EngineError> {
        let chain = self
            .channels
            .get(channel)
            .ok_or_else(|| EngineError::NotFound(channel.to_string()))?;
        Ok(chain.serialize_variables(delim, sep, &self.settings()))
    }
}
