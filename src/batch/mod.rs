//! The batch dispatcher.
//!
//! Finalized records converge on one FIFO queue. A background task drains
//! it when the queue reaches the configured size or the batch timer fires,
//! whichever comes first; `cdr submit` and engine shutdown force a drain.
//! Each drain either posts inline (scheduler-only mode and shutdown) or on
//! a detached task. Batches live only in memory; a hard crash loses them
//! by design.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};

use crate::backend::BackendRegistry;
use crate::cdr::ExternalRecord;
use crate::config::Config;

/// Commands accepted by the dispatcher task.
#[derive(Debug)]
pub enum BatchCommand {
    /// Drain now.
    Flush,
    /// Drain (when safe shutdown is configured) and stop.
    Shutdown,
}

/// Queue state shared between the engine and the dispatcher task.
#[derive(Debug, Default)]
pub struct BatchState {
    queue: Mutex<Vec<ExternalRecord>>,
    next_flush: Mutex<Option<Instant>>,
}

impl BatchState {
    /// Append records; returns the queue length afterwards.
    pub fn push(&self, records: Vec<ExternalRecord>) -> usize {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.extend(records);
        queue.len()
    }

    /// Atomically swap the queue out.
    pub fn take(&self) -> Vec<ExternalRecord> {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *queue)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seconds until the next scheduled drain, while the dispatcher runs.
    pub fn seconds_until_flush(&self) -> Option<u64> {
        self.next_flush
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs())
    }

    fn set_deadline(&self, deadline: Instant) {
        *self.next_flush.lock().unwrap_or_else(|e| e.into_inner()) = Some(deadline);
    }
}

/// Cheap handle for submitting dispatcher commands.
#[derive(Clone)]
pub struct BatchHandle {
    tx: mpsc::Sender<BatchCommand>,
}

impl BatchHandle {
    /// Ask for an immediate drain without blocking.
    pub fn submit(&self) {
        let _ = self.tx.try_send(BatchCommand::Flush);
    }

    /// Ask the dispatcher to drain (if configured) and stop.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(BatchCommand::Shutdown).await;
    }
}

/// The dispatcher task.
pub struct BatchDispatcher {
    state: Arc<BatchState>,
    registry: Arc<BackendRegistry>,
    config: watch::Receiver<Arc<Config>>,
    commands: mpsc::Receiver<BatchCommand>,
}

impl BatchDispatcher {
    /// Build the dispatcher and its command handle.
    pub fn new(
        state: Arc<BatchState>,
        registry: Arc<BackendRegistry>,
        config: watch::Receiver<Arc<Config>>,
    ) -> (Self, BatchHandle) {
        let (tx, commands) = mpsc::channel(64);
        (
            Self {
                state,
                registry,
                config,
                commands,
            },
            BatchHandle { tx },
        )
    }

    /// Run until shutdown. Spawn with `tokio::spawn`.
    pub async fn run(mut self) {
        loop {
            let time = self.config.borrow().general.time;
            let deadline = Instant::now() + Duration::from_secs(time);
            self.state.set_deadline(deadline);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(BatchCommand::Flush) => self.drain(false).await,
                    Some(BatchCommand::Shutdown) | None => {
                        let safe = self.config.borrow().general.safeshutdown;
                        if safe {
                            self.drain(true).await;
                        }
                        break;
                    }
                },
                _ = sleep_until(deadline) => self.drain(false).await,
            }
        }
        self.registry.flush().await;
        info!("batch dispatcher stopped");
    }

    async fn drain(&self, inline: bool) {
        let records = self.state.take();
        if records.is_empty() {
            return;
        }

        let config = Arc::clone(&self.config.borrow());
        let scheduler_only = config.general.scheduleronly;
        debug!(records = records.len(), inline, "draining CDR batch");

        if inline || scheduler_only {
            post_batch(&self.registry, &config, records).await;
        } else {
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                post_batch(&registry, &config, records).await;
            });
        }
    }
}

/// Hand a drained batch to every backend, applying the post filter.
pub async fn post_batch(
    registry: &BackendRegistry,
    config: &Config,
    records: Vec<ExternalRecord>,
) {
    for record in records {
        if record.should_post(&config.general) {
            registry.post(&record).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;

    fn sample() -> ExternalRecord {
        crate::backend::memory::tests::sample_record()
    }

    #[test]
    fn test_state_push_and_take() {
        let state = BatchState::default();
        assert_eq!(state.push(vec![sample()]), 1);
        assert_eq!(state.push(vec![sample(), sample()]), 3);
        assert_eq!(state.take().len(), 3);
        assert!(state.is_empty());
    }

    #[tokio::test]
    async fn test_flush_command_drains_to_backends() {
        let state = Arc::new(BatchState::default());
        let registry = Arc::new(BackendRegistry::new());
        let memory = Arc::new(MemoryBackend::new(16));
        registry.register("mem", "", memory.clone()).unwrap();

        let (_, config_rx) = watch::channel(Arc::new(Config::default()));
        let (dispatcher, handle) = BatchDispatcher::new(
            Arc::clone(&state),
            Arc::clone(&registry),
            config_rx,
        );
        let task = tokio::spawn(dispatcher.run());

        state.push(vec![sample(), sample()]);
        handle.submit();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(memory.count(), 2);

        handle.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_safe_shutdown_drains_pending() {
        let state = Arc::new(BatchState::default());
        let registry = Arc::new(BackendRegistry::new());
        let memory = Arc::new(MemoryBackend::new(16));
        registry.register("mem", "", memory.clone()).unwrap();

        let (_, config_rx) = watch::channel(Arc::new(Config::default()));
        let (dispatcher, handle) = BatchDispatcher::new(
            Arc::clone(&state),
            Arc::clone(&registry),
            config_rx,
        );
        let task = tokio::spawn(dispatcher.run());

        state.push(vec![sample()]);
        handle.shutdown().await;
        task.await.unwrap();
        assert_eq!(memory.count(), 1);
    }

    #[tokio::test]
    async fn test_disabled_records_never_post() {
        let registry = BackendRegistry::new();
        let memory = Arc::new(MemoryBackend::new(16));
        registry.register("mem", "", memory.clone()).unwrap();

        let mut disabled = sample();
        disabled.disabled = true;
        post_batch(&registry, &Config::default(), vec![disabled, sample()]).await;
        assert_eq!(memory.count(), 1);
    }
}
