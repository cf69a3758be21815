//! cdrd — a Call Detail Record engine.
//!
//! Consumes an asynchronous stream of channel/bridge lifecycle events,
//! aggregates them into billable call records through a per-channel state
//! machine, and delivers finalized records to pluggable backends, either
//! immediately or on a size-or-time batch schedule.
//!
//! The engine is a constructed value: build one with
//! [`engine::Engine::new`], feed it [`events::EngineEvent`]s, register
//! [`backend::Backend`] sinks, and tear it down with
//! [`engine::Engine::shutdown`].

pub mod backend;
pub mod batch;
pub mod cdr;
pub mod cli;
pub mod config;
pub mod engine;
pub mod events;
pub mod telemetry;

pub use engine::{Engine, EngineError};
