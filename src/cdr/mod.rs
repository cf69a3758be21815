//! Call Detail Record core.
//!
//! The types that make up the record model:
//! - Channel/bridge snapshots and per-party engine state
//! - The record state machine (one lifecycle per channel event stream)
//! - Per-channel chains of records
//! - The externalized record handed to backends

mod chain;
mod external;
mod record;
mod snapshot;
mod state;

pub use chain::{CdrChain, ForkOptions, ResetOptions, Sequence};
pub use external::ExternalRecord;
pub use record::{is_readonly_var, CdrProperty, CdrRecord, Disposition, RecordFlags, READONLY_VARS};
pub use snapshot::{
    cause, is_dialed, pick_party_a, BridgeSnapshot, ChannelFlags, ChannelSnapshot, ChannelState,
    CdrSnapshot, Picked, Variables,
};
pub use state::CdrState;
