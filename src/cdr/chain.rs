//! Per-channel record chains.
//!
//! A chain owns every record produced for one Party-A channel, newest last.
//! All traversal and mutation happens under the chain's single lock; the
//! router and the public API never observe a chain mid-update.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::debug;

use crate::config::GeneralConfig;

use super::external::ExternalRecord;
use super::record::{CdrProperty, CdrRecord, READONLY_VARS};
use super::snapshot::{is_dialed, ChannelSnapshot, ChannelState, CdrSnapshot, Variables};
use super::state::CdrState;

/// Engine-wide record sequence counter; provides a total order on records.
#[derive(Debug, Default)]
pub struct Sequence(AtomicU32);

impl Sequence {
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Options for [`CdrChain::fork`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ForkOptions {
    /// Re-answer now if Party A is up.
    pub set_answer: bool,
    /// Start the new record's clock from now.
    pub reset: bool,
    /// Carry variables over to the new record.
    pub keep_vars: bool,
    /// Finalize every prior non-finalized record in the chain.
    pub finalize: bool,
}

/// Options for [`CdrChain::reset`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOptions {
    pub keep_vars: bool,
}

/// A chain of records sharing one Party-A channel name.
#[derive(Debug)]
pub struct CdrChain {
    name: String,
    records: Mutex<Vec<CdrRecord>>,
}

impl CdrChain {
    /// Create a chain seeded with a newborn Single record for `snapshot`.
    pub fn new(snapshot: Arc<ChannelSnapshot>, sequence: &Sequence, settings: &GeneralConfig) -> Arc<Self> {
        let name = snapshot.name.clone();
        let record = CdrRecord::new(CdrSnapshot::new(snapshot), sequence.next(), settings);
        debug!(channel = %name, "created CDR chain");
        Arc::new(Self {
            name,
            records: Mutex::new(vec![record]),
        })
    }

    /// Create a chain whose first record is fully prepared by the caller.
    /// Used by bridge pairing when it fabricates a chain for a party that
    /// was only ever seen as somebody's Party B.
    pub fn from_record(name: &str, record: CdrRecord) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            records: Mutex::new(vec![record]),
        })
    }

    /// The Party-A channel name. Immutable after creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the chain for a multi-step router operation.
    pub fn lock(&self) -> MutexGuard<'_, Vec<CdrRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a new Single record inheriting Party A from the current last
    /// element. Returns the new record's index.
    pub fn append_locked(
        records: &mut Vec<CdrRecord>,
        sequence: &Sequence,
        settings: &GeneralConfig,
    ) -> usize {
        let last = records.last().expect("chain is never empty");
        let party_a = last.party_a.clone();
        let (linkedid, appl, data) = (last.linkedid.clone(), last.appl.clone(), last.data.clone());

        let mut record = CdrRecord::new(party_a, sequence.next(), settings);
        record.linkedid = linkedid;
        record.appl = appl;
        record.data = data;
        records.push(record);
        records.len() - 1
    }

    /// Finalize every record. Optionally transition them to the terminal
    /// state as well (shutdown does, channel teardown does not).
    pub fn finalize_all(&self, transition: bool, settings: &GeneralConfig) {
        let mut records = self.lock();
        for record in records.iter_mut() {
            record.finalize(settings);
            if transition && !record.is_finalized() {
                record.transition(CdrState::Finalized, settings);
            }
        }
    }

    /// Externalize the whole chain. Records whose Party A is a dialed
    /// channel are billed from the caller's chain and skipped here.
    pub fn externalize(&self, settings: &GeneralConfig) -> Vec<ExternalRecord> {
        let records = self.lock();
        records
            .iter()
            .filter(|r| !is_dialed(&r.party_a.snapshot))
            .map(|r| ExternalRecord::from_record(r, settings))
            .collect()
    }

    /// Read a standard property or Party-A variable from the newest record.
    pub fn get_var(&self, name: &str, settings: &GeneralConfig) -> String {
        let records = self.lock();
        let last = records.last().expect("chain is never empty");
        last.format_property(name, settings)
            .unwrap_or_else(|| last.format_variable(name))
    }

    /// Set (or with `None` delete) a variable on every non-finalized record
    /// where `channel` is one of the parties. Returns how many records were
    /// touched.
    pub fn set_var(&self, channel: &str, name: &str, value: Option<&str>) -> usize {
        let mut records = self.lock();
        let mut touched = 0;
        for record in records.iter_mut().filter(|r| !r.is_finalized()) {
            if record.party_a.name() == channel {
                record.party_a.variables.set(name, value);
                touched += 1;
            } else if let Some(party_b) = record
                .party_b
                .as_mut()
                .filter(|b| b.name() == channel)
            {
                party_b.variables.set(name, value);
                touched += 1;
            }
        }
        touched
    }

    /// Copy `userfield` to Party A of every non-finalized record.
    pub fn set_userfield_party_a(&self, userfield: &str) {
        let mut records = self.lock();
        for record in records.iter_mut().filter(|r| !r.is_finalized()) {
            record.party_a.userfield = userfield.to_string();
        }
    }

    /// Copy `userfield` to Party B of every non-finalized record whose
    /// Party B is `channel`.
    pub fn set_userfield_party_b(&self, channel: &str, userfield: &str) {
        let mut records = self.lock();
        for record in records.iter_mut().filter(|r| !r.is_finalized()) {
            if let Some(party_b) = record.party_b.as_mut().filter(|b| b.name() == channel) {
                party_b.userfield = userfield.to_string();
            }
        }
    }

    /// Set or clear a flag on every non-finalized record.
    pub fn set_property(&self, property: CdrProperty, on: bool) {
        let mut records = self.lock();
        for record in records.iter_mut().filter(|r| !r.is_finalized()) {
            match property {
                CdrProperty::Disable => record.flags.disabled = on,
            }
        }
    }

    /// Wipe the chain's timestamps and (optionally) variables, restarting
    /// every record's clock from now.
    pub fn reset(&self, options: ResetOptions, _settings: &GeneralConfig) {
        let mut records = self.lock();
        for record in records.iter_mut() {
            if !options.keep_vars {
                record.party_a.variables.clear();
                if let Some(party_b) = record.party_b.as_mut() {
                    party_b.variables.clear();
                }
            }
            record.start = Some(Utc::now());
            record.answer = None;
            record.end = None;
            record.check_answer();
        }
    }

    /// Append a new element continuing the newest record. Returns `false`
    /// when the newest record is already finalized.
    pub fn fork(&self, options: ForkOptions, sequence: &Sequence, settings: &GeneralConfig) -> bool {
        let mut records = self.lock();
        let source_idx = records.len() - 1;
        if records[source_idx].is_finalized() {
            return false;
        }

        debug!(channel = %self.name, "forking CDR");
        let new_idx = Self::append_locked(&mut records, sequence, settings);
        let source = records[source_idx].clone();
        let record = &mut records[new_idx];

        // The fork continues the current record rather than starting over.
        record.state = source.state;
        record.bridge_id = source.bridge_id.clone();
        record.flags = source.flags;
        record.start = source.start;
        record.answer = source.answer;

        if let Some(party_b) = source.party_b {
            record.party_b = Some(CdrSnapshot {
                snapshot: party_b.snapshot,
                userfield: party_b.userfield,
                party_a_flag: party_b.party_a_flag,
                variables: if options.keep_vars {
                    party_b.variables
                } else {
                    Variables::new()
                },
            });
        }

        if options.set_answer && record.party_a.snapshot.state == ChannelState::Up {
            record.answer = Some(Utc::now());
        }
        if options.reset {
            let now = Utc::now();
            record.answer = Some(now);
            record.start = Some(now);
        }
        if !options.keep_vars {
            record.party_a.variables.clear();
        }

        if options.finalize {
            for record in records[..new_idx].iter_mut() {
                if record.is_finalized() {
                    continue;
                }
                record.finalize(settings);
                record.transition(CdrState::Finalized, settings);
            }
        }

        true
    }

    /// Concatenate variables and standard properties of every record.
    pub fn serialize_variables(&self, delim: char, sep: char, settings: &GeneralConfig) -> String {
        let records = self.lock();
        let mut out = String::new();
        for (i, record) in records.iter().enumerate() {
            let level = i + 1;
            if i > 0 {
                out.push('\n');
            }
            for (name, value) in record.party_a.variables.iter() {
                out.push_str(&format!("level {level}: {name}{delim}{value}{sep}"));
            }
            for name in READONLY_VARS {
                let value = record
                    .format_property(name, settings)
                    .unwrap_or_default();
                if !value.is_empty() {
                    out.push_str(&format!("level {level}: {name}{delim}{value}{sep}"));
                }
            }
        }
        out
    }
}
