//! The in-memory record the state machine operates on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GeneralConfig;

use super::snapshot::{cause, ChannelSnapshot, ChannelState, CdrSnapshot};
use super::state::CdrState;
use crate::events::DialStatus;

/// Outcome classification of a call record.
///
/// The numeric codes are wire-compatible with the classic billing values;
/// note that CONGESTION sorts above ANSWERED, so congestion records always
/// pass the unanswered post filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Disposition {
    #[default]
    Null,
    Failed,
    Busy,
    NoAnswer,
    Answered,
    Congestion,
}

impl Disposition {
    pub fn code(self) -> u32 {
        match self {
            Disposition::Null => 0,
            Disposition::Failed => 1,
            Disposition::Busy => 2,
            Disposition::NoAnswer => 3,
            Disposition::Answered => 4,
            Disposition::Congestion => 8,
        }
    }

    /// Map a hangup cause code. Causes outside the mapped set leave the
    /// disposition untouched.
    pub fn from_cause(cause_code: u32, congestion_enabled: bool) -> Option<Self> {
        match cause_code {
            cause::BUSY => Some(Disposition::Busy),
            cause::CONGESTION => Some(if congestion_enabled {
                Disposition::Congestion
            } else {
                Disposition::Failed
            }),
            cause::NO_ROUTE_DESTINATION | cause::UNREGISTERED => Some(Disposition::Failed),
            cause::NORMAL_CLEARING | cause::NO_ANSWER => Some(Disposition::NoAnswer),
            _ => None,
        }
    }

    pub fn from_dial_status(status: DialStatus, congestion_enabled: bool) -> Self {
        match status {
            DialStatus::Answer => Disposition::Answered,
            DialStatus::Busy => Disposition::Busy,
            DialStatus::Cancel | DialStatus::NoAnswer => Disposition::NoAnswer,
            DialStatus::Congestion => {
                if congestion_enabled {
                    Disposition::Congestion
                } else {
                    Disposition::Failed
                }
            }
            DialStatus::Failed => Disposition::Failed,
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The null disposition reads as NO ANSWER for backward
        // compatibility with the classic billing format.
        let s = match self {
            Disposition::Null | Disposition::NoAnswer => "NO ANSWER",
            Disposition::Failed => "FAILED",
            Disposition::Busy => "BUSY",
            Disposition::Answered => "ANSWERED",
            Disposition::Congestion => "CONGESTION",
        };
        f.write_str(s)
    }
}

/// Engine-settable flags on a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFlags {
    /// Suppress posting of this record.
    pub disabled: bool,
}

/// Flags addressable through the set/clear property API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdrProperty {
    Disable,
}

/// Standard property names that cannot be set as variables.
pub const READONLY_VARS: &[&str] = &[
    "clid",
    "src",
    "dst",
    "dcontext",
    "channel",
    "dstchannel",
    "lastapp",
    "lastdata",
    "start",
    "answer",
    "end",
    "duration",
    "billsec",
    "disposition",
    "amaflags",
    "accountcode",
    "peeraccount",
    "uniqueid",
    "linkedid",
    "userfield",
    "sequence",
];

pub fn is_readonly_var(name: &str) -> bool {
    READONLY_VARS.iter().any(|v| v.eq_ignore_ascii_case(name))
}

/// One node of a per-channel chain.
#[derive(Debug, Clone)]
pub struct CdrRecord {
    pub party_a: CdrSnapshot,
    pub party_b: Option<CdrSnapshot>,
    pub state: CdrState,
    pub disposition: Disposition,
    pub start: Option<DateTime<Utc>>,
    pub answer: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub sequence: u32,
    pub flags: RecordFlags,
    /// Cached here as it may change out from under Party A.
    pub linkedid: String,
    /// Party A channel name; immutable for the life of the chain.
    pub name: String,
    /// The bridge Party A happens to be in.
    pub bridge_id: String,
    /// Last accepted application Party A was in, and its data.
    pub appl: String,
    pub data: String,
}

impl CdrRecord {
    /// Create a newborn record in the Single state.
    pub fn new(party_a: CdrSnapshot, sequence: u32, settings: &GeneralConfig) -> Self {
        let mut record = Self {
            name: party_a.snapshot.name.clone(),
            linkedid: party_a.snapshot.linkedid.clone(),
            party_a,
            party_b: None,
            state: CdrState::Single,
            disposition: Disposition::Null,
            start: None,
            answer: None,
            end: None,
            sequence,
            flags: RecordFlags::default(),
            bridge_id: String::new(),
            appl: String::new(),
            data: String::new(),
        };
        record.enter_state(settings);
        record
    }

    pub fn is_finalized(&self) -> bool {
        self.state == CdrState::Finalized
    }

    /// Move to a new state and run its entry behavior.
    pub fn transition(&mut self, state: CdrState, settings: &GeneralConfig) {
        if settings.debug {
            debug!(
                channel = %self.name,
                sequence = self.sequence,
                from = %self.state,
                to = %state,
                "CDR state transition"
            );
        }
        self.state = state;
        self.enter_state(settings);
    }

    fn enter_state(&mut self, settings: &GeneralConfig) {
        match self.state {
            CdrState::Single => {
                self.start = Some(Utc::now());
                self.check_answer();
            }
            CdrState::BridgedPending => {
                self.flags.disabled = true;
            }
            CdrState::Finalized => {
                if settings.endbeforehexten {
                    self.finalize(settings);
                }
            }
            _ => {}
        }
    }

    /// Set the answer time if Party A is up and we have not answered yet.
    /// Safe to call repeatedly.
    pub fn check_answer(&mut self) {
        if self.party_a.snapshot.state == ChannelState::Up && self.answer.is_none() {
            self.answer = Some(Utc::now());
        }
    }

    /// Move to Finalized if Party A has hung up.
    pub fn check_hangup(&mut self, settings: &GeneralConfig) {
        if self.party_a.snapshot.flags.zombie && self.state != CdrState::Finalized {
            self.transition(CdrState::Finalized, settings);
        }
    }

    /// Freeze the end time and resolve the disposition. Idempotent; does
    /// not change the record's state.
    pub fn finalize(&mut self, settings: &GeneralConfig) {
        if self.end.is_some() {
            return;
        }
        self.end = Some(Utc::now());

        if self.disposition == Disposition::Null {
            self.disposition = if self.answer.is_some() {
                Disposition::Answered
            } else if self.party_a.snapshot.hangup_cause != cause::NONE {
                Disposition::from_cause(self.party_a.snapshot.hangup_cause, settings.congestion)
                    .unwrap_or(Disposition::Failed)
            } else if let Some(cause_code) = self
                .party_b
                .as_ref()
                .map(|b| b.snapshot.hangup_cause)
                .filter(|c| *c != cause::NONE)
            {
                Disposition::from_cause(cause_code, settings.congestion)
                    .unwrap_or(Disposition::Failed)
            } else {
                Disposition::Failed
            };
        }

        debug!(
            channel = %self.name,
            sequence = self.sequence,
            disposition = %self.disposition,
            "finalized CDR"
        );
    }

    /// Elapsed whole seconds from start to end (or to now while live).
    pub fn duration(&self) -> i64 {
        let Some(start) = self.start else { return 0 };
        let end = self.end.unwrap_or_else(Utc::now);
        (end - start).num_milliseconds().max(0) / 1000
    }

    /// Billable seconds from answer to end; zero when never answered.
    pub fn billsec(&self, settings: &GeneralConfig) -> i64 {
        let Some(answer) = self.answer else { return 0 };
        let end = self.end.unwrap_or_else(Utc::now);
        let ms = (end - answer).num_milliseconds().max(0);
        if settings.initiatedseconds && ms % 1000 >= 500 {
            ms / 1000 + 1
        } else {
            ms / 1000
        }
    }

    /// Swap Party A's snapshot, preserving caller id fields.
    pub fn swap_party_a(&mut self, snapshot: &Arc<ChannelSnapshot>) {
        self.party_a.swap(snapshot);
    }

    /// Format a standard property; `None` when the name is not one.
    pub fn format_property(&self, name: &str, settings: &GeneralConfig) -> Option<String> {
        let party_a = &self.party_a.snapshot;
        let party_b = self.party_b.as_ref().map(|b| &b.snapshot);
        let value = match name.to_ascii_lowercase().as_str() {
            "clid" => party_a.callerid(),
            "src" => party_a.caller_number.clone(),
            "dst" => party_a.exten.clone(),
            "dcontext" => party_a.context.clone(),
            "channel" => party_a.name.clone(),
            "dstchannel" => party_b.map(|b| b.name.clone()).unwrap_or_default(),
            "lastapp" => party_a.appl.clone(),
            "lastdata" => party_a.data.clone(),
            "start" => format_time(self.start),
            "answer" => format_time(self.answer),
            "end" => format_time(self.end),
            "duration" => self.duration().to_string(),
            "billsec" => self.billsec(settings).to_string(),
            "disposition" => self.disposition.code().to_string(),
            "amaflags" => party_a.amaflags.to_string(),
            "accountcode" => party_a.accountcode.clone(),
            "peeraccount" => party_b.map(|b| b.accountcode.clone()).unwrap_or_default(),
            "uniqueid" => party_a.uniqueid.clone(),
            "linkedid" => self.linkedid.clone(),
            "userfield" => self.party_a.userfield.clone(),
            "sequence" => self.sequence.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Look up a Party A variable.
    pub fn format_variable(&self, name: &str) -> String {
        self.party_a
            .variables
            .get(name)
            .unwrap_or_default()
            .to_string()
    }
}

fn format_time(when: Option<DateTime<Utc>>) -> String {
    match when {
        Some(t) => format!("{}.{:06}", t.timestamp(), t.timestamp_subsec_micros()),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdr::snapshot::Variables;
    use chrono::Duration;

    fn settings() -> GeneralConfig {
        GeneralConfig::default()
    }

    fn record() -> CdrRecord {
        let snapshot = Arc::new(ChannelSnapshot {
            name: "SIP/alice-1".into(),
            uniqueid: "uid-1".into(),
            linkedid: "lid-1".into(),
            caller_name: "Alice".into(),
            caller_number: "100".into(),
            exten: "200".into(),
            context: "default".into(),
            creation_time: Utc::now(),
            ..Default::default()
        });
        CdrRecord::new(CdrSnapshot::new(snapshot), 1, &settings())
    }

    #[test]
    fn test_new_record_starts_in_single() {
        let rec = record();
        assert_eq!(rec.state, CdrState::Single);
        assert!(rec.start.is_some());
        assert!(rec.answer.is_none());
        assert_eq!(rec.disposition, Disposition::Null);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut rec = record();
        rec.finalize(&settings());
        let first_end = rec.end;
        let first_disposition = rec.disposition;
        rec.finalize(&settings());
        assert_eq!(rec.end, first_end);
        assert_eq!(rec.disposition, first_disposition);
    }

    #[test]
    fn test_finalize_resolves_answered() {
        let mut rec = record();
        rec.answer = Some(Utc::now());
        rec.finalize(&settings());
        assert_eq!(rec.disposition, Disposition::Answered);
    }

    #[test]
    fn test_finalize_maps_hangup_cause() {
        let mut rec = record();
        Arc::make_mut(&mut rec.party_a.snapshot).hangup_cause = cause::BUSY;
        rec.finalize(&settings());
        assert_eq!(rec.disposition, Disposition::Busy);
    }

    #[test]
    fn test_congestion_maps_to_failed_unless_enabled() {
        let mut rec = record();
        Arc::make_mut(&mut rec.party_a.snapshot).hangup_cause = cause::CONGESTION;
        rec.finalize(&settings());
        assert_eq!(rec.disposition, Disposition::Failed);

        let mut rec = record();
        Arc::make_mut(&mut rec.party_a.snapshot).hangup_cause = cause::CONGESTION;
        let mut cfg = settings();
        cfg.congestion = true;
        rec.finalize(&cfg);
        assert_eq!(rec.disposition, Disposition::Congestion);
    }

    #[test]
    fn test_billsec_zero_without_answer() {
        let mut rec = record();
        rec.finalize(&settings());
        assert_eq!(rec.billsec(&settings()), 0);
        assert!(rec.duration() >= 0);
    }

    #[test]
    fn test_billsec_initiated_seconds_rounds_up() {
        let mut rec = record();
        let now = Utc::now();
        rec.answer = Some(now - Duration::milliseconds(2600));
        rec.end = Some(now);
        assert_eq!(rec.billsec(&settings()), 2);
        let mut cfg = settings();
        cfg.initiatedseconds = true;
        assert_eq!(rec.billsec(&cfg), 3);
    }

    #[test]
    fn test_format_property_and_variable() {
        let mut rec = record();
        rec.party_a.variables = {
            let mut v = Variables::new();
            v.set("custom", Some("value"));
            v
        };
        assert_eq!(rec.format_property("channel", &settings()).unwrap(), "SIP/alice-1");
        assert_eq!(rec.format_property("clid", &settings()).unwrap(), "\"Alice\" <100>");
        assert_eq!(rec.format_property("dstchannel", &settings()).unwrap(), "");
        assert!(rec.format_property("nonsense", &settings()).is_none());
        assert_eq!(rec.format_variable("custom"), "value");
    }

    #[test]
    fn test_readonly_var_detection() {
        assert!(is_readonly_var("BillSec"));
        assert!(is_readonly_var("userfield"));
        assert!(!is_readonly_var("myvar"));
    }
}
