//! Channel and bridge snapshots, and the per-party state the engine keeps
//! on top of them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hangup cause codes (Q.931 subset the engine cares about).
pub mod cause {
    pub const NONE: u32 = 0;
    pub const NO_ROUTE_DESTINATION: u32 = 3;
    pub const NORMAL_CLEARING: u32 = 16;
    pub const BUSY: u32 = 17;
    pub const NO_ANSWER: u32 = 19;
    pub const UNREGISTERED: u32 = 20;
    pub const CONGESTION: u32 = 34;
}

/// Channel state as reported by the upstream snapshot producer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Down,
    Reserved,
    OffHook,
    Dialing,
    Ring,
    Ringing,
    Up,
    Busy,
}

/// Lifecycle flags carried on a channel snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFlags {
    /// Channel has hung up; the snapshot is the channel's last word.
    #[serde(default)]
    pub zombie: bool,
    /// Channel was created outbound.
    #[serde(default)]
    pub outgoing: bool,
    /// Channel was originated rather than dialed.
    #[serde(default)]
    pub originated: bool,
}

/// Immutable point-in-time state of a channel, published by the upstream
/// producer. Shared by reference between every record that observes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    /// Channel name; the unique chain key.
    pub name: String,
    pub uniqueid: String,
    /// Call-wide id shared by all channels in a call.
    #[serde(default)]
    pub linkedid: String,
    #[serde(default)]
    pub caller_name: String,
    #[serde(default)]
    pub caller_number: String,
    #[serde(default)]
    pub caller_dnid: String,
    #[serde(default)]
    pub caller_subaddr: String,
    #[serde(default)]
    pub dialed_subaddr: String,
    /// Dialplan location.
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub exten: String,
    #[serde(default)]
    pub priority: u32,
    /// Currently executing application and its argument string.
    #[serde(default)]
    pub appl: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub accountcode: String,
    #[serde(default)]
    pub amaflags: u32,
    #[serde(default)]
    pub hangup_cause: u32,
    pub creation_time: DateTime<Utc>,
    #[serde(default)]
    pub flags: ChannelFlags,
    #[serde(default)]
    pub state: ChannelState,
}

impl ChannelSnapshot {
    /// Caller id in the classic `"Name" <number>` presentation.
    pub fn callerid(&self) -> String {
        match (self.caller_name.is_empty(), self.caller_number.is_empty()) {
            (false, false) => format!("\"{}\" <{}>", self.caller_name, self.caller_number),
            (false, true) => self.caller_name.clone(),
            (true, false) => self.caller_number.clone(),
            (true, true) => String::new(),
        }
    }

    /// Whether the dialplan location or application changed between two
    /// snapshots. Drives new-record decisions.
    pub fn cep_changed(&self, other: &ChannelSnapshot) -> bool {
        self.context != other.context
            || self.exten != other.exten
            || self.priority != other.priority
            || self.appl != other.appl
    }
}

/// Point-in-time state of a bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeSnapshot {
    pub uniqueid: String,
    #[serde(default)]
    pub technology: String,
}

/// A channel created as the result of a dial and not independently
/// originated. Dialed parties never win Party A.
pub fn is_dialed(snapshot: &ChannelSnapshot) -> bool {
    snapshot.flags.outgoing && !snapshot.flags.originated
}

/// Insertion-ordered variable map. Names are matched case-insensitively;
/// setting an empty-name variable is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Variables(Vec<(String, String)>);

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set, replace or (with `None`) delete a variable.
    pub fn set(&mut self, name: &str, value: Option<&str>) {
        if name.is_empty() {
            return;
        }
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        if let Some(value) = value {
            self.0.push((name.to_string(), value.to_string()));
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Copy every non-empty variable from `other` that is not already set.
    pub fn merge_missing(&mut self, other: &Variables) {
        for (name, value) in other.iter() {
            if !value.is_empty() && !self.contains(name) {
                self.0.push((name.to_string(), value.to_string()));
            }
        }
    }
}

/// One party of a record: a shared channel snapshot plus the mutable
/// engine-owned state that survives snapshot swaps.
#[derive(Debug, Clone)]
pub struct CdrSnapshot {
    pub snapshot: Arc<ChannelSnapshot>,
    pub userfield: String,
    /// This party has been explicitly pinned as Party A.
    pub party_a_flag: bool,
    pub variables: Variables,
}

impl CdrSnapshot {
    pub fn new(snapshot: Arc<ChannelSnapshot>) -> Self {
        let mut party = Self {
            snapshot: Arc::clone(&snapshot),
            userfield: String::new(),
            party_a_flag: false,
            variables: Variables::new(),
        };
        party.preserve_cid(&snapshot);
        party
    }

    pub fn name(&self) -> &str {
        &self.snapshot.name
    }

    /// Replace the underlying channel snapshot, preserving caller id fields
    /// that change between snapshots into the variable map first.
    pub fn swap(&mut self, new_snapshot: &Arc<ChannelSnapshot>) {
        if self.snapshot.caller_dnid != new_snapshot.caller_dnid {
            self.variables.set("dnid", Some(&new_snapshot.caller_dnid));
        }
        if self.snapshot.caller_subaddr != new_snapshot.caller_subaddr {
            self.variables
                .set("callingsubaddr", Some(&new_snapshot.caller_subaddr));
        }
        if self.snapshot.dialed_subaddr != new_snapshot.dialed_subaddr {
            self.variables
                .set("calledsubaddr", Some(&new_snapshot.dialed_subaddr));
        }
        self.snapshot = Arc::clone(new_snapshot);
    }

    fn preserve_cid(&mut self, snapshot: &ChannelSnapshot) {
        if !snapshot.caller_dnid.is_empty() {
            self.variables.set("dnid", Some(&snapshot.caller_dnid));
        }
        if !snapshot.caller_subaddr.is_empty() {
            self.variables
                .set("callingsubaddr", Some(&snapshot.caller_subaddr));
        }
        if !snapshot.dialed_subaddr.is_empty() {
            self.variables
                .set("calledsubaddr", Some(&snapshot.dialed_subaddr));
        }
    }
}

/// Which of the two parties handed to [`pick_party_a`] won.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Picked {
    Left,
    Right,
}

/// Decide which of two parties is Party A for a record.
///
/// Dialed parties lose to non-dialed parties; an explicit Party-A flag wins
/// next; earlier creation time wins last. On equal seconds the right side
/// wins only when the left's microseconds are strictly greater, otherwise
/// the left wins. The asymmetry is long-standing upstream behavior and is
/// kept for parity.
pub fn pick_party_a(left: &CdrSnapshot, right: &CdrSnapshot) -> Picked {
    let left_dialed = is_dialed(&left.snapshot);
    let right_dialed = is_dialed(&right.snapshot);
    if !left_dialed && right_dialed {
        return Picked::Left;
    }
    if left_dialed && !right_dialed {
        return Picked::Right;
    }

    if left.party_a_flag && !right.party_a_flag {
        return Picked::Left;
    }
    if right.party_a_flag && !left.party_a_flag {
        return Picked::Right;
    }

    let (lt, rt) = (&left.snapshot.creation_time, &right.snapshot.creation_time);
    if lt.timestamp() < rt.timestamp() {
        Picked::Left
    } else if lt.timestamp() > rt.timestamp() {
        Picked::Right
    } else if lt.timestamp_subsec_micros() > rt.timestamp_subsec_micros() {
        Picked::Right
    } else {
        Picked::Left
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot(name: &str, secs: i64, micros: u32) -> Arc<ChannelSnapshot> {
        Arc::new(ChannelSnapshot {
            name: name.to_string(),
            uniqueid: format!("{name}-uid"),
            creation_time: Utc.timestamp_opt(secs, micros * 1000).unwrap(),
            ..Default::default()
        })
    }

    fn party(name: &str, secs: i64, micros: u32) -> CdrSnapshot {
        CdrSnapshot::new(snapshot(name, secs, micros))
    }

    #[test]
    fn test_dialed_party_loses() {
        let caller = party("SIP/alice-1", 10, 0);
        let mut dialed = party("SIP/bob-1", 5, 0);
        let snap = Arc::make_mut(&mut dialed.snapshot);
        snap.flags.outgoing = true;
        assert_eq!(pick_party_a(&caller, &dialed), Picked::Left);
        assert_eq!(pick_party_a(&dialed, &caller), Picked::Right);
    }

    #[test]
    fn test_originated_outgoing_is_not_dialed() {
        let mut originated = party("Local/100-1", 20, 0);
        let snap = Arc::make_mut(&mut originated.snapshot);
        snap.flags.outgoing = true;
        snap.flags.originated = true;
        let other = party("SIP/alice-1", 10, 0);
        // Neither is dialed, so creation time decides.
        assert_eq!(pick_party_a(&originated, &other), Picked::Right);
    }

    #[test]
    fn test_party_a_flag_wins() {
        let mut flagged = party("SIP/late-1", 100, 0);
        flagged.party_a_flag = true;
        let earlier = party("SIP/early-1", 1, 0);
        assert_eq!(pick_party_a(&flagged, &earlier), Picked::Left);
        assert_eq!(pick_party_a(&earlier, &flagged), Picked::Right);
    }

    #[test]
    fn test_creation_time_tiebreak_is_asymmetric() {
        let a = party("SIP/a-1", 10, 500);
        let b = party("SIP/b-1", 10, 200);
        // Equal seconds: right wins only when left usec is greater.
        assert_eq!(pick_party_a(&a, &b), Picked::Right);
        assert_eq!(pick_party_a(&b, &a), Picked::Left);
        // Full tie takes the left.
        assert_eq!(pick_party_a(&a, &a.clone()), Picked::Left);
    }

    #[test]
    fn test_swap_preserves_changed_cid_fields() {
        let mut old = snapshot("SIP/alice-1", 0, 0);
        Arc::make_mut(&mut old).caller_dnid = "1000".into();
        let mut party = CdrSnapshot::new(old);

        let mut new = snapshot("SIP/alice-1", 0, 0);
        Arc::make_mut(&mut new).caller_dnid = "2000".into();
        party.swap(&new);

        assert_eq!(party.variables.get("dnid"), Some("2000"));
        assert_eq!(party.snapshot.caller_dnid, "2000");
    }

    #[test]
    fn test_variables_replace_and_delete() {
        let mut vars = Variables::new();
        vars.set("foo", Some("1"));
        vars.set("FOO", Some("2"));
        assert_eq!(vars.get("foo"), Some("2"));
        vars.set("foo", None);
        assert!(vars.get("foo").is_none());
    }

    #[test]
    fn test_variables_merge_missing_skips_empty_and_present() {
        let mut a = Variables::new();
        a.set("kept", Some("original"));
        let mut b = Variables::new();
        b.set("kept", Some("shadowed"));
        b.set("empty", Some(""));
        b.set("added", Some("yes"));
        a.merge_missing(&b);
        assert_eq!(a.get("kept"), Some("original"));
        assert!(!a.contains("empty"));
        assert_eq!(a.get("added"), Some("yes"));
    }
}
