//! Per-state event handlers for [`CdrRecord`].
//!
//! Each record sits in one of six states; events are dispatched through a
//! `match` on the state tag. Handlers report whether they consumed the
//! event: an unhandled event tells the router to fork a fresh chain element
//! and retry. `None` means the state does not observe that event kind at
//! all, which leaves the router's accumulator untouched.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::GeneralConfig;
use crate::events::DialStatus;

use super::record::{CdrRecord, Disposition};
use super::snapshot::{BridgeSnapshot, ChannelSnapshot, CdrSnapshot, Picked, pick_party_a};

/// The state tag of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CdrState {
    /// Newborn record; one channel, no peer yet.
    Single,
    /// Party A dialing or being originated toward Party B.
    Dial,
    /// Dial succeeded; awaiting the next event to classify.
    DialedPending,
    /// Party A is in a bridge with Party B.
    Bridged,
    /// Left a bridge; awaiting classification.
    BridgedPending,
    /// Terminal.
    Finalized,
}

impl std::fmt::Display for CdrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CdrState::Single => "Single",
            CdrState::Dial => "Dial",
            CdrState::DialedPending => "DialedPending",
            CdrState::Bridged => "Bridged",
            CdrState::BridgedPending => "Pending",
            CdrState::Finalized => "Finalized",
        };
        f.write_str(s)
    }
}

impl CdrRecord {
    /// Party A snapshot update. Returns `true` when the record absorbed the
    /// update; `false` asks the router to fork a new chain element.
    pub fn process_party_a(&mut self, snapshot: &Arc<ChannelSnapshot>, settings: &GeneralConfig) -> bool {
        match self.state {
            CdrState::Single | CdrState::Dial | CdrState::Bridged => {
                self.base_party_a(snapshot, settings);
                true
            }
            CdrState::DialedPending => {
                if self.party_a.snapshot.cep_changed(snapshot) {
                    // Dialplan is executing again. With a Party B this
                    // record's work is done and a new element must pick the
                    // event up; alone, it degrades back to Single.
                    if self.party_b.is_some() {
                        self.transition(CdrState::Finalized, settings);
                        return false;
                    }
                    self.transition(CdrState::Single, settings);
                    self.base_party_a(snapshot, settings);
                    return true;
                }
                self.base_party_a(snapshot, settings);
                true
            }
            CdrState::BridgedPending => {
                if snapshot.flags.zombie {
                    return true;
                }
                let unchanged = self.party_a.snapshot.context == snapshot.context
                    && self.party_a.snapshot.exten == snapshot.exten
                    && self.party_a.snapshot.priority == snapshot.priority;
                if unchanged {
                    return true;
                }
                self.flags.disabled = false;
                self.transition(CdrState::Single, settings);
                self.base_party_a(snapshot, settings);
                true
            }
            CdrState::Finalized => {
                if self.party_a.snapshot.flags.zombie {
                    self.finalize(settings);
                }
                false
            }
        }
    }

    fn base_party_a(&mut self, snapshot: &Arc<ChannelSnapshot>, settings: &GeneralConfig) {
        if snapshot.name != self.name {
            debug_assert!(false, "party A update for wrong channel");
            warn!(channel = %self.name, got = %snapshot.name, "party A update for wrong channel");
            return;
        }
        self.swap_party_a(snapshot);

        // When an originated Party A finishes its application the upstream
        // restores a dummy "AppDial" placeholder; don't let that clobber the
        // application we already accepted.
        if !snapshot.appl.is_empty()
            && (!starts_with_appdial(&snapshot.appl) || self.appl.is_empty())
        {
            self.appl = snapshot.appl.clone();
            self.data = snapshot.data.clone();
        }

        self.linkedid = snapshot.linkedid.clone();
        self.check_answer();
        self.check_hangup(settings);
    }

    /// Party B snapshot update. The router only routes these to records
    /// whose Party B name matches.
    pub fn process_party_b(&mut self, snapshot: &Arc<ChannelSnapshot>, settings: &GeneralConfig) {
        match self.state {
            CdrState::Dial | CdrState::Bridged => {
                let matches = self
                    .party_b
                    .as_ref()
                    .is_some_and(|b| b.name() == snapshot.name);
                if !matches {
                    return;
                }
                if let Some(party_b) = self.party_b.as_mut() {
                    party_b.swap(snapshot);
                }
                if snapshot.flags.zombie {
                    self.transition(CdrState::Finalized, settings);
                }
            }
            CdrState::Single => {
                debug_assert!(false, "party B update dispatched to a Single record");
                warn!(channel = %self.name, "party B update dispatched to a Single record");
            }
            _ => {}
        }
    }

    /// Whether this record's state observes Party B updates.
    pub fn observes_party_b(&self) -> bool {
        matches!(self.state, CdrState::Dial | CdrState::Bridged)
    }

    /// Dial begin. `None`: state does not observe dials. `Some(false)`:
    /// unhandled, fork a new element.
    pub fn process_dial_begin(
        &mut self,
        caller: Option<&Arc<ChannelSnapshot>>,
        peer: Option<&Arc<ChannelSnapshot>>,
        settings: &GeneralConfig,
    ) -> Option<bool> {
        match self.state {
            CdrState::Single => {
                if let Some(caller) = caller.filter(|c| c.name == self.name) {
                    self.swap_party_a(caller);
                    if let Some(peer) = peer {
                        match self.party_b.as_mut() {
                            Some(b) => b.swap(peer),
                            None => self.party_b = Some(CdrSnapshot::new(Arc::clone(peer))),
                        }
                    }
                } else if let Some(peer) = peer.filter(|p| p.name == self.name) {
                    // We are the destination of an origination.
                    self.swap_party_a(peer);
                }
                self.transition(CdrState::Dial, settings);
                Some(true)
            }
            // A Party A already dialing that sees another dial begin gets a
            // fresh chain element from the router.
            CdrState::Dial => Some(false),
            CdrState::DialedPending => {
                self.transition(CdrState::Finalized, settings);
                Some(false)
            }
            CdrState::BridgedPending => {
                self.flags.disabled = false;
                self.transition(CdrState::Single, settings);
                self.process_dial_begin(caller, peer, settings)
            }
            CdrState::Bridged | CdrState::Finalized => None,
        }
    }

    /// Dial end with the final dial status.
    pub fn process_dial_end(
        &mut self,
        caller: Option<&Arc<ChannelSnapshot>>,
        peer: Option<&Arc<ChannelSnapshot>>,
        status: DialStatus,
        settings: &GeneralConfig,
    ) -> Option<bool> {
        match self.state {
            CdrState::Dial => {
                let Some(party_a) = caller.or(peer) else {
                    return Some(false);
                };
                if party_a.name != self.name {
                    debug_assert!(false, "dial end for wrong channel");
                    warn!(channel = %self.name, got = %party_a.name, "dial end for wrong channel");
                    return Some(false);
                }
                self.swap_party_a(party_a);

                if self.party_b.is_some() {
                    match peer {
                        Some(peer)
                            if self
                                .party_b
                                .as_ref()
                                .is_some_and(|b| b.name() == peer.name) =>
                        {
                            if let Some(b) = self.party_b.as_mut() {
                                b.swap(peer);
                            }
                        }
                        // Not the status for this record; defer to the
                        // router.
                        _ => return Some(false),
                    }
                }

                self.disposition = Disposition::from_dial_status(status, settings.congestion);
                if self.disposition == Disposition::Answered {
                    self.transition(CdrState::DialedPending, settings);
                } else {
                    self.transition(CdrState::Finalized, settings);
                }
                Some(true)
            }
            CdrState::Single | CdrState::BridgedPending => {
                debug_assert!(false, "dial end dispatched to a record that never dialed");
                warn!(channel = %self.name, state = %self.state, "unexpected dial end");
                Some(true)
            }
            CdrState::DialedPending | CdrState::Bridged | CdrState::Finalized => None,
        }
    }

    /// Bridge leave. `Some(true)` when this record represented the bridge
    /// membership that just ended.
    pub fn process_bridge_leave(
        &mut self,
        bridge: &Arc<BridgeSnapshot>,
        channel: &Arc<ChannelSnapshot>,
        settings: &GeneralConfig,
    ) -> Option<bool> {
        match self.state {
            CdrState::Bridged => {
                if self.bridge_id != bridge.uniqueid {
                    return Some(false);
                }
                let party_a_matches = self.party_a.name() == channel.name;
                let party_b_mismatch = self
                    .party_b
                    .as_ref()
                    .is_some_and(|b| b.name() != channel.name);
                if !party_a_matches && party_b_mismatch {
                    return Some(false);
                }
                self.transition(CdrState::Finalized, settings);
                Some(true)
            }
            CdrState::Finalized => None,
            _ => {
                debug_assert!(false, "bridge leave dispatched to a record not in a bridge");
                warn!(channel = %self.name, state = %self.state, "unexpected bridge leave");
                Some(false)
            }
        }
    }

    /// Whether this record's state observes bridge enter messages.
    pub fn observes_bridge_enter(&self) -> bool {
        matches!(
            self.state,
            CdrState::Single | CdrState::Dial | CdrState::DialedPending | CdrState::BridgedPending
        )
    }

    /// Try to adopt one of the candidate record's parties as our Party B
    /// while entering a bridge from the Single state. Returns `true` on
    /// adoption.
    pub fn single_bridge_adopt(&mut self, candidate: &mut CdrRecord, settings: &GeneralConfig) -> bool {
        // Their Party A first.
        if pick_party_a(&self.party_a, &candidate.party_a) == Picked::Left {
            self.party_b = Some(candidate.party_a.clone());
            if candidate.party_b.is_none() {
                // We just stole their only party; set their end time in
                // place. They can be re-activated by a later pairing.
                candidate.finalize(settings);
            }
            return true;
        }

        // Then their Party B.
        if let Some(cand_b) = candidate.party_b.as_ref() {
            if pick_party_a(&self.party_a, cand_b) == Picked::Left {
                self.party_b = Some(cand_b.clone());
                return true;
            }
        }
        false
    }

    /// Bridge-enter adoption from the Dial state: only the candidate that
    /// is our existing Party B counts.
    pub fn dial_bridge_adopt(&mut self, candidate: &mut CdrRecord, settings: &GeneralConfig) -> bool {
        let Some(party_b_name) = self.party_b.as_ref().map(|b| b.name().to_string()) else {
            return false;
        };
        if candidate.party_a.name() != party_b_name {
            return false;
        }
        self.party_b = Some(candidate.party_a.clone());
        if candidate.party_b.is_none() {
            candidate.finalize(settings);
        }
        true
    }
}

fn starts_with_appdial(appl: &str) -> bool {
    appl.get(..7)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("appdial"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cdr::snapshot::{ChannelState, CdrSnapshot};
    use chrono::Utc;

    fn settings() -> GeneralConfig {
        GeneralConfig::default()
    }

    fn snapshot(name: &str) -> Arc<ChannelSnapshot> {
        Arc::new(ChannelSnapshot {
            name: name.to_string(),
            uniqueid: format!("{name}-uid"),
            context: "default".into(),
            exten: "1000".into(),
            priority: 1,
            appl: "Dial".into(),
            data: "SIP/bob".into(),
            creation_time: Utc::now(),
            ..Default::default()
        })
    }

    fn record(name: &str) -> CdrRecord {
        CdrRecord::new(CdrSnapshot::new(snapshot(name)), 0, &settings())
    }

    #[test]
    fn test_party_a_update_caches_application() {
        let mut rec = record("SIP/alice-1");
        assert!(rec.process_party_a(&snapshot("SIP/alice-1"), &settings()));
        assert_eq!(rec.appl, "Dial");
        assert_eq!(rec.data, "SIP/bob");
    }

    #[test]
    fn test_appdial_placeholder_does_not_clobber() {
        let mut rec = record("SIP/alice-1");
        rec.process_party_a(&snapshot("SIP/alice-1"), &settings());
        let mut shim = snapshot("SIP/alice-1");
        Arc::make_mut(&mut shim).appl = "AppDial2".into();
        rec.process_party_a(&shim, &settings());
        assert_eq!(rec.appl, "Dial");

        // But it is accepted when nothing is cached yet.
        let mut fresh = record("SIP/alice-2");
        let mut shim = snapshot("SIP/alice-2");
        Arc::make_mut(&mut shim).appl = "AppDial".into();
        fresh.process_party_a(&shim, &settings());
        assert_eq!(fresh.appl, "AppDial");
    }

    #[test]
    fn test_zombie_party_a_finalizes() {
        let mut rec = record("SIP/alice-1");
        let mut dead = snapshot("SIP/alice-1");
        Arc::make_mut(&mut dead).flags.zombie = true;
        rec.process_party_a(&dead, &settings());
        assert_eq!(rec.state, CdrState::Finalized);
    }

    #[test]
    fn test_dial_begin_adopts_peer_as_party_b() {
        let mut rec = record("SIP/alice-1");
        let caller = snapshot("SIP/alice-1");
        let peer = snapshot("SIP/bob-1");
        assert_eq!(
            rec.process_dial_begin(Some(&caller), Some(&peer), &settings()),
            Some(true)
        );
        assert_eq!(rec.state, CdrState::Dial);
        assert_eq!(rec.party_b.as_ref().unwrap().name(), "SIP/bob-1");
    }

    #[test]
    fn test_origination_adopts_peer_as_party_a_only() {
        let mut rec = record("SIP/bob-1");
        let peer = snapshot("SIP/bob-1");
        assert_eq!(
            rec.process_dial_begin(None, Some(&peer), &settings()),
            Some(true)
        );
        assert_eq!(rec.state, CdrState::Dial);
        assert!(rec.party_b.is_none());
    }

    #[test]
    fn test_dial_end_answer_goes_pending() {
        let mut rec = record("SIP/alice-1");
        let caller = snapshot("SIP/alice-1");
        let peer = snapshot("SIP/bob-1");
        rec.process_dial_begin(Some(&caller), Some(&peer), &settings());
        let out = rec.process_dial_end(Some(&caller), Some(&peer), DialStatus::Answer, &settings());
        assert_eq!(out, Some(true));
        assert_eq!(rec.state, CdrState::DialedPending);
        assert_eq!(rec.disposition, Disposition::Answered);
    }

    #[test]
    fn test_dial_end_busy_finalizes() {
        let mut rec = record("SIP/alice-1");
        let caller = snapshot("SIP/alice-1");
        let peer = snapshot("SIP/bob-1");
        rec.process_dial_begin(Some(&caller), Some(&peer), &settings());
        rec.process_dial_end(Some(&caller), Some(&peer), DialStatus::Busy, &settings());
        assert_eq!(rec.state, CdrState::Finalized);
        assert_eq!(rec.disposition, Disposition::Busy);
    }

    #[test]
    fn test_dial_end_for_other_peer_defers() {
        let mut rec = record("SIP/alice-1");
        let caller = snapshot("SIP/alice-1");
        let peer = snapshot("SIP/bob-1");
        rec.process_dial_begin(Some(&caller), Some(&peer), &settings());
        let other = snapshot("SIP/carol-1");
        let out = rec.process_dial_end(Some(&caller), Some(&other), DialStatus::Answer, &settings());
        assert_eq!(out, Some(false));
        assert_eq!(rec.state, CdrState::Dial);
    }

    #[test]
    fn test_bridge_leave_matches_party_a() {
        let mut rec = record("SIP/alice-1");
        rec.state = CdrState::Bridged;
        rec.bridge_id = "bridge-1".into();
        let bridge = Arc::new(BridgeSnapshot {
            uniqueid: "bridge-1".into(),
            technology: "simple_bridge".into(),
        });
        let out = rec.process_bridge_leave(&bridge, &snapshot("SIP/alice-1"), &settings());
        assert_eq!(out, Some(true));
        assert_eq!(rec.state, CdrState::Finalized);
    }

    #[test]
    fn test_bridge_leave_wrong_bridge_unhandled() {
        let mut rec = record("SIP/alice-1");
        rec.state = CdrState::Bridged;
        rec.bridge_id = "bridge-1".into();
        let other = Arc::new(BridgeSnapshot {
            uniqueid: "bridge-2".into(),
            technology: "simple_bridge".into(),
        });
        let out = rec.process_bridge_leave(&other, &snapshot("SIP/alice-1"), &settings());
        assert_eq!(out, Some(false));
        assert_eq!(rec.state, CdrState::Bridged);
    }

    #[test]
    fn test_bridged_pending_revives_on_cep_change() {
        let mut rec = record("SIP/alice-1");
        rec.transition(CdrState::BridgedPending, &settings());
        assert!(rec.flags.disabled);

        // Same dialplan location: stays pending.
        assert!(rec.process_party_a(&snapshot("SIP/alice-1"), &settings()));
        assert_eq!(rec.state, CdrState::BridgedPending);

        let mut moved = snapshot("SIP/alice-1");
        Arc::make_mut(&mut moved).priority = 2;
        assert!(rec.process_party_a(&moved, &settings()));
        assert_eq!(rec.state, CdrState::Single);
        assert!(!rec.flags.disabled);
    }

    #[test]
    fn test_dialed_pending_cep_change_with_party_b_forks() {
        let mut rec = record("SIP/alice-1");
        let caller = snapshot("SIP/alice-1");
        let peer = snapshot("SIP/bob-1");
        rec.process_dial_begin(Some(&caller), Some(&peer), &settings());
        rec.process_dial_end(Some(&caller), Some(&peer), DialStatus::Answer, &settings());
        assert_eq!(rec.state, CdrState::DialedPending);

        let mut moved = snapshot("SIP/alice-1");
        Arc::make_mut(&mut moved).appl = "Hangup".into();
        let handled = rec.process_party_a(&moved, &settings());
        assert!(!handled);
        assert_eq!(rec.state, CdrState::Finalized);
    }
}
