//! The event router.
//!
//! Single consumer of the merged channel+bridge stream: locates or creates
//! the right chain, dispatches to the state handlers, performs bridge
//! pairing, and maintains both indices. Event processing is synchronous;
//! backend delivery happens afterwards, with every chain and index lock
//! released.
//!
//! Bridge pairing locks candidate chains while the entering chain's lock is
//! held. That is deadlock-free because only this router ever holds more
//! than one chain lock at a time; public API calls lock a single chain.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cdr::{
    pick_party_a, BridgeSnapshot, CdrChain, CdrRecord, CdrSnapshot, CdrState, ChannelSnapshot,
    ExternalRecord, Picked,
};
use crate::config::GeneralConfig;
use crate::events::{filter_bridge_snapshot, filter_channel_snapshot, DialStatus, EngineEvent};

use super::Engine;

/// A party present in a bridge, harvested from a record already there.
struct BridgeCandidate {
    chain: Arc<CdrChain>,
    record_idx: usize,
    snap: CdrSnapshot,
    /// Harvested from the record's Party A slot (as opposed to Party B).
    from_party_a: bool,
}

impl Engine {
    /// Consume one event from the upstream stream. Events for a single
    /// channel must be delivered in publication order.
    pub async fn handle_event(&self, event: EngineEvent) {
        let settings = self.settings();
        let mut outgoing = Vec::new();

        match event {
            EngineEvent::ChannelUpdate { old, new } => {
                self.process_channel_update(old, new, &settings, &mut outgoing);
            }
            EngineEvent::Dial {
                caller,
                peer,
                status,
            } => self.process_dial(caller, peer, status, &settings),
            EngineEvent::BridgeEnter { bridge, channel } => {
                self.process_bridge_enter(bridge, channel, &settings);
            }
            EngineEvent::BridgeLeave { bridge, channel } => {
                self.process_bridge_leave(bridge, channel, &settings);
            }
        }

        for records in outgoing {
            self.detach(records).await;
        }
    }

    fn process_channel_update(
        &self,
        old: Option<Arc<ChannelSnapshot>>,
        new: Option<Arc<ChannelSnapshot>>,
        settings: &GeneralConfig,
        outgoing: &mut Vec<Vec<ExternalRecord>>,
    ) {
        if old.as_deref().is_some_and(filter_channel_snapshot)
            || new.as_deref().is_some_and(filter_channel_snapshot)
        {
            return;
        }
        let Some(name) = new
            .as_ref()
            .map(|s| s.name.clone())
            .or_else(|| old.as_ref().map(|s| s.name.clone()))
        else {
            return;
        };

        if settings.debug {
            debug!(channel = %name, fresh = old.is_none(), gone = new.is_none(), "channel update");
        }

        let chain = if old.is_none() && new.is_some() {
            let chain = CdrChain::new(
                Arc::clone(new.as_ref().expect("checked above")),
                &self.sequence,
                settings,
            );
            self.channels.insert(Arc::clone(&chain));
            Some(chain)
        } else {
            self.channels.get(&name)
        };

        match chain {
            None => warn!(channel = %name, "no CDR for channel"),
            Some(chain) => {
                if let Some(new) = new.as_ref() {
                    let mut records = chain.lock();
                    let mut all_unhandled = true;
                    for record in records.iter_mut() {
                        all_unhandled &= !record.process_party_a(new, settings);
                    }
                    // Not hung up and a new dialplan step: a fresh record
                    // picks the update up.
                    if all_unhandled && new_record_needed(old.as_deref(), new) {
                        let idx = CdrChain::append_locked(&mut records, &self.sequence, settings);
                        records[idx].process_party_a(new, settings);
                    }
                } else {
                    // The channel is gone; the chain's work is done.
                    chain.finalize_all(false, settings);
                    outgoing.push(chain.externalize(settings));
                    self.channels.remove(&name);
                    self.bridges.remove_chain(&name);
                }
            }
        }

        // Party B side of the update runs as its own pass over the index,
        // one chain lock at a time.
        if let Some(new) = new.as_ref() {
            for chain in self.channels.all() {
                let mut records = chain.lock();
                for record in records.iter_mut() {
                    if record.observes_party_b()
                        && record.party_b.as_ref().is_some_and(|b| b.name() == new.name)
                    {
                        record.process_party_b(new, settings);
                    }
                }
            }
        } else if let Some(old) = old.as_ref() {
            // The disappearing channel may be Party B elsewhere; set end
            // times in place and let each Party A finish its own chain.
            for chain in self.channels.all() {
                let mut records = chain.lock();
                for record in records.iter_mut() {
                    if record.party_b.as_ref().is_some_and(|b| b.name() == old.name) {
                        record.finalize(settings);
                    }
                }
            }
        }
    }

    fn process_dial(
        &self,
        caller: Option<Arc<ChannelSnapshot>>,
        peer: Option<Arc<ChannelSnapshot>>,
        status: Option<DialStatus>,
        settings: &GeneralConfig,
    ) {
        if caller.is_none() && peer.is_none() {
            return;
        }

        let chain_caller = caller.as_ref().and_then(|c| self.channels.get(&c.name));
        let chain_peer = peer.as_ref().and_then(|p| self.channels.get(&p.name));

        // One owner chain runs the show; the other side's Party A becomes
        // the dial's Party B. Only the owner chain is locked.
        let (owner, party_a, party_b) = match (chain_caller, chain_peer) {
            (Some(chain_caller), Some(chain_peer)) => {
                let caller_party = head_party_a(&chain_caller);
                let peer_party = head_party_a(&chain_peer);
                if pick_party_a(&caller_party, &peer_party) == Picked::Left {
                    (chain_caller, Some(caller_party.snapshot), Some(peer_party.snapshot))
                } else {
                    (chain_peer, Some(peer_party.snapshot), Some(caller_party.snapshot))
                }
            }
            (Some(chain_caller), None) => {
                let caller_party = head_party_a(&chain_caller);
                (chain_caller, Some(caller_party.snapshot), None)
            }
            (None, Some(chain_peer)) => {
                let peer_party = head_party_a(&chain_peer);
                (chain_peer, None, Some(peer_party.snapshot))
            }
            (None, None) => {
                warn!("dial message for channels without CDRs");
                return;
            }
        };

        if settings.debug {
            debug!(
                owner = %owner.name(),
                status = ?status,
                "dial message"
            );
        }

        let mut records = owner.lock();
        match status {
            None => {
                let mut all_unhandled = true;
                for record in records.iter_mut() {
                    if let Some(handled) =
                        record.process_dial_begin(party_a.as_ref(), party_b.as_ref(), settings)
                    {
                        all_unhandled &= !handled;
                    }
                }
                if all_unhandled {
                    let idx = CdrChain::append_locked(&mut records, &self.sequence, settings);
                    records[idx].process_dial_begin(party_a.as_ref(), party_b.as_ref(), settings);
                }
            }
            Some(status) => {
                for record in records.iter_mut() {
                    record.process_dial_end(party_a.as_ref(), party_b.as_ref(), status, settings);
                }
            }
        }
    }

    fn process_bridge_enter(
        &self,
        bridge: Arc<BridgeSnapshot>,
        channel: Arc<ChannelSnapshot>,
        settings: &GeneralConfig,
    ) {
        if filter_bridge_snapshot(&bridge) || filter_channel_snapshot(&channel) {
            return;
        }
        let Some(chain) = self.channels.get(&channel.name) else {
            warn!(channel = %channel.name, "no CDR for channel");
            return;
        };

        if settings.debug {
            debug!(channel = %channel.name, bridge = %bridge.uniqueid, "bridge enter");
        }

        let mut records = chain.lock();

        for record in records.iter_mut() {
            record.process_party_a(&channel, settings);
        }

        let mut all_unhandled = true;
        let mut handled_idx = None;
        for idx in 0..records.len() {
            if !records[idx].observes_bridge_enter() {
                continue;
            }
            let handled = self.record_bridge_enter(chain.name(), &mut records, idx, &bridge, settings);
            if handled && handled_idx.is_none() {
                handled_idx = Some(idx);
            }
            all_unhandled &= !handled;
        }

        if all_unhandled {
            // Party A for nobody in this bridge. Close the books; a later
            // arrival can still re-activate a record through pairing.
            for record in records.iter_mut() {
                record.finalize(settings);
            }
        }

        // Pair from the first record that handled the enter, or the newest
        // if none did.
        let seed_idx = handled_idx.unwrap_or(records.len() - 1);
        self.pair_bridge(&chain, &mut records, seed_idx, &bridge, settings);

        drop(records);
        self.bridges.insert(&bridge.uniqueid, chain);
    }

    /// Dispatch a bridge enter to one record, resolving the pending states
    /// by transitioning and retrying in a loop.
    fn record_bridge_enter(
        &self,
        chain_name: &str,
        records: &mut Vec<CdrRecord>,
        idx: usize,
        bridge: &Arc<BridgeSnapshot>,
        settings: &GeneralConfig,
    ) -> bool {
        loop {
            match records[idx].state {
                CdrState::DialedPending => {
                    records[idx].transition(CdrState::Dial, settings);
                }
                CdrState::BridgedPending => {
                    records[idx].flags.disabled = false;
                    records[idx].transition(CdrState::Single, settings);
                }
                CdrState::Single => {
                    return self.scan_bridge_peers(chain_name, records, idx, bridge, false, settings);
                }
                CdrState::Dial => {
                    return self.scan_bridge_peers(chain_name, records, idx, bridge, true, settings);
                }
                CdrState::Bridged | CdrState::Finalized => {
                    debug_assert!(false, "bridge enter dispatched to a non-observing state");
                    return false;
                }
            }
        }
    }

    /// Look for a Party B among the records already in the bridge. In the
    /// Dial flavor only our existing Party B qualifies. Always transitions
    /// the record to Bridged.
    fn scan_bridge_peers(
        &self,
        chain_name: &str,
        records: &mut Vec<CdrRecord>,
        idx: usize,
        bridge: &Arc<BridgeSnapshot>,
        restrict_to_party_b: bool,
        settings: &GeneralConfig,
    ) -> bool {
        records[idx].bridge_id = bridge.uniqueid.clone();
        let mut success = false;

        for cand_chain in self.bridges.chains(&bridge.uniqueid) {
            if cand_chain.name() == chain_name {
                continue;
            }
            let mut cand_records = cand_chain.lock();
            for cand in cand_records.iter_mut() {
                if cand.state != CdrState::Bridged || cand.bridge_id != bridge.uniqueid {
                    continue;
                }
                let adopted = if restrict_to_party_b {
                    records[idx].dial_bridge_adopt(cand, settings)
                } else {
                    records[idx].single_bridge_adopt(cand, settings)
                };
                if adopted {
                    success = true;
                    break;
                }
            }
        }

        records[idx].transition(CdrState::Bridged, settings);
        success
    }

    /// Establish pairings with every other occupant of the bridge so each
    /// distinct pair of channels has exactly one record.
    fn pair_bridge(
        &self,
        chain: &Arc<CdrChain>,
        records: &mut Vec<CdrRecord>,
        seed_idx: usize,
        bridge: &Arc<BridgeSnapshot>,
        settings: &GeneralConfig,
    ) {
        let seed_party_a = records[seed_idx].party_a.clone();
        let seed_party_b_name = records[seed_idx]
            .party_b
            .as_ref()
            .map(|b| b.name().to_string());
        let seed_bridge = records[seed_idx].bridge_id.clone();

        for candidate in self.collect_candidates(chain.name(), bridge) {
            // Skip ourselves and whoever we already took on.
            if candidate.snap.name() == seed_party_a.name()
                || seed_party_b_name.as_deref() == Some(candidate.snap.name())
            {
                continue;
            }

            if pick_party_a(&seed_party_a, &candidate.snap) == Picked::Left {
                // We are Party A: a new element on our chain records the
                // pair.
                let idx = CdrChain::append_locked(records, &self.sequence, settings);
                let record = &mut records[idx];
                record.party_b = Some(candidate.snap.clone());
                record.check_answer();
                record.bridge_id = seed_bridge.clone();
                record.transition(CdrState::Bridged, settings);
            } else if candidate.from_party_a {
                // The candidate is Party A of its own record; we become its
                // Party B, either in place or on a new element.
                let mut cand_records = candidate.chain.lock();
                let has_other_party_b = cand_records[candidate.record_idx]
                    .party_b
                    .as_ref()
                    .is_some_and(|b| b.name() != seed_party_a.name());
                if has_other_party_b {
                    let cand_bridge = cand_records[candidate.record_idx].bridge_id.clone();
                    let idx = CdrChain::append_locked(&mut cand_records, &self.sequence, settings);
                    let record = &mut cand_records[idx];
                    record.party_b = Some(seed_party_a.clone());
                    record.check_answer();
                    record.bridge_id = cand_bridge;
                    record.transition(CdrState::Bridged, settings);
                } else {
                    let record = &mut cand_records[candidate.record_idx];
                    record.party_b = Some(seed_party_a.clone());
                    // It may have been tentatively finalized when its only
                    // party was stolen; re-activate it.
                    record.end = None;
                }
            } else {
                // The candidate only appears as somebody's Party B; the
                // pairing lives on the candidate's own chain, fabricated if
                // it has none.
                match self.channels.get(candidate.snap.name()) {
                    None => {
                        let mut record = CdrRecord::new(
                            candidate.snap.clone(),
                            self.sequence.next(),
                            settings,
                        );
                        record.party_b = Some(seed_party_a.clone());
                        record.check_answer();
                        record.bridge_id = bridge.uniqueid.clone();
                        record.transition(CdrState::Bridged, settings);
                        let fabricated = CdrChain::from_record(candidate.snap.name(), record);
                        self.channels.insert(Arc::clone(&fabricated));
                        self.bridges.insert(&bridge.uniqueid, fabricated);
                    }
                    Some(b_chain) => {
                        {
                            let mut b_records = b_chain.lock();
                            let idx =
                                CdrChain::append_locked(&mut b_records, &self.sequence, settings);
                            let record = &mut b_records[idx];
                            record.party_b = Some(seed_party_a.clone());
                            record.check_answer();
                            record.bridge_id = bridge.uniqueid.clone();
                            record.transition(CdrState::Bridged, settings);
                        }
                        self.bridges.insert(&bridge.uniqueid, b_chain);
                    }
                }
            }
        }
    }

    /// Enumerate the deduplicated parties present in a bridge. Two passes:
    /// Party A slots first so they take precedence over Party B slots.
    fn collect_candidates(&self, chain_name: &str, bridge: &Arc<BridgeSnapshot>) -> Vec<BridgeCandidate> {
        let chains = self.bridges.chains(&bridge.uniqueid);
        let mut candidates: Vec<BridgeCandidate> = Vec::new();

        for from_party_a in [true, false] {
            for cand_chain in &chains {
                if cand_chain.name() == chain_name {
                    continue;
                }
                let cand_records = cand_chain.lock();
                for (record_idx, record) in cand_records.iter().enumerate() {
                    if record.state != CdrState::Bridged || record.bridge_id != bridge.uniqueid {
                        continue;
                    }
                    let party = if from_party_a {
                        Some(&record.party_a)
                    } else {
                        record.party_b.as_ref()
                    };
                    let Some(party) = party else { continue };
                    if candidates.iter().any(|c| c.snap.name() == party.name()) {
                        continue;
                    }
                    candidates.push(BridgeCandidate {
                        chain: Arc::clone(cand_chain),
                        record_idx,
                        snap: party.clone(),
                        from_party_a,
                    });
                }
            }
        }

        candidates
    }

    fn process_bridge_leave(
        &self,
        bridge: Arc<BridgeSnapshot>,
        channel: Arc<ChannelSnapshot>,
        settings: &GeneralConfig,
    ) {
        if filter_bridge_snapshot(&bridge) || filter_channel_snapshot(&channel) {
            return;
        }
        let Some(chain) = self.channels.get(&channel.name) else {
            warn!(channel = %channel.name, "no CDR for channel");
            return;
        };

        if settings.debug {
            debug!(channel = %channel.name, bridge = %bridge.uniqueid, "bridge leave");
        }

        {
            let mut records = chain.lock();
            let mut left_bridge = false;
            for record in records.iter_mut() {
                if record.process_bridge_leave(&bridge, &channel, settings) == Some(true) {
                    record.bridge_id.clear();
                    left_bridge = true;
                }
            }
            if !left_bridge {
                return;
            }

            self.bridges.remove(&bridge.uniqueid, chain.name());

            // A pending record watches what the channel does next; if
            // nothing happens it is dropped by its DISABLE flag.
            let idx = CdrChain::append_locked(&mut records, &self.sequence, settings);
            records[idx].transition(CdrState::BridgedPending, settings);
        }

        // Records elsewhere that had the leaving channel as Party B get
        // their end times set; their own Party A finishes the chain later.
        for cand_chain in self.bridges.chains(&bridge.uniqueid) {
            let mut cand_records = cand_chain.lock();
            for record in cand_records.iter_mut() {
                if record.state != CdrState::Bridged {
                    continue;
                }
                if !record.party_b.as_ref().is_some_and(|b| b.name() == channel.name) {
                    continue;
                }
                if record.process_bridge_leave(&bridge, &channel, settings) == Some(true) {
                    record.finalize(settings);
                }
            }
        }
    }
}

/// Whether a Party A update that no record handled warrants a new chain
/// element: the channel is alive, runs an application, and moved to a new
/// dialplan step.
fn new_record_needed(old: Option<&ChannelSnapshot>, new: &ChannelSnapshot) -> bool {
    if new.flags.zombie {
        return false;
    }
    // Auto-fall-through bumps the priority but carries no application.
    if new.appl.is_empty() {
        return false;
    }
    match old {
        Some(old) => old.cep_changed(new),
        None => true,
    }
}

fn head_party_a(chain: &Arc<CdrChain>) -> CdrSnapshot {
    chain
        .lock()
        .first()
        .expect("chain is never empty")
        .party_a
        .clone()
}
