//! The inbound event stream.
//!
//! Upstream channel/bridge producers publish four message kinds. The
//! contract: the channel name is the unique chain key, the first message
//! for a channel is a ChannelUpdate with `old` absent, the last is a
//! ChannelUpdate with `new` absent, and events for one channel arrive in
//! publication order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cdr::{BridgeSnapshot, ChannelSnapshot};

/// Final status of a dial attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DialStatus {
    Answer,
    Busy,
    Cancel,
    #[serde(rename = "NOANSWER")]
    NoAnswer,
    Congestion,
    Failed,
}

/// One message from the merged channel+bridge stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Channel state change. `(None, Some)` announces a channel,
    /// `(Some, None)` retires it.
    ChannelUpdate {
        #[serde(default)]
        old: Option<Arc<ChannelSnapshot>>,
        #[serde(default)]
        new: Option<Arc<ChannelSnapshot>>,
    },
    /// Dial progress. An empty status is a dial begin; a status is a dial
    /// end. At most one of caller/peer may be absent.
    Dial {
        #[serde(default)]
        caller: Option<Arc<ChannelSnapshot>>,
        #[serde(default)]
        peer: Option<Arc<ChannelSnapshot>>,
        #[serde(default)]
        status: Option<DialStatus>,
    },
    BridgeEnter {
        bridge: Arc<BridgeSnapshot>,
        channel: Arc<ChannelSnapshot>,
    },
    BridgeLeave {
        bridge: Arc<BridgeSnapshot>,
        channel: Arc<ChannelSnapshot>,
    },
}

/// Synthetic announcement/record channels that never get CDRs.
pub fn filter_channel_snapshot(snapshot: &ChannelSnapshot) -> bool {
    snapshot.name.starts_with("CBAnn") || snapshot.name.starts_with("CBRec")
}

/// Holding bridges are treated as just another application a channel
/// enters, not as call legs meeting.
pub fn filter_bridge_snapshot(bridge: &BridgeSnapshot) -> bool {
    bridge.technology == "holding_bridge"
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_event_round_trips_as_tagged_json() {
        let event = EngineEvent::ChannelUpdate {
            old: None,
            new: Some(Arc::new(ChannelSnapshot {
                name: "SIP/alice-1".into(),
                uniqueid: "uid".into(),
                creation_time: Utc::now(),
                ..Default::default()
            })),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"channel_update\""));
        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, EngineEvent::ChannelUpdate { old: None, new: Some(_) }));
    }

    #[test]
    fn test_dial_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&DialStatus::NoAnswer).unwrap(),
            "\"NOANSWER\""
        );
        assert_eq!(
            serde_json::from_str::<DialStatus>("\"ANSWER\"").unwrap(),
            DialStatus::Answer
        );
    }

    #[test]
    fn test_synthetic_channels_filtered() {
        let mut snap = ChannelSnapshot {
            name: "CBAnn/bridge-1".into(),
            creation_time: Utc::now(),
            ..Default::default()
        };
        assert!(filter_channel_snapshot(&snap));
        snap.name = "CBRec/bridge-1".into();
        assert!(filter_channel_snapshot(&snap));
        snap.name = "SIP/alice-1".into();
        assert!(!filter_channel_snapshot(&snap));
    }

    #[test]
    fn test_holding_bridge_filtered() {
        let bridge = BridgeSnapshot {
            uniqueid: "b1".into(),
            technology: "holding_bridge".into(),
        };
        assert!(filter_bridge_snapshot(&bridge));
    }
}
