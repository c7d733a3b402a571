//! Control messages multiplexed onto the tunnel record stream.
//!
//! A control message is a record whose plaintext begins with the ASCII tag
//! `CTRL:`; the remainder is a UTF-8 command string. Control messages are
//! never written to a TUN device.
//!
//! Vocabulary:
//! - `CTRL:PEER_LIST:<json>` — directory broadcast, server → all clients.
//! - `CTRL:VIDEO_CALL:<addr>:<blob>` — signaling with one-hop peer
//!   addressing: `<addr>` is the target on the client → server leg and the
//!   sender on the forwarded server → client leg.
//! - `CTRL:VIDEO_CALL:<blob>` — signaling without address context.
//! - `CTRL:UPDATE_<TOKEN>` — update notification, server → all clients.

use std::net::Ipv4Addr;

use crate::types::PeerInfo;
use crate::CTRL_PREFIX;

const PEER_LIST_TAG: &str = "PEER_LIST:";
const SIGNAL_TAG: &str = "VIDEO_CALL:";
const UPDATE_TAG: &str = "UPDATE_";

/// A parsed control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Wholesale replacement of the peer directory.
    PeerList(Vec<PeerInfo>),
    /// Extension signaling. `addr` is the target (client → server) or the
    /// originating peer (server → client); `None` when no address rides
    /// with the blob.
    Signal {
        addr: Option<Ipv4Addr>,
        data: String,
    },
    /// Update notification carrying the component token.
    Update(String),
    /// Recognized as control, but not a known command; logged and ignored.
    Unknown(String),
}

impl ControlMessage {
    /// Whether a plaintext payload is a control message.
    pub fn is_control(payload: &[u8]) -> bool {
        payload.starts_with(CTRL_PREFIX)
    }

    /// Parse a plaintext payload. `None` means the payload is packet data.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let command = payload.strip_prefix(CTRL_PREFIX)?;
        let Ok(command) = std::str::from_utf8(command) else {
            return Some(Self::Unknown("<non-utf8>".to_string()));
        };

        if let Some(json) = command.strip_prefix(PEER_LIST_TAG) {
            return match serde_json::from_str::<Vec<PeerInfo>>(json) {
                Ok(peers) => Some(Self::PeerList(peers)),
                Err(_) => Some(Self::Unknown(command.to_string())),
            };
        }

        if let Some(rest) = command.strip_prefix(SIGNAL_TAG) {
            // A leading dotted-quad followed by ':' carries the peer
            // address; signal blobs are JSON and never parse as one.
            if let Some((head, tail)) = rest.split_once(':') {
                if let Ok(addr) = head.parse::<Ipv4Addr>() {
                    return Some(Self::Signal {
                        addr: Some(addr),
                        data: tail.to_string(),
                    });
                }
            }
            return Some(Self::Signal {
                addr: None,
                data: rest.to_string(),
            });
        }

        if let Some(token) = command.strip_prefix(UPDATE_TAG) {
            return Some(Self::Update(token.to_string()));
        }

        Some(Self::Unknown(command.to_string()))
    }

    /// Encode to the plaintext record payload, `CTRL:` prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let command = match self {
            Self::PeerList(peers) => {
                let json = serde_json::to_string(peers).unwrap_or_else(|_| "[]".to_string());
                format!("{PEER_LIST_TAG}{json}")
            }
            Self::Signal {
                addr: Some(addr),
                data,
            } => format!("{SIGNAL_TAG}{addr}:{data}"),
            Self::Signal { addr: None, data } => format!("{SIGNAL_TAG}{data}"),
            Self::Update(token) => format!("{UPDATE_TAG}{token}"),
            Self::Unknown(command) => command.clone(),
        };

        let mut payload = Vec::with_capacity(CTRL_PREFIX.len() + command.len());
        payload.extend_from_slice(CTRL_PREFIX);
        payload.extend_from_slice(command.as_bytes());
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(addr: &str) -> PeerInfo {
        PeerInfo {
            hostname: "box".to_string(),
            vpn_address: addr.to_string(),
            public_ip: "203.0.113.9".to_string(),
            connected_at: "2026-01-01T00:00:00Z".to_string(),
            os: "linux".to_string(),
        }
    }

    #[test]
    fn packet_data_is_not_control() {
        // An IPv4 header never begins with the CTRL tag.
        assert!(!ControlMessage::is_control(&[0x45, 0x00, 0x00, 0x54]));
        assert!(ControlMessage::parse(&[0x45, 0x00]).is_none());
    }

    #[test]
    fn peer_list_roundtrip() {
        let msg = ControlMessage::PeerList(vec![peer("10.8.0.2"), peer("10.8.0.3")]);
        let wire = msg.encode();
        assert!(wire.starts_with(b"CTRL:PEER_LIST:["));
        assert_eq!(ControlMessage::parse(&wire).unwrap(), msg);
    }

    #[test]
    fn targeted_signal_roundtrip() {
        let msg = ControlMessage::Signal {
            addr: Some("10.8.0.3".parse().unwrap()),
            data: r#"{"type":"offer","sdp":"v=0"}"#.to_string(),
        };
        let wire = msg.encode();
        assert_eq!(
            wire,
            br#"CTRL:VIDEO_CALL:10.8.0.3:{"type":"offer","sdp":"v=0"}"#
        );
        assert_eq!(ControlMessage::parse(&wire).unwrap(), msg);
    }

    #[test]
    fn bare_signal_keeps_blob_intact() {
        let wire = br#"CTRL:VIDEO_CALL:{"type":"answer"}"#;
        match ControlMessage::parse(wire).unwrap() {
            ControlMessage::Signal { addr: None, data } => {
                assert_eq!(data, r#"{"type":"answer"}"#);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn update_tokens() {
        for token in ["VPN", "MENU", "VIDEO", "ALL", "SCREEN_SHARE"] {
            let wire = format!("CTRL:UPDATE_{token}").into_bytes();
            assert_eq!(
                ControlMessage::parse(&wire).unwrap(),
                ControlMessage::Update(token.to_string())
            );
        }
    }

    #[test]
    fn unknown_commands_surface_as_unknown() {
        match ControlMessage::parse(b"CTRL:REBOOT_NOW").unwrap() {
            ControlMessage::Unknown(cmd) => assert_eq!(cmd, "REBOOT_NOW"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn malformed_peer_list_is_unknown_not_panic() {
        assert!(matches!(
            ControlMessage::parse(b"CTRL:PEER_LIST:not json").unwrap(),
            ControlMessage::Unknown(_)
        ));
    }
}
