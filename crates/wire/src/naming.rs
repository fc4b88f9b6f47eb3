//! Envelopes of the named-peer claim protocol.
//!
//! These travel as single JSON documents per data-channel message on the
//! dedicated ID channel, never through the signaler.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

/// A message of the named-peer claim protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NamingMessage {
    /// Advertises a peer's candidate names (or its single claimed name)
    /// together with its boot timestamp, fixed once at open.
    Greeting {
        /// Candidate names still contested, or the claimed name alone.
        ids: Vec<String>,
        /// Boot timestamp used to break claim ties; lower wins.
        timestamp: i64,
    },
    /// Tells the remote peer to pause its claim timer and re-greet.
    Backoff {},
    /// Tells the remote peer to drop `id` from its candidate set.
    Kick {
        /// The name that is no longer available.
        id: String,
    },
    /// Announces that the sender now permanently holds `id`.
    Claimed {
        /// The claimed name.
        id: String,
    },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

impl NamingMessage {
    /// Decode a message from raw JSON bytes, tolerating unknown types.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        match envelope.kind.as_str() {
            "greeting" | "backoff" | "kick" | "claimed" => Ok(serde_json::from_slice(raw)?),
            other => Err(Error::UnknownType(other.to_string())),
        }
    }

    /// Encode the message as JSON bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_shape() {
        let raw = NamingMessage::Greeting {
            ids: vec!["alice".to_string(), "bob".to_string()],
            timestamp: 100,
        }
        .to_vec()
        .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "greeting", "ids": ["alice", "bob"], "timestamp": 100})
        );
    }

    #[test]
    fn test_backoff_roundtrip() {
        let decoded =
            NamingMessage::from_slice(&NamingMessage::Backoff {}.to_vec().unwrap()).unwrap();
        assert_eq!(decoded, NamingMessage::Backoff {});
    }

    #[test]
    fn test_kick_claimed_roundtrip() {
        for msg in [
            NamingMessage::Kick {
                id: "alice".to_string(),
            },
            NamingMessage::Claimed {
                id: "alice".to_string(),
            },
        ] {
            let decoded = NamingMessage::from_slice(&msg.to_vec().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let raw = br#"{"type": "gossip"}"#;
        assert!(matches!(
            NamingMessage::from_slice(raw),
            Err(Error::UnknownType(_))
        ));
    }
}
