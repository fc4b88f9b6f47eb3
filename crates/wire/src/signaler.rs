//! Envelopes relayed through the signaling server.
//!
//! Every frame is a JSON object with a `type` discriminator. The signaler
//! never inspects `payload` bytes; for `offer`/`answer` they carry a
//! JSON-encoded session description and for `candidate` the ICE candidate
//! SDP fragment, both opaque at this layer.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

/// A message of the signaler wire protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalerMessage {
    /// A peer announcing itself to the community after (re)connecting.
    Introduction {
        /// Transport id of the sender.
        from: String,
    },
    /// An SDP offer addressed to one community member.
    Offer {
        /// Transport id of the sender.
        from: String,
        /// Transport id of the recipient.
        to: String,
        /// JSON-encoded session description.
        #[serde(with = "crate::base64_bytes")]
        payload: Vec<u8>,
    },
    /// An SDP answer addressed to one community member.
    Answer {
        /// Transport id of the sender.
        from: String,
        /// Transport id of the recipient.
        to: String,
        /// JSON-encoded session description.
        #[serde(with = "crate::base64_bytes")]
        payload: Vec<u8>,
    },
    /// A trickled ICE candidate addressed to one community member.
    Candidate {
        /// Transport id of the sender.
        from: String,
        /// Transport id of the recipient.
        to: String,
        /// ICE candidate SDP fragment.
        #[serde(with = "crate::base64_bytes")]
        payload: Vec<u8>,
    },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

impl SignalerMessage {
    /// Decode a message from raw JSON bytes.
    ///
    /// Unknown `type` values yield [Error::UnknownType] so that callers can
    /// log and skip them instead of dropping the connection.
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(raw)?;
        match envelope.kind.as_str() {
            "introduction" | "offer" | "answer" | "candidate" => {
                Ok(serde_json::from_slice(raw)?)
            }
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
    fn test_introduction_shape() {
        let raw = SignalerMessage::Introduction {
            from: "a".to_string(),
        }
        .to_vec()
        .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "introduction", "from": "a"})
        );
    }

    #[test]
    fn test_payload_is_base64() {
        let raw = SignalerMessage::Offer {
            from: "a".to_string(),
            to: "b".to_string(),
            payload: b"hi".to_vec(),
        }
        .to_vec()
        .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "offer", "from": "a", "to": "b", "payload": "aGk="})
        );
    }

    #[test]
    fn test_decode_roundtrip() {
        let msg = SignalerMessage::Candidate {
            from: "a".to_string(),
            to: "b".to_string(),
            payload: b"candidate:1".to_vec(),
        };
        let decoded = SignalerMessage::from_slice(&msg.to_vec().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let raw = br#"{"type": "metrics", "from": "a"}"#;
        assert!(matches!(
            SignalerMessage::from_slice(raw),
            Err(Error::UnknownType(t)) if t == "metrics"
        ));
    }
}
