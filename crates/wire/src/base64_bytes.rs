//! Serde helper encoding byte payloads as base64 strings inside JSON
//! envelopes, matching how Go's `encoding/json` marshals `[]byte`.

use serde::Deserialize;
use serde::Deserializer;
use serde::Serializer;

/// Serialize bytes as a standard-alphabet base64 string.
pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::encode(bytes))
}

/// Deserialize bytes from a standard-alphabet base64 string.
pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    base64::decode(encoded).map_err(serde::de::Error::custom)
}
