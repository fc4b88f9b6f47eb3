//! ICE server list parsing.
//!
//! Two entry grammars are accepted: `stun:host:port` for STUN servers and
//! `user:credential@turn:host:port` for TURN servers with password
//! credentials.

use webrtc::ice_transport::ice_credential_type::RTCIceCredentialType;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::Error;
use crate::error::Result;

/// Parsed ICE configuration.
pub struct IceConfig {
    /// Servers handed to the WebRTC API.
    pub servers: Vec<RTCIceServer>,
    /// Whether at least one TURN server was parsed; required under a
    /// forced-relay policy.
    pub has_turn: bool,
}

/// Parse the configured ICE server entries.
pub fn parse_servers(entries: &[String]) -> Result<IceConfig> {
    let mut servers = Vec::with_capacity(entries.len());
    let mut has_turn = false;

    for entry in entries {
        if let Some((credentials, addr)) = entry.split_once('@') {
            if !addr.starts_with("turn:") {
                return Err(Error::InvalidTurn(entry.clone()));
            }

            let (username, credential) = credentials
                .split_once(':')
                .ok_or_else(|| Error::MissingTurnCredentials(entry.clone()))?;
            if username.is_empty() || credential.is_empty() {
                return Err(Error::MissingTurnCredentials(entry.clone()));
            }

            has_turn = true;
            servers.push(RTCIceServer {
                urls: vec![addr.to_string()],
                username: username.to_string(),
                credential: credential.to_string(),
                credential_type: RTCIceCredentialType::Password,
            });
        } else if entry.starts_with("turn:") {
            return Err(Error::MissingTurnCredentials(entry.clone()));
        } else {
            servers.push(RTCIceServer {
                urls: vec![entry.to_string()],
                ..Default::default()
            });
        }
    }

    Ok(IceConfig { servers, has_turn })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stun() {
        let config = parse_servers(&["stun:stun.l.google.com:19302".to_string()]).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].urls, vec![
            "stun:stun.l.google.com:19302".to_string()
        ]);
        assert!(!config.has_turn);
    }

    #[test]
    fn test_parse_turn_with_credentials() {
        let config = parse_servers(&["user:cred@turn:relay.example.com:3478".to_string()]).unwrap();
        assert!(config.has_turn);
        assert_eq!(config.servers[0].urls, vec![
            "turn:relay.example.com:3478".to_string()
        ]);
        assert_eq!(config.servers[0].username, "user");
        assert_eq!(config.servers[0].credential, "cred");
        assert_eq!(
            config.servers[0].credential_type,
            RTCIceCredentialType::Password
        );
    }

    #[test]
    fn test_turn_without_credentials() {
        assert!(matches!(
            parse_servers(&["turn:relay.example.com:3478".to_string()]),
            Err(Error::MissingTurnCredentials(_))
        ));
        assert!(matches!(
            parse_servers(&["user@turn:relay.example.com:3478".to_string()]),
            Err(Error::MissingTurnCredentials(_))
        ));
        assert!(matches!(
            parse_servers(&[":@turn:relay.example.com:3478".to_string()]),
            Err(Error::MissingTurnCredentials(_))
        ));
    }

    #[test]
    fn test_malformed_turn() {
        assert!(matches!(
            parse_servers(&["user:cred@stun:relay.example.com:3478".to_string()]),
            Err(Error::InvalidTurn(_))
        ));
    }
}
