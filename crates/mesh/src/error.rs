#![allow(missing_docs)]

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("WebRTC error: {0}")]
    Webrtc(#[from] webrtc::error::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Wire error: {0}")]
    Wire(#[from] commune_wire::Error),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid signaler URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Invalid TURN server address {0}")]
    InvalidTurn(String),

    #[error("TURN server address {0} is missing credentials")]
    MissingTurnCredentials(String),

    #[error("Relay is forced but no TURN server was configured")]
    MissingForcedTurn,

    #[error("All candidate names are claimed by other peers")]
    AllNamesClaimed,

    #[error("Adapter is closed")]
    Closed,
}
