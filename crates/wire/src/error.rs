#![allow(missing_docs)]

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Ciphertext is too short or fails authentication")]
    BadCiphertext,

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown message type {0}")]
    UnknownType(String),
}
