//! Signaler-wide error types.

/// A `Result` alias carrying signaler errors.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors distinguished by the signaler core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The supplied community password does not match the stored hash.
    #[error("Wrong community password")]
    WrongPassword,

    /// The community does not exist and ephemeral communities are disabled.
    #[error("Ephemeral communities are disabled")]
    EphemeralDisabled,

    /// A persistent community with this id already exists.
    #[error("Community already exists")]
    UniqueViolation,

    /// The community does not exist.
    #[error("Community not found")]
    NotFound,

    /// The `community` query parameter is missing.
    #[error("Missing community")]
    MissingCommunity,

    /// The `password` query parameter is missing.
    #[error("Missing password")]
    MissingPassword,

    /// The management API is not configured.
    #[error("Management API is disabled")]
    ApiDisabled,

    /// The supplied management credentials were rejected.
    #[error("Unauthorized")]
    Unauthorized,

    /// The operation was cancelled by shutdown or kick.
    #[error("Cancelled")]
    Cancelled,

    /// A connection stayed silent past the heartbeat deadline.
    #[error("Heartbeat expired")]
    HeartbeatExpired,

    /// A websocket send or receive failed.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A broker subscription or publish failed.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Password hashing or verification failed.
    #[error("Bcrypt error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),

    /// Database error from the SQL persister.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration error from the SQL persister.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Redis error from the distributed broker.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// OIDC discovery or key fetch failed.
    #[error("OIDC provider error: {0}")]
    OidcProvider(String),

    /// ID-token validation failed.
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    /// Json error.
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper server error.
    #[error("Server error: {0}")]
    Server(#[from] hyper::Error),
}
