//! Management-API authentication.
//!
//! The management endpoints accept either HTTP Basic credentials or an
//! OIDC ID token in the `Authorization` header. When neither is
//! configured, management is disabled and every call fails with
//! [crate::Error::ApiDisabled], which the server maps to 501.

pub mod oidc;

use async_trait::async_trait;

use crate::error::Error;
use crate::error::Result;

pub use oidc::OidcAuthenticator;

/// Validates management-API credentials.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check the raw `Authorization` header value, if any.
    async fn authenticate(&self, authorization: Option<&str>) -> Result<()>;
}

/// Authenticator used when no credentials are configured.
#[derive(Default)]
pub struct DisabledAuthenticator;

#[async_trait]
impl Authenticator for DisabledAuthenticator {
    async fn authenticate(&self, _authorization: Option<&str>) -> Result<()> {
        Err(Error::ApiDisabled)
    }
}

/// Authenticator checking a static HTTP Basic user/password pair.
pub struct BasicAuthenticator {
    username: String,
    password: String,
}

impl BasicAuthenticator {
    /// Create an authenticator for the given credentials.
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(&self, authorization: Option<&str>) -> Result<()> {
        let header = authorization.ok_or(Error::Unauthorized)?;
        let encoded = header
            .strip_prefix("Basic ")
            .ok_or(Error::Unauthorized)?;
        let decoded = base64::decode(encoded).map_err(|_| Error::Unauthorized)?;
        let credentials = String::from_utf8(decoded).map_err(|_| Error::Unauthorized)?;

        let (username, password) = credentials.split_once(':').ok_or(Error::Unauthorized)?;
        if username != self.username || password != self.password {
            return Err(Error::Unauthorized);
        }

        Ok(())
    }
}
