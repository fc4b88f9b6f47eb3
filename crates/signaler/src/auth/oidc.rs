//! OIDC ID-token verification against a discovered provider.

use jsonwebtoken::jwk::AlgorithmParameters;
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::DecodingKey;
use jsonwebtoken::Validation;
use serde::Deserialize;
use tokio::sync::RwLock;

use super::Authenticator;
use crate::error::Error;
use crate::error::Result;

#[derive(Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

#[derive(Deserialize)]
struct Claims {
    #[allow(dead_code)]
    sub: String,
}

/// Authenticator validating OIDC ID tokens.
///
/// The provider's discovery document is fetched once at open; the JWKS is
/// cached and refetched when a token references an unknown key id.
pub struct OidcAuthenticator {
    issuer: String,
    client_id: String,
    jwks_uri: String,
    http: reqwest::Client,
    keys: RwLock<JwkSet>,
}

impl OidcAuthenticator {
    /// Discover the provider at `issuer` and prime the key cache.
    ///
    /// Misconfiguration (unreachable issuer, invalid document) fails here,
    /// at signaler open time, not on the first request.
    pub async fn discover(issuer: &str, client_id: &str) -> Result<Self> {
        let http = reqwest::Client::new();

        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            issuer.trim_end_matches('/')
        );
        let document: DiscoveryDocument = http
            .get(&discovery_url)
            .send()
            .await
            .map_err(|e| Error::OidcProvider(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::OidcProvider(e.to_string()))?;

        let keys = Self::fetch_keys(&http, &document.jwks_uri).await?;

        Ok(Self {
            issuer: issuer.to_string(),
            client_id: client_id.to_string(),
            jwks_uri: document.jwks_uri,
            http,
            keys: RwLock::new(keys),
        })
    }

    async fn fetch_keys(http: &reqwest::Client, jwks_uri: &str) -> Result<JwkSet> {
        http.get(jwks_uri)
            .send()
            .await
            .map_err(|e| Error::OidcProvider(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::OidcProvider(e.to_string()))
    }

    async fn key_for(&self, kid: &str) -> Result<Jwk> {
        if let Some(jwk) = self.keys.read().await.find(kid) {
            return Ok(jwk.clone());
        }

        // Key rotation: refetch once before giving up.
        let fresh = Self::fetch_keys(&self.http, &self.jwks_uri).await?;
        let mut keys = self.keys.write().await;
        *keys = fresh;
        keys.find(kid).cloned().ok_or(Error::Unauthorized)
    }
}

#[async_trait::async_trait]
impl Authenticator for OidcAuthenticator {
    async fn authenticate(&self, authorization: Option<&str>) -> Result<()> {
        let header = authorization.ok_or(Error::Unauthorized)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(Error::Unauthorized)?;

        let token_header = jsonwebtoken::decode_header(token)?;
        let kid = token_header.kid.ok_or(Error::Unauthorized)?;
        let jwk = self.key_for(&kid).await?;

        let decoding_key = match &jwk.algorithm {
            AlgorithmParameters::RSA(_) => DecodingKey::from_jwk(&jwk)?,
            _ => return Err(Error::Unauthorized),
        };

        let mut validation = Validation::new(token_header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.client_id]);

        jsonwebtoken::decode::<Claims>(token, &decoding_key, &validation)?;
        Ok(())
    }
}
