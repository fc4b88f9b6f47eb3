//! Community metadata storage.
//!
//! A community row holds the bcrypt hash of its password, the live client
//! count and whether it outlives its last member. The client count is kept
//! non-negative under any interleaving of joins and leaves; backends
//! enforce this with an exclusive transaction or an in-memory mutex.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;

pub use memory::MemoryPersister;
pub use sqlite::SqlitePersister;

/// Public view of a community, as returned by the management API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    /// Free-form community id.
    pub id: String,
    /// Number of currently connected clients.
    pub clients: i64,
    /// Whether the community is retained at zero clients.
    pub persistent: bool,
}

/// Storage backend for community metadata.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Admit one client into `community`.
    ///
    /// If the community exists the password is verified against the stored
    /// bcrypt hash ([crate::Error::WrongPassword] on mismatch) and the
    /// count incremented. If it does not exist, an ephemeral community
    /// with one client is created when `allow_ephemeral` is set, else the
    /// call fails with [crate::Error::EphemeralDisabled].
    async fn add_clients_to_community(
        &self,
        community: &str,
        password: &str,
        allow_ephemeral: bool,
    ) -> Result<()>;

    /// Remove one client from `community`. A non-persistent community that
    /// drops to zero clients is deleted; a persistent one is clamped at 0.
    async fn remove_client_from_community(&self, community: &str) -> Result<()>;

    /// Delete all non-persistent communities and reset the client counts
    /// of persistent ones. Used at startup with operator opt-in.
    async fn cleanup(&self) -> Result<()>;

    /// List all communities.
    async fn get_communities(&self) -> Result<Vec<Community>>;

    /// Create a persistent community with zero clients. Fails with
    /// [crate::Error::UniqueViolation] if the id is taken.
    async fn create_persistent_community(
        &self,
        community: &str,
        password: &str,
    ) -> Result<Community>;

    /// Delete a community. Fails with [crate::Error::NotFound] if absent.
    async fn delete_community(&self, community: &str) -> Result<()>;
}
