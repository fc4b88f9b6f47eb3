//! Ephemeral in-memory persister.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::Community;
use super::Persister;
use crate::error::Error;
use crate::error::Result;

struct Record {
    password_hash: String,
    clients: i64,
    persistent: bool,
}

/// Persister keeping all community state behind one mutex. Everything is
/// lost on restart, which also makes `cleanup` a no-op for ephemeral rows.
#[derive(Default)]
pub struct MemoryPersister {
    communities: Mutex<HashMap<String, Record>>,
}

impl MemoryPersister {
    /// Create an empty persister.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn add_clients_to_community(
        &self,
        community: &str,
        password: &str,
        allow_ephemeral: bool,
    ) -> Result<()> {
        // Verify outside the lock would race a concurrent delete, and
        // bcrypt cost is what bounds this critical section anyway.
        let mut communities = self.communities.lock().unwrap();

        match communities.get_mut(community) {
            Some(record) => {
                if !bcrypt::verify(password, &record.password_hash)? {
                    return Err(Error::WrongPassword);
                }
                record.clients += 1;
            }
            None => {
                if !allow_ephemeral {
                    return Err(Error::EphemeralDisabled);
                }
                let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
                communities.insert(community.to_string(), Record {
                    password_hash,
                    clients: 1,
                    persistent: false,
                });
            }
        }

        Ok(())
    }

    async fn remove_client_from_community(&self, community: &str) -> Result<()> {
        let mut communities = self.communities.lock().unwrap();

        let record = communities.get_mut(community).ok_or(Error::NotFound)?;
        record.clients -= 1;
        if record.clients <= 0 {
            if record.persistent {
                record.clients = 0;
            } else {
                communities.remove(community);
            }
        }

        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let mut communities = self.communities.lock().unwrap();
        communities.retain(|_, record| record.persistent);
        for record in communities.values_mut() {
            record.clients = 0;
        }
        Ok(())
    }

    async fn get_communities(&self) -> Result<Vec<Community>> {
        let communities = self.communities.lock().unwrap();
        let mut all: Vec<Community> = communities
            .iter()
            .map(|(id, record)| Community {
                id: id.clone(),
                clients: record.clients,
                persistent: record.persistent,
            })
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn create_persistent_community(
        &self,
        community: &str,
        password: &str,
    ) -> Result<Community> {
        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
        let mut communities = self.communities.lock().unwrap();

        if communities.contains_key(community) {
            return Err(Error::UniqueViolation);
        }

        communities.insert(community.to_string(), Record {
            password_hash,
            clients: 0,
            persistent: true,
        });

        Ok(Community {
            id: community.to_string(),
            clients: 0,
            persistent: true,
        })
    }

    async fn delete_community(&self, community: &str) -> Result<()> {
        let mut communities = self.communities.lock().unwrap();
        communities.remove(community).ok_or(Error::NotFound)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_and_remove_tracks_count() {
        let persister = MemoryPersister::new();

        persister
            .add_clients_to_community("c", "p", true)
            .await
            .unwrap();
        persister
            .add_clients_to_community("c", "p", true)
            .await
            .unwrap();

        let communities = persister.get_communities().await.unwrap();
        assert_eq!(communities, vec![Community {
            id: "c".to_string(),
            clients: 2,
            persistent: false,
        }]);

        persister.remove_client_from_community("c").await.unwrap();
        persister.remove_client_from_community("c").await.unwrap();

        // Ephemeral community vanishes at zero clients.
        assert!(persister.get_communities().await.unwrap().is_empty());
        assert!(matches!(
            persister.remove_client_from_community("c").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_wrong_password() {
        let persister = MemoryPersister::new();
        persister
            .add_clients_to_community("c", "p", true)
            .await
            .unwrap();

        assert!(matches!(
            persister.add_clients_to_community("c", "wrong", true).await,
            Err(Error::WrongPassword)
        ));
    }

    #[tokio::test]
    async fn test_ephemeral_disabled() {
        let persister = MemoryPersister::new();
        assert!(matches!(
            persister.add_clients_to_community("c", "p", false).await,
            Err(Error::EphemeralDisabled)
        ));
    }

    #[tokio::test]
    async fn test_persistent_survives_zero_clients() {
        let persister = MemoryPersister::new();
        persister
            .create_persistent_community("c", "p")
            .await
            .unwrap();

        persister
            .add_clients_to_community("c", "p", false)
            .await
            .unwrap();
        persister.remove_client_from_community("c").await.unwrap();

        let communities = persister.get_communities().await.unwrap();
        assert_eq!(communities, vec![Community {
            id: "c".to_string(),
            clients: 0,
            persistent: true,
        }]);
    }

    #[tokio::test]
    async fn test_create_duplicate() {
        let persister = MemoryPersister::new();
        persister
            .create_persistent_community("c", "p")
            .await
            .unwrap();
        assert!(matches!(
            persister.create_persistent_community("c", "p").await,
            Err(Error::UniqueViolation)
        ));
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let persister = MemoryPersister::new();
        assert!(matches!(
            persister.delete_community("missing").await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_cleanup() {
        let persister = MemoryPersister::new();
        persister
            .create_persistent_community("keep", "p")
            .await
            .unwrap();
        persister
            .add_clients_to_community("keep", "p", false)
            .await
            .unwrap();
        persister
            .add_clients_to_community("drop", "p", true)
            .await
            .unwrap();

        persister.cleanup().await.unwrap();

        let communities = persister.get_communities().await.unwrap();
        assert_eq!(communities, vec![Community {
            id: "keep".to_string(),
            clients: 0,
            persistent: true,
        }]);
    }
}
