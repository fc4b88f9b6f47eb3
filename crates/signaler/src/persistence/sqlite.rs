//! SQL persister backed by SQLite.
//!
//! Migrations are embedded and applied on open. The pool is capped at one
//! connection so single-writer backends never surface database-locked
//! errors; together with SQLite's serializable transactions this keeps the
//! client count race-free.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use super::Community;
use super::Persister;
use crate::error::Error;
use crate::error::Result;

/// Persister storing community rows in a SQLite database.
pub struct SqlitePersister {
    pool: SqlitePool,
}

impl SqlitePersister {
    /// Open the database at `url` (e.g. `sqlite://signaler.db?mode=rwc` or
    /// `sqlite::memory:`) and apply pending migrations.
    pub async fn open(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Persister for SqlitePersister {
    async fn add_clients_to_community(
        &self,
        community: &str,
        password: &str,
        allow_ephemeral: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(String,)> =
            sqlx::query_as("SELECT password FROM communities WHERE id = ?")
                .bind(community)
                .fetch_optional(&mut *tx)
                .await?;

        match row {
            Some((password_hash,)) => {
                if !bcrypt::verify(password, &password_hash)? {
                    return Err(Error::WrongPassword);
                }

                sqlx::query("UPDATE communities SET clients = clients + 1 WHERE id = ?")
                    .bind(community)
                    .execute(&mut *tx)
                    .await?;
            }
            None => {
                if !allow_ephemeral {
                    return Err(Error::EphemeralDisabled);
                }

                let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;
                sqlx::query(
                    "INSERT INTO communities (id, password, clients, persistent) VALUES (?, ?, 1, FALSE)",
                )
                .bind(community)
                .bind(password_hash)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_client_from_community(&self, community: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i64, bool)> =
            sqlx::query_as("SELECT clients, persistent FROM communities WHERE id = ?")
                .bind(community)
                .fetch_optional(&mut *tx)
                .await?;

        // Removing a missing community is a no-op here; the in-memory
        // backend reports NotFound instead. Callers treat both as terminal
        // for the connection.
        let Some((clients, persistent)) = row else {
            return Ok(());
        };

        if clients - 1 <= 0 {
            if persistent {
                sqlx::query("UPDATE communities SET clients = 0 WHERE id = ?")
                    .bind(community)
                    .execute(&mut *tx)
                    .await?;
            } else {
                sqlx::query("DELETE FROM communities WHERE id = ?")
                    .bind(community)
                    .execute(&mut *tx)
                    .await?;
            }
        } else {
            sqlx::query("UPDATE communities SET clients = clients - 1 WHERE id = ?")
                .bind(community)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM communities WHERE persistent = FALSE")
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE communities SET clients = 0")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_communities(&self) -> Result<Vec<Community>> {
        let rows: Vec<(String, i64, bool)> =
            sqlx::query_as("SELECT id, clients, persistent FROM communities ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, clients, persistent)| Community {
                id,
                clients,
                persistent,
            })
            .collect())
    }

    async fn create_persistent_community(
        &self,
        community: &str,
        password: &str,
    ) -> Result<Community> {
        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)?;

        let result = sqlx::query(
            "INSERT INTO communities (id, password, clients, persistent) VALUES (?, ?, 0, TRUE)",
        )
        .bind(community)
        .bind(password_hash)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(Community {
                id: community.to_string(),
                clients: 0,
                persistent: true,
            }),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(Error::UniqueViolation)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_community(&self, community: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM communities WHERE id = ?")
            .bind(community)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound);
        }
        Ok(())
    }
}
