//! Redis-backed broker for clustered deployments.
//!
//! Inputs and kicks travel as JSON over Redis pub/sub channels, giving
//! at-most-once delivery across server instances. Each subscription owns a
//! dedicated pub/sub connection; the relay task ends when the subscriber
//! drops its receiver.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;

use super::Broker;
use super::Input;
use super::Kick;
use crate::error::Result;

const KICKS_CHANNEL: &str = "commune.kicks";

fn inputs_channel(community: &str) -> String {
    format!("commune.messages.{community}")
}

/// Broker relaying through Redis pub/sub.
pub struct RedisBroker {
    client: redis::Client,
    publisher: MultiplexedConnection,
}

impl RedisBroker {
    /// Connect to the Redis instance at `url`.
    pub async fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { client, publisher })
    }

    async fn subscribe<T>(&self, channel: String) -> Result<mpsc::Receiver<T>>
    where T: serde::de::DeserializeOwned + Send + 'static {
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        pubsub.subscribe(&channel).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload: Vec<u8> = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        tracing::debug!("Skipping malformed broker payload: {e}");
                        continue;
                    }
                };

                let decoded: T = match serde_json::from_slice(&payload) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        tracing::debug!("Skipping undecodable broker message: {e}");
                        continue;
                    }
                };

                if tx.send(decoded).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe_to_kicks(&self) -> Result<mpsc::Receiver<Kick>> {
        self.subscribe(KICKS_CHANNEL.to_string()).await
    }

    async fn subscribe_to_inputs(&self, community: &str) -> Result<mpsc::Receiver<Input>> {
        self.subscribe(inputs_channel(community)).await
    }

    async fn publish_input(&self, community: &str, input: Input) -> Result<()> {
        let payload = serde_json::to_vec(&input)?;
        let mut publisher = self.publisher.clone();
        publisher
            .publish::<_, _, ()>(inputs_channel(community), payload)
            .await?;
        Ok(())
    }

    async fn publish_kick(&self, kick: Kick) -> Result<()> {
        let payload = serde_json::to_vec(&kick)?;
        let mut publisher = self.publisher.clone();
        publisher.publish::<_, _, ()>(KICKS_CHANNEL, payload).await?;
        Ok(())
    }
}
