//! Pub/sub fan-out plane between server instances.
//!
//! Two topics exist: per-community input fan-out and cluster-wide
//! community kicks. The broker guarantees at-most-once delivery and never
//! blocks a publisher on a slow subscriber; it is a fan-out plane, not a
//! queue. Subscribers may see inputs published by their own connection,
//! the server filters those by sender id.

pub mod process;
pub mod redis;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::Result;

pub use self::process::ProcessBroker;
pub use self::redis::RedisBroker;

/// Framing of a relayed websocket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A text frame.
    Text,
    /// A binary frame.
    Binary,
}

/// One websocket frame relayed through a community's input topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Input {
    /// Connection id of the sender, used to filter self-delivery.
    pub sender: String,
    /// Original websocket frame kind.
    pub kind: MessageKind,
    /// Opaque frame payload.
    #[serde(with = "commune_wire::base64_bytes")]
    pub payload: Vec<u8>,
}

/// A cluster-wide order to tear down all connections of a community.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kick {
    /// The community being deleted.
    pub community: String,
}

/// Fan-out bus connecting server instances.
///
/// Dropping a returned receiver ends the subscription.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Subscribe to cluster-wide community kicks.
    async fn subscribe_to_kicks(&self) -> Result<mpsc::Receiver<Kick>>;

    /// Subscribe to the input topic of `community`.
    async fn subscribe_to_inputs(&self, community: &str) -> Result<mpsc::Receiver<Input>>;

    /// Publish an input to the community's topic.
    async fn publish_input(&self, community: &str, input: Input) -> Result<()>;

    /// Publish a kick to all server instances.
    async fn publish_kick(&self, kick: Kick) -> Result<()>;
}
