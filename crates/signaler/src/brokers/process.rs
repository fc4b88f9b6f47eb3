//! In-process broker for single-instance deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Broker;
use super::Input;
use super::Kick;
use crate::error::Result;

/// Per-subscriber relay buffer. An overly slow consumer drops a message
/// rather than blocking the rest of the community.
const LISTENER_BUFFER: usize = 1;

/// Broker relaying through in-memory channels.
#[derive(Default)]
pub struct ProcessBroker {
    inputs: Mutex<HashMap<String, Vec<mpsc::Sender<Input>>>>,
    kicks: Mutex<Vec<mpsc::Sender<Kick>>>,
}

impl ProcessBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }
}

fn fan_out<T: Clone>(listeners: &mut Vec<mpsc::Sender<T>>, message: T) {
    listeners.retain(|listener| match listener.try_send(message.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::debug!("Dropping message for slow broker subscriber");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

#[async_trait]
impl Broker for ProcessBroker {
    async fn subscribe_to_kicks(&self) -> Result<mpsc::Receiver<Kick>> {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        self.kicks.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn subscribe_to_inputs(&self, community: &str) -> Result<mpsc::Receiver<Input>> {
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        self.inputs
            .lock()
            .unwrap()
            .entry(community.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish_input(&self, community: &str, input: Input) -> Result<()> {
        let mut inputs = self.inputs.lock().unwrap();
        if let Some(listeners) = inputs.get_mut(community) {
            fan_out(listeners, input);
            if listeners.is_empty() {
                inputs.remove(community);
            }
        }
        Ok(())
    }

    async fn publish_kick(&self, kick: Kick) -> Result<()> {
        fan_out(&mut self.kicks.lock().unwrap(), kick);
        Ok(())
    }
}
