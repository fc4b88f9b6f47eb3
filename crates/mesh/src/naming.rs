//! The named-peer layer.
//!
//! Wraps an [Adapter] and runs the claim protocol on a dedicated ID
//! channel prepended to the application channels. Each instance starts
//! with a configured candidate name set and a boot timestamp fixed at
//! open; peers exchange greetings, kick names already claimed, and back
//! off against older instances until a claim timer fires and the instance
//! claims the lexicographically smallest surviving candidate. Application
//! channels are held back until the local claim and are emitted with the
//! remote's claimed name once known.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use commune_wire::naming::NamingMessage;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use webrtc::data::data_channel::DataChannel;

use crate::adapter::Adapter;
use crate::adapter::AdapterConfig;
use crate::adapter::Peer;
use crate::error::Error;
use crate::error::Result;

/// Name of the data channel reserved for the claim protocol.
pub const ID_CHANNEL: &str = "commune/id";

/// Decides whether any of `ids` already claims `name`. The default is
/// plain set membership; deployments with aliasing can plug their own.
pub type IdClaimChecker = Arc<dyn Fn(&[String], &str) -> bool + Send + Sync>;

const MESSAGE_BUFFER: usize = 8192;
const WRITER_BUFFER: usize = 16;

/// Configuration of a named adapter.
#[derive(Clone)]
pub struct NamedAdapterConfig {
    /// Candidate names, most of which are expected to be contested.
    pub names: Vec<String>,
    /// Application channel names; the ID channel is added implicitly.
    pub channels: Vec<String>,
    /// ICE server entries, see [crate::ice::parse_servers].
    pub ice_servers: Vec<String>,
    /// Restrict the transport policy to TURN relays.
    pub force_relay: bool,
    /// Signaler read deadline and reconnection wait.
    pub timeout: Duration,
    /// Settling time granted to kicks and backoffs before claiming.
    pub kicks: Duration,
    /// Claim membership check; None means set membership.
    pub is_id_claimed: Option<IdClaimChecker>,
}

impl Default for NamedAdapterConfig {
    fn default() -> Self {
        Self {
            names: vec![],
            channels: vec![],
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            force_relay: false,
            timeout: Duration::from_secs(10),
            kicks: Duration::from_secs(5),
            is_id_claimed: None,
        }
    }
}

/// A mesh adapter whose peers carry negotiated stable names instead of
/// transport ids.
pub struct NamedAdapter {
    adapter: Adapter,
    names: Vec<String>,
    timeout: Duration,
    kicks: Duration,
    is_id_claimed: IdClaimChecker,
    token: CancellationToken,
}

impl NamedAdapter {
    /// Create a named adapter; arguments mirror [Adapter::new].
    pub fn new(
        signaler_url: &str,
        key: &str,
        config: NamedAdapterConfig,
        token: CancellationToken,
    ) -> Self {
        let mut channels = Vec::with_capacity(config.channels.len() + 1);
        channels.push(ID_CHANNEL.to_string());
        channels.extend(config.channels.iter().cloned());

        let adapter = Adapter::new(
            signaler_url,
            key,
            AdapterConfig {
                channels,
                ice_servers: config.ice_servers.clone(),
                force_relay: config.force_relay,
                timeout: config.timeout,
                id: String::new(),
            },
            token.clone(),
        );

        Self {
            adapter,
            names: config.names,
            timeout: config.timeout,
            kicks: config.kicks,
            is_id_claimed: config
                .is_id_claimed
                .unwrap_or_else(|| Arc::new(|ids: &[String], name: &str| ids.iter().any(|id| id == name))),
            token,
        }
    }

    /// Open the underlying adapter and start the claim negotiation.
    ///
    /// Returns the accept stream of named application peers and an error
    /// stream; [Error::AllNamesClaimed] on the latter is fatal and the
    /// adapter closes itself.
    pub async fn open(&self) -> Result<(mpsc::Receiver<Peer>, mpsc::Receiver<Error>)> {
        let (event_tx, event_rx) = mpsc::channel(64);

        // Reconnects arm the claim timer; they ride a dedicated unbounded
        // channel so a full event buffer can never swallow one.
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        self.adapter.set_on_reconnect(Arc::new(move || {
            let _ = reconnect_tx.send(());
        }));

        let mut accept = self.adapter.open().await?;

        let pump_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(peer) = accept.recv().await {
                if pump_tx.send(Event::Accepted(peer)).await.is_err() {
                    break;
                }
            }
        });

        let (peer_tx, peer_rx) = mpsc::channel(16);
        let (error_tx, error_rx) = mpsc::channel(1);

        let driver = Driver {
            names: self.names.clone(),
            kicks: self.kicks,
            is_id_claimed: self.is_id_claimed.clone(),
            timeout: self.timeout,
            token: self.token.clone(),
            event_tx,
            peer_tx,
            error_tx,
            state: Negotiation::new(&self.names),
        };
        tokio::spawn(driver.run(event_rx, reconnect_rx));

        Ok((peer_rx, error_rx))
    }

    /// Stop the adapter and the negotiation.
    pub fn close(&self) {
        self.adapter.close();
    }

    /// Wait for the underlying adapter to stop.
    pub async fn wait(&self) -> Result<()> {
        self.adapter.wait().await
    }
}

enum Event {
    Accepted(Peer),
    Message {
        peer_id: String,
        message: NamingMessage,
    },
    Gone {
        peer_id: String,
    },
}

/// What a received greeting demands of us.
#[derive(Debug, PartialEq, Eq)]
enum GreetingAction {
    Ignore,
    /// The remote is younger and contests our candidates.
    Backoff,
    /// The remote advertises a name we already hold.
    Kick(String),
}

fn greeting_action(
    claimed: Option<&str>,
    candidates: &BTreeSet<String>,
    local_timestamp: i64,
    remote_ids: &[String],
    remote_timestamp: i64,
    is_id_claimed: &IdClaimChecker,
) -> GreetingAction {
    match claimed {
        Some(name) => {
            if is_id_claimed(remote_ids, name) {
                GreetingAction::Kick(name.to_string())
            } else {
                GreetingAction::Ignore
            }
        }
        None => {
            let contested = remote_ids.iter().any(|id| candidates.contains(id));
            if contested && local_timestamp < remote_timestamp {
                GreetingAction::Backoff
            } else {
                GreetingAction::Ignore
            }
        }
    }
}

/// The surviving candidate that would be claimed next.
fn pick_name(candidates: &BTreeSet<String>) -> Option<String> {
    candidates.iter().next().cloned()
}

struct Negotiation {
    candidates: BTreeSet<String>,
    claimed: Option<String>,
    timestamp: i64,
    /// Transport id to ID-channel writer queue.
    id_peers: HashMap<String, mpsc::Sender<NamingMessage>>,
    /// Transport ids whose first greeting was already counted against the
    /// claim timer. Steady regreets from backed-off peers must not keep
    /// rearming it.
    greeted: HashSet<String>,
    /// Transport id to claimed remote name.
    logical: HashMap<String, String>,
    /// Application peers held back until the local claim.
    pending: Vec<Peer>,
    /// Application peers already emitted, per transport id, re-emitted
    /// under the remote's name once it claims.
    emitted: HashMap<String, Vec<Peer>>,
}

impl Negotiation {
    fn new(names: &[String]) -> Self {
        Self {
            candidates: names.iter().cloned().collect(),
            claimed: None,
            timestamp: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            id_peers: HashMap::new(),
            greeted: HashSet::new(),
            logical: HashMap::new(),
            pending: Vec::new(),
            emitted: HashMap::new(),
        }
    }

    /// Restart the negotiation for a fresh signaler connection. The ID
    /// channels of the dead connection stay registered until their
    /// readers end and prune them through `Gone`.
    fn reset(&mut self, names: &[String]) {
        self.candidates = names.iter().cloned().collect();
        self.claimed = None;
        self.greeted.clear();
        self.logical.clear();
        self.pending.clear();
        self.emitted.clear();
    }

    fn greeting(&self) -> NamingMessage {
        let ids = match &self.claimed {
            Some(name) => vec![name.clone()],
            None => self.candidates.iter().cloned().collect(),
        };
        NamingMessage::Greeting {
            ids,
            timestamp: self.timestamp,
        }
    }
}

struct Driver {
    names: Vec<String>,
    kicks: Duration,
    is_id_claimed: IdClaimChecker,
    timeout: Duration,
    token: CancellationToken,
    event_tx: mpsc::Sender<Event>,
    peer_tx: mpsc::Sender<Peer>,
    error_tx: mpsc::Sender<Error>,
    state: Negotiation,
}

impl Driver {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        mut reconnects: mpsc::UnboundedReceiver<()>,
    ) {
        // Armed on connect; the first greeting of every remote transport
        // peer seen while unclaimed pushes it out by another kicks
        // interval.
        let mut claim_at: Option<Instant> = None;
        // Set while backing off; fires a re-greeting.
        let mut regreet_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,

                _ = tokio::time::sleep_until(claim_at.unwrap_or_else(Instant::now)),
                        if claim_at.is_some() => {
                    claim_at = None;
                    if !self.claim().await {
                        break;
                    }
                }

                _ = tokio::time::sleep_until(regreet_at.unwrap_or_else(Instant::now)),
                        if regreet_at.is_some() => {
                    regreet_at = None;
                    self.broadcast(&self.state.greeting());
                    claim_at = Some(Instant::now() + self.kicks);
                }

                reconnected = reconnects.recv() => {
                    if reconnected.is_none() {
                        break;
                    }
                    self.state.reset(&self.names);
                    regreet_at = None;
                    claim_at = Some(Instant::now() + self.timeout + self.kicks);
                }

                event = events.recv() => {
                    let Some(event) = event else { break };
                    match event {
                        Event::Accepted(peer) => self.accept(peer).await,

                        Event::Message { peer_id, message } => {
                            self.message(peer_id, message, &mut claim_at, &mut regreet_at)
                                .await;
                        }

                        Event::Gone { peer_id } => self.gone(&peer_id),
                    }
                }
            }
        }
    }

    async fn accept(&mut self, peer: Peer) {
        if peer.channel_id == ID_CHANNEL {
            tracing::debug!(peer = %peer.peer_id, "Greeting new peer");

            let (writer, outbox) = mpsc::channel(WRITER_BUFFER);
            tokio::spawn(write_messages(peer.conn.clone(), outbox));
            tokio::spawn(read_messages(
                peer.conn.clone(),
                peer.peer_id.clone(),
                self.event_tx.clone(),
            ));

            let _ = writer.try_send(self.state.greeting());
            self.state.id_peers.insert(peer.peer_id.clone(), writer);
            return;
        }

        if self.state.claimed.is_some() {
            self.emit(peer).await;
        } else {
            self.state.pending.push(peer);
        }
    }

    async fn message(
        &mut self,
        peer_id: String,
        message: NamingMessage,
        claim_at: &mut Option<Instant>,
        regreet_at: &mut Option<Instant>,
    ) {
        match message {
            NamingMessage::Greeting { ids, timestamp } => {
                let first_greeting = self.state.greeted.insert(peer_id.clone());
                if first_greeting && self.state.claimed.is_none() && regreet_at.is_none() {
                    *claim_at = Some(Instant::now() + self.kicks);
                }

                let action = greeting_action(
                    self.state.claimed.as_deref(),
                    &self.state.candidates,
                    self.state.timestamp,
                    &ids,
                    timestamp,
                    &self.is_id_claimed,
                );
                match action {
                    GreetingAction::Ignore => {}
                    GreetingAction::Backoff => {
                        tracing::debug!(peer = %peer_id, "Backing off a younger contender");
                        self.send_to(&peer_id, NamingMessage::Backoff {});
                    }
                    GreetingAction::Kick(name) => {
                        tracing::debug!(peer = %peer_id, name = %name, "Kicking a claimed name");
                        self.send_to(&peer_id, NamingMessage::Kick { id: name });
                    }
                }
            }

            NamingMessage::Backoff {} => {
                if self.state.claimed.is_none() {
                    tracing::debug!(peer = %peer_id, "Received backoff");
                    *claim_at = None;
                    *regreet_at = Some(Instant::now() + self.kicks);
                }
            }

            NamingMessage::Kick { id } => {
                tracing::debug!(peer = %peer_id, name = %id, "Candidate name kicked");
                self.state.candidates.remove(&id);
            }

            NamingMessage::Claimed { id } => {
                tracing::debug!(peer = %peer_id, name = %id, "Peer claimed its name");
                self.state.logical.insert(peer_id.clone(), id.clone());

                // Channels emitted under the transport id are re-emitted
                // under the name so the application learns it.
                let seen = self.state.emitted.remove(&peer_id).unwrap_or_default();
                for peer in &seen {
                    let _ = self
                        .peer_tx
                        .send(Peer {
                            peer_id: id.clone(),
                            channel_id: peer.channel_id.clone(),
                            conn: peer.conn.clone(),
                        })
                        .await;
                }
                self.state.emitted.insert(peer_id, seen);
            }
        }
    }

    /// Forget everything about a departed transport peer.
    fn gone(&mut self, peer_id: &str) {
        self.state.id_peers.remove(peer_id);
        self.state.greeted.remove(peer_id);
        self.state.logical.remove(peer_id);
        self.state.emitted.remove(peer_id);
        self.state.pending.retain(|peer| peer.peer_id != peer_id);
    }

    /// Claim the smallest surviving candidate. Returns false when none
    /// are left, which is fatal.
    async fn claim(&mut self) -> bool {
        let Some(name) = pick_name(&self.state.candidates) else {
            let _ = self.error_tx.send(Error::AllNamesClaimed).await;
            self.token.cancel();
            return false;
        };

        tracing::info!(name = %name, "Claimed name");
        self.state.claimed = Some(name.clone());
        self.broadcast(&NamingMessage::Claimed { id: name });

        for peer in std::mem::take(&mut self.state.pending) {
            self.emit(peer).await;
        }
        true
    }

    async fn emit(&mut self, peer: Peer) {
        let named = Peer {
            peer_id: self
                .state
                .logical
                .get(&peer.peer_id)
                .cloned()
                .unwrap_or_else(|| peer.peer_id.clone()),
            channel_id: peer.channel_id.clone(),
            conn: peer.conn.clone(),
        };

        self.state
            .emitted
            .entry(peer.peer_id.clone())
            .or_default()
            .push(peer);

        let _ = self.peer_tx.send(named).await;
    }

    fn broadcast(&self, message: &NamingMessage) {
        for (peer_id, writer) in &self.state.id_peers {
            if writer.try_send(message.clone()).is_err() {
                tracing::debug!(peer = %peer_id, "Dropping naming message for a stalled peer");
            }
        }
    }

    fn send_to(&self, peer_id: &str, message: NamingMessage) {
        if let Some(writer) = self.state.id_peers.get(peer_id) {
            if writer.try_send(message).is_err() {
                tracing::debug!(peer = %peer_id, "Dropping naming message for a stalled peer");
            }
        }
    }
}

async fn write_messages(conn: Arc<DataChannel>, mut outbox: mpsc::Receiver<NamingMessage>) {
    while let Some(message) = outbox.recv().await {
        let raw = match message.to_vec() {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("Could not encode naming message: {e}");
                continue;
            }
        };
        if let Err(e) = conn.write(&Bytes::from(raw)).await {
            tracing::debug!("Could not write naming message: {e}");
            return;
        }
    }
}

async fn read_messages(conn: Arc<DataChannel>, peer_id: String, events: mpsc::Sender<Event>) {
    let mut buffer = vec![0u8; MESSAGE_BUFFER];
    loop {
        let n = match conn.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(peer = %peer_id, "ID channel closed: {e}");
                break;
            }
        };

        match NamingMessage::from_slice(&buffer[..n]) {
            Ok(message) => {
                let forwarded = events
                    .send(Event::Message {
                        peer_id: peer_id.clone(),
                        message,
                    })
                    .await;
                if forwarded.is_err() {
                    break;
                }
            }
            Err(e) => tracing::debug!(peer = %peer_id, "Skipping undecodable naming message: {e}"),
        }
    }

    let _ = events.send(Event::Gone { peer_id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker() -> IdClaimChecker {
        Arc::new(|ids: &[String], name: &str| ids.iter().any(|id| id == name))
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    struct TestDriver {
        driver: Driver,
        event_tx: mpsc::Sender<Event>,
        events: mpsc::Receiver<Event>,
        reconnect_tx: mpsc::UnboundedSender<()>,
        reconnects: mpsc::UnboundedReceiver<()>,
        peers: mpsc::Receiver<Peer>,
        errors: mpsc::Receiver<Error>,
    }

    fn driver(names: &[&str], kicks: Duration) -> TestDriver {
        let (event_tx, events) = mpsc::channel(64);
        let (reconnect_tx, reconnects) = mpsc::unbounded_channel();
        let (peer_tx, peers) = mpsc::channel(16);
        let (error_tx, errors) = mpsc::channel(1);

        let names = ids(names);
        TestDriver {
            driver: Driver {
                names: names.clone(),
                kicks,
                is_id_claimed: checker(),
                timeout: kicks,
                token: CancellationToken::new(),
                event_tx: event_tx.clone(),
                peer_tx,
                error_tx,
                state: Negotiation::new(&names),
            },
            event_tx,
            events,
            reconnect_tx,
            reconnects,
            peers,
            errors,
        }
    }

    fn attach_id_peer(driver: &mut Driver, peer_id: &str) -> mpsc::Receiver<NamingMessage> {
        let (writer, outbox) = mpsc::channel(WRITER_BUFFER);
        driver.state.id_peers.insert(peer_id.to_string(), writer);
        outbox
    }

    #[test]
    fn test_older_instance_backs_off_younger_contender() {
        let action = greeting_action(
            None,
            &set(&["alice", "bob"]),
            100,
            &ids(&["bob"]),
            200,
            &checker(),
        );
        assert_eq!(action, GreetingAction::Backoff);
    }

    #[test]
    fn test_younger_instance_does_not_back_off_older() {
        let action = greeting_action(
            None,
            &set(&["alice", "bob"]),
            200,
            &ids(&["bob"]),
            100,
            &checker(),
        );
        assert_eq!(action, GreetingAction::Ignore);
    }

    #[test]
    fn test_disjoint_candidates_are_ignored() {
        let action = greeting_action(
            None,
            &set(&["alice"]),
            100,
            &ids(&["carol"]),
            200,
            &checker(),
        );
        assert_eq!(action, GreetingAction::Ignore);
    }

    #[test]
    fn test_claimed_name_is_defended() {
        let action = greeting_action(
            Some("alice"),
            &BTreeSet::new(),
            100,
            &ids(&["alice", "bob"]),
            200,
            &checker(),
        );
        assert_eq!(action, GreetingAction::Kick("alice".to_string()));
    }

    #[test]
    fn test_claimed_name_ignores_unrelated_greeting() {
        let action = greeting_action(
            Some("alice"),
            &BTreeSet::new(),
            100,
            &ids(&["bob"]),
            200,
            &checker(),
        );
        assert_eq!(action, GreetingAction::Ignore);
    }

    #[test]
    fn test_pick_name_is_deterministic() {
        assert_eq!(pick_name(&set(&["bob", "alice"])).as_deref(), Some("alice"));
        assert_eq!(pick_name(&BTreeSet::new()), None);
    }

    #[test]
    fn test_greeting_advertises_claim_or_candidates() {
        let mut state = Negotiation::new(&ids(&["bob", "alice"]));
        match state.greeting() {
            NamingMessage::Greeting { ids, .. } => {
                assert_eq!(ids, vec!["alice".to_string(), "bob".to_string()]);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        state.claimed = Some("alice".to_string());
        match state.greeting() {
            NamingMessage::Greeting { ids, .. } => {
                assert_eq!(ids, vec!["alice".to_string()]);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_greeting_from_younger_contender_draws_backoff() {
        let mut harness = driver(&["alice"], Duration::from_secs(1));
        harness.driver.state.timestamp = 100;
        let mut outbox = attach_id_peer(&mut harness.driver, "p1");

        let mut claim_at = None;
        let mut regreet_at = None;
        harness
            .driver
            .message(
                "p1".to_string(),
                NamingMessage::Greeting {
                    ids: ids(&["alice"]),
                    timestamp: 200,
                },
                &mut claim_at,
                &mut regreet_at,
            )
            .await;

        assert_eq!(outbox.recv().await, Some(NamingMessage::Backoff {}));
        assert!(claim_at.is_some(), "first greeting must arm the claim timer");
    }

    #[tokio::test]
    async fn test_repeat_greetings_do_not_rearm_claim_timer() {
        let mut harness = driver(&["alice"], Duration::from_secs(1));
        harness.driver.state.timestamp = 300;
        let _outbox = attach_id_peer(&mut harness.driver, "p1");

        let greeting = NamingMessage::Greeting {
            ids: ids(&["alice"]),
            timestamp: 200,
        };
        let mut claim_at = None;
        let mut regreet_at = None;
        harness
            .driver
            .message("p1".to_string(), greeting.clone(), &mut claim_at, &mut regreet_at)
            .await;
        assert!(claim_at.is_some());

        // A backed-off peer regreets every kicks interval; those repeats
        // must not starve the timer.
        claim_at = None;
        harness
            .driver
            .message("p1".to_string(), greeting, &mut claim_at, &mut regreet_at)
            .await;
        assert!(claim_at.is_none());
    }

    #[tokio::test]
    async fn test_claimed_name_draws_kick() {
        let mut harness = driver(&[], Duration::from_secs(1));
        harness.driver.state.claimed = Some("alice".to_string());
        let mut outbox = attach_id_peer(&mut harness.driver, "p1");

        let mut claim_at = None;
        let mut regreet_at = None;
        harness
            .driver
            .message(
                "p1".to_string(),
                NamingMessage::Greeting {
                    ids: ids(&["alice", "bob"]),
                    timestamp: 200,
                },
                &mut claim_at,
                &mut regreet_at,
            )
            .await;

        assert_eq!(
            outbox.recv().await,
            Some(NamingMessage::Kick {
                id: "alice".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_kick_then_claim_picks_next_candidate() {
        let mut harness = driver(&["alice", "bob"], Duration::from_secs(1));
        let mut outbox = attach_id_peer(&mut harness.driver, "p1");

        let mut claim_at = None;
        let mut regreet_at = None;
        harness
            .driver
            .message(
                "p1".to_string(),
                NamingMessage::Kick {
                    id: "alice".to_string(),
                },
                &mut claim_at,
                &mut regreet_at,
            )
            .await;

        assert!(harness.driver.claim().await);
        assert_eq!(harness.driver.state.claimed.as_deref(), Some("bob"));
        assert_eq!(
            outbox.recv().await,
            Some(NamingMessage::Claimed {
                id: "bob".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_exhausted_candidates_are_fatal() {
        let mut harness = driver(&[], Duration::from_secs(1));

        assert!(!harness.driver.claim().await);
        assert!(matches!(
            harness.errors.recv().await,
            Some(Error::AllNamesClaimed)
        ));
        assert!(harness.driver.token.is_cancelled());
    }

    #[tokio::test]
    async fn test_backoff_pauses_claim_timer() {
        let mut harness = driver(&["alice"], Duration::from_secs(1));
        let _outbox = attach_id_peer(&mut harness.driver, "p1");

        let mut claim_at = Some(Instant::now());
        let mut regreet_at = None;
        harness
            .driver
            .message(
                "p1".to_string(),
                NamingMessage::Backoff {},
                &mut claim_at,
                &mut regreet_at,
            )
            .await;

        assert!(claim_at.is_none());
        assert!(regreet_at.is_some());
    }

    #[tokio::test]
    async fn test_gone_prunes_all_peer_state() {
        let mut harness = driver(&["alice"], Duration::from_secs(1));
        let _outbox = attach_id_peer(&mut harness.driver, "p1");

        let mut claim_at = None;
        let mut regreet_at = None;
        harness
            .driver
            .message(
                "p1".to_string(),
                NamingMessage::Greeting {
                    ids: ids(&["other"]),
                    timestamp: 200,
                },
                &mut claim_at,
                &mut regreet_at,
            )
            .await;
        harness
            .driver
            .message(
                "p1".to_string(),
                NamingMessage::Claimed {
                    id: "other".to_string(),
                },
                &mut claim_at,
                &mut regreet_at,
            )
            .await;
        assert!(harness.driver.state.greeted.contains("p1"));
        assert!(harness.driver.state.logical.contains_key("p1"));

        harness.driver.gone("p1");
        assert!(harness.driver.state.id_peers.is_empty());
        assert!(harness.driver.state.greeted.is_empty());
        assert!(harness.driver.state.logical.is_empty());
        assert!(harness.driver.state.emitted.is_empty());
        assert!(harness.driver.state.pending.is_empty());
    }

    #[tokio::test]
    async fn test_claim_timer_fires_after_reconnect() {
        let kicks = Duration::from_millis(50);
        let mut harness = driver(&["n1"], kicks);
        let mut outbox = attach_id_peer(&mut harness.driver, "p1");
        let token = harness.driver.token.clone();

        tokio::spawn(harness.driver.run(harness.events, harness.reconnects));
        harness.reconnect_tx.send(()).unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(2), outbox.recv())
            .await
            .expect("claim timer never fired");
        assert_eq!(
            claimed,
            Some(NamingMessage::Claimed {
                id: "n1".to_string()
            })
        );
        token.cancel();
    }

    #[tokio::test]
    async fn test_backoff_delays_claim_and_regreets() {
        let kicks = Duration::from_millis(50);
        let mut harness = driver(&["n1"], kicks);
        let mut outbox = attach_id_peer(&mut harness.driver, "p1");
        let token = harness.driver.token.clone();

        tokio::spawn(harness.driver.run(harness.events, harness.reconnects));
        harness.reconnect_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        harness
            .event_tx
            .send(Event::Message {
                peer_id: "p1".to_string(),
                message: NamingMessage::Backoff {},
            })
            .await
            .unwrap();

        // The backoff postpones the claim behind a fresh greeting.
        let first = tokio::time::timeout(Duration::from_secs(2), outbox.recv())
            .await
            .expect("regreet never fired");
        assert!(matches!(first, Some(NamingMessage::Greeting { .. })), "got {first:?}");

        let second = tokio::time::timeout(Duration::from_secs(2), outbox.recv())
            .await
            .expect("claim never fired after the regreet");
        assert_eq!(
            second,
            Some(NamingMessage::Claimed {
                id: "n1".to_string()
            })
        );
        token.cancel();
    }
}
