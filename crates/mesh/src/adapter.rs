//! The mesh adapter.
//!
//! Per client, the adapter keeps a websocket to the signaler and runs the
//! introduction/offer/answer/candidate state machine against every other
//! member of the community, so that after convergence each pair of members
//! shares exactly one WebRTC peer connection carrying one data channel per
//! configured channel name. Opened channels are detached into raw byte
//! streams and emitted on the accept stream as [Peer]s.
//!
//! Peer records carry an incarnation id stamped at creation. A remote that
//! re-introduces itself replaces its record under a fresh incarnation;
//! the Disconnected handler of the old connection compares incarnations
//! before tearing anything down, so stale callbacks cannot destroy the
//! replacement.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use commune_wire::encryption;
use commune_wire::signaler::SignalerMessage;
use futures::SinkExt;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::data::data_channel::DataChannel;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::candidates::CandidateQueue;
use crate::error::Error;
use crate::error::Result;
use crate::ice;

/// Hook invoked at the start of every signaler connection attempt,
/// including the first.
pub type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Build the websocket URL joining `community` on the signaler at
/// `raddr`, percent-encoding the query parameters.
pub fn signaler_url(raddr: &str, community: &str, password: &str) -> Result<String> {
    let mut url = url::Url::parse(raddr)?;
    url.query_pairs_mut()
        .append_pair("community", community)
        .append_pair("password", password);
    Ok(url.to_string())
}

/// Configuration of a mesh adapter.
#[derive(Clone)]
pub struct AdapterConfig {
    /// Data channel names created on every peer connection, in order.
    pub channels: Vec<String>,
    /// ICE server entries, see [crate::ice::parse_servers].
    pub ice_servers: Vec<String>,
    /// Restrict the transport policy to TURN relays.
    pub force_relay: bool,
    /// Read deadline of the signaler websocket and the reconnection wait.
    pub timeout: Duration,
    /// Static transport id; a fresh UUID per connection when empty.
    pub id: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            channels: vec![],
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            force_relay: false,
            timeout: Duration::from_secs(10),
            id: String::new(),
        }
    }
}

/// An accepted data channel to one remote member, detached into a raw
/// message stream.
#[derive(Clone)]
pub struct Peer {
    /// Transport id of the remote (rewritten by the named-peer layer).
    pub peer_id: String,
    /// The channel name.
    pub channel_id: String,
    /// The detached channel; one read returns one remote message.
    pub conn: Arc<DataChannel>,
}

struct PeerState {
    incarnation: u64,
    conn: Arc<RTCPeerConnection>,
    channels: HashMap<String, Arc<RTCDataChannel>>,
    candidates: Arc<CandidateQueue>,
}

struct Inner {
    url: String,
    key: String,
    config: AdapterConfig,
    token: CancellationToken,
    peers: Mutex<HashMap<String, PeerState>>,
    incarnations: AtomicU64,
    accept_tx: mpsc::Sender<Peer>,
    on_reconnect: Mutex<Option<ReconnectHook>>,
}

/// A mesh adapter for one community.
pub struct Adapter {
    inner: Arc<Inner>,
    accept_rx: Mutex<Option<mpsc::Receiver<Peer>>>,
    run: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Adapter {
    /// Create an adapter connecting to `signaler_url` (a `ws(s)://` URL
    /// carrying the `community` and `password` query parameters), sealing
    /// frames with `key`.
    pub fn new(
        signaler_url: &str,
        key: &str,
        config: AdapterConfig,
        token: CancellationToken,
    ) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(16);

        Self {
            inner: Arc::new(Inner {
                url: signaler_url.to_string(),
                key: key.to_string(),
                config,
                token,
                peers: Mutex::new(HashMap::new()),
                incarnations: AtomicU64::new(0),
                accept_tx,
                on_reconnect: Mutex::new(None),
            }),
            accept_rx: Mutex::new(Some(accept_rx)),
            run: Mutex::new(None),
        }
    }

    /// Install the reconnect hook. Must be called before [Adapter::open].
    pub fn set_on_reconnect(&self, hook: ReconnectHook) {
        *self.inner.on_reconnect.lock().unwrap() = Some(hook);
    }

    /// Validate the configuration, connect and return the accept stream.
    ///
    /// Configuration errors ([Error::MissingForcedTurn],
    /// [Error::InvalidTurn], [Error::MissingTurnCredentials]) are returned
    /// here and are fatal; transient signaler failures afterwards trigger
    /// reconnection forever until [Adapter::close].
    pub async fn open(&self) -> Result<mpsc::Receiver<Peer>> {
        let ice_config = ice::parse_servers(&self.inner.config.ice_servers)?;
        if self.inner.config.force_relay && !ice_config.has_turn {
            return Err(Error::MissingForcedTurn);
        }

        let mut setting = SettingEngine::default();
        setting.detach_data_channels();
        let api = Arc::new(APIBuilder::new().with_setting_engine(setting).build());

        let accept_rx = self
            .accept_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(Error::Closed)?;

        let inner = self.inner.clone();
        *self.run.lock().unwrap() = Some(tokio::spawn(run(inner, api)));

        Ok(accept_rx)
    }

    /// Wait for the adapter to stop after [Adapter::close].
    pub async fn wait(&self) -> Result<()> {
        let handle = self.run.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| {
                Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;
        }
        Ok(())
    }

    /// Stop the adapter, tearing down all peers and the websocket.
    pub fn close(&self) {
        self.inner.token.cancel();
    }
}

async fn run(inner: Arc<Inner>, api: Arc<API>) {
    loop {
        if inner.token.is_cancelled() {
            break;
        }

        let hook = inner.on_reconnect.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }

        match connection(&inner, &api).await {
            Ok(()) => break,
            Err(e) => tracing::error!("Signaler connection lost: {e}"),
        }

        // State from the dead connection never survives into the next one.
        teardown_all(&inner).await;

        tokio::select! {
            _ = inner.token.cancelled() => break,
            _ = tokio::time::sleep(inner.config.timeout) => {}
        }
    }

    teardown_all(&inner).await;
}

/// Drive one signaler connection until it fails or the adapter closes.
/// Returns Ok only on cancellation.
async fn connection(inner: &Arc<Inner>, api: &Arc<API>) -> Result<()> {
    let (socket, _) = connect_async(&inner.url).await?;
    let (mut sink, mut stream) = socket.split();

    let local_id = if inner.config.id.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        inner.config.id.clone()
    };
    tracing::info!(id = %local_id, "Connected to signaler");

    // Outbound envelopes funnel through one channel so that webrtc
    // callbacks can send without touching the sink.
    let (out_tx, mut out_rx) = mpsc::channel::<SignalerMessage>(64);

    let introduction = SignalerMessage::Introduction {
        from: local_id.clone(),
    };
    let sealed = encryption::seal(&introduction.to_vec()?, &inner.key)?;
    sink.send(WsMessage::Binary(sealed)).await?;

    let timeout = inner.config.timeout;
    let mut ping = tokio::time::interval(timeout / 2);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut deadline = tokio::time::Instant::now() + timeout;

    loop {
        tokio::select! {
            _ = inner.token.cancelled() => return Ok(()),

            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "signaler heartbeat expired",
                )));
            }

            _ = ping.tick() => {
                sink.send(WsMessage::Ping(vec![])).await?;
            }

            outbound = out_rx.recv() => {
                // Senders live as long as this scope; the channel cannot end.
                let Some(outbound) = outbound else { return Ok(()) };
                let sealed = encryption::seal(&outbound.to_vec()?, &inner.key)?;
                sink.send(WsMessage::Binary(sealed)).await?;
            }

            message = stream.next() => {
                let message = match message {
                    None => return Err(Error::Closed),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(message)) => message,
                };

                let raw = match message {
                    WsMessage::Pong(_) => {
                        deadline = tokio::time::Instant::now() + timeout;
                        continue;
                    }
                    // tungstenite answers pings on its own.
                    WsMessage::Ping(_) | WsMessage::Frame(_) => continue,
                    WsMessage::Close(_) => return Err(Error::Closed),
                    WsMessage::Text(text) => text.into_bytes(),
                    WsMessage::Binary(raw) => raw,
                };

                handle_frame(inner, api, &local_id, &out_tx, raw).await?;
            }
        }
    }
}

async fn handle_frame(
    inner: &Arc<Inner>,
    api: &Arc<API>,
    local_id: &str,
    out_tx: &mpsc::Sender<SignalerMessage>,
    raw: Vec<u8>,
) -> Result<()> {
    let plain = match encryption::open(&raw, &inner.key) {
        Ok(plain) => plain,
        Err(e) => {
            tracing::debug!("Skipping frame that failed to open: {e}");
            return Ok(());
        }
    };

    let message = match SignalerMessage::from_slice(&plain) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!("Skipping undecodable frame: {e}");
            return Ok(());
        }
    };

    match message {
        SignalerMessage::Introduction { from } => {
            handle_introduction(inner, api, local_id, out_tx, from).await
        }
        SignalerMessage::Offer { from, to, payload } if to == local_id => {
            handle_offer(inner, api, local_id, out_tx, from, payload).await
        }
        SignalerMessage::Answer { from, to, payload } if to == local_id => {
            handle_answer(inner, from, payload).await
        }
        SignalerMessage::Candidate { from, to, payload } if to == local_id => {
            handle_candidate(inner, from, payload)
        }
        _ => {
            tracing::trace!("Discarding message addressed to another peer");
            Ok(())
        }
    }
}

async fn handle_introduction(
    inner: &Arc<Inner>,
    api: &Arc<API>,
    local_id: &str,
    out_tx: &mpsc::Sender<SignalerMessage>,
    remote: String,
) -> Result<()> {
    tracing::debug!(remote = %remote, "Received introduction");
    replace_peer(inner, &remote).await;

    let incarnation = inner.incarnations.fetch_add(1, Ordering::Relaxed);
    let pc = new_peer_connection(inner, api, local_id, out_tx, &remote, incarnation).await?;

    // One SDP covers every channel created before the offer.
    for channel in &inner.config.channels {
        let dc = pc.create_data_channel(channel, None).await?;
        register_channel(inner, &remote, dc);
    }

    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer.clone()).await?;

    insert_peer(inner, &remote, incarnation, pc);

    let _ = out_tx
        .send(SignalerMessage::Offer {
            from: local_id.to_string(),
            to: remote,
            payload: serde_json::to_vec(&offer)?,
        })
        .await;

    Ok(())
}

async fn handle_offer(
    inner: &Arc<Inner>,
    api: &Arc<API>,
    local_id: &str,
    out_tx: &mpsc::Sender<SignalerMessage>,
    remote: String,
    payload: Vec<u8>,
) -> Result<()> {
    tracing::debug!(remote = %remote, "Received offer");
    replace_peer(inner, &remote).await;

    let incarnation = inner.incarnations.fetch_add(1, Ordering::Relaxed);
    let pc = new_peer_connection(inner, api, local_id, out_tx, &remote, incarnation).await?;

    let on_channel_inner = inner.clone();
    let on_channel_remote = remote.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        register_channel(&on_channel_inner, &on_channel_remote, dc);
        Box::pin(async move {})
    }));

    let offer: RTCSessionDescription = serde_json::from_slice(&payload)?;
    pc.set_remote_description(offer).await?;

    let answer = pc.create_answer(None).await?;
    pc.set_local_description(answer.clone()).await?;

    let candidates = insert_peer(inner, &remote, incarnation, pc.clone());
    tokio::spawn(drain_candidates(pc, candidates));

    let _ = out_tx
        .send(SignalerMessage::Answer {
            from: local_id.to_string(),
            to: remote,
            payload: serde_json::to_vec(&answer)?,
        })
        .await;

    Ok(())
}

async fn handle_answer(inner: &Arc<Inner>, remote: String, payload: Vec<u8>) -> Result<()> {
    tracing::debug!(remote = %remote, "Received answer");

    let (pc, candidates) = {
        let peers = inner.peers.lock().unwrap();
        let Some(peer) = peers.get(&remote) else {
            tracing::debug!(remote = %remote, "Answer for unknown peer");
            return Ok(());
        };
        (peer.conn.clone(), peer.candidates.clone())
    };

    let answer: RTCSessionDescription = serde_json::from_slice(&payload)?;
    pc.set_remote_description(answer).await?;
    tokio::spawn(drain_candidates(pc, candidates));

    Ok(())
}

fn handle_candidate(inner: &Arc<Inner>, remote: String, payload: Vec<u8>) -> Result<()> {
    let peers = inner.peers.lock().unwrap();
    let Some(peer) = peers.get(&remote) else {
        tracing::debug!(remote = %remote, "Candidate for unknown peer");
        return Ok(());
    };

    match String::from_utf8(payload) {
        // Pushes racing a teardown are dropped by the closed flag.
        Ok(candidate) => {
            peer.candidates.push(candidate);
        }
        Err(_) => tracing::debug!(remote = %remote, "Discarding non-utf8 candidate"),
    }
    Ok(())
}

/// Create a peer connection with the ICE and state-change plumbing shared
/// by both negotiation directions.
async fn new_peer_connection(
    inner: &Arc<Inner>,
    api: &Arc<API>,
    local_id: &str,
    out_tx: &mpsc::Sender<SignalerMessage>,
    remote: &str,
    incarnation: u64,
) -> Result<Arc<RTCPeerConnection>> {
    let ice_config = ice::parse_servers(&inner.config.ice_servers)?;

    let mut rtc_config = RTCConfiguration {
        ice_servers: ice_config.servers,
        ..Default::default()
    };
    if inner.config.force_relay {
        rtc_config.ice_transport_policy = RTCIceTransportPolicy::Relay;
    }

    let pc = Arc::new(api.new_peer_connection(rtc_config).await?);

    let candidate_out = out_tx.clone();
    let candidate_from = local_id.to_string();
    let candidate_to = remote.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidate_out = candidate_out.clone();
        let candidate_from = candidate_from.clone();
        let candidate_to = candidate_to.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(e) => {
                    tracing::debug!("Could not serialize local candidate: {e}");
                    return;
                }
            };
            let _ = candidate_out
                .send(SignalerMessage::Candidate {
                    from: candidate_from,
                    to: candidate_to,
                    payload: init.candidate.into_bytes(),
                })
                .await;
        })
    }));

    let state_inner = inner.clone();
    let state_remote = remote.to_string();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let state_inner = state_inner.clone();
        let state_remote = state_remote.clone();
        Box::pin(async move {
            tracing::debug!(remote = %state_remote, "Peer connection state: {state}");
            if state == RTCPeerConnectionState::Disconnected {
                // Only the record of this very incarnation may be torn
                // down; a replacement under the same remote id stays.
                let record = {
                    let mut peers = state_inner.peers.lock().unwrap();
                    match peers.get(&state_remote) {
                        Some(peer) if peer.incarnation == incarnation => {
                            peers.remove(&state_remote)
                        }
                        _ => None,
                    }
                };
                if let Some(record) = record {
                    teardown_peer(record).await;
                }
            }
        })
    }));

    Ok(pc)
}

/// Wire up open/close handling of one data channel, emitting the detached
/// stream upward once the channel opens.
fn register_channel(inner: &Arc<Inner>, remote: &str, dc: Arc<RTCDataChannel>) {
    let label = dc.label().to_string();
    if !inner.config.channels.contains(&label) {
        tracing::debug!(remote = %remote, channel = %label, "Ignoring unknown channel");
        return;
    }

    let open_inner = inner.clone();
    let open_remote = remote.to_string();
    let open_label = label.clone();
    let open_dc = dc.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            let detached = match open_dc.detach().await {
                Ok(detached) => detached,
                Err(e) => {
                    tracing::error!(channel = %open_label, "Could not detach channel: {e}");
                    return;
                }
            };

            {
                let mut peers = open_inner.peers.lock().unwrap();
                if let Some(peer) = peers.get_mut(&open_remote) {
                    peer.channels.insert(open_label.clone(), open_dc.clone());
                }
            }

            tracing::debug!(remote = %open_remote, channel = %open_label, "Channel open");
            let _ = open_inner
                .accept_tx
                .send(Peer {
                    peer_id: open_remote.clone(),
                    channel_id: open_label.clone(),
                    conn: detached,
                })
                .await;
        })
    }));

    let close_inner = inner.clone();
    let close_remote = remote.to_string();
    dc.on_close(Box::new(move || {
        // Missing entries are fine: teardown may have removed the record.
        let mut peers = close_inner.peers.lock().unwrap();
        if let Some(peer) = peers.get_mut(&close_remote) {
            peer.channels.remove(&label);
        }
        Box::pin(async move {})
    }));
}

fn insert_peer(
    inner: &Arc<Inner>,
    remote: &str,
    incarnation: u64,
    pc: Arc<RTCPeerConnection>,
) -> Arc<CandidateQueue> {
    let candidates = Arc::new(CandidateQueue::default());
    inner.peers.lock().unwrap().insert(remote.to_string(), PeerState {
        incarnation,
        conn: pc,
        channels: HashMap::new(),
        candidates: candidates.clone(),
    });
    candidates
}

/// Tear down the prior record for `remote`, if any. Re-introduction
/// replaces the peer.
async fn replace_peer(inner: &Arc<Inner>, remote: &str) {
    let prior = inner.peers.lock().unwrap().remove(remote);
    if let Some(prior) = prior {
        tracing::debug!(remote = %remote, "Replacing existing peer");
        teardown_peer(prior).await;
    }
}

async fn teardown_peer(record: PeerState) {
    for (_, channel) in record.channels {
        if let Err(e) = channel.close().await {
            tracing::debug!("Could not close channel: {e}");
        }
    }
    if let Err(e) = record.conn.close().await {
        tracing::debug!("Could not close peer connection: {e}");
    }
    record.candidates.close();
}

async fn teardown_all(inner: &Arc<Inner>) {
    let records: Vec<PeerState> = {
        let mut peers = inner.peers.lock().unwrap();
        peers.drain().map(|(_, record)| record).collect()
    };
    for record in records {
        teardown_peer(record).await;
    }
}

async fn drain_candidates(pc: Arc<RTCPeerConnection>, queue: Arc<CandidateQueue>) {
    while let Some(candidate) = queue.pop().await {
        let init = RTCIceCandidateInit {
            candidate,
            ..Default::default()
        };
        if let Err(e) = pc.add_ice_candidate(init).await {
            tracing::debug!("Discarding remote candidate: {e}");
        }
    }
}
