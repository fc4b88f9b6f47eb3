//! The signaling server.
//!
//! One HTTP surface dispatched by method: GET with a `community` query
//! joins that community over a websocket; GET without one lists
//! communities; POST creates a persistent community; DELETE deletes one
//! and kicks its members cluster-wide. Relayed frames are opaque payload
//! bytes, already sealed end-to-end with the community key.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::http::header;
use axum::http::HeaderMap;
use axum::http::Method;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use axum::Router;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::brokers::Broker;
use crate::brokers::Input;
use crate::brokers::Kick;
use crate::brokers::MessageKind;
use crate::error::Error;
use crate::error::Result;
use crate::persistence::Persister;

/// Tunables of a signaler instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Silence budget of a connection; pings go out at half this rate.
    pub heartbeat: Duration,
    /// Whether joining may lazily create a non-persistent community.
    pub ephemeral_communities: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(10),
            ephemeral_communities: true,
        }
    }
}

/// Membership registry: community id -> connection id -> kick handle.
type Connections = Mutex<HashMap<String, HashMap<String, CancellationToken>>>;

/// A signaler instance. All cross-connection traffic goes through the
/// broker; this struct only tracks membership and configuration.
pub struct Signaler {
    persister: Arc<dyn Persister>,
    broker: Arc<dyn Broker>,
    authenticator: Arc<dyn Authenticator>,
    config: ServerConfig,
    connections: Connections,
}

impl Signaler {
    /// Assemble a signaler over its backends.
    pub fn new(
        persister: Arc<dyn Persister>,
        broker: Arc<dyn Broker>,
        authenticator: Arc<dyn Authenticator>,
        config: ServerConfig,
    ) -> Self {
        Self {
            persister,
            broker,
            authenticator,
            config,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Bind the HTTP listener and start the cluster kick subscriber.
    pub async fn bind(
        self: Arc<Self>,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<BoundSignaler> {
        let kicks = self.broker.subscribe_to_kicks().await?;
        tokio::spawn(Self::listen_for_kicks(
            self.clone(),
            kicks,
            shutdown.clone(),
        ));

        let router = Router::new()
            .fallback(handle_request)
            .layer(CorsLayer::permissive())
            .with_state(self);

        let server = axum::Server::try_bind(&addr)
            .map_err(Error::Server)?
            .serve(router.into_make_service());
        let local_addr = server.local_addr();
        tracing::info!("Signaler listening on {local_addr}");

        Ok(BoundSignaler {
            local_addr,
            serve: Box::pin(async move {
                server
                    .with_graceful_shutdown(shutdown.cancelled())
                    .await
                    .map_err(Error::Server)
            }),
        })
    }

    async fn listen_for_kicks(
        signaler: Arc<Self>,
        mut kicks: tokio::sync::mpsc::Receiver<Kick>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                kick = kicks.recv() => {
                    let Some(kick) = kick else {
                        tracing::warn!("Kick subscription ended");
                        return;
                    };

                    let handles: Vec<CancellationToken> = {
                        let connections = signaler.connections.lock().unwrap();
                        connections
                            .get(&kick.community)
                            .map(|members| members.values().cloned().collect())
                            .unwrap_or_default()
                    };

                    tracing::info!(
                        community = %kick.community,
                        connections = handles.len(),
                        "Kicking community"
                    );
                    for handle in handles {
                        handle.cancel();
                    }
                }
            }
        }
    }

    fn register(&self, community: &str, conn_id: &str, kick: CancellationToken) {
        self.connections
            .lock()
            .unwrap()
            .entry(community.to_string())
            .or_default()
            .insert(conn_id.to_string(), kick);
    }

    fn deregister(&self, community: &str, conn_id: &str) {
        let mut connections = self.connections.lock().unwrap();
        if let Some(members) = connections.get_mut(community) {
            members.remove(conn_id);
            if members.is_empty() {
                connections.remove(community);
            }
        }
    }

    /// Drive one websocket connection from upgrade to teardown.
    async fn handle_connection(self: Arc<Self>, socket: WebSocket, community: String) {
        let conn_id = Uuid::new_v4().to_string();
        let kick = CancellationToken::new();
        self.register(&community, &conn_id, kick.clone());

        tracing::info!(community = %community, conn_id = %conn_id, "Client joined");
        if let Err(e) = self.connection_loop(socket, &community, &conn_id, &kick).await {
            tracing::info!(community = %community, conn_id = %conn_id, "Client disconnected: {e}");
        } else {
            tracing::info!(community = %community, conn_id = %conn_id, "Client left");
        }

        // Cleanup happens on every exit path: deregister, decrement the
        // community count, drop the socket.
        self.deregister(&community, &conn_id);
        if let Err(e) = self.persister.remove_client_from_community(&community).await {
            tracing::error!(community = %community, "Could not remove client from community: {e}");
        }
    }

    async fn connection_loop(
        &self,
        socket: WebSocket,
        community: &str,
        conn_id: &str,
        kick: &CancellationToken,
    ) -> Result<()> {
        let mut inputs = self.broker.subscribe_to_inputs(community).await?;
        let (mut sink, mut stream) = socket.split();

        let heartbeat = self.config.heartbeat;
        let mut ping = tokio::time::interval(heartbeat / 2);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut deadline = tokio::time::Instant::now() + heartbeat;

        loop {
            tokio::select! {
                _ = kick.cancelled() => return Ok(()),

                _ = tokio::time::sleep_until(deadline) => {
                    return Err(Error::HeartbeatExpired);
                }

                _ = ping.tick() => {
                    sink.send(Message::Ping(vec![]))
                        .await
                        .map_err(|e| Error::WebSocket(e.to_string()))?;
                }

                message = stream.next() => {
                    let message = match message {
                        None => return Ok(()),
                        Some(Err(e)) => return Err(Error::WebSocket(e.to_string())),
                        Some(Ok(message)) => message,
                    };

                    let input = match message {
                        Message::Pong(_) => {
                            deadline = tokio::time::Instant::now() + heartbeat;
                            continue;
                        }
                        // axum replies to pings on its own.
                        Message::Ping(_) => continue,
                        Message::Close(_) => return Ok(()),
                        Message::Text(text) => Input {
                            sender: conn_id.to_string(),
                            kind: MessageKind::Text,
                            payload: text.into_bytes(),
                        },
                        Message::Binary(payload) => Input {
                            sender: conn_id.to_string(),
                            kind: MessageKind::Binary,
                            payload,
                        },
                    };

                    self.broker.publish_input(community, input).await?;
                }

                input = inputs.recv() => {
                    let Some(input) = input else {
                        return Err(Error::Broker("input subscription ended".to_string()));
                    };
                    if input.sender == conn_id {
                        continue;
                    }

                    let message = match input.kind {
                        MessageKind::Text => match String::from_utf8(input.payload) {
                            Ok(text) => Message::Text(text),
                            Err(_) => {
                                tracing::debug!("Skipping non-utf8 text input");
                                continue;
                            }
                        },
                        MessageKind::Binary => Message::Binary(input.payload),
                    };

                    sink.send(message)
                        .await
                        .map_err(|e| Error::WebSocket(e.to_string()))?;
                }
            }
        }
    }
}

/// A bound signaler ready to serve.
pub struct BoundSignaler {
    local_addr: SocketAddr,
    serve: futures::future::BoxFuture<'static, Result<()>>,
}

impl BoundSignaler {
    /// The address the listener actually bound, useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until the shutdown token fires.
    pub async fn serve(self) -> Result<()> {
        self.serve.await
    }
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::WrongPassword
        | Error::EphemeralDisabled
        | Error::MissingPassword
        | Error::Unauthorized
        | Error::InvalidToken(_) => StatusCode::UNAUTHORIZED,
        Error::NotFound => StatusCode::NOT_FOUND,
        Error::UniqueViolation => StatusCode::CONFLICT,
        Error::ApiDisabled => StatusCode::NOT_IMPLEMENTED,
        Error::MissingCommunity => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: Error) -> Response {
    let status = status_for(&error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {error}");
    } else {
        tracing::debug!("Request rejected: {error}");
    }
    (status, error.to_string()).into_response()
}

async fn handle_request(
    State(signaler): State<Arc<Signaler>>,
    method: Method,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let community = params.get("community").cloned();
    let password = params.get("password").cloned();
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let result = match (method, community) {
        (Method::GET, Some(community)) => {
            join(signaler, community, password, ws).await
        }
        (Method::GET, None) => list(signaler, authorization).await,
        (Method::POST, community) => {
            create(signaler, community, password, authorization).await
        }
        (Method::DELETE, community) => delete(signaler, community, authorization).await,
        _ => Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    };

    result.unwrap_or_else(error_response)
}

async fn join(
    signaler: Arc<Signaler>,
    community: String,
    password: Option<String>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response> {
    let password = password.ok_or(Error::MissingPassword)?;
    let Some(ws) = ws else {
        return Ok((StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response());
    };

    signaler
        .persister
        .add_clients_to_community(
            &community,
            &password,
            signaler.config.ephemeral_communities,
        )
        .await?;

    Ok(ws.on_upgrade(move |socket| signaler.handle_connection(socket, community)))
}

async fn list(signaler: Arc<Signaler>, authorization: Option<String>) -> Result<Response> {
    signaler
        .authenticator
        .authenticate(authorization.as_deref())
        .await?;

    let communities = signaler.persister.get_communities().await?;
    Ok(Json(communities).into_response())
}

async fn create(
    signaler: Arc<Signaler>,
    community: Option<String>,
    password: Option<String>,
    authorization: Option<String>,
) -> Result<Response> {
    signaler
        .authenticator
        .authenticate(authorization.as_deref())
        .await?;

    let community = community.ok_or(Error::MissingCommunity)?;
    let password = password.ok_or(Error::MissingPassword)?;

    let created = signaler
        .persister
        .create_persistent_community(&community, &password)
        .await?;
    Ok(Json(created).into_response())
}

async fn delete(
    signaler: Arc<Signaler>,
    community: Option<String>,
    authorization: Option<String>,
) -> Result<Response> {
    signaler
        .authenticator
        .authenticate(authorization.as_deref())
        .await?;

    let community = community.ok_or(Error::MissingCommunity)?;
    signaler.persister.delete_community(&community).await?;

    // Tear down member connections on every instance of the cluster.
    signaler
        .broker
        .publish_kick(Kick {
            community: community.clone(),
        })
        .await?;

    Ok(StatusCode::OK.into_response())
}
