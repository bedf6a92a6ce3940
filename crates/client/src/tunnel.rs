//! Tunnel connection from the local catalog to the relay server.

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use toolrelay_core::tunnel::{ClientFrame, RequestId, ServerFrame, StreamId, TUNNEL_PROTOCOL_VERSION};
use toolrelay_mcp::McpHandler;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Public endpoint assigned by the relay for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: String,
    pub subdomain: String,
    pub public_url: String,
    /// Presented on reconnect to keep the subdomain.
    pub lease_token: String,
    pub lease_secs: u64,
    pub connected_at: DateTime<Utc>,
}

impl Session {
    /// SSE endpoint agents connect to.
    pub fn sse_endpoint(&self) -> String {
        format!("{}/sse", self.public_url.trim_end_matches('/'))
    }
}

/// A welcomed tunnel that is not serving yet.
pub struct Connection {
    pub session: Session,
    socket: WsStream,
}

enum Disconnect {
    Shutdown,
    Lost(String),
}

/// Keeps one outbound tunnel to the relay and serves MCP traffic over it.
pub struct RelayClient {
    config: Arc<ClientConfig>,
    handler: Arc<McpHandler>,
    session: watch::Sender<Option<Session>>,
}

impl RelayClient {
    pub fn new(config: ClientConfig, handler: Arc<McpHandler>) -> Self {
        let (session, _) = watch::channel(None);
        Self {
            config: Arc::new(config),
            handler,
            session,
        }
    }

    pub fn handler(&self) -> &Arc<McpHandler> {
        &self.handler
    }

    /// Current session; `None` while disconnected.
    pub fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.session.subscribe()
    }

    /// Open the first tunnel, asking for the configured subdomain.
    pub async fn connect(&self) -> ClientResult<Connection> {
        self.open(self.config.subdomain.as_deref(), None).await
    }

    /// Serve until `shutdown` fires, reconnecting after drops.
    ///
    /// Fails with [`ClientError::EndpointChanged`] when a reconnect lands on a
    /// different subdomain, and with the last connect error once retries run out
    /// or the relay refuses outright.
    pub async fn run(&self, connection: Connection, shutdown: CancellationToken) -> ClientResult<()> {
        let mut connection = connection;

        loop {
            let session = connection.session.clone();
            self.session.send_replace(Some(session.clone()));
            let outcome = self.serve(connection.socket, &shutdown).await;
            self.session.send_replace(None);

            let reason = match outcome {
                Disconnect::Shutdown => {
                    info!(subdomain = %session.subdomain, "Relay client shut down");
                    return Ok(());
                }
                Disconnect::Lost(reason) => reason,
            };
            warn!(subdomain = %session.subdomain, reason = %reason, "Lost relay connection, reconnecting");

            connection = match self.reconnect(&session, reason, &shutdown).await? {
                Some(connection) => connection,
                None => return Ok(()),
            };

            if connection.session.subdomain != session.subdomain {
                return Err(ClientError::EndpointChanged {
                    old: session.public_url,
                    new: connection.session.public_url,
                });
            }
            info!(subdomain = %session.subdomain, "Reconnected to relay");
        }
    }

    /// Dial again with backoff, presenting the lease. `None` on shutdown.
    async fn reconnect(
        &self,
        previous: &Session,
        reason: String,
        shutdown: &CancellationToken,
    ) -> ClientResult<Option<Connection>> {
        let retry = &self.config.retry_config;
        let mut last_error = ClientError::WebSocket(reason);
        let mut attempt = 0;

        while retry.allows_attempt(attempt) {
            let backoff = retry.backoff_for_attempt(attempt);
            debug!(attempt, backoff_ms = backoff.as_millis() as u64, "Waiting before reconnect");

            let result = tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                result = async {
                    tokio::time::sleep(backoff).await;
                    self.open(Some(&previous.subdomain), Some(&previous.lease_token)).await
                } => result,
            };

            match result {
                Ok(connection) => return Ok(Some(connection)),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "Reconnect failed");
                    last_error = e;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    async fn open(&self, subdomain: Option<&str>, lease_token: Option<&str>) -> ClientResult<Connection> {
        let url = self.config.tunnel_url()?;
        debug!(url = %url, "Connecting to relay");

        let hello = ClientFrame::Hello {
            version: TUNNEL_PROTOCOL_VERSION,
            subdomain: subdomain.map(String::from),
            lease_token: lease_token.map(String::from),
            access_token: self.config.access_token.clone(),
            registration_secret: self.config.registration_secret.clone(),
        };

        let handshake = async {
            let (mut socket, _) = connect_async(url.as_str()).await?;
            socket.send(Message::Text(serde_json::to_string(&hello)?)).await?;
            let reply = next_frame(&mut socket)
                .await?
                .ok_or_else(|| ClientError::Handshake("relay closed the connection".to_string()))?;
            Ok::<_, ClientError>((socket, reply))
        };

        let (socket, reply) = tokio::time::timeout(self.config.connect_timeout, handshake)
            .await
            .map_err(|_| ClientError::Handshake("timed out waiting for welcome".to_string()))??;

        match reply {
            ServerFrame::Welcome {
                connection_id,
                subdomain,
                public_url,
                lease_token,
                lease_secs,
            } => {
                info!(subdomain = %subdomain, connection_id = %connection_id, "Connected to relay");
                Ok(Connection {
                    session: Session {
                        connection_id,
                        subdomain,
                        public_url,
                        lease_token,
                        lease_secs,
                        connected_at: Utc::now(),
                    },
                    socket,
                })
            }
            ServerFrame::Rejected { reason } => Err(ClientError::Rejected(reason)),
            other => Err(ClientError::Handshake(format!("expected welcome, got {:?}", other))),
        }
    }

    async fn serve(&self, socket: WsStream, shutdown: &CancellationToken) -> Disconnect {
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut replies) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(self.handler.clone(), outbound);
        let idle = self.config.idle_timeout;
        let mut last_heard = Instant::now();

        let lost = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break None,
                _ = tokio::time::sleep_until(last_heard + idle) => {
                    break Some("relay went quiet".to_string());
                }
                Some(frame) = replies.recv() => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize tunnel frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        break Some(e.to_string());
                    }
                }
                next = next_frame(&mut stream) => {
                    last_heard = Instant::now();
                    match next {
                        Ok(Some(frame)) => dispatcher.handle(frame),
                        Ok(None) => break Some("relay closed the tunnel".to_string()),
                        Err(e) => break Some(e.to_string()),
                    }
                }
            }
        };

        drop(dispatcher);
        let _ = sink.close().await;

        match lost {
            None => Disconnect::Shutdown,
            Some(reason) => Disconnect::Lost(reason),
        }
    }
}

/// Next parseable relay frame; `None` once the socket is closed
async fn next_frame<S>(socket: &mut S) -> ClientResult<Option<ServerFrame>>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => match serde_json::from_str::<ServerFrame>(&text) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => warn!(error = %e, "Malformed tunnel frame"),
            },
            Message::Close(_) => return Ok(None),
            _ => {}
        }
    }
    Ok(None)
}

/// Routes relay frames into the MCP handler for one tunnel connection.
///
/// Dropping it aborts every running call and closes every stream it saw.
struct Dispatcher {
    handler: Arc<McpHandler>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    in_flight: Arc<Mutex<HashMap<RequestId, AbortHandle>>>,
    streams: HashSet<StreamId>,
}

impl Dispatcher {
    fn new(handler: Arc<McpHandler>, outbound: mpsc::UnboundedSender<ClientFrame>) -> Self {
        Self {
            handler,
            outbound,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            streams: HashSet::new(),
        }
    }

    fn handle(&mut self, frame: ServerFrame) {
        match frame {
            ServerFrame::Request {
                request_id,
                stream_id,
                message,
            } => self.dispatch(request_id, stream_id, message),
            ServerFrame::Cancel { request_id } => {
                if let Some(task) = self.in_flight.lock().remove(&request_id) {
                    debug!(request_id, "Relay cancelled request");
                    task.abort();
                }
            }
            ServerFrame::StreamOpened { stream_id } => {
                self.handler.open(&stream_id);
                self.streams.insert(stream_id);
            }
            ServerFrame::StreamClosed { stream_id } => {
                if self.streams.remove(&stream_id) {
                    self.handler.close(&stream_id);
                }
            }
            ServerFrame::Ping => {
                let _ = self.outbound.send(ClientFrame::Pong);
            }
            ServerFrame::Welcome { .. } | ServerFrame::Rejected { .. } => {
                warn!("Ignoring handshake frame on an established tunnel");
            }
        }
    }

    fn dispatch(&mut self, request_id: RequestId, stream_id: StreamId, message: Value) {
        self.streams.insert(stream_id.clone());

        let handler = self.handler.clone();
        let outbound = self.outbound.clone();
        let in_flight = self.in_flight.clone();

        // held across spawn so the task cannot deregister before it is registered
        let mut tasks = self.in_flight.lock();
        let task = tokio::spawn(async move {
            let reply = handler.handle_message(&stream_id, message).await;
            in_flight.lock().remove(&request_id);
            let _ = outbound.send(ClientFrame::Response {
                request_id,
                message: reply,
            });
        });
        tasks.insert(request_id, task.abort_handle());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for (_, task) in self.in_flight.lock().drain() {
            task.abort();
        }
        for stream_id in self.streams.drain() {
            self.handler.close(&stream_id);
        }
    }
}
