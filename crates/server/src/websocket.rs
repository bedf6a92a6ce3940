// Tunnel endpoint for relay clients (`GET /connect`)

use crate::config::{is_valid_label, AppState};
use crate::middleware::auth::tokens_match;
use crate::tenant::TenantHandle;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use toolrelay_core::tunnel::{ClientFrame, ServerFrame, TUNNEL_PROTOCOL_VERSION};
use uuid::Uuid;

const RANDOM_LABEL_LEN: usize = 10;
const ASSIGN_ATTEMPTS: usize = 16;

/// WebSocket handler for relay client tunnels
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle one relay client connection from handshake to teardown
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();

    let hello = match tokio::time::timeout(state.config.handshake_timeout(), next_frame(&mut stream)).await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            tracing::debug!("Relay client left before saying hello");
            return;
        }
        Err(_) => {
            reject(&mut sink, "handshake timed out").await;
            return;
        }
    };

    let (tenant, outbound) = match admit(&state, hello) {
        Ok(admitted) => admitted,
        Err(reason) => {
            tracing::warn!(reason = %reason, "Rejected relay client");
            reject(&mut sink, &reason).await;
            return;
        }
    };

    let welcome = ServerFrame::Welcome {
        connection_id: tenant.connection_id.clone(),
        subdomain: tenant.subdomain.clone(),
        public_url: state.config.public_url(&tenant.subdomain),
        lease_token: tenant.lease_token.clone(),
        lease_secs: state.config.lease_secs,
    };

    if send_frame(&mut sink, &welcome).await.is_ok() {
        tracing::info!(
            subdomain = %tenant.subdomain,
            connection_id = %tenant.connection_id,
            "Relay client connected"
        );

        let keepalive = state.config.keepalive_interval();
        let writer = tokio::spawn(write_loop(sink, outbound, tenant.clone(), keepalive));
        read_loop(&mut stream, &tenant, keepalive * 3).await;

        state
            .routes
            .unregister(&tenant.subdomain, &tenant.connection_id, state.config.lease_duration());
        tenant.shutdown();
        let _ = writer.await;
    } else {
        state
            .routes
            .unregister(&tenant.subdomain, &tenant.connection_id, state.config.lease_duration());
        tenant.shutdown();
    }
}

/// Next parseable client frame; `None` once the socket is gone
async fn next_frame(stream: &mut SplitStream<WebSocket>) -> Option<ClientFrame> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(frame) => return Some(frame),
                Err(e) => tracing::warn!(error = %e, "Malformed tunnel frame"),
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Validate a hello and register the tenant under its subdomain
fn admit(
    state: &AppState,
    hello: ClientFrame,
) -> Result<(Arc<TenantHandle>, mpsc::UnboundedReceiver<ServerFrame>), String> {
    let ClientFrame::Hello {
        version,
        subdomain,
        lease_token,
        access_token,
        registration_secret,
    } = hello
    else {
        return Err("expected hello".to_string());
    };

    if version != TUNNEL_PROTOCOL_VERSION {
        return Err(format!(
            "unsupported tunnel protocol version {} (relay speaks {})",
            version, TUNNEL_PROTOCOL_VERSION
        ));
    }

    if let Some(expected) = &state.config.registration_secret {
        let presented = registration_secret.as_deref().unwrap_or_default();
        if !tokens_match(expected, presented) {
            return Err("invalid registration secret".to_string());
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let config = &state.config;
    let new_tenant = |subdomain: String, lease_token: String| {
        Arc::new(TenantHandle::new(
            subdomain,
            lease_token,
            access_token.clone(),
            tx.clone(),
            config.max_pending_per_tenant,
            config.max_streams_per_tenant,
        )
        .with_session_idle(config.session_idle()))
    };

    let requested = subdomain
        .map(|s| s.to_ascii_lowercase())
        .filter(|s| is_valid_label(s));
    if let Some(requested) = requested {
        let lease = lease_token.unwrap_or_else(random_token);
        let tenant = new_tenant(requested, lease);
        match state.routes.register(tenant.clone()) {
            Ok(()) => return Ok((tenant, rx)),
            Err(e) => tracing::info!(error = %e, "Requested subdomain unavailable, assigning another"),
        }
    }

    for _ in 0..ASSIGN_ATTEMPTS {
        let tenant = new_tenant(random_label(), random_token());
        if state.routes.register(tenant.clone()).is_ok() {
            return Ok((tenant, rx));
        }
    }
    Err("could not assign a subdomain".to_string())
}

fn random_label() -> String {
    let mut label = Uuid::new_v4().simple().to_string();
    label.truncate(RANDOM_LABEL_LEN);
    label
}

fn random_token() -> String {
    Uuid::new_v4().simple().to_string()
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sink.send(Message::Text(text.into())).await
}

async fn reject(sink: &mut SplitSink<WebSocket, Message>, reason: &str) {
    let frame = ServerFrame::Rejected {
        reason: reason.to_string(),
    };
    let _ = send_frame(sink, &frame).await;
    let _ = sink.close().await;
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<ServerFrame>,
    tenant: Arc<TenantHandle>,
    keepalive: Duration,
) {
    let mut ping = tokio::time::interval(keepalive);
    ping.tick().await;

    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = ping.tick() => ServerFrame::Ping,
            _ = tenant.closed() => break,
        };

        if let Err(e) = send_frame(&mut sink, &frame).await {
            tracing::debug!(subdomain = %tenant.subdomain, error = %e, "Tunnel write failed");
            break;
        }
    }

    let _ = sink.close().await;
}

async fn read_loop(stream: &mut SplitStream<WebSocket>, tenant: &TenantHandle, idle: Duration) {
    loop {
        let next = match tokio::time::timeout(idle, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                tracing::warn!(subdomain = %tenant.subdomain, "Relay client went quiet, dropping tunnel");
                break;
            }
        };

        match next {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(ClientFrame::Response {
                    request_id,
                    message,
                }) => {
                    if !tenant.complete(request_id, message) {
                        tracing::debug!(
                            subdomain = %tenant.subdomain,
                            request_id,
                            "Dropping response nobody waits for"
                        );
                    }
                }
                Ok(ClientFrame::Pong) => {}
                Ok(ClientFrame::Hello { .. }) => {
                    tracing::warn!(subdomain = %tenant.subdomain, "Ignoring repeated hello");
                }
                Err(e) => {
                    tracing::warn!(subdomain = %tenant.subdomain, error = %e, "Malformed tunnel frame");
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                tracing::debug!(subdomain = %tenant.subdomain, error = %e, "Tunnel read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn hello(subdomain: Option<&str>, lease: Option<&str>) -> ClientFrame {
        ClientFrame::Hello {
            version: TUNNEL_PROTOCOL_VERSION,
            subdomain: subdomain.map(String::from),
            lease_token: lease.map(String::from),
            access_token: None,
            registration_secret: None,
        }
    }

    #[test]
    fn test_random_label() {
        let label = random_label();
        assert_eq!(label.len(), RANDOM_LABEL_LEN);
        assert!(is_valid_label(&label));
        assert_ne!(label, random_label());
    }

    #[tokio::test]
    async fn test_admit_honours_requested_subdomain() {
        let state = AppState::new(RelayConfig::default());
        let (tenant, _rx) = admit(&state, hello(Some("MyTools"), None)).unwrap();
        assert_eq!(tenant.subdomain, "mytools");
        assert!(state.routes.resolve("mytools").is_some());

        // taken: a second client gets a random label
        let (other, _rx) = admit(&state, hello(Some("mytools"), None)).unwrap();
        assert_ne!(other.subdomain, "mytools");
        assert_eq!(other.subdomain.len(), RANDOM_LABEL_LEN);
    }

    #[tokio::test]
    async fn test_admit_reclaims_lease() {
        let state = AppState::new(RelayConfig::default());
        let (tenant, _rx) = admit(&state, hello(Some("keep"), None)).unwrap();
        let lease = tenant.lease_token.clone();
        state
            .routes
            .unregister("keep", &tenant.connection_id, Duration::from_secs(60));

        let (stranger, _rx) = admit(&state, hello(Some("keep"), None)).unwrap();
        assert_ne!(stranger.subdomain, "keep");

        let (again, _rx) = admit(&state, hello(Some("keep"), Some(&lease))).unwrap();
        assert_eq!(again.subdomain, "keep");
        assert_eq!(again.lease_token, lease);
    }

    #[tokio::test]
    async fn test_admit_checks_version_and_secret() {
        let state = AppState::new(RelayConfig {
            registration_secret: Some("letmein".to_string()),
            ..Default::default()
        });

        assert!(admit(&state, hello(None, None)).is_err());
        assert!(admit(&state, ClientFrame::Pong).is_err());

        let bad_version = ClientFrame::Hello {
            version: 99,
            subdomain: None,
            lease_token: None,
            access_token: None,
            registration_secret: Some("letmein".to_string()),
        };
        assert!(admit(&state, bad_version).unwrap_err().contains("version"));

        let good = ClientFrame::Hello {
            version: TUNNEL_PROTOCOL_VERSION,
            subdomain: None,
            lease_token: None,
            access_token: Some("agent-token".to_string()),
            registration_secret: Some("letmein".to_string()),
        };
        let (tenant, _rx) = admit(&state, good).unwrap();
        assert!(tenant.requires_token());
    }
}
