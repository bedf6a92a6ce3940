// One connected relay client and everything routed to it

use crate::error::RelayError;
use crate::middleware::auth::tokens_match;
use crate::pending::PendingTable;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use toolrelay_core::tunnel::{RequestId, ServerFrame, StreamId};
use uuid::Uuid;

/// Sessions without a push channel are dropped after this long unused
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(600);

struct StreamEntry {
    /// `None` for sessions without a push channel (`POST /mcp`)
    push: Option<mpsc::UnboundedSender<Value>>,
    last_used: Instant,
}

pub struct TenantHandle {
    pub connection_id: String,
    pub subdomain: String,
    pub lease_token: String,
    access_token: Option<String>,
    outbound: mpsc::UnboundedSender<ServerFrame>,
    pending: PendingTable,
    streams: DashMap<StreamId, StreamEntry>,
    /// Reserved stream slots; counted separately so the limit holds under concurrent opens
    open_streams: AtomicUsize,
    max_streams: usize,
    session_idle: Duration,
    closed: CancellationToken,
}

impl std::fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantHandle")
            .field("connection_id", &self.connection_id)
            .field("subdomain", &self.subdomain)
            .finish_non_exhaustive()
    }
}

impl TenantHandle {
    pub fn new(
        subdomain: impl Into<String>,
        lease_token: impl Into<String>,
        access_token: Option<String>,
        outbound: mpsc::UnboundedSender<ServerFrame>,
        max_pending: usize,
        max_streams: usize,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            subdomain: subdomain.into(),
            lease_token: lease_token.into(),
            access_token: access_token.filter(|t| !t.is_empty()),
            outbound,
            pending: PendingTable::new(max_pending),
            streams: DashMap::new(),
            open_streams: AtomicUsize::new(0),
            max_streams,
            session_idle: DEFAULT_SESSION_IDLE,
            closed: CancellationToken::new(),
        }
    }

    pub fn with_session_idle(mut self, idle: Duration) -> Self {
        self.session_idle = idle;
        self
    }

    /// Whether `presented` grants access to this tenant's public endpoints
    pub fn authorize(&self, presented: Option<&str>) -> bool {
        match &self.access_token {
            None => true,
            Some(expected) => presented.is_some_and(|p| tokens_match(expected, p)),
        }
    }

    pub fn requires_token(&self) -> bool {
        self.access_token.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the relay client is gone
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_full()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn send(&self, frame: ServerFrame) -> Result<(), RelayError> {
        self.outbound
            .send(frame)
            .map_err(|_| RelayError::ConnectionClosed)
    }

    /// Open an agent stream whose pushed messages arrive on the returned handle
    pub fn open_stream(self: &Arc<Self>) -> Result<AgentStream, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register_stream(Some(tx))?;
        Ok(AgentStream {
            id,
            rx,
            tenant: self.clone(),
        })
    }

    /// Open a stream without a push channel
    ///
    /// The stream closes when the returned guard drops, unless it is kept with
    /// [`SessionGuard::keep`]; kept sessions expire once idle.
    pub fn open_session(self: &Arc<Self>) -> Result<SessionGuard, RelayError> {
        let id = self.register_stream(None)?;
        Ok(SessionGuard {
            id,
            tenant: Some(self.clone()),
        })
    }

    fn reserve_slot(&self) -> bool {
        self.open_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.max_streams).then_some(open + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .open_streams
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| open.checked_sub(1));
    }

    fn register_stream(
        &self,
        push: Option<mpsc::UnboundedSender<Value>>,
    ) -> Result<StreamId, RelayError> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }
        if !self.reserve_slot() && (self.expire_idle_sessions() == 0 || !self.reserve_slot()) {
            return Err(RelayError::Busy);
        }

        let id = Uuid::new_v4().simple().to_string();
        self.streams.insert(
            id.clone(),
            StreamEntry {
                push,
                last_used: Instant::now(),
            },
        );
        self.send(ServerFrame::StreamOpened {
            stream_id: id.clone(),
        })
        .inspect_err(|_| {
            if self.streams.remove(&id).is_some() {
                self.release_slot();
            }
        })?;

        tracing::debug!(subdomain = %self.subdomain, stream_id = %id, "Agent stream opened");
        Ok(id)
    }

    pub fn has_stream(&self, stream_id: &str) -> bool {
        self.streams.contains_key(stream_id)
    }

    /// Mark a stream as used; `false` if it is unknown
    pub fn touch(&self, stream_id: &str) -> bool {
        match self.streams.get_mut(stream_id) {
            Some(mut entry) => {
                entry.last_used = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Close sessions without a push channel that have sat unused too long
    pub fn expire_idle_sessions(&self) -> usize {
        let idle: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|entry| entry.push.is_none() && entry.last_used.elapsed() >= self.session_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let expired = idle.iter().filter(|id| self.close_stream(id)).count();
        if expired > 0 {
            tracing::debug!(subdomain = %self.subdomain, expired, "Idle agent sessions expired");
        }
        expired
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Forget a stream and tell the relay client; `false` if it was unknown
    pub fn close_stream(&self, stream_id: &str) -> bool {
        if self.streams.remove(stream_id).is_none() {
            return false;
        }
        self.release_slot();
        let _ = self.send(ServerFrame::StreamClosed {
            stream_id: stream_id.to_string(),
        });
        tracing::debug!(subdomain = %self.subdomain, stream_id = %stream_id, "Agent stream closed");
        true
    }

    /// Push a message to an agent stream; `false` if the stream has no listener
    pub fn push(&self, stream_id: &str, message: Value) -> bool {
        match self.streams.get(stream_id) {
            Some(entry) => entry.push.as_ref().is_some_and(|tx| tx.send(message).is_ok()),
            None => false,
        }
    }

    /// Forward one agent message and wait for the relay client's answer
    ///
    /// `Ok(None)` means the message needed no response (notifications).
    /// If the caller stops waiting, the relay client is told to cancel.
    pub async fn forward(
        &self,
        stream_id: &str,
        message: Value,
        deadline: Duration,
    ) -> Result<Option<Value>, RelayError> {
        let mut pending = self.pending.begin()?;
        let request_id = pending.id;

        self.send(ServerFrame::Request {
            request_id,
            stream_id: stream_id.to_string(),
            message,
        })?;
        let mut cancel = CancelOnDrop {
            tenant: self,
            request_id,
            answered: false,
        };

        match tokio::time::timeout(deadline, pending.wait()).await {
            Ok(outcome) => {
                cancel.answered = true;
                outcome
            }
            Err(_) => {
                tracing::warn!(
                    subdomain = %self.subdomain,
                    request_id,
                    "Relay client did not answer in time"
                );
                Err(RelayError::Timeout(deadline))
            }
        }
    }

    /// Route a response frame from the relay client
    pub fn complete(&self, request_id: u64, message: Option<Value>) -> bool {
        self.pending.complete(request_id, message)
    }

    /// Fail all pending requests and end every agent stream
    pub fn shutdown(&self) {
        let failed = self.pending.fail_all(RelayError::ConnectionClosed);
        self.streams.clear();
        self.open_streams.store(0, Ordering::Release);
        self.closed.cancel();
        tracing::info!(
            subdomain = %self.subdomain,
            connection_id = %self.connection_id,
            failed,
            "Tenant disconnected"
        );
    }
}

/// Sends `cancel` for a forwarded request nobody waits on anymore
struct CancelOnDrop<'a> {
    tenant: &'a TenantHandle,
    request_id: RequestId,
    answered: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if !self.answered {
            let _ = self.tenant.send(ServerFrame::Cancel {
                request_id: self.request_id,
            });
        }
    }
}

/// A session opened by `POST /mcp`; closed on drop unless kept
pub struct SessionGuard {
    pub id: StreamId,
    tenant: Option<Arc<TenantHandle>>,
}

impl SessionGuard {
    /// Leave the session open for later requests and hand back its id
    pub fn keep(mut self) -> StreamId {
        self.tenant = None;
        std::mem::take(&mut self.id)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(tenant) = self.tenant.take() {
            tenant.close_stream(&self.id);
        }
    }
}

/// An open agent stream; dropping it closes the stream on the relay client
pub struct AgentStream {
    pub id: StreamId,
    rx: mpsc::UnboundedReceiver<Value>,
    tenant: Arc<TenantHandle>,
}

impl AgentStream {
    /// Next message for the agent; `None` once the tenant disconnects
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn tenant(&self) -> &Arc<TenantHandle> {
        &self.tenant
    }
}

impl Drop for AgentStream {
    fn drop(&mut self) {
        self.tenant.close_stream(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tenant(token: Option<&str>) -> (Arc<TenantHandle>, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tenant = TenantHandle::new("abc", "lease", token.map(String::from), tx, 2, 4);
        (Arc::new(tenant), rx)
    }

    #[test]
    fn test_authorize() {
        let (open, _rx) = tenant(None);
        assert!(open.authorize(None));

        let (locked, _rx) = tenant(Some("t0ken"));
        assert!(locked.authorize(Some("t0ken")));
        assert!(!locked.authorize(Some("wrong")));
        assert!(!locked.authorize(None));
    }

    #[tokio::test]
    async fn test_forward_round_trip() {
        let (tenant, mut rx) = tenant(None);

        let forwarding = tokio::spawn({
            let tenant = tenant.clone();
            async move {
                tenant
                    .forward("s1", json!({"id": 1}), Duration::from_secs(5))
                    .await
            }
        });

        let Some(ServerFrame::Request { request_id, stream_id, message }) = rx.recv().await else {
            panic!("expected a request frame");
        };
        assert_eq!(stream_id, "s1");
        assert_eq!(message, json!({"id": 1}));
        assert!(tenant.complete(request_id, Some(json!({"id": 1, "result": {}}))));

        let result = forwarding.await.unwrap();
        assert_eq!(result, Ok(Some(json!({"id": 1, "result": {}}))));
        assert_eq!(tenant.pending(), 0);
    }

    #[tokio::test]
    async fn test_forward_timeout_sends_cancel() {
        let (tenant, mut rx) = tenant(None);
        let result = tenant
            .forward("s1", json!({"id": 1}), Duration::from_millis(50))
            .await;
        assert_eq!(result, Err(RelayError::Timeout(Duration::from_millis(50))));
        assert_eq!(tenant.pending(), 0);

        let Some(ServerFrame::Request { request_id, .. }) = rx.recv().await else {
            panic!("expected a request frame");
        };
        assert_eq!(rx.recv().await, Some(ServerFrame::Cancel { request_id }));
        // a late answer goes nowhere
        assert!(!tenant.complete(request_id, None));
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_and_ends_streams() {
        let (tenant, _rx) = tenant(None);
        let mut stream = tenant.open_stream().unwrap();

        let forwarding = tokio::spawn({
            let tenant = tenant.clone();
            async move { tenant.forward("s1", json!({"id": 1}), Duration::from_secs(5)).await }
        });
        while tenant.pending() == 0 {
            tokio::task::yield_now().await;
        }

        tenant.shutdown();
        assert_eq!(forwarding.await.unwrap(), Err(RelayError::ConnectionClosed));
        assert_eq!(stream.recv().await, None);
        assert!(tenant.is_closed());
        assert_eq!(tenant.open_session().err(), Some(RelayError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_streams_announce_open_and_close() {
        let (tenant, mut rx) = tenant(None);
        let stream = tenant.open_stream().unwrap();
        let id = stream.id.clone();
        assert_eq!(rx.recv().await, Some(ServerFrame::StreamOpened { stream_id: id.clone() }));

        assert!(tenant.push(&id, json!({"hello": 1})));
        drop(stream);
        assert_eq!(rx.recv().await, Some(ServerFrame::StreamClosed { stream_id: id.clone() }));
        assert!(!tenant.has_stream(&id));
        assert!(!tenant.push(&id, json!({})));

        let session = tenant.open_session().unwrap().keep();
        assert!(!tenant.push(&session, json!({})));
        assert!(tenant.close_stream(&session));
        assert!(!tenant.close_stream(&session));
    }

    #[test]
    fn test_stream_limit() {
        let (tenant, _rx) = tenant(None);
        let sessions: Vec<_> = (0..4).map(|_| tenant.open_session().unwrap()).collect();
        assert_eq!(tenant.open_session().err(), Some(RelayError::Busy));

        drop(sessions);
        assert_eq!(tenant.stream_count(), 0);
        assert!(tenant.open_session().is_ok());
    }

    #[test]
    fn test_stream_limit_holds_under_concurrent_opens() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tenant = Arc::new(TenantHandle::new("abc", "lease", None, tx, 2, 8));

        let opened: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..32)
                .map(|_| {
                    let tenant = tenant.clone();
                    scope.spawn(move || tenant.open_session().ok().map(SessionGuard::keep))
                })
                .collect();
            workers.into_iter().filter_map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(opened.len(), 8);
        assert_eq!(tenant.stream_count(), 8);
    }

    #[tokio::test]
    async fn test_session_guard_closes_unless_kept() {
        let (tenant, mut rx) = tenant(None);

        let session = tenant.open_session().unwrap();
        let id = session.id.clone();
        assert_eq!(rx.recv().await, Some(ServerFrame::StreamOpened { stream_id: id.clone() }));
        drop(session);
        assert_eq!(rx.recv().await, Some(ServerFrame::StreamClosed { stream_id: id.clone() }));
        assert!(!tenant.has_stream(&id));

        let kept = tenant.open_session().unwrap().keep();
        assert!(tenant.has_stream(&kept));
        assert!(tenant.touch(&kept));
        assert!(!tenant.touch("nope"));
    }

    #[test]
    fn test_idle_sessions_expire_to_make_room() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tenant = Arc::new(
            TenantHandle::new("abc", "lease", None, tx, 2, 2).with_session_idle(Duration::ZERO),
        );

        let first = tenant.open_session().unwrap().keep();
        let _second = tenant.open_session().unwrap().keep();
        let third = tenant.open_session().unwrap().keep();

        assert!(!tenant.has_stream(&first));
        assert!(tenant.has_stream(&third));
        assert_eq!(tenant.stream_count(), 1);
    }

    #[test]
    fn test_push_streams_never_expire() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let tenant = Arc::new(
            TenantHandle::new("abc", "lease", None, tx, 2, 2).with_session_idle(Duration::ZERO),
        );

        let _a = tenant.open_stream().unwrap();
        let _b = tenant.open_stream().unwrap();
        assert_eq!(tenant.expire_idle_sessions(), 0);
        assert_eq!(tenant.open_session().err(), Some(RelayError::Busy));
    }

    #[tokio::test]
    async fn test_abandoned_forward_cancels_and_frees_its_slot() {
        let (tenant, mut rx) = tenant(None);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            tenant.forward("s1", json!({"id": 1}), Duration::from_secs(30)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(tenant.pending(), 0);

        let Some(ServerFrame::Request { request_id, .. }) = rx.recv().await else {
            panic!("expected a request frame");
        };
        assert_eq!(rx.recv().await, Some(ServerFrame::Cancel { request_id }));
    }
}
