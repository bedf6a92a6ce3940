// Correlation of forwarded requests with the relay client's responses

use crate::error::RelayError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use toolrelay_core::tunnel::RequestId;

/// What a waiting agent request eventually receives
pub type PendingOutcome = Result<Option<Value>, RelayError>;

#[derive(Default)]
struct Entries {
    waiting: HashMap<RequestId, oneshot::Sender<PendingOutcome>>,
    closed: bool,
}

/// In-flight requests of one tenant connection
pub struct PendingTable {
    next_id: AtomicU64,
    max: usize,
    entries: Mutex<Entries>,
}

impl PendingTable {
    pub fn new(max: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            max,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Reserve a fresh request id; the entry lives as long as the returned handle
    pub fn begin(&self) -> Result<PendingRequest<'_>, RelayError> {
        let mut entries = self.entries.lock();
        if entries.closed {
            return Err(RelayError::ConnectionClosed);
        }
        if entries.waiting.len() >= self.max {
            return Err(RelayError::Busy);
        }

        // ids are never reused on a connection
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        entries.waiting.insert(id, tx);

        Ok(PendingRequest {
            id,
            rx: Some(rx),
            table: self,
        })
    }

    /// Deliver a response; `false` if nobody is waiting for it anymore
    pub fn complete(&self, id: RequestId, message: Option<Value>) -> bool {
        let sender = self.entries.lock().waiting.remove(&id);
        match sender {
            Some(tx) => tx.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    /// Fail everything in flight and refuse new entries
    pub fn fail_all(&self, error: RelayError) -> usize {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock();
            entries.closed = true;
            entries.waiting.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max
    }
}

/// A reserved slot in the pending table; dropping it frees the slot
pub struct PendingRequest<'a> {
    pub id: RequestId,
    rx: Option<oneshot::Receiver<PendingOutcome>>,
    table: &'a PendingTable,
}

impl PendingRequest<'_> {
    pub async fn wait(&mut self) -> PendingOutcome {
        match self.rx.take() {
            Some(rx) => rx.await.unwrap_or(Err(RelayError::ConnectionClosed)),
            None => Err(RelayError::ConnectionClosed),
        }
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.table.entries.lock().waiting.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_delivers_to_waiter() {
        let table = PendingTable::new(4);
        let mut request = table.begin().unwrap();
        assert_eq!(table.len(), 1);

        assert!(table.complete(request.id, Some(json!({"ok": true}))));
        assert_eq!(request.wait().await, Ok(Some(json!({"ok": true}))));
        drop(request);
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_are_unique_and_slots_freed_on_drop() {
        let table = PendingTable::new(2);
        let a = table.begin().unwrap();
        let b = table.begin().unwrap();
        assert_ne!(a.id, b.id);
        assert!(table.is_full());
        assert_eq!(table.begin().err(), Some(RelayError::Busy));

        let old = a.id;
        drop(a);
        let c = table.begin().unwrap();
        assert!(c.id > old && c.id > b.id);
        assert!(!table.complete(old, None));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = PendingTable::new(8);
        let mut a = table.begin().unwrap();
        let mut b = table.begin().unwrap();

        assert_eq!(table.fail_all(RelayError::ConnectionClosed), 2);
        assert_eq!(a.wait().await, Err(RelayError::ConnectionClosed));
        assert_eq!(b.wait().await, Err(RelayError::ConnectionClosed));
        assert!(table.is_empty());
        assert_eq!(table.begin().err(), Some(RelayError::ConnectionClosed));
    }
}
