//! Outstanding outbound requests, keyed by request id.
//!
//! Every operation is a single critical section on one mutex. Waiters are
//! woken through oneshot channels after the entry has been removed, so a
//! response can be delivered to at most one caller. A handle dropped before
//! its outcome arrived takes its entry with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tracing::debug;
use turul_mcp_json_rpc::{JsonRpcErrorObject, Params, RequestId};

use crate::error::{EngineError, EngineResult};
use crate::transport::TransportMetadata;

/// A successful result plus the transport metadata of the frame carrying it
pub type ResultWithMetadata = (Params, Option<TransportMetadata>);

type Outcome = EngineResult<ResultWithMetadata>;

/// Bookkeeping for one outstanding request
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: RequestId,
    pub method: String,
    pub issued_at: Instant,
}

/// The awaiting caller's half of a pending request.
///
/// Dropping it unresolved (for instance when a `tokio::time::timeout` around
/// the request expires) removes the entry, so a late response is reported
/// as an orphan and shutdown does not wait for it.
#[derive(Debug)]
pub struct PendingHandle {
    id: RequestId,
    method: String,
    token: u64,
    receiver: oneshot::Receiver<Outcome>,
    table: Weak<Slots>,
    settled: bool,
}

impl PendingHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Wait for the response, cancellation or teardown
    pub async fn wait(self) -> EngineResult<Params> {
        self.wait_with_metadata().await.map(|(result, _)| result)
    }

    /// Like [`PendingHandle::wait`], keeping the response's transport metadata
    pub async fn wait_with_metadata(mut self) -> Outcome {
        self.recv().await
    }

    /// Await the outcome without giving up the handle. Must not be called
    /// again once it has returned.
    pub(crate) async fn recv(&mut self) -> Outcome {
        let outcome = (&mut self.receiver)
            .await
            .unwrap_or(Err(EngineError::ConnectionClosed));
        self.settled = true;
        outcome
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let Some(slots) = self.table.upgrade() else {
            return;
        };
        if slots.remove_if(&self.id, |slot| slot.token == self.token).is_some() {
            debug!(request_id = %self.id, method = %self.method, "Abandoned pending request");
        }
    }
}

struct Slot {
    entry: PendingEntry,
    token: u64,
    sender: oneshot::Sender<Outcome>,
}

/// The map itself, shared with the handles so they can remove themselves
#[derive(Default)]
struct Slots {
    map: Mutex<HashMap<RequestId, Slot>>,
    idle: Notify,
}

impl Slots {
    fn remove_if(&self, id: &RequestId, should_remove: impl FnOnce(&Slot) -> bool) -> Option<Slot> {
        let (slot, now_empty) = {
            let mut map = self.map.lock();
            let slot = match map.get(id) {
                Some(slot) if should_remove(slot) => map.remove(id),
                _ => None,
            };
            (slot, map.is_empty())
        };
        if now_empty {
            self.idle.notify_waiters();
        }
        slot
    }
}

/// Maps request ids to the callers waiting on them
pub struct CorrelationTable {
    slots: Arc<Slots>,
    next_id: AtomicI64,
    next_token: AtomicU64,
}

impl Default for CorrelationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Slots::default()),
            next_id: AtomicI64::new(0),
            next_token: AtomicU64::new(0),
        }
    }

    /// Allocate the next request id. Ids start at 0.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn register(&self, id: RequestId, method: impl Into<String>) -> EngineResult<PendingHandle> {
        let method = method.into();
        let (sender, receiver) = oneshot::channel();
        // Tells this registration apart from a later one reusing the id
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let mut map = self.slots.map.lock();
        if map.contains_key(&id) {
            return Err(EngineError::DuplicateId(id));
        }
        let entry = PendingEntry {
            id: id.clone(),
            method: method.clone(),
            issued_at: Instant::now(),
        };
        map.insert(
            id.clone(),
            Slot {
                entry,
                token,
                sender,
            },
        );
        drop(map);

        debug!(request_id = %id, method = %method, "Registered pending request");
        Ok(PendingHandle {
            id,
            method,
            token,
            receiver,
            table: Arc::downgrade(&self.slots),
            settled: false,
        })
    }

    /// Deliver a response outcome and return the entry it matched
    pub fn resolve(
        &self,
        id: &RequestId,
        outcome: Result<Params, JsonRpcErrorObject>,
        metadata: Option<TransportMetadata>,
    ) -> EngineResult<PendingEntry> {
        let slot = self.take(id).ok_or_else(|| EngineError::OrphanResponse(id.clone()))?;
        debug!(
            request_id = %id,
            method = %slot.entry.method,
            elapsed_ms = slot.entry.issued_at.elapsed().as_millis() as u64,
            "Resolved pending request"
        );
        let outcome = match outcome {
            Ok(result) => Ok((result, metadata)),
            Err(error) => Err(EngineError::Remote { error, metadata }),
        };
        // Receiver gone means the caller stopped waiting
        let _ = slot.sender.send(outcome);
        Ok(slot.entry)
    }

    /// Remove an entry without a response. The waiter observes `Cancelled`
    /// and a later response for the id is an orphan.
    pub fn cancel(&self, id: &RequestId) -> Option<PendingEntry> {
        let slot = self.take(id)?;
        let _ = slot.sender.send(Err(EngineError::Cancelled));
        Some(slot.entry)
    }

    /// Remove every entry, failing each waiter with `ConnectionClosed`
    pub fn drain_on_shutdown(&self) -> Vec<PendingEntry> {
        let drained: Vec<Slot> = {
            let mut map = self.slots.map.lock();
            map.drain().map(|(_, slot)| slot).collect()
        };
        self.slots.idle.notify_waiters();

        drained
            .into_iter()
            .map(|slot| {
                let _ = slot.sender.send(Err(EngineError::ConnectionClosed));
                slot.entry
            })
            .collect()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.slots.map.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.map.lock().is_empty()
    }

    /// Resolves once no request is outstanding
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.slots.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    fn take(&self, id: &RequestId) -> Option<Slot> {
        self.slots.remove_if(id, |_| true)
    }
}
