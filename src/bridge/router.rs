//! Request/reply correlation.
//!
//! The pending map is the only shared mutable state between callers and the
//! decode loop. Each entry holds a single-fulfillment slot; entries are
//! removed the moment they resolve, whether by reply, timeout, or worker
//! failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::bridge::codec::Reply;
use crate::errors::BridgeError;

pub type ReplyOutcome = Result<Value, BridgeError>;

pub struct CorrelationRouter {
    next_id: AtomicU64,
    max_in_flight: usize,
    pending: Mutex<HashMap<u64, oneshot::Sender<ReplyOutcome>>>,
}

impl CorrelationRouter {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            max_in_flight,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate a fresh correlation id and register its pending request.
    ///
    /// Ids are taken from a process-lifetime counter and never reused.
    /// Fails with `Overloaded` when the in-flight bound is reached; the
    /// check and the insert happen under one lock so concurrent callers
    /// cannot overshoot the bound.
    pub async fn register(&self) -> Result<(u64, oneshot::Receiver<ReplyOutcome>), BridgeError> {
        let mut pending = self.pending.lock().await;
        if pending.len() >= self.max_in_flight {
            return Err(BridgeError::Overloaded);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.insert(id, tx);
        Ok((id, rx))
    }

    /// Resolve the pending request matching a decoded reply.
    ///
    /// Unmatched ids (duplicates, replies for timed-out requests) are logged
    /// and discarded; this never propagates an error into the decode loop.
    pub async fn resolve(&self, reply: Reply) {
        let id = reply.id();
        let outcome = match reply {
            Reply::Result { payload, .. } => Ok(payload),
            Reply::Error {
                code,
                message,
                data,
                ..
            } => Err(BridgeError::Worker {
                code,
                message,
                data,
            }),
        };

        let slot = self.pending.lock().await.remove(&id);
        match slot {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(correlation_id = id, "caller gone before reply arrived");
                }
            }
            None => {
                tracing::warn!(correlation_id = id, "unmatched reply discarded");
            }
        }
    }

    /// Drop a pending request without fulfilling it (caller-side timeout).
    pub async fn discard(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Fail every pending request with `WorkerUnavailable`. Invoked when the
    /// worker exits or the bridge stops, so callers resolve immediately
    /// instead of waiting out their timeouts.
    pub async fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().await;
            pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::warn!(count = drained.len(), "failing in-flight requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(BridgeError::WorkerUnavailable));
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }
}
