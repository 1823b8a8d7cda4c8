//! Pending-call table for calls this side originated
//!
//! Each outbound call registers a completion slot keyed by its id. The router
//! fulfils the slot when the matching response arrives; teardown fails every
//! remaining slot with [`BridgeError::ConnectionClosed`].

use crate::error::{BridgeError, Result};
use crate::protocol::{RequestId, RpcError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Outcome delivered to a waiting caller
pub type CallOutcome = Result<Value>;

/// Receiving side of a completion slot
pub type CompletionSlot = oneshot::Receiver<CallOutcome>;

#[derive(Default)]
struct PendingState {
    calls: HashMap<RequestId, oneshot::Sender<CallOutcome>>,
    closed: bool,
}

/// Thread-safe table of in-flight outbound calls
#[derive(Default)]
pub struct PendingCalls {
    state: Mutex<PendingState>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a waiter for `id`
    ///
    /// Fails with `ConnectionClosed` once the table has been drained, and
    /// with `InvalidRequest` if `id` is already in flight.
    pub fn register(&self, id: RequestId) -> Result<CompletionSlot> {
        let mut state = self.lock();
        if state.closed {
            return Err(BridgeError::ConnectionClosed);
        }
        if state.calls.contains_key(&id) {
            return Err(BridgeError::InvalidRequest(format!(
                "call id {} is already in flight",
                id
            )));
        }

        let (tx, rx) = oneshot::channel();
        state.calls.insert(id, tx);
        Ok(rx)
    }

    /// Fulfil the slot for `id` with the peer's answer
    ///
    /// Returns `false` when no call with that id is pending (stale or
    /// duplicate response); the caller logs and drops it.
    pub fn resolve(&self, id: &RequestId, outcome: std::result::Result<Value, RpcError>) -> bool {
        let Some(slot) = self.lock().calls.remove(id) else {
            return false;
        };

        // The waiter may have given up (timeout); that is not an error here.
        if slot.send(outcome.map_err(BridgeError::Remote)).is_err() {
            tracing::debug!("Waiter for call {} went away before its response", id);
        }
        true
    }

    /// Drop the slot for `id` without fulfilling it
    pub fn remove(&self, id: &RequestId) -> bool {
        self.lock().calls.remove(id).is_some()
    }

    /// Resolve every pending call with `ConnectionClosed` and refuse new ones
    ///
    /// Returns the number of calls that were failed.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut state = self.lock();
            state.closed = true;
            state.calls.drain().collect()
        };

        let count = drained.len();
        for (id, slot) in drained {
            tracing::debug!("Failing pending call {} on teardown", id);
            let _ = slot.send(Err(BridgeError::ConnectionClosed));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
