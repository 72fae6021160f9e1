//! Outstanding call table
//!
//! Each call that expects a reply owns one entry keyed by its correlation id.
//! Whoever removes the entry first (reply or timeout) resolves the call, so a
//! call never completes twice.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::message::RpcBackPayload;

#[derive(Debug)]
struct PendingCall {
    tx: oneshot::Sender<RpcBackPayload>,
    issued: Instant,
}

/// Correlation id → waiting caller
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<String, PendingCall>,
}

impl PendingCalls {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call, returning (correlation id, receiver)
    ///
    /// The caller should send the request and await the receiver.
    pub fn prepare(&mut self) -> (String, oneshot::Receiver<RpcBackPayload>) {
        let callback_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.calls.insert(
            callback_id.clone(),
            PendingCall {
                tx,
                issued: Instant::now(),
            },
        );
        (callback_id, rx)
    }

    /// Hand a reply to the waiting caller
    ///
    /// Returns the round-trip latency, or `None` if no call with this id is
    /// outstanding (unknown id, or it already timed out).
    pub fn resolve(&mut self, callback_id: &str, reply: RpcBackPayload) -> Option<Duration> {
        let call = self.calls.remove(callback_id)?;
        let latency = call.issued.elapsed();
        call.tx.send(reply).ok().map(|()| latency)
    }

    /// Drop an outstanding call; returns `false` if it was already resolved
    pub fn cancel(&mut self, callback_id: &str) -> bool {
        self.calls.remove(callback_id).is_some()
    }

    /// Number of outstanding calls
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no calls are outstanding
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
