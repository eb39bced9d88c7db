//! Request dispatcher — pairs requests with responses across
//! arbitrary interleaving.
//!
//! Requests issued locally sit in `pending` until the matching
//! `Response` arrives; requests received from the peer sit in
//! `executing` with a cancellation token while their task runs.
//! Channel termination drains both: every pending call fails with the
//! termination cause, every executing task is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::channel::Channel;
use crate::error::TetherError;

/// How a locally issued request ended.
#[derive(Debug)]
pub(crate) enum CallOutcome {
    /// The peer answered with a value.
    Success(Bytes),
    /// The peer answered with a failure rendering.
    RemoteError(String),
    /// The channel terminated before an answer arrived.
    Aborted(Arc<TetherError>),
}

pub(crate) struct Dispatcher {
    next_request_id: AtomicU64,
    next_io_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<CallOutcome>>>,
    executing: Mutex<HashMap<u64, CancellationToken>>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            next_request_id: AtomicU64::new(1),
            next_io_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            executing: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next outbound request id. Monotone, never reused.
    pub(crate) fn allocate_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Allocate the next io-id for outbound pipe commands.
    pub(crate) fn next_io_id(&self) -> u64 {
        self.next_io_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Park a locally issued request until its response arrives.
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        rx
    }

    /// Forget a pending request (caller gave up before the response).
    pub(crate) fn unregister(&self, id: u64) {
        self.pending.lock().unwrap().remove(&id);
    }

    /// Deliver an outcome to the pending request `id`.
    ///
    /// Returns `false` when no such request is pending — a duplicate
    /// or stale response, which the caller logs and drops.
    pub(crate) fn complete(&self, id: u64, outcome: CallOutcome) -> bool {
        match self.pending.lock().unwrap().remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Track an incoming request while its task executes.
    pub(crate) fn begin_execute(&self, id: u64) -> CancellationToken {
        let token = CancellationToken::new();
        self.executing.lock().unwrap().insert(id, token.clone());
        token
    }

    /// The incoming request `id` finished (or was cancelled).
    pub(crate) fn finish_execute(&self, id: u64) {
        self.executing.lock().unwrap().remove(&id);
    }

    /// Fail every pending call with `cause` and cancel every executing
    /// task. Called exactly once, during channel termination.
    pub(crate) fn abort_all(&self, cause: Arc<TetherError>) {
        let pending: Vec<_> = {
            let mut map = self.pending.lock().unwrap();
            map.drain().collect()
        };
        for (_, tx) in pending {
            let _ = tx.send(CallOutcome::Aborted(cause.clone()));
        }

        let executing: Vec<_> = {
            let mut map = self.executing.lock().unwrap();
            map.drain().collect()
        };
        for (_, token) in executing {
            token.cancel();
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub(crate) fn executing_count(&self) -> usize {
        self.executing.lock().unwrap().len()
    }
}

// ── PendingCall ──────────────────────────────────────────────────

/// A locally issued request awaiting its response.
///
/// Dropping the handle abandons the call locally: the pending entry is
/// released and a late response is dropped. Nothing is sent to the
/// peer; wire-level cancellation is a concern for layers above.
pub struct PendingCall {
    channel: Channel,
    id: u64,
    selector: String,
    rx: oneshot::Receiver<CallOutcome>,
    finished: bool,
}

impl PendingCall {
    pub(crate) fn new(
        channel: Channel,
        id: u64,
        selector: String,
        rx: oneshot::Receiver<CallOutcome>,
    ) -> Self {
        Self {
            channel,
            id,
            selector,
            rx,
            finished: false,
        }
    }

    /// The request id this call went out under.
    pub fn request_id(&self) -> u64 {
        self.id
    }

    /// Wait for the response (or channel termination).
    pub async fn response(mut self) -> Result<Bytes, TetherError> {
        let outcome = (&mut self.rx).await;
        self.finished = true;
        match outcome {
            Ok(CallOutcome::Success(body)) => Ok(body),
            Ok(CallOutcome::RemoteError(remote)) => Err(TetherError::RemoteCallFailed {
                selector: self.selector.clone(),
                remote,
            }),
            Ok(CallOutcome::Aborted(cause)) => Err(TetherError::closed(Some(cause))),
            Err(_) => Err(TetherError::closed(self.channel.close_cause())),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.finished {
            self.channel.dispatcher().unregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_monotone() {
        let d = Dispatcher::new();
        let a = d.allocate_request_id();
        let b = d.allocate_request_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn complete_delivers_once() {
        let d = Dispatcher::new();
        let id = d.allocate_request_id();
        let rx = d.register(id);
        assert_eq!(d.pending_count(), 1);

        assert!(d.complete(id, CallOutcome::Success(Bytes::from_static(b"ok"))));
        assert_eq!(d.pending_count(), 0);
        // A duplicate response finds nothing.
        assert!(!d.complete(id, CallOutcome::Success(Bytes::new())));

        match rx.await.unwrap() {
            CallOutcome::Success(b) => assert_eq!(&b[..], b"ok"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_fails_pending_and_cancels_executing() {
        let d = Dispatcher::new();
        let rx = d.register(d.allocate_request_id());
        let token = d.begin_execute(77);
        assert_eq!(d.executing_count(), 1);

        d.abort_all(Arc::new(TetherError::OrderlyShutdown));
        assert_eq!(d.pending_count(), 0);
        assert_eq!(d.executing_count(), 0);
        assert!(token.is_cancelled());
        assert!(matches!(rx.await.unwrap(), CallOutcome::Aborted(_)));
    }

    #[test]
    fn finish_execute_removes_entry() {
        let d = Dispatcher::new();
        let _ = d.begin_execute(5);
        d.finish_execute(5);
        assert_eq!(d.executing_count(), 0);
    }
}
