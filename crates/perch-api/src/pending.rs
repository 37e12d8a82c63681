// ── Request/response correlation ──
//
// Tracks outstanding command ids and hands each caller a oneshot slot
// that is fulfilled exactly once: by the matching response, by the
// caller's own timeout cleanup, or by a bulk cancel on disconnect.
// First writer wins; the loser is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::error::{CancelReason, Error};
use crate::wire::Response;

type Slot = oneshot::Sender<Result<Response, Error>>;

/// Correlation table for in-flight requests over one session.
///
/// Ids are strictly increasing and never reused within a session
/// lifetime, so a late response for a timed-out id can never be
/// misapplied to a newer request.
#[derive(Default)]
pub struct PendingRequests {
    next_id: AtomicU64,
    slots: Mutex<HashMap<u64, Slot>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next request id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register a slot for `id` and return the receiver to await.
    ///
    /// Must be called before the request bytes are written, otherwise a
    /// fast response could arrive with nothing registered to resolve.
    pub fn track(&self, id: u64) -> oneshot::Receiver<Result<Response, Error>> {
        let (tx, rx) = oneshot::channel();
        let previous = self.lock().insert(id, tx);
        debug_assert!(previous.is_none(), "request id {id} tracked twice");
        rx
    }

    /// Fulfill the slot for `id` with a response.
    ///
    /// Returns whether a matching slot existed. A response for an
    /// unknown or expired id is the caller's to log -- it is not an
    /// error here.
    pub fn resolve(&self, id: u64, response: Response) -> bool {
        match self.lock().remove(&id) {
            Some(slot) => {
                // The receiver may already be gone (caller raced us and
                // gave up); either way the slot is consumed.
                let _ = slot.send(Ok(response));
                true
            }
            None => false,
        }
    }

    /// Remove the slot for `id` without fulfilling it.
    ///
    /// Called by a caller whose await timed out, so the table never
    /// leaks entries past their deadline. Returns whether the slot was
    /// still present.
    pub fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Fail every outstanding slot immediately.
    ///
    /// Called once per disconnect, before any reconnect attempt begins,
    /// so stale requests never resolve against a later connection.
    pub fn cancel_all(&self, reason: CancelReason) {
        let drained: Vec<Slot> = {
            let mut slots = self.lock();
            slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in drained {
            let _ = slot.send(Err(Error::Cancelled(reason)));
        }
    }

    /// Number of in-flight requests.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let pending = PendingRequests::new();
        let a = pending.next_id();
        let b = pending.next_id();
        let c = pending.next_id();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn resolve_fulfills_exactly_once() {
        let pending = PendingRequests::new();
        let id = pending.next_id();
        let rx = pending.track(id);

        assert!(pending.resolve(id, Response { id, ..Response::default() }));
        // Second attempt finds nothing.
        assert!(!pending.resolve(id, Response::default()));

        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.id, id);
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn timeout_cleanup_beats_late_resolve() {
        let pending = PendingRequests::new();
        let id = pending.next_id();
        let rx = pending.track(id);

        // Caller times out and removes its own entry...
        assert!(pending.remove(id));
        drop(rx);

        // ...so the late response is a no-match.
        assert!(!pending.resolve(id, Response::default()));
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancel_all_fails_every_slot() {
        let pending = PendingRequests::new();
        let receivers: Vec<_> = (0..4)
            .map(|_| {
                let id = pending.next_id();
                pending.track(id)
            })
            .collect();
        assert_eq!(pending.pending_count(), 4);

        pending.cancel_all(CancelReason::ConnectionLost);
        assert_eq!(pending.pending_count(), 0);

        for rx in receivers {
            let outcome = rx.await.unwrap();
            assert!(matches!(
                outcome,
                Err(Error::Cancelled(CancelReason::ConnectionLost))
            ));
        }

        // A second cancel on the empty table is a no-op.
        pending.cancel_all(CancelReason::SessionStopped);
        assert_eq!(pending.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_id_is_not_an_error() {
        let pending = PendingRequests::new();
        assert!(!pending.resolve(999, Response::default()));
        assert!(!pending.remove(999));
    }
}
