//! Correlation of in-flight calls with their responses.
//!
//! Each call registers a one-shot channel under a fresh message id. The
//! dispatcher removes the entry and delivers exactly one outcome when the
//! matching response arrives; the caller removes it itself if it gives up
//! first (cancellation or timeout).
//!
//! The lock is never held across an await point, so the table is safe to
//! share between the dispatcher task and callers on any runtime flavor.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::rpc::RpcError;
use crate::value::Value;

/// What a pending call eventually receives.
pub type CallOutcome = Result<Value, RpcError>;

#[derive(Debug, Default)]
pub struct CorrelationTable {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u32,
    calls: HashMap<u32, oneshot::Sender<CallOutcome>>,
    closed: bool,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_next_id(next_id: u32) -> Self {
        let table = Self::default();
        table.lock().next_id = next_id;
        table
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate the next message id and register a pending call for it.
    ///
    /// Ids increase monotonically and wrap at `u32::MAX`; an id that is
    /// still outstanding after wrapping is skipped.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::ConnectionClosed` once the table has been closed.
    pub fn register(&self) -> Result<(u32, oneshot::Receiver<CallOutcome>), RpcError> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(RpcError::ConnectionClosed);
        }

        let id = loop {
            let candidate = inner.next_id;
            inner.next_id = inner.next_id.wrapping_add(1);
            if !inner.calls.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = oneshot::channel();
        inner.calls.insert(id, tx);
        Ok((id, rx))
    }

    /// Remove the call registered under `id` and deliver `outcome` to it.
    ///
    /// Returns `false` if no call is waiting for `id` (a stray response).
    pub fn complete(&self, id: u32, outcome: CallOutcome) -> bool {
        let Some(tx) = self.lock().calls.remove(&id) else {
            return false;
        };
        // The caller may have been dropped between removal and delivery;
        // nothing is waiting for the outcome then.
        let _ = tx.send(outcome);
        true
    }

    /// Forget the call registered under `id` without delivering anything.
    pub fn cancel(&self, id: u32) -> bool {
        self.lock().calls.remove(&id).is_some()
    }

    /// Close the table and fail every outstanding call with
    /// `RpcError::ConnectionClosed`. Returns how many calls were failed.
    pub fn close_all(&self) -> usize {
        let calls: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.calls.drain().collect()
        };

        let count = calls.len();
        for (_, tx) in calls {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of calls awaiting a response.
    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes a pending call from its table when dropped, unless disarmed.
///
/// Held by the `call` future so that cancelling the future (dropping it, or
/// a timeout firing) cannot leak a correlation entry.
pub struct PendingGuard<'a> {
    table: &'a CorrelationTable,
    id: u32,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    pub fn new(table: &'a CorrelationTable, id: u32) -> Self {
        Self {
            table,
            id,
            armed: true,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// The entry was already removed by delivery; nothing to clean up.
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.table.cancel(self.id);
        }
    }
}
