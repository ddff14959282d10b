//! Outstanding requests awaiting their response.
//!
//! Each entry is a `oneshot` sender keyed by request id. Entries leave the
//! table when their response arrives, when the caller gives up (timeout or
//! failed send), or all at once when the connection ends.
//!
//! The close reason lives under the same lock as the table, so nothing can
//! be registered after the final drain.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{NodelinkError, Result};
use crate::protocol::RequestId;

/// Why the table stopped accepting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection went away.
    ConnectionClosed,
    /// The communicator was terminated.
    Terminated,
}

impl CloseReason {
    pub fn to_error(self) -> NodelinkError {
        match self {
            CloseReason::ConnectionClosed => NodelinkError::ConnectionClosed,
            CloseReason::Terminated => NodelinkError::Terminated,
        }
    }
}

type Resolver = oneshot::Sender<Result<Value>>;

#[derive(Default)]
struct Table {
    calls: HashMap<RequestId, Resolver>,
    closed: Option<CloseReason>,
}

/// Table of pending calls.
#[derive(Default)]
pub struct PendingCalls {
    table: Mutex<Table>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserve a fresh id and the receiver its outcome will arrive on.
    ///
    /// # Errors
    ///
    /// Fails with the close reason once the table has been drained.
    pub fn register(&self) -> Result<(RequestId, oneshot::Receiver<Result<Value>>)> {
        let mut table = self.lock();
        if let Some(reason) = table.closed {
            return Err(reason.to_error());
        }

        let (tx, rx) = oneshot::channel();
        let mut id = RequestId::new();
        while table.calls.contains_key(&id) {
            id = RequestId::new();
        }
        table.calls.insert(id.clone(), tx);
        Ok((id, rx))
    }

    /// Complete the call registered under `id`.
    ///
    /// Returns `false` if no such call is outstanding.
    pub fn resolve(&self, id: &RequestId, outcome: Result<Value>) -> bool {
        let resolver = self.lock().calls.remove(id);
        match resolver {
            Some(tx) => {
                // The caller may have stopped waiting.
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forget a call without completing it.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.lock().calls.remove(id).is_some()
    }

    /// Fail every outstanding call and refuse new ones.
    ///
    /// `Terminated` replaces an earlier `ConnectionClosed`, never the other
    /// way round. Returns how many calls were failed.
    pub fn fail_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<Resolver> = {
            let mut table = self.lock();
            table.closed = match (table.closed, reason) {
                (Some(CloseReason::Terminated), _) => Some(CloseReason::Terminated),
                (_, reason) => Some(reason),
            };
            table.calls.drain().map(|(_, tx)| tx).collect()
        };

        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(reason.to_error()));
        }
        count
    }

    /// Reason the table was closed, if it was.
    pub fn closed(&self) -> Option<CloseReason> {
        self.lock().closed
    }

    /// Fail fast if the table no longer accepts calls.
    pub fn ensure_open(&self) -> Result<()> {
        match self.closed() {
            Some(reason) => Err(reason.to_error()),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().calls.len()
    }
}
