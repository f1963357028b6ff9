//! Correlation table: in-flight requests keyed by correlation ID.
//!
//! Each registered request owns a oneshot channel. Resolving sends the
//! reply payload through the sender and removes the entry; abandoning
//! drops the sender, which wakes the waiting receiver with
//! [`RpcError::Cancelled`]. Either way the entry leaves the table exactly
//! once and a completion is settled at most once.
//!
//! [`CorrelationTable::abandon_all`] also closes the table: later
//! registrations fail with the same error the abandoned waiters saw.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::{log_debug, CorrelationId, Result, RpcError};

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The map has no invariants spanning multiple entries and no code panics
/// while holding the lock. The worst outcome of using a poisoned map is an
/// unmatched reply, which the table already tolerates.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Why every pending entry was abandoned at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbandonReason {
    /// The owner shut the client down.
    Shutdown,
    /// The reply stream ended underneath the client.
    ConnectionLost,
}

impl AbandonReason {
    fn error(self) -> RpcError {
        match self {
            AbandonReason::Shutdown => RpcError::Cancelled,
            AbandonReason::ConnectionLost => RpcError::ConnectionLost,
        }
    }
}

/// Single-assignment completion handed out by [`CorrelationTable::register`].
#[derive(Debug)]
pub struct PendingCompletion {
    // ---
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Result<Bytes>>,
}

impl PendingCompletion {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Wait for the completion to settle.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Cancelled`] if the entry was abandoned, or
    /// [`RpcError::ConnectionLost`] if the reply stream went away.
    pub async fn wait(self) -> Result<Bytes> {
        match self.rx.await {
            Ok(settled) => settled,
            Err(_) => Err(RpcError::Cancelled),
        }
    }
}

/// Mapping from correlation ID to pending completion.
///
/// Safe to share between the tasks issuing requests and the task routing
/// replies. The lock is held only for the map operation itself, never
/// across an await.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    // ---
    state: Mutex<TableState>,
    unmatched: AtomicU64,
}

#[derive(Debug, Default)]
struct TableState {
    entries: HashMap<CorrelationId, oneshot::Sender<Result<Bytes>>>,
    /// Set once by `abandon_all`; the first reason wins.
    closed: Option<AbandonReason>,
}

impl CorrelationTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending request.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::DuplicateCorrelationId`] if `id` is already
    /// pending. The existing entry is left untouched. After
    /// [`abandon_all`](Self::abandon_all) returns `Cancelled` or
    /// `ConnectionLost` according to the reason given there.
    pub fn register(&self, id: CorrelationId) -> Result<PendingCompletion> {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        if let Some(reason) = state.closed {
            return Err(reason.error());
        }

        match state.entries.entry(id) {
            Entry::Occupied(entry) => Err(RpcError::DuplicateCorrelationId(entry.key().to_string())),
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                let correlation_id = entry.key().clone();
                entry.insert(tx);
                Ok(PendingCompletion { correlation_id, rx })
            }
        }
    }

    /// Settle the completion for `id` with `payload` and remove the entry.
    ///
    /// Returns false for unknown IDs (late, duplicate, or spurious replies).
    pub fn resolve(&self, id: &CorrelationId, payload: Bytes) -> bool {
        // ---
        let tx = lock_ignore_poison(&self.state).entries.remove(id);

        match tx {
            Some(tx) => {
                // Receiver gone means the caller future was dropped mid-flight.
                if tx.send(Ok(payload)).is_err() {
                    log_debug!("reply for {id} arrived after its caller went away");
                }
                true
            }
            None => {
                self.unmatched.fetch_add(1, Ordering::Relaxed);
                log_debug!("dropping unmatched reply (correlation_id: {id})");
                false
            }
        }
    }

    /// Remove the entry for `id` without settling it.
    ///
    /// A task waiting on the completion resumes with [`RpcError::Cancelled`].
    /// Returns false if `id` was not pending.
    pub fn abandon(&self, id: &CorrelationId) -> bool {
        lock_ignore_poison(&self.state).entries.remove(id).is_some()
    }

    /// Settle every pending entry with the error for `reason` and close the
    /// table to new registrations. Returns how many entries were removed.
    ///
    /// Calling it again drains nothing new and keeps the first reason.
    pub fn abandon_all(&self, reason: AbandonReason) -> usize {
        // ---
        let drained: Vec<_> = {
            let mut state = lock_ignore_poison(&self.state);
            let reason = *state.closed.get_or_insert(reason);
            state
                .entries
                .drain()
                .map(|(_, tx)| (tx, reason))
                .collect()
        };

        let count = drained.len();
        for (tx, reason) in drained {
            let _ = tx.send(Err(reason.error()));
        }
        count
    }

    /// Whether [`abandon_all`](Self::abandon_all) has closed the table.
    pub fn is_closed(&self) -> bool {
        lock_ignore_poison(&self.state).closed.is_some()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        lock_ignore_poison(&self.state).entries.contains_key(id)
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replies dropped because no entry matched.
    pub fn unmatched(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }
}
