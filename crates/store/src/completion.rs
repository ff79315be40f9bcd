//! Deferred completion callbacks for asynchronous store operations.
//!
//! When a consumer finalizes by renaming a staging entry, the rename runs
//! on the store's worker thread and the caller's completion callback must
//! not fire until the store reports the handle done. Each such callback
//! parks here with its already-decided result value; [`CompletionQueue::drain`]
//! is called once per scheduler tick and fires whatever the store says is
//! ready. Completions fire in the order the store reports them ready, not
//! enqueue order.
//!
//! The queue is owned by the embedding runtime: created at startup,
//! `drain(store, true)` at shutdown so a stuck handle can never wedge
//! teardown.

use crate::{AsyncOpStatus, ContentStore, RenameHandle};

struct PendingCompletion<T> {
    handle: RenameHandle,
    result: T,
    callback: Box<dyn FnOnce(T) + Send>,
}

/// Queue of completion callbacks waiting on asynchronous store operations.
pub struct CompletionQueue<T> {
    pending: Vec<PendingCompletion<T>>,
}

impl<T> Default for CompletionQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CompletionQueue<T> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Parks `callback` until `handle` completes or expires. The result
    /// value is decided now and delivered verbatim later.
    pub fn enqueue(
        &mut self,
        handle: RenameHandle,
        result: T,
        callback: Box<dyn FnOnce(T) + Send>,
    ) {
        self.pending.push(PendingCompletion {
            handle,
            result,
            callback,
        });
    }

    /// Polls every parked record against the store, firing those whose
    /// handle is complete or expired. With `force_all` every remaining
    /// record fires regardless of handle state (shutdown path).
    pub fn drain(&mut self, store: &dyn ContentStore, force_all: bool) {
        let mut i = 0;
        while i < self.pending.len() {
            let ready = force_all
                || !matches!(
                    store.query_status(self.pending[i].handle),
                    AsyncOpStatus::Pending
                );
            if ready {
                let record = self.pending.swap_remove(i);
                (record.callback)(record.result);
            } else {
                i += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
