//! Shared store state: busy flag, last error and change notification.
//!
//! Every store owns one `Status`. Observers subscribe through a channel and
//! receive a `StoreEvent` whenever something they might render changes.
//! `loading` is advisory only. Nothing waits on it, and overlapping calls
//! simply race with last-write-wins.

use std::future::Future;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Change notification sent to store subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// An operation started (`true`) or settled (`false`)
    Loading(bool),
    /// An operation failed with this user-facing message
    Failed(String),
    /// The store's list (profiles, patients, drugs, settings) was replaced
    CollectionChanged,
    /// The store's current record was replaced or cleared
    CurrentChanged,
}

/// Lock a store mutex, recovering the data from a poisoned lock.
///
/// Store state is only ever swapped wholesale, so a panic mid-update cannot
/// leave it half-written.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Flags {
    loading: bool,
    error: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Status {
    flags: Mutex<Flags>,
    observers: Mutex<Vec<Sender<StoreEvent>>>,
}

impl Status {
    pub(crate) fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.observers).push(tx);
        rx
    }

    /// Send to every live subscriber, dropping the ones that hung up.
    pub(crate) fn emit(&self, event: StoreEvent) {
        lock(&self.observers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub(crate) fn loading(&self) -> bool {
        lock(&self.flags).loading
    }

    pub(crate) fn error(&self) -> Option<String> {
        lock(&self.flags).error.clone()
    }

    /// Run one store operation with the busy flag and error bookkeeping.
    ///
    /// On failure the backend's message (or `fallback`) is recorded for
    /// display and the error is still returned to the caller.
    pub(crate) async fn track<T>(
        &self,
        fallback: &str,
        work: impl Future<Output = crate::Result<T>>,
    ) -> crate::Result<T> {
        self.begin();
        let result = work.await;
        self.finish(result, fallback)
    }

    fn begin(&self) {
        {
            let mut flags = lock(&self.flags);
            flags.loading = true;
            flags.error = None;
        }
        self.emit(StoreEvent::Loading(true));
    }

    fn finish<T>(&self, result: crate::Result<T>, fallback: &str) -> crate::Result<T> {
        if let Err(e) = &result {
            let message = e.user_message().unwrap_or_else(|| fallback.to_string());
            tracing::error!("{fallback}: {e}");
            lock(&self.flags).error = Some(message.clone());
            self.emit(StoreEvent::Failed(message));
        }

        lock(&self.flags).loading = false;
        self.emit(StoreEvent::Loading(false));
        result
    }
}
