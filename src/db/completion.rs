//! Single-completion signal for callback-style units of work.
//!
//! [`callback`] adapts work that reports its outcome through a
//! [`Completion`] handle instead of returning a future. Only the first
//! signal counts; later ones are logged and ignored. If every clone of the
//! handle is dropped without signaling, the work fails instead of hanging.

use crate::driver::Connection;
use crate::error::{DatastoreError, DsResult};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::warn;

/// Handle through which a unit of work reports its outcome exactly once.
pub struct Completion<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<DsResult<T>>>>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Completion<T> {
    /// Create a signal and the receiver that observes it.
    pub fn channel() -> (Self, CompletionReceiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Arc::new(Mutex::new(Some(tx))),
            },
            CompletionReceiver { rx },
        )
    }

    /// Report the outcome. Returns `false` when an outcome was already reported.
    pub fn done(&self, outcome: DsResult<T>) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(tx) => {
                // The receiver is gone when the lease already timed out.
                let _ = tx.send(outcome);
                true
            }
            None => {
                warn!(
                    ignored_error = ?outcome.as_ref().err(),
                    "Unit of work signaled completion more than once; ignoring the extra signal"
                );
                false
            }
        }
    }

    pub fn succeed(&self, value: T) -> bool {
        self.done(Ok(value))
    }

    pub fn fail(&self, error: DatastoreError) -> bool {
        self.done(Err(error))
    }

    pub fn is_done(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Receiving side of a [`Completion`].
pub struct CompletionReceiver<T> {
    rx: oneshot::Receiver<DsResult<T>>,
}

impl<T> CompletionReceiver<T> {
    pub async fn wait(self) -> DsResult<T> {
        self.rx.await.unwrap_or_else(|_| {
            Err(DatastoreError::work(
                "unit of work finished without signaling completion",
            ))
        })
    }
}

/// Adapt callback-style work to the future-returning form leases and transactions run.
pub fn callback<T, F>(work: F) -> impl FnOnce(Connection) -> BoxFuture<'static, DsResult<T>>
where
    F: FnOnce(Connection, Completion<T>) + Send + 'static,
    T: Send + 'static,
{
    move |connection| {
        let (signal, receiver) = Completion::channel();
        work(connection, signal);
        Box::pin(receiver.wait())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_first_signal_wins() {
        let (signal, receiver) = Completion::<u32>::channel();
        assert!(signal.succeed(1));
        assert!(!signal.fail(DatastoreError::work("late failure")));
        assert!(signal.is_done());
        assert_eq!(receiver.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_signal_from_spawned_task() {
        let (signal, receiver) = Completion::<&'static str>::channel();
        let remote = signal.clone();
        tokio::spawn(async move {
            remote.succeed("from task");
        });
        drop(signal);
        assert_eq!(receiver.wait().await.unwrap(), "from task");
    }

    #[tokio::test]
    async fn test_dropped_signal_is_an_error() {
        let (signal, receiver) = Completion::<()>::channel();
        drop(signal);
        let err = receiver.wait().await.unwrap_err();
        assert_eq!(err.code(), "E_WORK");
    }

    #[test]
    fn test_receiver_pends_until_signaled() {
        let (signal, receiver) = Completion::<u8>::channel();
        let mut waiting = task::spawn(receiver.wait());

        assert_pending!(waiting.poll());
        signal.succeed(7);
        assert!(waiting.is_woken());
        assert_eq!(assert_ready!(waiting.poll()).unwrap(), 7);
    }
}
