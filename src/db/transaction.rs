//! Transaction orchestration on top of connection leasing.
//!
//! A transaction attempt moves `NotStarted -> Began -> {RolledBack | Committed}`.
//! Exactly one of commit or rollback is invoked per attempt, and the
//! enclosing lease releases the connection whichever terminal state is reached.

use super::lease::{LeaseOptions, Resource, run_work, with_connection};
use crate::driver::{Connectable, Connection, Manager, Transactional};
use crate::error::{DatastoreError, DsResult, LifecycleStage};
use crate::models::Meta;
use std::fmt;
use std::future::Future;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NotStarted,
    Began,
    /// Rollback was invoked (whether or not the driver succeeded).
    RolledBack,
    /// Commit was invoked (whether or not the driver succeeded).
    Committed,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RolledBack | Self::Committed)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Began => "began",
            Self::RolledBack => "rolled back",
            Self::Committed => "committed",
        };
        f.write_str(s)
    }
}

/// One transaction attempt on a leased connection.
pub struct TransactionAttempt<'a> {
    driver: &'a dyn Transactional,
    connection: Connection,
    meta: &'a Meta,
    state: TransactionState,
}

impl<'a> TransactionAttempt<'a> {
    pub fn new(driver: &'a dyn Transactional, connection: Connection, meta: &'a Meta) -> Self {
        Self {
            driver,
            connection,
            meta,
            state: TransactionState::NotStarted,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    fn ensure(&self, expected: TransactionState, next: TransactionState) -> DsResult<()> {
        if self.state == expected {
            return Ok(());
        }
        Err(DatastoreError::consistency(format!(
            "cannot move transaction on connection {} to `{}` while it is `{}`",
            self.connection.id(),
            next,
            self.state
        )))
    }

    pub async fn begin(&mut self) -> DsResult<()> {
        self.ensure(TransactionState::NotStarted, TransactionState::Began)?;
        self.driver
            .begin_transaction(&self.connection, self.meta)
            .await?;
        self.state = TransactionState::Began;
        debug!(connection = %self.connection.id(), "Began transaction");
        Ok(())
    }

    pub async fn commit(&mut self) -> DsResult<()> {
        self.ensure(TransactionState::Began, TransactionState::Committed)?;
        self.state = TransactionState::Committed;
        self.driver
            .commit_transaction(&self.connection, self.meta)
            .await?;
        debug!(connection = %self.connection.id(), "Committed transaction");
        Ok(())
    }

    pub async fn rollback(&mut self) -> DsResult<()> {
        self.ensure(TransactionState::Began, TransactionState::RolledBack)?;
        self.state = TransactionState::RolledBack;
        self.driver
            .rollback_transaction(&self.connection, self.meta)
            .await?;
        debug!(connection = %self.connection.id(), "Rolled back transaction");
        Ok(())
    }
}

/// Lease a connection from `manager`, run `work` inside a transaction, then
/// commit on success or roll back on failure.
///
/// `options.timeout` bounds the transactional work only; begin, commit,
/// rollback and release always run.
pub async fn run_transaction<T, F, Fut>(
    connectable: &dyn Connectable,
    transactional: &dyn Transactional,
    manager: Manager,
    options: &LeaseOptions,
    work: F,
) -> DsResult<T>
where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = DsResult<T>>,
{
    let lease_options = LeaseOptions::new(options.meta.clone());

    with_connection(
        connectable,
        Resource::Manager(manager),
        &lease_options,
        move |connection| async move {
            let mut attempt =
                TransactionAttempt::new(transactional, connection.clone(), &options.meta);
            attempt.begin().await?;

            match run_work(work, connection, options.timeout).await {
                Ok(value) => match attempt.commit().await {
                    Ok(()) => Ok(value),
                    Err(commit_err) => {
                        warn!(error = %commit_err, "Failed to commit transaction");
                        Err(DatastoreError::lifecycle(
                            LifecycleStage::Commit,
                            format!(
                                "The transactional unit of work ran successfully, but there was an issue committing the db transaction: {}",
                                commit_err
                            ),
                            commit_err,
                            None,
                        ))
                    }
                },
                Err(work_err) => match attempt.rollback().await {
                    Ok(()) => Err(work_err),
                    Err(rollback_err) => {
                        warn!(error = %rollback_err, "Failed to roll back transaction");
                        Err(DatastoreError::lifecycle(
                            LifecycleStage::Rollback,
                            format!(
                                "First, encountered error:\n  (1) {}\n...AND THEN when attempting to roll back the database transaction, there was a secondary error:\n  (2) {}",
                                work_err, rollback_err
                            ),
                            rollback_err,
                            Some(work_err),
                        ))
                    }
                },
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Transactional for Recorder {
        async fn begin_transaction(&self, _: &Connection, _: &Meta) -> DsResult<()> {
            self.calls.lock().unwrap().push("begin");
            Ok(())
        }

        async fn commit_transaction(&self, _: &Connection, _: &Meta) -> DsResult<()> {
            self.calls.lock().unwrap().push("commit");
            Ok(())
        }

        async fn rollback_transaction(&self, _: &Connection, _: &Meta) -> DsResult<()> {
            self.calls.lock().unwrap().push("rollback");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_attempt_cannot_reenter_began() {
        let driver = Recorder::default();
        let meta = Meta::new();
        let mut attempt = TransactionAttempt::new(&driver, Connection::new(()), &meta);

        attempt.begin().await.unwrap();
        attempt.commit().await.unwrap();
        assert_eq!(attempt.state(), TransactionState::Committed);
        assert!(attempt.state().is_terminal());

        assert_eq!(
            attempt.begin().await.unwrap_err().code(),
            "E_CONSISTENCY_VIOLATION"
        );
        assert_eq!(
            attempt.rollback().await.unwrap_err().code(),
            "E_CONSISTENCY_VIOLATION"
        );
        assert_eq!(*driver.calls.lock().unwrap(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn test_commit_requires_begin() {
        let driver = Recorder::default();
        let meta = Meta::new();
        let mut attempt = TransactionAttempt::new(&driver, Connection::new(()), &meta);

        assert!(attempt.commit().await.is_err());
        assert_eq!(attempt.state(), TransactionState::NotStarted);
        assert!(driver.calls.lock().unwrap().is_empty());
    }
}
