//! Connection leasing.
//!
//! [`with_connection`] runs a unit of work against a connection and
//! guarantees that a connection it acquired itself is released exactly once,
//! whatever the work does. A connection supplied by the caller is never
//! released here; ownership stays with the caller.

use crate::driver::{Connectable, Connection, Manager};
use crate::error::{DatastoreError, DsResult, LifecycleStage};
use crate::models::Meta;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, warn};

/// Where a lease gets its connection from.
#[derive(Debug, Clone)]
pub enum Resource {
    /// Acquire a connection ad hoc from this manager and release it afterwards.
    Manager(Manager),
    /// Use a connection the caller already owns.
    Connection(Connection),
}

impl Resource {
    pub fn is_ad_hoc(&self) -> bool {
        matches!(self, Self::Manager(_))
    }
}

/// Per-call options shared by leases, transactions and queries.
#[derive(Debug, Clone, Default)]
pub struct LeaseOptions {
    pub meta: Meta,
    /// Upper bound on how long the unit of work may run.
    pub timeout: Option<Duration>,
}

impl LeaseOptions {
    pub fn new(meta: Meta) -> Self {
        Self {
            meta,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Run `work` against a connection from `resource`.
///
/// Outcomes:
/// - acquisition fails: that error, nothing to release
/// - work and release both fail: one `E_RELEASE_FAILED` error whose message
///   carries both failures and whose `raw` is the work error
/// - only release fails: `E_RELEASE_FAILED`
/// - only work fails: the work error
pub async fn with_connection<T, F, Fut>(
    driver: &dyn Connectable,
    resource: Resource,
    options: &LeaseOptions,
    work: F,
) -> DsResult<T>
where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = DsResult<T>>,
{
    let (connection, ad_hoc) = match resource {
        Resource::Connection(connection) => {
            debug!(connection = %connection.id(), "Using caller-supplied connection");
            (connection, false)
        }
        Resource::Manager(manager) => {
            let connection = driver.get_connection(&manager, &options.meta).await?;
            debug!(connection = %connection.id(), manager = %manager.id(), "Acquired connection");
            (connection, true)
        }
    };

    let outcome = run_work(work, connection.clone(), options.timeout).await;

    if !ad_hoc {
        return outcome;
    }

    let released = driver.release_connection(&connection, &options.meta).await;
    match &released {
        Ok(()) => debug!(connection = %connection.id(), "Released connection"),
        Err(e) => warn!(connection = %connection.id(), error = %e, "Failed to release connection"),
    }

    reconcile_release(outcome, released)
}

/// Invoke a unit of work, turning panics and timeouts into errors.
pub(crate) async fn run_work<T, F, Fut>(
    work: F,
    connection: Connection,
    timeout: Option<Duration>,
) -> DsResult<T>
where
    F: FnOnce(Connection) -> Fut,
    Fut: Future<Output = DsResult<T>>,
{
    let future = match panic::catch_unwind(AssertUnwindSafe(|| work(connection))) {
        Ok(future) => future,
        Err(payload) => return Err(panic_error(payload)),
    };

    let guarded = AssertUnwindSafe(future).catch_unwind();
    let finished = match timeout {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(finished) => finished,
            Err(_) => {
                return Err(DatastoreError::timeout(
                    "unit of work",
                    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                ));
            }
        },
        None => guarded.await,
    };

    finished.unwrap_or_else(|payload| Err(panic_error(payload)))
}

fn panic_error(payload: Box<dyn Any + Send>) -> DatastoreError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    DatastoreError::work(format!("unit of work panicked: {}", detail))
}

fn reconcile_release<T>(outcome: DsResult<T>, released: DsResult<()>) -> DsResult<T> {
    match (outcome, released) {
        (outcome, Ok(())) => outcome,
        (Ok(_), Err(release_err)) => Err(DatastoreError::lifecycle(
            LifecycleStage::Release,
            format!(
                "The unit of work using this db connection ran successfully, but afterwards, \
                 when attempting to release the connection (since it was leased ad hoc), \
                 there was an error: {}",
                release_err
            ),
            release_err,
            None,
        )),
        (Err(work_err), Err(release_err)) => Err(DatastoreError::lifecycle(
            LifecycleStage::Release,
            format!(
                "The unit of work using this db connection encountered an error:\n  (1) {}\n\
                 ...AND THEN when attempting to release the connection (since it was leased ad hoc), \
                 there was a secondary issue:\n  (2) {}",
                work_err, release_err
            ),
            release_err,
            Some(work_err),
        )),
    }
}
