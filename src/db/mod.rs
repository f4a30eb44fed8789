//! Datastore runtime.
//!
//! Layers, bottom up:
//! - [`lease`]: acquire, use and reliably release a connection
//! - [`transaction`]: begin, run, then commit or roll back inside a lease
//! - [`executor`]: classify, compile, send and parse statements
//! - [`rdi`]: the per-datastore public handle built on the layers above

pub mod completion;
pub mod executor;
pub mod lease;
pub mod rdi;
pub mod transaction;

pub use completion::{Completion, CompletionReceiver, callback};
pub use executor::{send_native_query, send_statement};
pub use lease::{LeaseOptions, Resource, with_connection};
pub use rdi::{LeaseConnection, RegisteredDatastore, SendNativeQuery, SendStatement, Transaction};
pub use transaction::{TransactionAttempt, TransactionState, run_transaction};
