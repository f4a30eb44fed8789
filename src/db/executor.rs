//! Statement and native query execution.
//!
//! `send_statement` classifies, compiles, sends and parses. `send_native_query`
//! sends through a lease and attaches a footprint to query failures.

use super::lease::{LeaseOptions, Resource, with_connection};
use crate::driver::{Connectable, NativeQuery, Queryable, SendFailure};
use crate::error::{DatastoreError, DsResult};
use crate::models::{Meta, Statement};
use serde_json::Value;
use tracing::debug;

/// Send a native query and return the raw result.
///
/// A driver-reported query failure becomes `E_QUERY_FAILED` carrying the
/// footprint from `parse_native_query_error` and the original error as `raw`.
pub async fn send_native_query(
    connectable: &dyn Connectable,
    queryable: &dyn Queryable,
    resource: Resource,
    query: &NativeQuery,
    options: &LeaseOptions,
) -> DsResult<Value> {
    with_connection(connectable, resource, options, |connection| async move {
        debug!(connection = %connection.id(), query = %query.query, "Sending native query");
        match queryable
            .send_native_query(&connection, query, &options.meta)
            .await
        {
            Ok(raw) => Ok(raw),
            Err(SendFailure::Other(err)) => Err(err),
            Err(SendFailure::QueryFailed { error, meta }) => {
                let meta = meta.unwrap_or_else(|| options.meta.clone());
                Err(attach_footprint(queryable, error, &meta))
            }
        }
    })
    .await
}

fn attach_footprint(queryable: &dyn Queryable, error: DatastoreError, meta: &Meta) -> DatastoreError {
    match queryable.parse_native_query_error(&error, meta) {
        Ok(footprint) => {
            debug!(footprint = footprint.identity(), "Query failed");
            DatastoreError::query_failed(error, footprint)
        }
        Err(parse_err) => DatastoreError::FootprintParse {
            message: format!(
                "Query failed: {}\n...AND THEN when attempting to parse the native query error into a footprint, there was a secondary error: {}",
                error, parse_err
            ),
            raw: Box::new(error),
        },
    }
}

/// Classify, compile, send and parse a portable statement.
///
/// Classification failures happen before any driver call. Compile failures are
/// returned exactly as the driver reported them.
pub async fn send_statement(
    connectable: &dyn Connectable,
    queryable: &dyn Queryable,
    resource: Resource,
    statement: &Statement,
    options: &LeaseOptions,
) -> DsResult<Value> {
    let query_type = statement.query_type()?;
    let compiled = queryable.compile_statement(statement, &options.meta)?;

    let mut meta = options.meta.clone();
    if let Some(compiled_meta) = &compiled.meta {
        meta.extend(compiled_meta.clone());
    }
    let merged = LeaseOptions {
        meta,
        timeout: options.timeout,
    };

    let raw = send_native_query(
        connectable,
        queryable,
        resource,
        &compiled.native_query(),
        &merged,
    )
    .await?;

    queryable
        .parse_native_query_result(query_type, &raw, &merged.meta)
        .map_err(|e| DatastoreError::result_parse(query_type.as_str(), e.to_string()))
}
