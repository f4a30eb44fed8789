//! Footprint classification shared by the built-in adapters.

use crate::error::{DatastoreError, Footprint};

/// Message prefix SQLite (and the memory adapter) use for uniqueness violations.
pub const UNIQUE_PREFIX: &str = "UNIQUE constraint failed: ";

const POSTGRES_UNIQUE_VIOLATION: &str = "23505";
const MYSQL_DUPLICATE_ENTRY: &str = "1062";
const MYSQL_DUPLICATE_ENTRY_STATE: &str = "23000";

/// Classify a driver error into a footprint.
pub fn classify(error: &DatastoreError) -> Footprint {
    let DatastoreError::Driver {
        message,
        native_code,
    } = error
    else {
        return Footprint::Catchall;
    };

    if let Some(keys) = unique_keys_from_columns(message) {
        return Footprint::NotUnique { keys };
    }

    match native_code.as_deref() {
        Some(POSTGRES_UNIQUE_VIOLATION) => Footprint::NotUnique {
            keys: postgres_keys(message),
        },
        Some(MYSQL_DUPLICATE_ENTRY) | Some(MYSQL_DUPLICATE_ENTRY_STATE)
            if message.contains("Duplicate entry") =>
        {
            Footprint::NotUnique {
                keys: mysql_keys(message),
            }
        }
        _ if is_connection_loss(message) => Footprint::ConnectionLost,
        _ => Footprint::Catchall,
    }
}

/// `UNIQUE constraint failed: user.email, user.name` -> `["email", "name"]`.
fn unique_keys_from_columns(message: &str) -> Option<Vec<String>> {
    let start = message.find(UNIQUE_PREFIX)? + UNIQUE_PREFIX.len();
    let keys = message[start..]
        .split(',')
        .map(|part| {
            let part = part.trim();
            part.rsplit('.').next().unwrap_or(part).to_string()
        })
        .filter(|key| !key.is_empty())
        .collect();
    Some(keys)
}

/// `duplicate key value violates unique constraint "user_email_key"` -> `["user_email_key"]`.
fn postgres_keys(message: &str) -> Vec<String> {
    quoted(message, '"').into_iter().collect()
}

/// `Duplicate entry 'a@b.c' for key 'user.email'` -> `["email"]`.
fn mysql_keys(message: &str) -> Vec<String> {
    let Some(idx) = message.find("for key ") else {
        return Vec::new();
    };
    quoted(&message[idx..], '\'')
        .map(|key| key.rsplit('.').next().unwrap_or(&key).to_string())
        .into_iter()
        .collect()
}

fn quoted(text: &str, quote: char) -> Option<String> {
    let start = text.find(quote)? + 1;
    let end = text[start..].find(quote)? + start;
    Some(text[start..end].to_string())
}

fn is_connection_loss(message: &str) -> bool {
    let lower = message.to_lowercase();
    [
        "connection reset",
        "broken pipe",
        "connection refused",
        "server has gone away",
        "lost connection",
        "pool is closed",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_error(message: &str, code: Option<&str>) -> DatastoreError {
        DatastoreError::driver(message, code.map(String::from))
    }

    #[test]
    fn test_sqlite_unique_violation() {
        let fp = classify(&driver_error(
            "UNIQUE constraint failed: user.email, user.name",
            Some("2067"),
        ));
        assert_eq!(
            fp,
            Footprint::NotUnique {
                keys: vec!["email".into(), "name".into()]
            }
        );
    }

    #[test]
    fn test_postgres_unique_violation() {
        let fp = classify(&driver_error(
            "duplicate key value violates unique constraint \"user_email_key\"",
            Some("23505"),
        ));
        assert_eq!(
            fp,
            Footprint::NotUnique {
                keys: vec!["user_email_key".into()]
            }
        );
    }

    #[test]
    fn test_mysql_duplicate_entry() {
        let fp = classify(&driver_error(
            "Duplicate entry 'a@b.c' for key 'user.email'",
            Some("23000"),
        ));
        assert_eq!(
            fp,
            Footprint::NotUnique {
                keys: vec!["email".into()]
            }
        );
    }

    #[test]
    fn test_connection_loss_and_catchall() {
        assert_eq!(
            classify(&driver_error("I/O error: Broken pipe", None)),
            Footprint::ConnectionLost
        );
        assert_eq!(
            classify(&driver_error("no such table: user", Some("1"))),
            Footprint::Catchall
        );
        assert_eq!(
            classify(&DatastoreError::work("not a driver error")),
            Footprint::Catchall
        );
    }
}
