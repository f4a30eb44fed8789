//! Backend dispatch for the SQL adapter.
//!
//! The macros expand one body per backend so each arm is type-checked against
//! that backend's sqlx types, with the matching parameter binder in scope.

use std::fmt;

/// SQL backend selected by the datastore URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    MySql,
    Postgres,
    SQLite,
}

impl DatabaseType {
    /// Backend for a URL scheme, if it is one we speak.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::SQLite),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MySql => f.write_str("MySQL"),
            Self::Postgres => f.write_str("PostgreSQL"),
            Self::SQLite => f.write_str("SQLite"),
        }
    }
}

/// Run `$body` against whichever pool variant `$pool` holds.
///
/// ```ignore
/// on_pool!(&manager.pool, p, bind => {
///     let query = bind(sqlx::query(sql), &value);
///     query.execute(p).await
/// })
/// ```
macro_rules! on_pool {
    ($pool:expr, $p:ident, $bind:ident => $body:expr) => {
        match $pool {
            $crate::adapters::sql::pool::DbPool::MySql($p) => {
                #[allow(unused_imports)]
                use $crate::adapters::sql::params::bind_mysql as $bind;
                $body
            }
            $crate::adapters::sql::pool::DbPool::Postgres($p) => {
                #[allow(unused_imports)]
                use $crate::adapters::sql::params::bind_postgres as $bind;
                $body
            }
            $crate::adapters::sql::pool::DbPool::SQLite($p) => {
                #[allow(unused_imports)]
                use $crate::adapters::sql::params::bind_sqlite as $bind;
                $body
            }
        }
    };
}

/// Run `$body` against whichever pooled connection variant `$conn` holds.
/// `$c` is bound to `&mut PoolConnection<DB>`; use `&mut **$c` as the executor.
macro_rules! on_connection {
    ($conn:expr, $c:ident, $bind:ident => $body:expr) => {
        match $conn {
            $crate::adapters::sql::pool::PooledConnection::MySql($c) => {
                #[allow(unused_imports)]
                use $crate::adapters::sql::params::bind_mysql as $bind;
                $body
            }
            $crate::adapters::sql::pool::PooledConnection::Postgres($c) => {
                #[allow(unused_imports)]
                use $crate::adapters::sql::params::bind_postgres as $bind;
                $body
            }
            $crate::adapters::sql::pool::PooledConnection::SQLite($c) => {
                #[allow(unused_imports)]
                use $crate::adapters::sql::params::bind_sqlite as $bind;
                $body
            }
        }
    };
}

pub(crate) use {on_connection, on_pool};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_selects_backend() {
        assert_eq!(DatabaseType::from_scheme("postgresql"), Some(DatabaseType::Postgres));
        assert_eq!(DatabaseType::from_scheme("MySQL"), Some(DatabaseType::MySql));
        assert_eq!(DatabaseType::from_scheme("sqlite"), Some(DatabaseType::SQLite));
        assert_eq!(DatabaseType::from_scheme("mongodb"), None);
    }

    #[test]
    fn test_database_type_display() {
        assert_eq!(DatabaseType::Postgres.to_string(), "PostgreSQL");
        assert_eq!(DatabaseType::SQLite.to_string(), "SQLite");
    }
}
