//! Driver-facing building blocks for the connection context.
//!
//! # Responsibility
//! - Define the connection/transaction contracts the context coordinates.
//! - Provide the SQLite implementation of those contracts.
//! - Own the shared error taxonomy for the whole crate.
//!
//! # Invariants
//! - Driver failures are propagated unchanged; nothing in this layer retries.
//! - Configuration problems surface as `DbError::Configuration`.
//!
//! # See also
//! - `crate::context` for the coordination layer built on these contracts.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod command;
pub mod driver;
pub mod factory;
pub mod row;
pub mod sqlite;

pub use command::{Command, CommandKind, Params};
pub use driver::{ConnectionFactory, ConnectionState, DbConnection, DbTransaction, IsolationLevel};
pub use factory::DbConnectionFactory;
pub use row::{FromRow, FromValue, Row};
pub use sqlite::{SqliteConnection, SqliteOptions, SqliteTransaction};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    /// Connection settings are missing, malformed, or name an unknown provider.
    Configuration(String),
    /// An operation was issued against an object that can no longer serve it.
    InvalidState(String),
    /// A driver call required an open connection but found it closed.
    ConnectionClosed,
    /// The driver cannot run the requested command shape.
    Unsupported(String),
    /// A row could not be projected into the requested type.
    Mapping(String),
    /// Failure reported by a non-SQLite driver implementation.
    Driver(String),
    Sqlite(rusqlite::Error),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(message) => write!(f, "configuration error: {message}"),
            Self::InvalidState(message) => write!(f, "invalid state: {message}"),
            Self::ConnectionClosed => write!(f, "connection is closed"),
            Self::Unsupported(message) => write!(f, "unsupported: {message}"),
            Self::Mapping(message) => write!(f, "row mapping failed: {message}"),
            Self::Driver(message) => write!(f, "{message}"),
            Self::Sqlite(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Configuration(_)
            | Self::InvalidState(_)
            | Self::ConnectionClosed
            | Self::Unsupported(_)
            | Self::Mapping(_)
            | Self::Driver(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl DbError {
    /// Stable machine-readable code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::InvalidState(_) => "invalid_state",
            Self::ConnectionClosed => "connection_closed",
            Self::Unsupported(_) => "unsupported",
            Self::Mapping(_) => "mapping",
            Self::Driver(_) => "driver",
            Self::Sqlite(_) => "sqlite",
        }
    }
}
