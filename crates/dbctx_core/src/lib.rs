//! Connection context and unit-of-work coordination over SQLite.
//! One context owns one lazily created connection; units of work nest on it.

pub mod config;
pub mod context;
pub mod db;
pub mod logging;

pub use config::{ConnectionStringSettings, ConnectionStrings};
pub use context::{CleanupMode, DbContext, GridReader, QueryIter, ScopeId, UnitOfWork};
pub use db::{
    Command, CommandKind, ConnectionFactory, ConnectionState, DbConnection, DbConnectionFactory,
    DbError, DbResult, DbTransaction, FromRow, FromValue, IsolationLevel, Params, Row,
    SqliteConnection, SqliteOptions, SqliteTransaction,
};
pub use logging::{default_log_level, init_logging, init_logging_from_env, logging_status};

/// SQLite context built from a named connection string.
pub type SqliteContext = DbContext<DbConnectionFactory>;

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
