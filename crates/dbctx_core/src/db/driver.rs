//! Contracts between the connection context and a database driver.
//!
//! # Responsibility
//! - Describe the capability set of a physical connection and transaction.
//! - Describe how the context hands statements to the driver.
//!
//! # Invariants
//! - Disposing a connection or transaction handle is expressed by dropping it.
//! - A driver never decides transaction scoping; it runs what it is handed.

use super::command::Command;
use super::row::Row;
use super::DbResult;
use std::fmt::{Display, Formatter};

/// Open/closed state of a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
}

/// Locking/consistency level requested for a physical transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadUncommitted => "read_uncommitted",
            Self::ReadCommitted => "read_committed",
            Self::RepeatableRead => "repeatable_read",
            Self::Serializable => "serializable",
        }
    }
}

impl Display for IsolationLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical transaction handle.
///
/// Dropping a handle that was neither committed nor rolled back must release
/// the transaction on the driver side.
pub trait DbTransaction: Send {
    fn commit(&mut self) -> DbResult<()>;
    fn rollback(&mut self) -> DbResult<()>;
}

/// Physical connection handle and statement-execution collaborator.
pub trait DbConnection: Send {
    type Transaction: DbTransaction;

    fn state(&self) -> ConnectionState;
    fn open(&mut self) -> DbResult<()>;
    fn close(&mut self) -> DbResult<()>;

    /// Begins a transaction. The connection must be open.
    fn begin_transaction(&mut self, isolation_level: IsolationLevel)
        -> DbResult<Self::Transaction>;

    /// Runs a row-returning command and returns its first result set.
    ///
    /// With `auto_open`, a closed connection is opened for the duration of
    /// the call and closed again afterwards.
    fn query(
        &mut self,
        command: &Command,
        transaction: Option<&Self::Transaction>,
        auto_open: bool,
    ) -> DbResult<Vec<Row>>;

    /// Runs a multi-statement command and returns every result set in order.
    fn query_multiple(
        &mut self,
        command: &Command,
        transaction: Option<&Self::Transaction>,
        auto_open: bool,
    ) -> DbResult<Vec<Vec<Row>>>;

    /// Runs a command on an open connection and returns the affected-row count.
    fn execute(
        &mut self,
        command: &Command,
        transaction: Option<&Self::Transaction>,
    ) -> DbResult<usize>;
}

/// Supplies new, closed connection handles.
pub trait ConnectionFactory: Send + Sync {
    type Connection: DbConnection;

    fn create(&self) -> DbResult<Self::Connection>;
}
