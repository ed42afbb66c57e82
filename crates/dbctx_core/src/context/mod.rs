//! Connection context: one lazily created connection plus nested units of work.
//!
//! # Responsibility
//! - Create the physical connection on first use and own it until teardown.
//! - Route every query/execute through the innermost active unit of work.
//! - Decide, per unit of work, whether ending it closes the connection.
//!
//! # Invariants
//! - At most one physical connection is ever created per context.
//! - The connection exists whenever a unit of work is registered.
//! - A unit of work that opened the connection closes it when it ends; one
//!   that found it open leaves it open.
//! - After `close`, the context refuses new work instead of reconnecting.
//!
//! # Locking
//! Lock order is connection → registry → scope transaction slot. Ending a
//! scope takes its transaction out of the slot first and then runs cleanup
//! with no lock held.

mod registry;
mod results;
mod unit_of_work;

pub use registry::{CleanupMode, ScopeId};
pub use results::{GridReader, QueryIter};
pub use unit_of_work::UnitOfWork;

use crate::config::ConnectionStrings;
use crate::db::{
    Command, ConnectionFactory, ConnectionState, DbConnection, DbConnectionFactory, DbError,
    DbResult, FromRow, IsolationLevel,
};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use registry::{ScopeEntry, ScopeRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

type TransactionOf<F> = <<F as ConnectionFactory>::Connection as DbConnection>::Transaction;

/// Coordinates one physical connection and the units of work running on it.
///
/// A context can be shared between threads. The unit of work opened most
/// recently is the current one for every caller, whichever thread opened it.
pub struct DbContext<F: ConnectionFactory> {
    factory: F,
    connection: Mutex<Option<F::Connection>>,
    scopes: ScopeRegistry<TransactionOf<F>>,
    closed: AtomicBool,
}

impl DbContext<DbConnectionFactory> {
    /// Builds a SQLite context for the connection string named `name`.
    pub fn from_config(config: &ConnectionStrings, name: &str) -> DbResult<Self> {
        Ok(Self::new(DbConnectionFactory::new(config, name)?))
    }
}

impl<F: ConnectionFactory> DbContext<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            connection: Mutex::new(None),
            scopes: ScopeRegistry::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Starts a unit of work at read-committed isolation.
    pub fn begin(&self) -> DbResult<UnitOfWork<'_, F>> {
        self.create_unit_of_work(IsolationLevel::default())
    }

    /// Starts a unit of work at `isolation_level`.
    ///
    /// If the connection is closed it is opened here, and the returned unit
    /// of work closes it again when it ends.
    ///
    /// # Errors
    /// - Factory, open, and begin failures are returned unchanged. When begin
    ///   fails on a connection opened by this call, the connection is closed
    ///   first and the registry is left untouched.
    pub fn create_unit_of_work(
        &self,
        isolation_level: IsolationLevel,
    ) -> DbResult<UnitOfWork<'_, F>> {
        let mut slot = self.connection.lock();
        let connection = self.ensure_connection(&mut slot)?;

        let was_closed = connection.state() == ConnectionState::Closed;
        if was_closed {
            connection.open()?;
        }

        let transaction = match connection.begin_transaction(isolation_level) {
            Ok(transaction) => transaction,
            Err(err) => {
                if was_closed {
                    if let Err(close_err) = connection.close() {
                        warn!(
                            "event=db_close module=context status=error error_code={} error={}",
                            close_err.code(),
                            close_err
                        );
                    }
                }
                error!(
                    "event=uow_begin module=context status=error isolation={} error_code={} error={}",
                    isolation_level,
                    err.code(),
                    err
                );
                return Err(err);
            }
        };

        let cleanup = if was_closed {
            CleanupMode::DeregisterAndClose
        } else {
            CleanupMode::DeregisterOnly
        };
        let entry = Arc::new(ScopeEntry::new(transaction, cleanup, isolation_level));
        self.scopes.push(Arc::clone(&entry));
        drop(slot);

        debug!(
            "event=uow_begin module=context status=ok scope={} isolation={} self_opened={} depth={}",
            entry.id(),
            isolation_level,
            was_closed,
            self.scopes.len()
        );
        Ok(UnitOfWork::new(self, entry))
    }

    /// Runs `work` inside a new unit of work: commit on `Ok`, rollback on `Err`.
    pub fn in_unit_of_work<T, E>(
        &self,
        isolation_level: IsolationLevel,
        work: impl FnOnce(&Self) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<DbError>,
    {
        let unit = self.create_unit_of_work(isolation_level)?;
        match work(self) {
            Ok(value) => {
                unit.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = unit.rollback() {
                    warn!(
                        "event=uow_rollback module=context status=error scope={} error_code={} error={}",
                        unit.id(),
                        rollback_err.code(),
                        rollback_err
                    );
                }
                Err(err)
            }
        }
    }

    /// Runs a row-returning command inside the current unit of work, if any.
    ///
    /// A closed connection is opened for the duration of the call only.
    pub fn query<T: FromRow>(&self, command: &Command) -> DbResult<QueryIter<T>> {
        let started_at = Instant::now();
        let mut slot = self.connection.lock();
        let connection = self.ensure_connection(&mut slot)?;
        let rows = self.with_current_transaction(|transaction| {
            connection.query(command, transaction, true)
        });
        drop(slot);

        self.log_command("query", started_at, &rows);
        Ok(QueryIter::new(rows?))
    }

    /// Runs a multi-statement command and returns its result sets in order.
    pub fn query_multiple(&self, command: &Command) -> DbResult<GridReader> {
        let started_at = Instant::now();
        let mut slot = self.connection.lock();
        let connection = self.ensure_connection(&mut slot)?;
        let sets = self.with_current_transaction(|transaction| {
            connection.query_multiple(command, transaction, true)
        });
        drop(slot);

        self.log_command("query_multiple", started_at, &sets);
        Ok(GridReader::new(sets?))
    }

    /// Runs a command inside the current unit of work and returns affected rows.
    ///
    /// A closed connection is opened for the call and always closed afterwards.
    pub fn execute(&self, command: &Command) -> DbResult<usize> {
        let started_at = Instant::now();
        let mut slot = self.connection.lock();
        let connection = self.ensure_connection(&mut slot)?;

        let was_closed = connection.state() == ConnectionState::Closed;
        if was_closed {
            connection.open()?;
        }
        let mut result =
            self.with_current_transaction(|transaction| connection.execute(command, transaction));
        if was_closed {
            if let Err(close_err) = connection.close() {
                if result.is_ok() {
                    result = Err(close_err);
                } else {
                    warn!(
                        "event=db_close module=context status=error error_code={} error={}",
                        close_err.code(),
                        close_err
                    );
                }
            }
        }
        drop(slot);

        self.log_command("execute", started_at, &result);
        result
    }

    /// Tears the context down: rolls back every active unit of work, innermost
    /// first, then closes and drops the connection.
    ///
    /// Calling it again is a no-op. Every step runs even if an earlier one
    /// fails; the first failure is returned.
    pub fn close(&self) -> DbResult<()> {
        let was_closed = self.closed.swap(true, Ordering::AcqRel);
        let mut first_error = None;
        let mut rolled_back = 0_usize;

        // A begin already past the closed check holds the connection lock until
        // its scope is registered, so drain again once the lock is ours.
        let connection = loop {
            while let Some(entry) = self.scopes.pop_innermost() {
                match unit_of_work::finalize_rollback(self, &entry) {
                    Ok(true) => rolled_back += 1,
                    Ok(false) => {}
                    Err(err) => {
                        first_error.get_or_insert(err);
                    }
                }
            }

            let mut slot = self.connection.lock();
            if self.scopes.is_empty() {
                break slot.take();
            }
        };
        if let Some(mut connection) = connection {
            if connection.state() == ConnectionState::Open {
                if let Err(err) = connection.close() {
                    first_error.get_or_insert(err);
                }
            }
        }

        if !was_closed {
            match &first_error {
                None => info!(
                    "event=context_close module=context status=ok rolled_back={}",
                    rolled_back
                ),
                Some(err) => error!(
                    "event=context_close module=context status=error rolled_back={} error_code={} error={}",
                    rolled_back,
                    err.code(),
                    err
                ),
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// State of the physical connection; `Closed` before it is first created.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection
            .lock()
            .as_ref()
            .map_or(ConnectionState::Closed, |connection| connection.state())
    }

    pub fn has_connection(&self) -> bool {
        self.connection.lock().is_some()
    }

    pub fn active_scopes(&self) -> usize {
        self.scopes.len()
    }

    /// Active units of work, innermost first.
    pub fn scope_ids(&self) -> Vec<ScopeId> {
        self.scopes.ids()
    }

    /// The unit of work whose transaction the next query or execute binds to.
    pub fn current_scope(&self) -> Option<ScopeId> {
        self.scopes.innermost().map(|entry| entry.id())
    }

    fn ensure_connection<'a>(
        &self,
        slot: &'a mut Option<F::Connection>,
    ) -> DbResult<&'a mut F::Connection> {
        if self.is_closed() {
            return Err(DbError::InvalidState(
                "database context has been closed".to_string(),
            ));
        }

        let connection = match slot.take() {
            Some(connection) => connection,
            None => {
                let connection = self.factory.create().map_err(|err| {
                    error!(
                        "event=connection_create module=context status=error error_code={} error={}",
                        err.code(),
                        err
                    );
                    err
                })?;
                debug!("event=connection_create module=context status=ok");
                connection
            }
        };
        Ok(slot.insert(connection))
    }

    /// Calls `work` with the innermost active transaction, holding its slot
    /// so the scope cannot finalize mid-statement. Scopes that are finalized
    /// but not yet deregistered are skipped.
    fn with_current_transaction<R>(
        &self,
        work: impl FnOnce(Option<&TransactionOf<F>>) -> DbResult<R>,
    ) -> DbResult<R> {
        loop {
            let Some(entry) = self.scopes.innermost() else {
                return work(None);
            };
            let transaction = entry.transaction().lock();
            // Finalized between the lookup and the lock; look again.
            if transaction.is_some() {
                return work(transaction.as_ref());
            }
        }
    }

    /// Deregisters a finished scope and applies its cleanup mode.
    fn end_scope(&self, id: ScopeId, cleanup: CleanupMode) -> DbResult<()> {
        let deregistered = self.scopes.remove(id).is_some();
        let mut closed_connection = false;

        if cleanup == CleanupMode::DeregisterAndClose {
            let mut slot = self.connection.lock();
            if let Some(connection) = slot.as_mut() {
                if connection.state() == ConnectionState::Open {
                    connection.close()?;
                    closed_connection = true;
                }
            }
        }

        debug!(
            "event=uow_end module=context status=ok scope={} deregistered={} closed_connection={} depth={}",
            id,
            deregistered,
            closed_connection,
            self.scopes.len()
        );
        Ok(())
    }

    fn log_command<T>(&self, operation: &str, started_at: Instant, result: &DbResult<T>) {
        match result {
            Ok(_) => debug!(
                "event=db_{} module=context status=ok depth={} duration_ms={}",
                operation,
                self.scopes.len(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=db_{} module=context status=error depth={} duration_ms={} error_code={} error={}",
                operation,
                self.scopes.len(),
                started_at.elapsed().as_millis(),
                err.code(),
                err
            ),
        }
    }
}

impl<F: ConnectionFactory> Drop for DbContext<F> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(
                "event=context_dispose module=context status=error error_code={} error={}",
                err.code(),
                err
            );
        }
    }
}
