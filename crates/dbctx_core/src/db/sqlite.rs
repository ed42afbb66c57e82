//! SQLite implementation of the driver contracts.
//!
//! # Responsibility
//! - Open and configure SQLite sessions from parsed connection options.
//! - Map root transactions to `BEGIN` and nested ones to named savepoints.
//! - Run commands statement by statement, binding named parameters.
//!
//! # Invariants
//! - Returned sessions have `foreign_keys` and `busy_timeout` applied.
//! - A transaction handle only works against the session that created it;
//!   closing the connection invalidates every handle of that session.
//! - An unfinished transaction handle rolls back when dropped.
//! - Savepoints end newest first. Ending an older one first discards every
//!   newer savepoint, and the handles of those become dead.

use super::command::{Command, CommandKind, Params};
use super::driver::{ConnectionState, DbConnection, DbTransaction, IsolationLevel};
use super::row::Row;
use super::{DbError, DbResult};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Value;
use rusqlite::{Batch, Connection, OpenFlags, Statement};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MEMORY_DATA_SOURCE: &str = ":memory:";
const DISCARDED_SAVEPOINT: &str = "savepoint was discarded when an enclosing unit of work ended";

/// Parsed SQLite connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteOptions {
    /// Database file path, or `:memory:`.
    pub data_source: String,
    pub busy_timeout: Duration,
    pub foreign_keys: bool,
    pub read_only: bool,
}

impl SqliteOptions {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            data_source: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            foreign_keys: true,
            read_only: false,
        }
    }

    /// In-memory database. Its content is lost every time the connection closes.
    pub fn in_memory() -> Self {
        Self::file(MEMORY_DATA_SOURCE)
    }

    /// Parses `key=value;` pairs such as `Data Source=app.db;Busy Timeout=2000`.
    ///
    /// Keys are case-insensitive and ignore spaces/underscores.
    pub fn parse(connection_string: &str) -> DbResult<Self> {
        let mut options = Self::file(String::new());
        for segment in connection_string.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (raw_key, value) = segment.split_once('=').ok_or_else(|| {
                DbError::Configuration(format!(
                    "malformed connection string segment `{segment}`; expected key=value"
                ))
            })?;
            let key = raw_key.trim().to_ascii_lowercase().replace([' ', '_'], "");
            let value = value.trim();
            match key.as_str() {
                "datasource" | "filename" => options.data_source = value.to_string(),
                "busytimeout" => {
                    let millis = value.parse::<u64>().map_err(|_| {
                        DbError::Configuration(format!(
                            "`Busy Timeout` must be milliseconds, got `{value}`"
                        ))
                    })?;
                    options.busy_timeout = Duration::from_millis(millis);
                }
                "foreignkeys" => options.foreign_keys = parse_flag("Foreign Keys", value)?,
                "readonly" => options.read_only = parse_flag("Read Only", value)?,
                _ => {
                    return Err(DbError::Configuration(format!(
                        "unsupported connection string key `{}`",
                        raw_key.trim()
                    )));
                }
            }
        }

        if options.data_source.is_empty() {
            return Err(DbError::Configuration(
                "connection string is missing `Data Source`".to_string(),
            ));
        }
        Ok(options)
    }

    fn is_memory(&self) -> bool {
        self.data_source == MEMORY_DATA_SOURCE
    }
}

fn parse_flag(key: &str, value: &str) -> DbResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(DbError::Configuration(format!(
            "`{key}` must be a boolean, got `{value}`"
        ))),
    }
}

/// Physical session shared by a connection and its transaction handles.
struct Session {
    conn: Option<Connection>,
    /// Bumped on every open so handles from an earlier session are detectable.
    generation: u64,
    /// Open savepoint names, oldest first.
    savepoints: Vec<String>,
}

impl Session {
    fn live(&self) -> DbResult<&Connection> {
        self.conn.as_ref().ok_or(DbError::ConnectionClosed)
    }

    fn savepoint_depth(&self, name: &str) -> Option<usize> {
        self.savepoints.iter().rposition(|open| open == name)
    }

    /// Rolls back and releases every savepoint above `depth`, newest first.
    fn discard_savepoints_above(&mut self, depth: usize) -> DbResult<usize> {
        let conn = self.conn.as_ref().ok_or(DbError::ConnectionClosed)?;
        let mut discarded = 0;
        while self.savepoints.len() > depth {
            let Some(name) = self.savepoints.last() else {
                break;
            };
            conn.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};"
            ))?;
            self.savepoints.pop();
            discarded += 1;
        }
        Ok(discarded)
    }
}

/// SQLite connection handle. Created closed; `open` starts a session.
pub struct SqliteConnection {
    options: SqliteOptions,
    session: Arc<Mutex<Session>>,
}

impl SqliteConnection {
    pub fn new(options: SqliteOptions) -> Self {
        Self {
            options,
            session: Arc::new(Mutex::new(Session {
                conn: None,
                generation: 0,
                savepoints: Vec::new(),
            })),
        }
    }

    pub fn options(&self) -> &SqliteOptions {
        &self.options
    }

    fn open_session(&self) -> DbResult<Connection> {
        let conn = if self.options.is_memory() {
            Connection::open_in_memory()?
        } else if self.options.read_only {
            Connection::open_with_flags(
                &self.options.data_source,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            Connection::open(&self.options.data_source)?
        };

        let foreign_keys = if self.options.foreign_keys { "ON" } else { "OFF" };
        conn.execute_batch(&format!("PRAGMA foreign_keys = {foreign_keys};"))?;
        conn.busy_timeout(self.options.busy_timeout)?;
        Ok(conn)
    }

    /// Runs `work` on the live session with the command timeout applied.
    fn with_session<T>(
        &self,
        command: &Command,
        transaction: Option<&SqliteTransaction>,
        work: impl FnOnce(&Connection) -> DbResult<T>,
    ) -> DbResult<T> {
        if command.kind == CommandKind::StoredProcedure {
            return Err(DbError::Unsupported(
                "sqlite has no stored procedures".to_string(),
            ));
        }

        let session = self.session.lock();
        let conn = session.live()?;
        if let Some(transaction) = transaction {
            transaction.ensure_bound_to(&self.session, &session)?;
        }

        let Some(timeout) = command.timeout else {
            return work(conn);
        };
        conn.busy_timeout(timeout)?;
        let result = work(conn);
        let restored = conn.busy_timeout(self.options.busy_timeout);
        match (result, restored) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), _) => Err(err),
        }
    }

    /// Opens the session around `work` when it is closed and `auto_open` is set.
    fn with_auto_open<T>(
        &mut self,
        auto_open: bool,
        work: impl FnOnce(&Self) -> DbResult<T>,
    ) -> DbResult<T> {
        let opened_here = auto_open && self.state() == ConnectionState::Closed;
        if opened_here {
            self.open()?;
        }
        let result = work(self);
        if opened_here {
            if let Err(err) = self.close() {
                if result.is_ok() {
                    return Err(err);
                }
                warn!(
                    "event=db_close module=sqlite status=error error_code={} error={}",
                    err.code(),
                    err
                );
            }
        }
        result
    }
}

impl DbConnection for SqliteConnection {
    type Transaction = SqliteTransaction;

    fn state(&self) -> ConnectionState {
        if self.session.lock().conn.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    fn open(&mut self) -> DbResult<()> {
        if self.state() == ConnectionState::Open {
            return Ok(());
        }

        let started_at = Instant::now();
        let mode = if self.options.is_memory() { "memory" } else { "file" };
        match self.open_session() {
            Ok(conn) => {
                let mut session = self.session.lock();
                session.conn = Some(conn);
                session.generation += 1;
                session.savepoints.clear();
                info!(
                    "event=db_open module=sqlite status=ok mode={} generation={} duration_ms={}",
                    mode,
                    session.generation,
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=db_open module=sqlite status=error mode={} duration_ms={} error_code={} error={}",
                    mode,
                    started_at.elapsed().as_millis(),
                    err.code(),
                    err
                );
                Err(err)
            }
        }
    }

    fn close(&mut self) -> DbResult<()> {
        let conn = {
            let mut session = self.session.lock();
            session.savepoints.clear();
            session.conn.take()
        };
        let Some(conn) = conn else {
            return Ok(());
        };

        // A failed close hands the connection back; dropping it still releases
        // the session, so the handle ends up closed either way.
        match conn.close() {
            Ok(()) => {
                info!("event=db_close module=sqlite status=ok");
                Ok(())
            }
            Err((conn, err)) => {
                drop(conn);
                error!(
                    "event=db_close module=sqlite status=error error={}",
                    err
                );
                Err(err.into())
            }
        }
    }

    fn begin_transaction(
        &mut self,
        isolation_level: IsolationLevel,
    ) -> DbResult<SqliteTransaction> {
        let mut session = self.session.lock();

        let kind = if session.live()?.is_autocommit() {
            session.live()?.execute_batch(begin_sql(isolation_level))?;
            session.savepoints.clear();
            TransactionKind::Root
        } else {
            let name = format!("uow_{}", Uuid::new_v4().simple());
            session.live()?.execute_batch(&format!("SAVEPOINT {name};"))?;
            session.savepoints.push(name.clone());
            TransactionKind::Savepoint(name)
        };
        debug!(
            "event=tx_begin module=sqlite status=ok kind={} isolation={}",
            kind.label(),
            isolation_level
        );

        Ok(SqliteTransaction {
            session: Arc::clone(&self.session),
            generation: session.generation,
            kind,
            finished: false,
        })
    }

    fn query(
        &mut self,
        command: &Command,
        transaction: Option<&SqliteTransaction>,
        auto_open: bool,
    ) -> DbResult<Vec<Row>> {
        let sets = self.query_multiple(command, transaction, auto_open)?;
        Ok(sets.into_iter().next().unwrap_or_default())
    }

    fn query_multiple(
        &mut self,
        command: &Command,
        transaction: Option<&SqliteTransaction>,
        auto_open: bool,
    ) -> DbResult<Vec<Vec<Row>>> {
        self.with_auto_open(auto_open, |this| {
            this.with_session(command, transaction, |conn| {
                run_result_sets(conn, &command.sql, &command.params)
            })
        })
    }

    fn execute(
        &mut self,
        command: &Command,
        transaction: Option<&SqliteTransaction>,
    ) -> DbResult<usize> {
        self.with_session(command, transaction, |conn| {
            run_statements(conn, &command.sql, &command.params)
        })
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        // Handles may outlive the connection; make sure none of them keeps the
        // physical session alive.
        if let Err(err) = self.close() {
            warn!(
                "event=db_dispose module=sqlite status=error error_code={} error={}",
                err.code(),
                err
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TransactionKind {
    Root,
    Savepoint(String),
}

impl TransactionKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Savepoint(_) => "savepoint",
        }
    }
}

/// SQLite transaction handle: a root `BEGIN` or a nested savepoint.
pub struct SqliteTransaction {
    session: Arc<Mutex<Session>>,
    generation: u64,
    kind: TransactionKind,
    finished: bool,
}

impl SqliteTransaction {
    pub fn is_savepoint(&self) -> bool {
        matches!(self.kind, TransactionKind::Savepoint(_))
    }

    fn ensure_bound_to(&self, session: &Arc<Mutex<Session>>, live: &Session) -> DbResult<()> {
        if !Arc::ptr_eq(&self.session, session) {
            return Err(DbError::InvalidState(
                "transaction belongs to a different connection".to_string(),
            ));
        }
        if self.finished {
            return Err(DbError::InvalidState(
                "transaction has already completed".to_string(),
            ));
        }
        if self.generation != live.generation {
            return Err(DbError::InvalidState(
                "transaction belongs to a connection session that was closed".to_string(),
            ));
        }
        if let TransactionKind::Savepoint(name) = &self.kind {
            if live.savepoint_depth(name).is_none() {
                return Err(DbError::InvalidState(DISCARDED_SAVEPOINT.to_string()));
            }
        }
        Ok(())
    }

    /// Locks the session this handle belongs to, rejecting finished or stale handles.
    fn lock_session(&self) -> DbResult<MutexGuard<'_, Session>> {
        if self.finished {
            return Err(DbError::InvalidState(
                "transaction has already completed".to_string(),
            ));
        }
        let session = self.session.lock();
        session.live()?;
        if session.generation != self.generation {
            return Err(DbError::InvalidState(
                "transaction belongs to a connection session that was closed".to_string(),
            ));
        }
        Ok(session)
    }

    fn log_finished(&self, action: &str, discarded: usize) {
        if discarded > 0 {
            warn!(
                "event=tx_{} module=sqlite status=ok kind={} discarded_savepoints={}",
                action,
                self.kind.label(),
                discarded
            );
        } else {
            debug!("event=tx_{} module=sqlite status=ok kind={}", action, self.kind.label());
        }
    }
}

impl DbTransaction for SqliteTransaction {
    /// Commits the root transaction or releases the savepoint.
    ///
    /// Savepoints opened after this one and still open are rolled back first,
    /// so only work whose scope already ended is kept.
    fn commit(&mut self) -> DbResult<()> {
        let mut session = self.lock_session()?;
        let discarded = match &self.kind {
            TransactionKind::Root => {
                let discarded = session.discard_savepoints_above(0)?;
                session.live()?.execute_batch("COMMIT;")?;
                discarded
            }
            TransactionKind::Savepoint(name) => {
                let depth = session
                    .savepoint_depth(name)
                    .ok_or_else(|| DbError::InvalidState(DISCARDED_SAVEPOINT.to_string()))?;
                let discarded = session.discard_savepoints_above(depth + 1)?;
                session
                    .live()?
                    .execute_batch(&format!("RELEASE SAVEPOINT {name};"))?;
                session.savepoints.truncate(depth);
                discarded
            }
        };
        drop(session);
        self.finished = true;
        self.log_finished("commit", discarded);
        Ok(())
    }

    /// Rolls back the root transaction or the savepoint and everything above it.
    ///
    /// A savepoint already discarded by an enclosing scope counts as rolled back.
    fn rollback(&mut self) -> DbResult<()> {
        let mut session = self.lock_session()?;
        let discarded = match &self.kind {
            TransactionKind::Root => {
                session.live()?.execute_batch("ROLLBACK;")?;
                let discarded = session.savepoints.len();
                session.savepoints.clear();
                discarded
            }
            TransactionKind::Savepoint(name) => match session.savepoint_depth(name) {
                Some(depth) => {
                    let discarded = session.discard_savepoints_above(depth + 1)?;
                    session.live()?.execute_batch(&format!(
                        "ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};"
                    ))?;
                    session.savepoints.truncate(depth);
                    discarded
                }
                None => 0,
            },
        };
        drop(session);
        self.finished = true;
        self.log_finished("rollback", discarded);
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.rollback() {
            Ok(()) => {}
            // Closing the session already discarded the transaction.
            Err(DbError::ConnectionClosed) | Err(DbError::InvalidState(_)) => {}
            Err(err) => warn!(
                "event=tx_dispose module=sqlite status=error kind={} error_code={} error={}",
                self.kind.label(),
                err.code(),
                err
            ),
        }
    }
}

fn begin_sql(isolation_level: IsolationLevel) -> &'static str {
    match isolation_level {
        IsolationLevel::ReadUncommitted | IsolationLevel::ReadCommitted => "BEGIN DEFERRED;",
        IsolationLevel::RepeatableRead => "BEGIN IMMEDIATE;",
        IsolationLevel::Serializable => "BEGIN EXCLUSIVE;",
    }
}

fn bind_params(stmt: &mut Statement<'_>, params: &Params) -> DbResult<()> {
    for (name, value) in params.iter() {
        if let Some(index) = stmt.parameter_index(name)? {
            stmt.raw_bind_parameter(index, value)?;
        }
    }
    Ok(())
}

/// Runs every statement in `sql`, collecting one result set per row-returning statement.
fn run_result_sets(conn: &Connection, sql: &str, params: &Params) -> DbResult<Vec<Vec<Row>>> {
    let mut batch = Batch::new(conn, sql);
    let mut sets = Vec::new();

    while let Some(mut stmt) = batch.next()? {
        bind_params(&mut stmt, params)?;
        if stmt.column_count() == 0 {
            stmt.raw_execute()?;
            continue;
        }

        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into();
        let width = columns.len();
        let mut rows = stmt.raw_query();
        let mut set = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for index in 0..width {
                values.push(row.get::<_, Value>(index)?);
            }
            set.push(Row::new(Arc::clone(&columns), values));
        }
        sets.push(set);
    }

    Ok(sets)
}

/// Runs every statement in `sql` and sums the rows they changed.
fn run_statements(conn: &Connection, sql: &str, params: &Params) -> DbResult<usize> {
    let mut batch = Batch::new(conn, sql);
    let mut affected = 0;

    while let Some(mut stmt) = batch.next()? {
        bind_params(&mut stmt, params)?;
        if stmt.column_count() == 0 {
            affected += stmt.raw_execute()?;
        } else {
            let mut rows = stmt.raw_query();
            while rows.next()?.is_some() {}
        }
    }

    Ok(affected)
}
