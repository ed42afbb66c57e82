//! Scripted driver that records every call and can be told to fail.

#![allow(dead_code)]

use dbctx_core::{
    Command, ConnectionFactory, ConnectionState, DbConnection, DbError, DbResult, DbTransaction,
    IsolationLevel, Row,
};
use rusqlite::types::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Create,
    Open,
    Close,
    DropConnection,
    Begin(i64),
    Commit(i64),
    Rollback(i64),
    Dispose(i64),
    Query(Option<i64>),
    Execute(Option<i64>),
}

/// Holds `begin_transaction` until released.
#[derive(Default)]
struct BeginGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    armed: bool,
    waiting: bool,
}

impl BeginGate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.armed {
            return;
        }
        state.waiting = true;
        self.changed.notify_all();
        while state.armed {
            state = self.changed.wait(state).unwrap();
        }
        state.waiting = false;
    }
}

#[derive(Default)]
struct Script {
    begin_gate: BeginGate,
    events: Mutex<Vec<Event>>,
    next_tx: AtomicI64,
    fail_create: AtomicBool,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
    fail_execute: AtomicBool,
}

impl Script {
    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// Factory handle; clones share the same script and journal.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.script.events.lock().unwrap().clone()
    }

    pub fn count(&self, wanted: impl Fn(&Event) -> bool) -> usize {
        self.events().iter().filter(|event| wanted(event)).count()
    }

    pub fn clear(&self) {
        self.script.events.lock().unwrap().clear();
    }

    pub fn fail_create(&self, fail: bool) {
        self.script.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_begin(&self, fail: bool) {
        self.script.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.script.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.script.fail_rollback.store(fail, Ordering::SeqCst);
    }

    pub fn fail_execute(&self, fail: bool) {
        self.script.fail_execute.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `begin_transaction` calls block until `release_begin`.
    pub fn hold_begin(&self) {
        self.script.begin_gate.state.lock().unwrap().armed = true;
    }

    /// Blocks until a `begin_transaction` call is parked at the gate.
    pub fn wait_for_held_begin(&self) {
        let gate = &self.script.begin_gate;
        let mut state = gate.state.lock().unwrap();
        while !state.waiting {
            state = gate.changed.wait(state).unwrap();
        }
    }

    pub fn release_begin(&self) {
        let gate = &self.script.begin_gate;
        gate.state.lock().unwrap().armed = false;
        gate.changed.notify_all();
    }
}

impl ConnectionFactory for ScriptedFactory {
    type Connection = ScriptedConnection;

    fn create(&self) -> DbResult<ScriptedConnection> {
        if self.script.fail_create.load(Ordering::SeqCst) {
            return Err(DbError::Configuration(
                "scripted factory has no connection".to_string(),
            ));
        }
        self.script.record(Event::Create);
        Ok(ScriptedConnection {
            script: Arc::clone(&self.script),
            state: ConnectionState::Closed,
        })
    }
}

pub struct ScriptedConnection {
    script: Arc<Script>,
    state: ConnectionState,
}

impl ScriptedConnection {
    /// One row with a `tx` column holding the bound transaction id, or NULL.
    fn tx_row(transaction: Option<&ScriptedTransaction>) -> Row {
        let columns: Arc<[String]> = vec!["tx".to_string()].into();
        let value = transaction.map_or(Value::Null, |tx| Value::Integer(tx.id));
        Row::new(columns, vec![value])
    }
}

impl DbConnection for ScriptedConnection {
    type Transaction = ScriptedTransaction;

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn open(&mut self) -> DbResult<()> {
        self.script.record(Event::Open);
        self.state = ConnectionState::Open;
        Ok(())
    }

    fn close(&mut self) -> DbResult<()> {
        self.script.record(Event::Close);
        self.state = ConnectionState::Closed;
        Ok(())
    }

    fn begin_transaction(
        &mut self,
        _isolation_level: IsolationLevel,
    ) -> DbResult<ScriptedTransaction> {
        if self.state == ConnectionState::Closed {
            return Err(DbError::ConnectionClosed);
        }
        self.script.begin_gate.pass();
        if self.script.fail_begin.load(Ordering::SeqCst) {
            return Err(DbError::Driver("begin failed".to_string()));
        }
        let id = self.script.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        self.script.record(Event::Begin(id));
        Ok(ScriptedTransaction {
            id,
            script: Arc::clone(&self.script),
        })
    }

    fn query(
        &mut self,
        _command: &Command,
        transaction: Option<&ScriptedTransaction>,
        auto_open: bool,
    ) -> DbResult<Vec<Row>> {
        let opened_here = self.state == ConnectionState::Closed;
        if opened_here && !auto_open {
            return Err(DbError::ConnectionClosed);
        }
        if opened_here {
            self.open()?;
        }
        self.script.record(Event::Query(transaction.map(|tx| tx.id)));
        let rows = vec![Self::tx_row(transaction)];
        if opened_here {
            self.close()?;
        }
        Ok(rows)
    }

    fn query_multiple(
        &mut self,
        command: &Command,
        transaction: Option<&ScriptedTransaction>,
        auto_open: bool,
    ) -> DbResult<Vec<Vec<Row>>> {
        let first = self.query(command, transaction, auto_open)?;
        Ok(vec![first.clone(), first])
    }

    fn execute(
        &mut self,
        _command: &Command,
        transaction: Option<&ScriptedTransaction>,
    ) -> DbResult<usize> {
        if self.state == ConnectionState::Closed {
            return Err(DbError::ConnectionClosed);
        }
        if self.script.fail_execute.load(Ordering::SeqCst) {
            return Err(DbError::Driver("execute failed".to_string()));
        }
        self.script.record(Event::Execute(transaction.map(|tx| tx.id)));
        Ok(1)
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        self.script.record(Event::DropConnection);
    }
}

pub struct ScriptedTransaction {
    id: i64,
    script: Arc<Script>,
}

impl DbTransaction for ScriptedTransaction {
    fn commit(&mut self) -> DbResult<()> {
        if self.script.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::Driver("commit failed".to_string()));
        }
        self.script.record(Event::Commit(self.id));
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        if self.script.fail_rollback.load(Ordering::SeqCst) {
            return Err(DbError::Driver("rollback failed".to_string()));
        }
        self.script.record(Event::Rollback(self.id));
        Ok(())
    }
}

impl Drop for ScriptedTransaction {
    fn drop(&mut self) {
        self.script.record(Event::Dispose(self.id));
    }
}
