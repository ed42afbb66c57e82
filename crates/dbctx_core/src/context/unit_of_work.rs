//! One transactional scope on a `DbContext`.
//!
//! # Invariants
//! - A scope is finalized at most once: by commit, rollback, drop, or context
//!   teardown, whichever takes its transaction first.
//! - Finalizing always disposes the transaction handle and deregisters the
//!   scope, including when the commit or rollback itself fails.

use super::registry::{CleanupMode, ScopeEntry, ScopeId};
use super::{DbContext, TransactionOf};
use crate::db::{ConnectionFactory, DbError, DbResult, DbTransaction, IsolationLevel};
use log::{debug, error, warn};
use std::sync::Arc;

/// A unit of work started by `DbContext::begin` or `create_unit_of_work`.
///
/// Dropping it without `commit` rolls the transaction back.
pub struct UnitOfWork<'ctx, F: ConnectionFactory> {
    context: &'ctx DbContext<F>,
    entry: Arc<ScopeEntry<TransactionOf<F>>>,
}

impl<'ctx, F: ConnectionFactory> UnitOfWork<'ctx, F> {
    pub(super) fn new(
        context: &'ctx DbContext<F>,
        entry: Arc<ScopeEntry<TransactionOf<F>>>,
    ) -> Self {
        Self { context, entry }
    }

    pub fn id(&self) -> ScopeId {
        self.entry.id()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.entry.isolation_level()
    }

    /// Whether ending this unit of work also closes the connection.
    pub fn cleanup_mode(&self) -> CleanupMode {
        self.entry.cleanup()
    }

    /// `false` once committed, rolled back, or torn down with the context.
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Commits the transaction ("save changes").
    ///
    /// # Errors
    /// - `DbError::InvalidState` if the unit of work was already finalized.
    /// - The driver's commit failure. The scope is still deregistered and its
    ///   handle disposed, so the unit of work is finished either way.
    pub fn commit(&self) -> DbResult<()> {
        finalize_commit(self.context, &self.entry)
    }

    /// Rolls the transaction back. A no-op once finalized.
    pub fn rollback(&self) -> DbResult<()> {
        finalize_rollback(self.context, &self.entry).map(|_| ())
    }
}

impl<F: ConnectionFactory> Drop for UnitOfWork<'_, F> {
    fn drop(&mut self) {
        if let Err(err) = self.rollback() {
            warn!(
                "event=uow_dispose module=uow status=error scope={} error_code={} error={}",
                self.entry.id(),
                err.code(),
                err
            );
        }
    }
}

pub(super) fn finalize_commit<F: ConnectionFactory>(
    context: &DbContext<F>,
    entry: &ScopeEntry<TransactionOf<F>>,
) -> DbResult<()> {
    let Some(mut transaction) = entry.take_transaction() else {
        return Err(DbError::InvalidState(
            "cannot commit a unit of work more than once".to_string(),
        ));
    };

    let committed = transaction.commit();
    drop(transaction);
    let ended = context.end_scope(entry.id(), entry.cleanup());

    match committed {
        Ok(()) => {
            debug!("event=uow_commit module=uow status=ok scope={}", entry.id());
            ended
        }
        Err(err) => {
            error!(
                "event=uow_commit module=uow status=error scope={} error_code={} error={}",
                entry.id(),
                err.code(),
                err
            );
            if let Err(end_err) = ended {
                warn!(
                    "event=uow_end module=uow status=error scope={} error_code={} error={}",
                    entry.id(),
                    end_err.code(),
                    end_err
                );
            }
            Err(err)
        }
    }
}

/// Returns `Ok(false)` when the scope was already finalized.
pub(super) fn finalize_rollback<F: ConnectionFactory>(
    context: &DbContext<F>,
    entry: &ScopeEntry<TransactionOf<F>>,
) -> DbResult<bool> {
    let Some(mut transaction) = entry.take_transaction() else {
        return Ok(false);
    };

    let rolled_back = transaction.rollback();
    drop(transaction);
    let ended = context.end_scope(entry.id(), entry.cleanup());

    match rolled_back {
        Ok(()) => {
            debug!("event=uow_rollback module=uow status=ok scope={}", entry.id());
            ended.map(|()| true)
        }
        Err(err) => {
            error!(
                "event=uow_rollback module=uow status=error scope={} error_code={} error={}",
                entry.id(),
                err.code(),
                err
            );
            if let Err(end_err) = ended {
                warn!(
                    "event=uow_end module=uow status=error scope={} error_code={} error={}",
                    entry.id(),
                    end_err.code(),
                    end_err
                );
            }
            Err(err)
        }
    }
}
