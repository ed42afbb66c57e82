//! Ordered registry of active units of work.
//!
//! # Invariants
//! - Iteration order is most recent first; nothing here ever promotes an entry.
//! - Reads share the lock; push/remove/pop take it exclusively.

use crate::db::IsolationLevel;
use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockUpgradableReadGuard};
use std::sync::Arc;
use uuid::Uuid;

/// Stable identity of one unit of work.
pub type ScopeId = Uuid;

/// What the context does when a scope ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// The connection was already open; only forget the scope.
    DeregisterOnly,
    /// The scope opened the connection; forget it and close the connection.
    DeregisterAndClose,
}

/// Registry-side state of one scope, shared with its `UnitOfWork`.
pub(crate) struct ScopeEntry<T> {
    id: ScopeId,
    cleanup: CleanupMode,
    isolation_level: IsolationLevel,
    /// Empty once the scope is finalized.
    transaction: Mutex<Option<T>>,
}

impl<T> ScopeEntry<T> {
    pub(crate) fn new(
        transaction: T,
        cleanup: CleanupMode,
        isolation_level: IsolationLevel,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            cleanup,
            isolation_level,
            transaction: Mutex::new(Some(transaction)),
        }
    }

    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }

    pub(crate) fn cleanup(&self) -> CleanupMode {
        self.cleanup
    }

    pub(crate) fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub(crate) fn transaction(&self) -> &Mutex<Option<T>> {
        &self.transaction
    }

    /// Takes the transaction out, finalizing the scope. `None` if already finalized.
    pub(crate) fn take_transaction(&self) -> Option<T> {
        self.transaction.lock().take()
    }

    pub(crate) fn is_active(&self) -> bool {
        self.transaction.lock().is_some()
    }
}

pub(crate) struct ScopeRegistry<T> {
    entries: RwLock<LruCache<ScopeId, Arc<ScopeEntry<T>>>>,
}

impl<T> ScopeRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(LruCache::unbounded()),
        }
    }

    pub(crate) fn push(&self, entry: Arc<ScopeEntry<T>>) {
        self.entries.write().put(entry.id(), entry);
    }

    /// Removes `id` if present; the exclusive lock is only taken when it is.
    pub(crate) fn remove(&self, id: ScopeId) -> Option<Arc<ScopeEntry<T>>> {
        let entries = self.entries.upgradable_read();
        if !entries.contains(&id) {
            return None;
        }
        RwLockUpgradableReadGuard::upgrade(entries).pop(&id)
    }

    /// Most recently pushed entry that is registered and not yet finalized.
    pub(crate) fn innermost(&self) -> Option<Arc<ScopeEntry<T>>> {
        self.entries
            .read()
            .iter()
            .map(|(_, entry)| entry)
            .find(|entry| entry.is_active())
            .map(Arc::clone)
    }

    /// Selects and pops the innermost entry in one step, for teardown.
    pub(crate) fn pop_innermost(&self) -> Option<Arc<ScopeEntry<T>>> {
        let entries = self.entries.upgradable_read();
        let id = entries.iter().next().map(|(id, _)| *id)?;
        RwLockUpgradableReadGuard::upgrade(entries).pop(&id)
    }

    /// Ids from innermost to outermost.
    pub(crate) fn ids(&self) -> Vec<ScopeId> {
        self.entries.read().iter().map(|(id, _)| *id).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
