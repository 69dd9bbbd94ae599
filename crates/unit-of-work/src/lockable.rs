//! Unit of work guarded by a named advisory lock.

use std::time::Duration;

use crate::error::{with_cleanup, Result};
use crate::lock::{Lock, LockFactory};
use crate::scope::OperationScope;
use crate::unit_of_work::{Client, UnitOfWork, UnitOfWorkFactory};

/// Combines [`LockFactory`] and [`UnitOfWorkFactory`] over one pool.
#[derive(Clone)]
pub struct LockableUnitOfWorkFactory {
    locks: LockFactory,
    units: UnitOfWorkFactory,
}

impl LockableUnitOfWorkFactory {
    pub fn new(locks: LockFactory, units: UnitOfWorkFactory) -> Self {
        Self { locks, units }
    }

    /// Take `lock_name`, then begin a unit of work on the same scope.
    ///
    /// An empty `lock_name` skips locking. If the unit of work cannot begin,
    /// the lock is released before the (joined) error is returned.
    pub async fn begin(
        &self,
        scope: &OperationScope,
        lock_name: &str,
        timeout: Duration,
    ) -> Result<LockableUnitOfWork> {
        if lock_name.is_empty() {
            let unit = self.units.begin(scope).await?;
            return Ok(LockableUnitOfWork { unit, lock: None });
        }

        let lock = self.locks.new_lock(scope, lock_name, timeout).await?;
        match self.units.begin(scope).await {
            Ok(unit) => Ok(LockableUnitOfWork {
                unit,
                lock: Some(lock),
            }),
            Err(e) => {
                let unlock = lock.unlock().await;
                with_cleanup(Err(e), unlock)
            }
        }
    }

    pub fn units(&self) -> &UnitOfWorkFactory {
        &self.units
    }

    pub fn locks(&self) -> &LockFactory {
        &self.locks
    }
}

/// A unit of work that holds its lock until completion.
pub struct LockableUnitOfWork {
    unit: UnitOfWork,
    lock: Option<Lock>,
}

impl LockableUnitOfWork {
    pub fn scope(&self) -> &OperationScope {
        self.unit.scope()
    }

    pub fn client(&self) -> Client<'_> {
        self.unit.client()
    }

    /// Whether a lock is held.
    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Complete the unit of work, then release the lock.
    ///
    /// The lock is released whatever the transaction outcome; errors from
    /// both are joined.
    pub async fn complete<T>(self, result: Result<T>) -> Result<T> {
        let Self { unit, lock } = self;
        let result = unit.complete(result).await;
        match lock {
            Some(lock) => {
                let unlock = lock.unlock().await;
                with_cleanup(result, unlock)
            }
            None => result,
        }
    }
}
