//! Operation scopes: the sharing key for pooled resources.
//!
//! A scope pairs an explicit [`OperationId`] with a cancellation signal.
//! Pools key on the id only; the signal is consulted while waiting for a new
//! physical connection.

use std::fmt;

use tokio::sync::watch;
use uuid::Uuid;

/// Identifier of one logical unit of work (e.g. a request id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OperationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity and cancellation boundary of one logical operation.
///
/// Clones share both the id and the cancellation signal, so every
/// participant of the operation joins the same pooled connection and
/// transaction.
#[derive(Debug, Clone)]
pub struct OperationScope {
    id: OperationId,
    cancelled: watch::Receiver<bool>,
}

/// Cancels the scope it was created with.
#[derive(Debug)]
pub struct ScopeCanceller(watch::Sender<bool>);

impl OperationScope {
    /// Scope with a fresh id that is never cancelled.
    pub fn new() -> Self {
        Self::with_id(OperationId::new())
    }

    /// Scope for an existing id that is never cancelled.
    pub fn with_id(id: OperationId) -> Self {
        let (_, cancelled) = watch::channel(false);
        Self { id, cancelled }
    }

    /// Scope with a fresh id plus the handle that cancels it.
    pub fn cancellable() -> (Self, ScopeCanceller) {
        Self::cancellable_with_id(OperationId::new())
    }

    pub fn cancellable_with_id(id: OperationId) -> (Self, ScopeCanceller) {
        let (tx, cancelled) = watch::channel(false);
        (Self { id, cancelled }, ScopeCanceller(tx))
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Resolves once the scope is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.cancelled.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            // Canceller dropped without cancelling
            std::future::pending::<()>().await;
        }
    }
}

impl Default for OperationScope {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeCanceller {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}
