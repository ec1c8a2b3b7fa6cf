//! Store handle provider boundary.
//!
//! A [`StoreHandle`] is the long-lived persistence resource a conversation
//! owns across requests. Handles are opened in deferred-write mode: writes
//! queue in the handle and only reach the database at an explicit
//! [`StoreHandle::commit`]. The transport connection underneath a handle can
//! be released and re-acquired without losing the handle or its pending
//! state.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub mod postgres;

/// Errors raised by handle providers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The handle was already released.
    #[error("store handle is closed")]
    HandleClosed,

    /// Database failure while opening, using, or releasing a handle.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A long-lived persistence handle owned by one conversation.
#[async_trait]
pub trait StoreHandle: Send + Sync + fmt::Debug {
    /// Whether the handle is still usable.
    fn is_open(&self) -> bool;

    /// Run a statement, or queue it when the handle is in deferred-write
    /// mode.
    async fn execute(&self, statement: &str) -> Result<(), ProviderError>;

    /// Flush every pending statement in a single transaction.
    async fn commit(&self) -> Result<(), ProviderError>;

    /// Release the transport connection while keeping the handle and its
    /// pending state alive. A later operation re-acquires transport.
    async fn disconnect(&self) -> Result<(), ProviderError>;

    /// Drop any pending, uncommitted statements.
    fn clear_pending(&self);

    /// Close the handle. Further operations fail with
    /// [`ProviderError::HandleClosed`].
    async fn close(&self) -> Result<(), ProviderError>;
}

/// Opens and releases store handles.
#[async_trait]
pub trait HandleProvider: Send + Sync + fmt::Debug {
    /// Open a fresh handle. Deferred-write handles hold writes until commit
    /// instead of flushing per operation.
    async fn open(&self, deferred_write: bool) -> Result<Arc<dyn StoreHandle>, ProviderError>;

    /// Release a handle and everything it holds.
    async fn release(&self, handle: &dyn StoreHandle) -> Result<(), ProviderError>;
}
