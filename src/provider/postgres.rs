//! Postgres-backed store handles over a `sqlx` pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool, Postgres};

use super::{HandleProvider, ProviderError, StoreHandle};

/// Hands out [`PgHandle`]s backed by connections from a shared pool.
#[derive(Debug, Clone)]
pub struct PgHandleProvider {
    pool: PgPool,
}

impl PgHandleProvider {
    pub async fn connect(database_url: &str) -> Result<Self, ProviderError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl HandleProvider for PgHandleProvider {
    async fn open(&self, deferred_write: bool) -> Result<Arc<dyn StoreHandle>, ProviderError> {
        let conn = self.pool.acquire().await?;
        Ok(Arc::new(PgHandle {
            pool: self.pool.clone(),
            conn: Mutex::new(Some(conn)),
            deferred_write,
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }))
    }

    async fn release(&self, handle: &dyn StoreHandle) -> Result<(), ProviderError> {
        handle.close().await
    }
}

/// A store handle over one pooled Postgres connection.
///
/// The connection is optional: `disconnect` returns it to the pool and the
/// next statement re-acquires one, so an idle conversation holds no
/// transport. Pending statements survive the connection, not the handle.
pub struct PgHandle {
    pool: PgPool,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
    deferred_write: bool,
    pending: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl fmt::Debug for PgHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgHandle")
            .field("deferred_write", &self.deferred_write)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl PgHandle {
    fn ensure_open(&self) -> Result<(), ProviderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProviderError::HandleClosed);
        }
        Ok(())
    }

    /// Take the cached connection, or acquire a new one if the transport was
    /// disconnected.
    async fn take_conn(&self) -> Result<PoolConnection<Postgres>, ProviderError> {
        let cached = self.conn.lock().unwrap().take();
        match cached {
            Some(conn) => Ok(conn),
            None => Ok(self.pool.acquire().await?),
        }
    }

    fn stash_conn(&self, conn: PoolConnection<Postgres>) {
        *self.conn.lock().unwrap() = Some(conn);
    }

    async fn run_in_transaction(
        conn: &mut PoolConnection<Postgres>,
        statements: &[String],
    ) -> Result<(), ProviderError> {
        let mut tx = conn.begin().await?;
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl StoreHandle for PgHandle {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn execute(&self, statement: &str) -> Result<(), ProviderError> {
        self.ensure_open()?;
        if self.deferred_write {
            self.pending.lock().unwrap().push(statement.to_string());
            return Ok(());
        }
        let mut conn = self.take_conn().await?;
        let result = sqlx::query(statement).execute(&mut *conn).await;
        self.stash_conn(conn);
        result?;
        Ok(())
    }

    async fn commit(&self) -> Result<(), ProviderError> {
        self.ensure_open()?;
        let mut statements: Vec<String> = std::mem::take(&mut *self.pending.lock().unwrap());
        if statements.is_empty() {
            return Ok(());
        }
        let mut conn = self.take_conn().await?;
        let result = Self::run_in_transaction(&mut conn, &statements).await;
        self.stash_conn(conn);
        if result.is_err() {
            // The work is still uncommitted; put it back for a retry.
            let mut pending = self.pending.lock().unwrap();
            statements.extend(pending.drain(..));
            *pending = statements;
        }
        result
    }

    async fn disconnect(&self) -> Result<(), ProviderError> {
        self.ensure_open()?;
        // Dropping the pooled connection returns it to the pool.
        let conn = self.conn.lock().unwrap().take();
        drop(conn);
        Ok(())
    }

    fn clear_pending(&self) {
        self.pending.lock().unwrap().clear();
    }

    async fn close(&self) -> Result<(), ProviderError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pending.lock().unwrap().clear();
        let conn = self.conn.lock().unwrap().take();
        drop(conn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A lazy pool never touches the network as long as no statement runs,
    // which is enough to exercise the deferred-write bookkeeping.
    fn lazy_handle() -> PgHandle {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/conversations_test")
            .expect("lazy pool");
        PgHandle {
            pool,
            conn: Mutex::new(None),
            deferred_write: true,
            pending: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn deferred_execute_queues_without_touching_the_database() {
        let handle = lazy_handle();

        handle.execute("INSERT INTO t VALUES (1)").await.unwrap();
        handle.execute("INSERT INTO t VALUES (2)").await.unwrap();

        assert_eq!(handle.pending.lock().unwrap().len(), 2);
        assert!(handle.is_open());
    }

    #[tokio::test]
    async fn clear_pending_drops_queued_statements() {
        let handle = lazy_handle();

        handle.execute("INSERT INTO t VALUES (1)").await.unwrap();
        handle.clear_pending();

        assert!(handle.pending.lock().unwrap().is_empty());
        // Nothing pending means commit has nothing to flush.
        handle.commit().await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_keeps_pending_state() {
        let handle = lazy_handle();

        handle.execute("INSERT INTO t VALUES (1)").await.unwrap();
        handle.disconnect().await.unwrap();

        assert!(handle.is_open());
        assert_eq!(handle.pending.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let handle = lazy_handle();

        handle.execute("INSERT INTO t VALUES (1)").await.unwrap();
        handle.close().await.unwrap();
        handle.close().await.unwrap();

        assert!(!handle.is_open());
        assert!(handle.pending.lock().unwrap().is_empty());
        assert!(matches!(
            handle.execute("INSERT INTO t VALUES (2)").await,
            Err(ProviderError::HandleClosed)
        ));
        assert!(matches!(
            handle.commit().await,
            Err(ProviderError::HandleClosed)
        ));
    }
}
