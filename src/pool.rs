//! Bounded pool of reusable transport connections.
//!
//! `get` never blocks on capacity: when every pooled slot is leased it opens
//! a temporary connection instead. Temporary connections join the idle set on
//! return if there is room, otherwise they are closed.

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{Error, Result};

#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection>;

    /// Cheap liveness check run before a connection is handed out.
    async fn is_alive(&self, connection: &mut Self::Connection) -> bool;

    async fn disconnect(&self, connection: Self::Connection);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
    pub temporary_leased: usize,
    pub temporary_created: u64,
    pub closed: bool,
}

struct PoolInner<M: ConnectionManager> {
    manager: M,
    capacity: usize,
    idle: Mutex<VecDeque<M::Connection>>,
    leased: AtomicUsize,
    temporary_leased: AtomicUsize,
    temporary_created: AtomicU64,
    closed: AtomicBool,
}

pub struct ConnectionPool<M: ConnectionManager> {
    inner: Arc<PoolInner<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: ConnectionManager> ConnectionPool<M> {
    pub fn new(manager: M, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                manager,
                capacity: capacity.max(1),
                idle: Mutex::new(VecDeque::new()),
                leased: AtomicUsize::new(0),
                temporary_leased: AtomicUsize::new(0),
                temporary_created: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub async fn get(&self) -> Result<PooledConnection<M>> {
        loop {
            self.ensure_open()?;

            // The slot moves from idle to leased under the idle lock, so
            // `leased + idle` never exceeds capacity in between.
            let candidate = {
                let mut idle = self.inner.idle.lock();
                let connection = idle.pop_front();
                if connection.is_some() {
                    self.inner.leased.fetch_add(1, Ordering::SeqCst);
                }
                connection
            };
            let Some(mut connection) = candidate else {
                break;
            };

            if self.inner.manager.is_alive(&mut connection).await {
                return Ok(self.lease(connection, false));
            }

            debug!("Discarding dead pooled connection");
            self.inner.leased.fetch_sub(1, Ordering::SeqCst);
            self.inner.manager.disconnect(connection).await;
        }

        let temporary = self.reserve_slot().is_none();
        let connection = match self.inner.manager.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                if !temporary {
                    self.inner.leased.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(e);
            }
        };

        if temporary {
            self.inner.temporary_leased.fetch_add(1, Ordering::SeqCst);
            self.inner.temporary_created.fetch_add(1, Ordering::Relaxed);
            debug!(
                capacity = self.inner.capacity,
                "Pool exhausted, opened temporary connection"
            );
        }

        Ok(self.lease(connection, temporary))
    }

    /// Returns a leased connection. Fails with [`Error::PoolClosed`] after
    /// `close`, in which case the connection is disconnected.
    pub async fn put(&self, mut connection: PooledConnection<M>) -> Result<()> {
        match connection.connection.take() {
            Some(raw) => self.give_back(raw, connection.temporary).await,
            None => Ok(()),
        }
    }

    /// Closes every idle connection. Leased connections are closed as they
    /// come back.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let drained: Vec<M::Connection> = self.inner.idle.lock().drain(..).collect();
        let count = drained.len();

        for connection in drained {
            self.inner.manager.disconnect(connection).await;
        }

        info!(closed_connections = count, "Connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.inner.capacity,
            idle: self.inner.idle.lock().len(),
            leased: self.inner.leased.load(Ordering::SeqCst),
            temporary_leased: self.inner.temporary_leased.load(Ordering::SeqCst),
            temporary_created: self.inner.temporary_created.load(Ordering::Relaxed),
            closed: self.inner.closed.load(Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        Ok(())
    }

    /// Claims a pooled slot if idle plus leased connections are under capacity.
    fn reserve_slot(&self) -> Option<()> {
        let idle = self.inner.idle.lock();

        self.inner
            .leased
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |leased| {
                (leased + idle.len() < self.inner.capacity).then_some(leased + 1)
            })
            .ok()
            .map(|_| ())
    }

    fn lease(&self, connection: M::Connection, temporary: bool) -> PooledConnection<M> {
        PooledConnection {
            connection: Some(connection),
            pool: self.clone(),
            temporary,
        }
    }

    fn release_slot(&self, temporary: bool) {
        if temporary {
            self.inner.temporary_leased.fetch_sub(1, Ordering::SeqCst);
        } else {
            self.inner.leased.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn give_back(&self, connection: M::Connection, temporary: bool) -> Result<()> {
        self.release_slot(temporary);

        if self.is_closed() {
            self.inner.manager.disconnect(connection).await;
            return Err(Error::PoolClosed);
        }

        let rejected = {
            let mut idle = self.inner.idle.lock();
            let leased = self.inner.leased.load(Ordering::SeqCst);
            if idle.len() + leased < self.inner.capacity {
                idle.push_back(connection);
                None
            } else {
                Some(connection)
            }
        };

        if let Some(connection) = rejected {
            debug!(temporary, "Pool at capacity, closing returned connection");
            self.inner.manager.disconnect(connection).await;
        }

        Ok(())
    }

    async fn discard_raw(&self, connection: M::Connection, temporary: bool) {
        self.release_slot(temporary);
        self.inner.manager.disconnect(connection).await;
    }
}

/// A connection leased from a [`ConnectionPool`]. Dropping it returns the
/// connection to the pool.
pub struct PooledConnection<M: ConnectionManager> {
    connection: Option<M::Connection>,
    pool: ConnectionPool<M>,
    temporary: bool,
}

impl<M: ConnectionManager> PooledConnection<M> {
    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub async fn release(self) -> Result<()> {
        let pool = self.pool.clone();
        pool.put(self).await
    }

    /// Closes the connection instead of returning it, e.g. after an I/O error.
    pub async fn discard(mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.discard_raw(connection, self.temporary).await;
        }
    }
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `put`/`discard`/`drop` take the connection, and they consume the lease.
        match self.connection.as_ref() {
            Some(connection) => connection,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.connection.as_mut() {
            Some(connection) => connection,
            None => unreachable!("pooled connection accessed after release"),
        }
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let pool = self.pool.clone();
        let temporary = self.temporary;

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = pool.give_back(connection, temporary).await;
                });
            }
            Err(_) => {
                pool.release_slot(temporary);
                warn!("Pooled connection dropped outside of a runtime");
            }
        }
    }
}
