use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use delivery_service::{
    Error,
    pool::{ConnectionManager, ConnectionPool},
};
use parking_lot::Mutex;

#[derive(Default)]
struct Counters {
    next_id: AtomicU32,
    dead: Mutex<HashSet<u32>>,
    disconnected: Mutex<Vec<u32>>,
    refuse: Mutex<bool>,
    liveness_delay: Mutex<Option<Duration>>,
}

#[derive(Clone, Default)]
struct FakeManager {
    counters: Arc<Counters>,
}

#[async_trait]
impl ConnectionManager for FakeManager {
    type Connection = u32;

    async fn connect(&self) -> delivery_service::Result<u32> {
        if *self.counters.refuse.lock() {
            return Err(Error::transient("connection refused"));
        }
        Ok(self.counters.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn is_alive(&self, connection: &mut u32) -> bool {
        let delay = *self.counters.liveness_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        !self.counters.dead.lock().contains(connection)
    }

    async fn disconnect(&self, connection: u32) {
        self.counters.disconnected.lock().push(connection);
    }
}

/// Test: A returned connection is reused by the next lease
#[tokio::test]
async fn test_connections_are_reused() -> Result<()> {
    let manager = FakeManager::default();
    let pool = ConnectionPool::new(manager.clone(), 2);

    let first = pool.get().await?;
    let id = *first;
    assert!(!first.is_temporary());
    assert_eq!(pool.stats().leased, 1);

    first.release().await?;
    assert_eq!(pool.stats().idle, 1);
    assert_eq!(pool.stats().leased, 0);

    let second = pool.get().await?;
    assert_eq!(*second, id);
    assert_eq!(manager.counters.next_id.load(Ordering::SeqCst), 1);
    second.release().await?;

    Ok(())
}

/// Test: A dead idle connection is discarded and replaced on lease
#[tokio::test]
async fn test_dead_connection_is_replaced() -> Result<()> {
    let manager = FakeManager::default();
    let pool = ConnectionPool::new(manager.clone(), 2);

    let conn = pool.get().await?;
    let dead_id = *conn;
    conn.release().await?;

    manager.counters.dead.lock().insert(dead_id);

    let fresh = pool.get().await?;
    assert_ne!(*fresh, dead_id);
    assert_eq!(*manager.counters.disconnected.lock(), vec![dead_id]);
    assert!(!fresh.is_temporary());
    fresh.release().await?;

    Ok(())
}

/// Test: An exhausted pool hands out temporary connections instead of blocking
#[tokio::test]
async fn test_exhausted_pool_opens_temporary_connections() -> Result<()> {
    let manager = FakeManager::default();
    let pool = ConnectionPool::new(manager.clone(), 2);

    let a = pool.get().await?;
    let b = pool.get().await?;
    let extra = tokio::time::timeout(Duration::from_millis(200), pool.get()).await??;

    assert!(!a.is_temporary());
    assert!(!b.is_temporary());
    assert!(extra.is_temporary());

    let stats = pool.stats();
    assert_eq!(stats.leased, 2);
    assert_eq!(stats.temporary_leased, 1);
    assert_eq!(stats.temporary_created, 1);

    // No room while both pooled slots are out: the temporary one is closed.
    let extra_id = *extra;
    extra.release().await?;
    assert_eq!(*manager.counters.disconnected.lock(), vec![extra_id]);

    a.release().await?;
    b.release().await?;

    let stats = pool.stats();
    assert_eq!(stats.idle, 2);
    assert_eq!(stats.leased, 0);
    assert_eq!(stats.temporary_leased, 0);

    Ok(())
}

/// Test: Discarding a lease frees its slot without returning the connection
#[tokio::test]
async fn test_discard_frees_slot() -> Result<()> {
    let manager = FakeManager::default();
    let pool = ConnectionPool::new(manager.clone(), 1);

    let conn = pool.get().await?;
    let id = *conn;
    conn.discard().await;

    assert_eq!(*manager.counters.disconnected.lock(), vec![id]);
    assert_eq!(pool.stats().leased, 0);
    assert_eq!(pool.stats().idle, 0);

    let next = pool.get().await?;
    assert!(!next.is_temporary());
    next.release().await?;

    Ok(())
}

/// Test: A failed connect does not leak the reserved slot
#[tokio::test]
async fn test_connect_failure_releases_slot() -> Result<()> {
    let manager = FakeManager::default();
    let pool = ConnectionPool::new(manager.clone(), 1);

    *manager.counters.refuse.lock() = true;
    assert!(pool.get().await.is_err());
    assert_eq!(pool.stats().leased, 0);

    *manager.counters.refuse.lock() = false;
    let conn = pool.get().await?;
    assert!(!conn.is_temporary());
    conn.release().await?;

    Ok(())
}

/// Test: Closing drains idle connections and refuses further use
#[tokio::test]
async fn test_close_drains_and_rejects() -> Result<()> {
    let manager = FakeManager::default();
    let pool = ConnectionPool::new(manager.clone(), 3);

    let idle = pool.get().await?;
    let leased = pool.get().await?;
    let idle_id = *idle;
    let leased_id = *leased;
    idle.release().await?;

    pool.close().await;
    assert!(pool.is_closed());
    assert!(pool.stats().closed);
    assert_eq!(pool.stats().idle, 0);
    assert!(manager.counters.disconnected.lock().contains(&idle_id));

    assert!(matches!(pool.get().await, Err(Error::PoolClosed)));
    assert!(matches!(leased.release().await, Err(Error::PoolClosed)));
    assert!(manager.counters.disconnected.lock().contains(&leased_id));

    Ok(())
}

/// Test: Dropping a lease returns it to the pool in the background
#[tokio::test]
async fn test_drop_returns_connection() -> Result<()> {
    let manager = FakeManager::default();
    let pool = ConnectionPool::new(manager, 1);

    {
        let _conn = pool.get().await?;
    }

    for _ in 0..50 {
        if pool.stats().idle == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.leased, 0);

    Ok(())
}

/// Test: A lease taken while an idle connection is being checked cannot overfill the pool
#[tokio::test]
async fn test_liveness_window_respects_capacity() -> Result<()> {
    let manager = FakeManager::default();
    let pool = ConnectionPool::new(manager.clone(), 1);

    pool.get().await?.release().await?;
    assert_eq!(pool.stats().idle, 1);

    *manager.counters.liveness_delay.lock() = Some(Duration::from_millis(100));

    let reviving = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let concurrent = pool.get().await?;
    assert!(concurrent.is_temporary(), "the idle slot was already claimed");

    let revived = reviving.await??;
    assert!(!revived.is_temporary());

    let stats = pool.stats();
    assert_eq!(stats.leased, 1);
    assert_eq!(stats.temporary_leased, 1);
    assert!(stats.leased + stats.idle <= stats.capacity);

    revived.release().await?;
    concurrent.release().await?;
    assert_eq!(pool.stats().idle, 1);

    Ok(())
}
