//! Per-host connection pool with bounded size and leased connections
//!
//! Each host owns an arena of slots. A slot is vacant, holds an idle
//! connection, or is leased. Leases are counted by a semaphore sized to the
//! per-host cap, so idle plus leased connections never exceed the cap.
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::config::PoolConfig;
use crate::error::UpstreamFault;
use crate::origin::{OriginConnection, OriginConnector, OriginHost, OriginRequest, OriginResponse};

/// Why a lease could not be handed out
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("no connection became available in time")]
    Exhausted,
    #[error(transparent)]
    Connect(#[from] UpstreamFault),
}

/// Snapshot of one host's pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub opened_total: u64,
    pub reused_total: u64,
    pub closed_total: u64,
}

enum Slot {
    Vacant,
    Idle(Box<dyn OriginConnection>),
    Leased,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    /// Indices of idle slots, most recently returned last
    idle: Vec<usize>,
    vacant: Vec<usize>,
}

impl Arena {
    /// Pop the freshest idle connection that is still open; stale ones are closed
    fn take_idle(&mut self) -> (Option<(usize, Box<dyn OriginConnection>)>, u64) {
        let mut closed = 0;
        while let Some(index) = self.idle.pop() {
            match std::mem::replace(&mut self.slots[index], Slot::Leased) {
                Slot::Idle(conn) if conn.is_open() => return (Some((index, conn)), closed),
                _ => {
                    self.vacate(index);
                    closed += 1;
                }
            }
        }
        (None, closed)
    }

    fn reserve(&mut self) -> usize {
        match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Slot::Leased;
                index
            }
            None => {
                self.slots.push(Slot::Leased);
                self.slots.len() - 1
            }
        }
    }

    fn put_back(&mut self, index: usize, conn: Box<dyn OriginConnection>) {
        self.slots[index] = Slot::Idle(conn);
        self.idle.push(index);
    }

    fn vacate(&mut self, index: usize) {
        self.slots[index] = Slot::Vacant;
        self.vacant.push(index);
    }

    fn leased(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot, Slot::Leased))
            .count()
    }
}

struct HostPool {
    host: OriginHost,
    permits: Arc<Semaphore>,
    arena: Mutex<Arena>,
    opened_total: AtomicU64,
    reused_total: AtomicU64,
    closed_total: AtomicU64,
}

impl HostPool {
    fn new(host: OriginHost, max_connections: usize) -> Self {
        Self {
            host,
            permits: Arc::new(Semaphore::new(max_connections)),
            arena: Mutex::new(Arena::default()),
            opened_total: AtomicU64::new(0),
            reused_total: AtomicU64::new(0),
            closed_total: AtomicU64::new(0),
        }
    }
}

/// A connection checked out of the pool.
///
/// [`release`](Self::release) returns it for reuse. Dropping it without
/// releasing closes the connection and frees its slot.
pub struct PooledConnection {
    pool: Arc<HostPool>,
    index: usize,
    conn: Option<Box<dyn OriginConnection>>,
    returned: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub async fn send(&mut self, request: &OriginRequest) -> Result<OriginResponse, UpstreamFault> {
        match self.conn.as_mut() {
            Some(conn) => conn.send(request).await,
            None => Err(UpstreamFault::Io("connection is not established".into())),
        }
    }

    /// Hand the connection back; closed connections are discarded instead
    pub fn release(mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let mut arena = self.pool.arena.lock();
        if conn.is_open() {
            arena.put_back(self.index, conn);
        } else {
            arena.vacate(self.index);
            self.pool.closed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.returned = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if self.conn.take().is_some() {
            debug!("Closing unreleased connection to {}", self.pool.host);
            self.pool.closed_total.fetch_add(1, Ordering::Relaxed);
        }
        self.pool.arena.lock().vacate(self.index);
    }
}

/// Keyed collection of per-host pools
pub struct ConnectionPool {
    hosts: DashMap<OriginHost, Arc<HostPool>>,
    connector: Arc<dyn OriginConnector>,
    max_connections_per_host: usize,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn OriginConnector>, config: &PoolConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            connector,
            max_connections_per_host: config.max_connections_per_host.max(1),
        }
    }

    fn host_pool(&self, host: &OriginHost) -> Arc<HostPool> {
        if let Some(pool) = self.hosts.get(host) {
            return Arc::clone(&pool);
        }
        let pool = self
            .hosts
            .entry(host.clone())
            .or_insert_with(|| Arc::new(HostPool::new(host.clone(), self.max_connections_per_host)));
        Arc::clone(&pool)
    }

    /// Lease a connection to `host`, waiting at most `wait` for a free slot.
    ///
    /// Reuses an idle connection when one is open, otherwise opens a new one.
    pub async fn acquire(
        &self,
        host: &OriginHost,
        wait: Duration,
    ) -> Result<PooledConnection, AcquireError> {
        let pool = self.host_pool(host);
        let permit = match timeout(wait, Arc::clone(&pool.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => {
                warn!(
                    "Connection pool for {} exhausted ({} leased)",
                    host, self.max_connections_per_host
                );
                return Err(AcquireError::Exhausted);
            }
        };

        let (idle, stale) = {
            let mut arena = pool.arena.lock();
            match arena.take_idle() {
                (Some(found), stale) => (Ok(found), stale),
                (None, stale) => (Err(arena.reserve()), stale),
            }
        };
        if stale > 0 {
            pool.closed_total.fetch_add(stale, Ordering::Relaxed);
        }

        match idle {
            Ok((index, conn)) => {
                pool.reused_total.fetch_add(1, Ordering::Relaxed);
                Ok(PooledConnection {
                    pool,
                    index,
                    conn: Some(conn),
                    returned: false,
                    _permit: permit,
                })
            }
            Err(index) => {
                // The lease owns the reserved slot while connecting, so a
                // cancelled or failed connect frees it again
                let mut lease = PooledConnection {
                    pool: Arc::clone(&pool),
                    index,
                    conn: None,
                    returned: false,
                    _permit: permit,
                };
                let conn = self.connector.connect(host).await?;
                pool.opened_total.fetch_add(1, Ordering::Relaxed);
                lease.conn = Some(conn);
                Ok(lease)
            }
        }
    }

    pub fn stats(&self, host: &OriginHost) -> Option<PoolStats> {
        let pool = self.hosts.get(host)?;
        let arena = pool.arena.lock();
        Some(PoolStats {
            idle: arena.idle.len(),
            leased: arena.leased(),
            opened_total: pool.opened_total.load(Ordering::Relaxed),
            reused_total: pool.reused_total.load(Ordering::Relaxed),
            closed_total: pool.closed_total.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedConnector;

    fn pool(connector: &Arc<ScriptedConnector>, max: usize) -> ConnectionPool {
        ConnectionPool::new(
            connector.clone(),
            &PoolConfig {
                max_connections_per_host: max,
                ..PoolConfig::default()
            },
        )
    }

    fn host() -> OriginHost {
        OriginHost::new("origin", 80)
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let pool = pool(&connector, 4);

        let lease = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        lease.release();
        let lease = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        lease.release();

        assert_eq!(connector.connects(), 1);
        let stats = pool.stats(&host()).unwrap();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.reused_total, 1);
    }

    #[tokio::test]
    async fn test_dropped_lease_closes_connection() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let pool = pool(&connector, 4);

        let lease = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        drop(lease);
        let stats = pool.stats(&host()).unwrap();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.closed_total, 1);

        let _lease = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connects(), 2);
    }

    #[tokio::test]
    async fn test_closed_idle_connection_is_not_reused() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let pool = pool(&connector, 4);

        let lease = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        lease.release();
        connector.close_all();

        let _lease = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.connects(), 2);
        assert_eq!(pool.stats(&host()).unwrap().closed_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cap_blocks_until_timeout() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let pool = pool(&connector, 1);

        let held = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        let err = pool
            .acquire(&host(), Duration::from_millis(50))
            .await
            .err()
            .unwrap();
        assert_eq!(err, AcquireError::Exhausted);

        held.release();
        assert!(pool.acquire(&host(), Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_gets_returned_connection() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        let pool = Arc::new(pool(&connector, 1));

        let held = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&host(), Duration::from_secs(5)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        held.release();

        assert!(waiter.await.unwrap());
        assert_eq!(connector.connects(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_frees_slot() {
        let connector = Arc::new(ScriptedConnector::new(vec![]));
        connector.fail_connects(1);
        let pool = pool(&connector, 1);

        let err = pool
            .acquire(&host(), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AcquireError::Connect(UpstreamFault::Connect(_))));

        let lease = pool.acquire(&host(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.stats(&host()).unwrap().leased, 1);
        drop(lease);
        assert_eq!(pool.stats(&host()).unwrap().leased, 0);
    }
}
