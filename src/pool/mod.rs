//! Per-exchanger connection pool.
//!
//! Each `host:port` gets its own deadpool bucket capped at
//! `max_connections_per_pool`. When a bucket is at capacity and no
//! connection frees up within `acquire_timeout`, an overflow connection is
//! opened instead; it is closed on release and never retained. With pooling
//! disabled every connection is of that kind.
//!
//! The bucket map lock only guards bookkeeping; sockets are never touched
//! while it is held.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use deadpool::managed::{
    Manager, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult, TimeoutType, Timeouts,
};
use deadpool::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ValidatorConfig;
use crate::errors::{VerifyError, VerifyErrorKind, VerifyResult};
use crate::protocol::ProbeState;
use crate::transport::SmtpConnection;
use crate::types::{MxRecord, PoolStats};

/// Creates probe connections for one exchanger.
#[derive(Debug)]
pub struct ProbeConnectionManager {
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_idle: Duration,
}

#[async_trait]
impl Manager for ProbeConnectionManager {
    type Type = SmtpConnection;
    type Error = VerifyError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        SmtpConnection::connect(&self.host, self.port, self.connect_timeout, self.read_timeout).await
    }

    async fn recycle(&self, conn: &mut Self::Type, _: &Metrics) -> RecycleResult<Self::Error> {
        if !conn.is_usable() {
            return Err(RecycleError::Backend(VerifyError::not_connected()));
        }
        if conn.idle_time() > self.max_idle {
            return Err(RecycleError::Backend(VerifyError::new(
                VerifyErrorKind::PoolExhausted,
                "Connection idle for too long",
            )));
        }
        Ok(())
    }
}

type Bucket = Pool<ProbeConnectionManager>;

enum Slot {
    Pooled(Object<ProbeConnectionManager>),
    Overflow(SmtpConnection),
}

/// Connection checked out of the pool.
///
/// Hand it back with `ConnectionPool::release`. Dropping a pooled
/// connection without releasing it returns it to its bucket as is.
pub struct PooledConnection {
    slot: Slot,
    reused: bool,
}

impl PooledConnection {
    /// True if the connection had already carried a probe.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// True if the connection is retained by the pool after release.
    pub fn is_pooled(&self) -> bool {
        matches!(self.slot, Slot::Pooled(_))
    }
}

impl Deref for PooledConnection {
    type Target = SmtpConnection;

    fn deref(&self) -> &SmtpConnection {
        match &self.slot {
            Slot::Pooled(obj) => &**obj,
            Slot::Overflow(conn) => conn,
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut SmtpConnection {
        match &mut self.slot {
            Slot::Pooled(obj) => &mut **obj,
            Slot::Overflow(conn) => conn,
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &**self)
            .field("pooled", &self.is_pooled())
            .field("reused", &self.reused)
            .finish()
    }
}

/// Bounded connection pool keyed by exchanger address.
#[derive(Debug)]
pub struct ConnectionPool {
    buckets: Mutex<HashMap<String, Bucket>>,
    enabled: bool,
    max_per_pool: usize,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    read_timeout: Duration,
    max_idle: Duration,
    overflow: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Creates an empty pool. Buckets are created on first use.
    pub fn new(config: &ValidatorConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            enabled: config.enable_connection_pooling,
            max_per_pool: config.max_connections_per_pool,
            acquire_timeout: config.acquire_timeout,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            max_idle: config.max_idle_time,
            overflow: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket(&self, mx: &MxRecord) -> VerifyResult<Bucket> {
        let mut buckets = self.lock();
        if let Some(bucket) = buckets.get(&mx.address()) {
            return Ok(bucket.clone());
        }

        let manager = ProbeConnectionManager {
            host: mx.exchange.clone(),
            port: mx.port,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            max_idle: self.max_idle,
        };
        let bucket = Pool::builder(manager)
            .max_size(self.max_per_pool)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| VerifyError::configuration(format!("Cannot create pool: {}", e)))?;

        debug!(host = %mx.address(), max = self.max_per_pool, "Created connection pool bucket");
        buckets.insert(mx.address(), bucket.clone());
        Ok(bucket)
    }

    async fn open_overflow(&self, mx: &MxRecord) -> VerifyResult<PooledConnection> {
        let conn =
            SmtpConnection::connect(&mx.exchange, mx.port, self.connect_timeout, self.read_timeout)
                .await?;
        Ok(PooledConnection {
            slot: Slot::Overflow(conn),
            reused: false,
        })
    }

    /// Checks out a connection to an exchanger.
    pub async fn acquire(&self, mx: &MxRecord) -> VerifyResult<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return Err(VerifyError::new(
                VerifyErrorKind::PoolExhausted,
                "Connection pool is closed",
            ));
        }
        if !self.enabled {
            return self.open_overflow(mx).await;
        }

        let bucket = self.bucket(mx)?;
        let timeouts = Timeouts {
            wait: Some(self.acquire_timeout),
            create: Some(self.connect_timeout + self.read_timeout),
            recycle: Some(self.read_timeout),
        };

        match bucket.timeout_get(&timeouts).await {
            Ok(obj) => {
                let reused = obj.is_greeted();
                Ok(PooledConnection {
                    slot: Slot::Pooled(obj),
                    reused,
                })
            }
            Err(PoolError::Timeout(TimeoutType::Wait)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                debug!(host = %mx.address(), "Pool at capacity, opening overflow connection");
                self.open_overflow(mx).await
            }
            Err(PoolError::Timeout(_)) => Err(VerifyError::timeout(format!(
                "Connect to {} timed out",
                mx.address()
            ))),
            Err(PoolError::Backend(e)) => Err(e),
            Err(e) => Err(VerifyError::new(
                VerifyErrorKind::PoolExhausted,
                format!("Cannot acquire connection to {}: {}", mx.address(), e),
            )),
        }
    }

    /// Hands a connection back.
    ///
    /// Overflow connections are closed. Pooled connections are reset for the
    /// next probe; those that cannot be reset are detached and closed.
    pub async fn release(&self, conn: PooledConnection) {
        match conn.slot {
            Slot::Overflow(mut conn) => conn.close().await,
            Slot::Pooled(mut obj) => {
                if obj.is_usable() && obj.state() != ProbeState::Greeted {
                    if let Err(e) = obj.rset().await {
                        debug!(host = %obj.host(), error = %e, "RSET failed, discarding connection");
                        obj.mark_broken();
                    }
                }

                if !obj.is_usable() || self.closed.load(Ordering::Acquire) {
                    let mut conn = Object::take(obj);
                    conn.close().await;
                } else {
                    obj.touch();
                }
            }
        }
    }

    /// Closes retained connections idle longer than `max_idle_time` and
    /// forgets buckets left without any connection.
    pub fn sweep_idle(&self) {
        let max_idle = self.max_idle;
        let buckets: Vec<Bucket> = self.lock().values().cloned().collect();
        for bucket in buckets {
            bucket.retain(|conn, _| conn.is_usable() && conn.idle_time() <= max_idle);
        }

        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.status().size > 0);
        let dropped = before - buckets.len();
        if dropped > 0 {
            debug!(dropped, remaining = buckets.len(), "Dropped empty pool buckets");
        }
    }

    /// Runs `sweep_idle` every `interval` until the pool is dropped or closed.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match pool.upgrade() {
                    Some(pool) if !pool.closed.load(Ordering::Acquire) => pool.sweep_idle(),
                    _ => break,
                }
            }
        })
    }

    /// Returns pool statistics.
    pub fn get_stats(&self) -> PoolStats {
        let buckets = self.lock();
        let mut stats = PoolStats {
            pools: buckets.len(),
            overflow_connections: self.overflow.load(Ordering::Relaxed),
            ..Default::default()
        };

        for (address, bucket) in buckets.iter() {
            let status = bucket.status();
            let available = usize::try_from(status.available).unwrap_or(0);
            stats.total_connections += status.size;
            stats.available_connections += available;
            stats.in_use_connections += status.size.saturating_sub(available);
            stats.per_host.insert(address.clone(), status.size);
        }
        stats
    }

    /// Closes every bucket. Checked-out connections are closed on release.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let buckets: Vec<Bucket> = self.lock().drain().map(|(_, b)| b).collect();
        if !buckets.is_empty() {
            warn!(buckets = buckets.len(), "Closing connection pool");
        }
        for bucket in buckets {
            bucket.close();
        }
    }

    /// True once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockSmtpServer, ServerScript};

    fn config(max: usize, pooling: bool) -> ValidatorConfig {
        ValidatorConfig::builder()
            .max_connections_per_pool(max)
            .enable_connection_pooling(pooling)
            .acquire_timeout(Duration::from_millis(50))
            .build()
            .unwrap()
    }

    async fn greeted(pool: &ConnectionPool, mx: &MxRecord) -> PooledConnection {
        let mut conn = pool.acquire(mx).await.unwrap();
        if !conn.is_greeted() {
            conn.greet("probe.example.org").await.unwrap();
        }
        conn
    }

    #[tokio::test]
    async fn test_release_retains_and_reuses() {
        let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
        let mx = MxRecord::new("127.0.0.1", 0, server.port());
        let pool = ConnectionPool::new(&config(2, true));

        let mut conn = greeted(&pool, &mx).await;
        assert!(!conn.is_reused());
        conn.mail_from("verify@example.org").await.unwrap();
        pool.release(conn).await;

        let conn = pool.acquire(&mx).await.unwrap();
        assert!(conn.is_reused());
        assert_eq!(conn.state(), ProbeState::Greeted);
        pool.release(conn).await;

        let stats = pool.get_stats();
        assert_eq!(stats.pools, 1);
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.available_connections, 1);
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_cap_is_never_exceeded() {
        let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
        let mx = MxRecord::new("127.0.0.1", 0, server.port());
        let pool = ConnectionPool::new(&config(1, true));

        let first = greeted(&pool, &mx).await;
        let second = greeted(&pool, &mx).await;
        assert!(first.is_pooled());
        assert!(!second.is_pooled());

        let stats = pool.get_stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(stats.in_use_connections, 1);
        assert_eq!(stats.overflow_connections, 1);

        pool.release(second).await;
        pool.release(first).await;
        assert_eq!(pool.get_stats().per_host[&mx.address()], 1);
        assert_eq!(pool.get_stats().total_connections, 1);
    }

    #[tokio::test]
    async fn test_pooling_disabled() {
        let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
        let mx = MxRecord::new("127.0.0.1", 0, server.port());
        let pool = ConnectionPool::new(&config(2, false));

        let conn = pool.acquire(&mx).await.unwrap();
        assert!(!conn.is_pooled());
        pool.release(conn).await;

        let conn = pool.acquire(&mx).await.unwrap();
        assert!(!conn.is_reused());
        pool.release(conn).await;

        assert_eq!(pool.get_stats().pools, 0);
        assert_eq!(server.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_broken_connection_is_discarded() {
        let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
        let mx = MxRecord::new("127.0.0.1", 0, server.port());
        let pool = ConnectionPool::new(&config(2, true));

        let mut conn = greeted(&pool, &mx).await;
        conn.mark_broken();
        pool.release(conn).await;

        assert_eq!(pool.get_stats().total_connections, 0);
    }

    #[tokio::test]
    async fn test_sweep_closes_idle_connections() {
        let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
        let mx = MxRecord::new("127.0.0.1", 0, server.port());
        let config = ValidatorConfig::builder()
            .max_idle_time(Duration::from_millis(20))
            .build()
            .unwrap();
        let pool = ConnectionPool::new(&config);

        let conn = greeted(&pool, &mx).await;
        pool.release(conn).await;
        assert_eq!(pool.get_stats().total_connections, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.sweep_idle();
        assert_eq!(pool.get_stats().total_connections, 0);
        assert_eq!(pool.get_stats().pools, 0);
    }

    #[tokio::test]
    async fn test_sweep_keeps_buckets_in_use() {
        let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
        let busy = MxRecord::new("127.0.0.1", 0, server.port());
        let dead = MockSmtpServer::unused_port().await.unwrap();
        let unreachable = MxRecord::new("127.0.0.1", 0, dead);
        let pool = ConnectionPool::new(&config(2, true));

        assert!(pool.acquire(&unreachable).await.is_err());
        let conn = greeted(&pool, &busy).await;
        assert_eq!(pool.get_stats().pools, 2);

        pool.sweep_idle();
        let stats = pool.get_stats();
        assert_eq!(stats.pools, 1);
        assert!(stats.per_host.contains_key(&busy.address()));

        pool.release(conn).await;
    }

    #[tokio::test]
    async fn test_close_rejects_new_acquires() {
        let server = MockSmtpServer::start(ServerScript::default()).await.unwrap();
        let mx = MxRecord::new("127.0.0.1", 0, server.port());
        let pool = ConnectionPool::new(&config(2, true));

        let conn = greeted(&pool, &mx).await;
        pool.release(conn).await;
        pool.close();

        assert!(pool.is_closed());
        assert_eq!(pool.get_stats().pools, 0);
        let err = pool.acquire(&mx).await.unwrap_err();
        assert_eq!(err.kind(), VerifyErrorKind::PoolExhausted);
    }
}
