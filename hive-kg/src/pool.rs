//! Bounded session pool
//!
//! At most `max_pool_size` sessions are checked out at once; a
//! [`tokio::sync::Semaphore`] enforces the bound and provides FIFO fairness
//! to waiting callers. Released sessions go back to an idle set and are
//! reused most-recently-used first. Sessions are created lazily, except for
//! the `min_pool_size` that [`SessionPool::warm_up`] and the periodic
//! [`SessionPool::sweep`] keep open.
//!
//! A [`PooledSession`] must be handed back with [`PooledSession::release`].
//! If it is dropped instead (an error path, a timeout, a cancelled future)
//! it still gets released exactly once, and its driver session is discarded
//! because its state is unknown.

use crate::driver::{AccessMode, DriverSession, DriverTransaction, GraphDriver};
use crate::error::{Neo4jError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the session pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPoolConfig {
    /// Upper bound on open sessions, idle and checked out together
    pub max_pool_size: usize,
    /// Idle sessions kept warm
    pub min_pool_size: usize,
    /// How long `acquire` waits for a free slot
    pub acquire_timeout: Duration,
    /// Idle sessions unused for longer are evicted by the sweep
    pub idle_timeout: Duration,
    /// Sessions older than this are closed instead of being reused
    pub max_lifetime: Duration,
    /// Interval of the background sweep
    pub sweep_interval: Duration,
    /// How long `close` waits for checked-out sessions
    pub close_grace_period: Duration,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 50,
            min_pool_size: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
            close_grace_period: Duration::from_secs(10),
        }
    }
}

impl SessionPoolConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(Neo4jError::ConfigError(
                "max_pool_size must be greater than 0".to_string(),
            ));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(Neo4jError::ConfigError(format!(
                "min_pool_size ({}) must not exceed max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(Neo4jError::ConfigError(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetrics {
    /// Sessions currently checked out
    pub active_sessions: usize,
    /// Idle sessions ready for reuse
    pub pooled_sessions: usize,
    pub total_sessions_created: u64,
    /// Rolling average wait in `acquire`, in milliseconds
    pub session_acquisition_time: f64,
    pub total_acquired: u64,
    pub total_released: u64,
    pub sessions_closed: u64,
    pub acquisition_timeouts: u64,
}

struct IdleSession {
    id: Uuid,
    session: Box<dyn DriverSession>,
    created_at: Instant,
    last_used: Instant,
}

impl IdleSession {
    fn lifetime_expired(&self, config: &SessionPoolConfig, now: Instant) -> bool {
        now.duration_since(self.created_at) >= config.max_lifetime
    }

    fn idle_expired(&self, config: &SessionPoolConfig, now: Instant) -> bool {
        now.duration_since(self.last_used) >= config.idle_timeout
    }
}

#[derive(Default)]
struct PoolState {
    /// Ordered by `last_used`, oldest at the front
    idle: VecDeque<IdleSession>,
    active: usize,
    total_sessions_created: u64,
    avg_acquire_ms: f64,
    total_acquired: u64,
    total_released: u64,
    sessions_closed: u64,
    acquisition_timeouts: u64,
}

struct PoolInner {
    driver: Arc<dyn GraphDriver>,
    config: SessionPoolConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
    released: Notify,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    /// Return a checked-out session to the pool. Hands back the session if
    /// it has to be closed instead.
    fn finish(
        &self,
        id: Uuid,
        session: Box<dyn DriverSession>,
        created_at: Instant,
        discard: bool,
    ) -> Option<Box<dyn DriverSession>> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        state.total_released += 1;

        let expired = now.duration_since(created_at) >= self.config.max_lifetime;
        let result = if discard || expired || self.closed.load(Ordering::Acquire) {
            state.sessions_closed += 1;
            debug!("Discarding session {} (broken: {}, expired: {})", id, discard, expired);
            Some(session)
        } else {
            state.idle.push_back(IdleSession {
                id,
                session,
                created_at,
                last_used: now,
            });
            None
        };
        drop(state);

        self.released.notify_waiters();
        result
    }
}

/// Pool of driver sessions
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(driver: Arc<dyn GraphDriver>, config: SessionPoolConfig) -> Self {
        let permits = config.max_pool_size;
        Self {
            inner: Arc::new(PoolInner {
                driver,
                config,
                semaphore: Arc::new(Semaphore::new(permits)),
                state: Mutex::new(PoolState::default()),
                closed: AtomicBool::new(false),
                released: Notify::new(),
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Check out a session.
    ///
    /// Waiting for a free slot and opening a new driver session share one
    /// `acquire_timeout` deadline. Expired idle sessions found on the way
    /// are closed before a replacement is opened.
    pub async fn acquire(&self) -> Result<PooledSession> {
        if self.is_closed() {
            return Err(Neo4jError::PoolClosed);
        }

        let config = &self.inner.config;
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + config.acquire_timeout);

        let permit = match tokio::time::timeout_at(
            deadline,
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Neo4jError::PoolClosed),
            Err(_) => return Err(self.acquisition_timeout()),
        };

        let now = Instant::now();
        let mut expired = Vec::new();
        let reused = {
            let mut state = self.inner.state.lock();
            loop {
                match state.idle.pop_back() {
                    Some(idle)
                        if idle.lifetime_expired(config, now) || idle.idle_expired(config, now) =>
                    {
                        state.sessions_closed += 1;
                        expired.push(idle);
                    }
                    other => break other,
                }
            }
        };

        for mut idle in expired {
            debug!("Evicting expired session {}", idle.id);
            close_quietly(&mut idle.session).await;
        }

        let (id, session, created_at) = match reused {
            Some(idle) => (idle.id, idle.session, idle.created_at),
            None => {
                let session =
                    match tokio::time::timeout_at(deadline, self.inner.driver.open_session()).await
                    {
                        Ok(opened) => opened?,
                        Err(_) => return Err(self.acquisition_timeout()),
                    };
                let id = Uuid::new_v4();
                self.inner.state.lock().total_sessions_created += 1;
                debug!("Created session {}", id);
                (id, session, Instant::now())
            }
        };

        {
            let waited_ms = start.elapsed().as_secs_f64() * 1000.0;
            let mut state = self.inner.state.lock();
            state.avg_acquire_ms = if state.total_acquired == 0 {
                waited_ms
            } else {
                (state.avg_acquire_ms * 9.0 + waited_ms) / 10.0
            };
            state.active += 1;
            state.total_acquired += 1;
        }

        Ok(PooledSession {
            id,
            session: Some(session),
            created_at,
            broken: false,
            pool: self.inner.clone(),
            permit: Some(permit),
        })
    }

    fn acquisition_timeout(&self) -> Neo4jError {
        let config = &self.inner.config;
        self.inner.state.lock().acquisition_timeouts += 1;
        warn!(
            "Session acquisition timed out after {:?} (max_pool_size: {})",
            config.acquire_timeout, config.max_pool_size
        );
        Neo4jError::AcquisitionTimeout {
            timeout_ms: config.acquire_timeout.as_millis() as u64,
            max_pool_size: config.max_pool_size,
        }
    }

    /// Current statistics.
    pub fn metrics(&self) -> SessionMetrics {
        let state = self.inner.state.lock();
        SessionMetrics {
            active_sessions: state.active,
            pooled_sessions: state.idle.len(),
            total_sessions_created: state.total_sessions_created,
            session_acquisition_time: state.avg_acquire_ms,
            total_acquired: state.total_acquired,
            total_released: state.total_released,
            sessions_closed: state.sessions_closed,
            acquisition_timeouts: state.acquisition_timeouts,
        }
    }

    /// Open sessions until `min_pool_size` are idle. Returns how many were opened.
    pub async fn warm_up(&self) -> Result<usize> {
        let opened = self.top_up().await?;
        if opened > 0 {
            info!("Session pool warmed up with {} sessions", opened);
        }
        Ok(opened)
    }

    /// One maintenance pass: evict expired idle sessions, then top up to
    /// `min_pool_size`.
    pub async fn sweep(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let config = &self.inner.config;
        let now = Instant::now();
        let evicted: Vec<IdleSession> = {
            let mut state = self.inner.state.lock();
            let mut evicted = Vec::new();

            let (expired, kept): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|idle| idle.lifetime_expired(config, now));
            evicted.extend(expired);
            state.idle.extend(kept);

            while state.idle.len() > config.min_pool_size {
                match state.idle.front() {
                    Some(idle) if idle.idle_expired(config, now) => {
                        evicted.extend(state.idle.pop_front());
                    }
                    _ => break,
                }
            }

            state.sessions_closed += evicted.len() as u64;
            evicted
        };

        if !evicted.is_empty() {
            debug!("Sweep evicting {} idle sessions", evicted.len());
        }
        for mut idle in evicted {
            close_quietly(&mut idle.session).await;
        }

        self.top_up().await?;
        Ok(())
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until the pool is closed.
    pub fn spawn_sweeper(&self) {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sweep_interval;

        info!("Starting session pool sweeper (interval: {:?})", interval);

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::Acquire) {
                    break;
                }

                let pool = SessionPool { inner };
                if let Err(e) = pool.sweep().await {
                    warn!("Session pool sweep failed: {}", e);
                }
            }
        });

        if let Some(previous) = self.inner.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Close the pool.
    ///
    /// New acquisitions fail with [`Neo4jError::PoolClosed`]. Checked-out
    /// sessions get `close_grace_period` to come back; after that the pool
    /// stops waiting for them. Idle sessions are closed, then the driver.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("Closing session pool");
        self.inner.semaphore.close();
        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }

        let deadline = tokio::time::Instant::now() + self.inner.config.close_grace_period;
        loop {
            let released = self.inner.released.notified();
            let active = self.inner.state.lock().active;
            if active == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                warn!(
                    "Force-closing session pool with {} sessions still in use",
                    self.inner.state.lock().active
                );
                break;
            }
        }

        let idle: Vec<IdleSession> = {
            let mut state = self.inner.state.lock();
            state.sessions_closed += state.idle.len() as u64;
            state.idle.drain(..).collect()
        };
        for mut session in idle {
            close_quietly(&mut session.session).await;
        }

        self.inner.driver.close().await?;
        info!("Session pool closed");
        Ok(())
    }

    async fn top_up(&self) -> Result<usize> {
        let config = &self.inner.config;
        let wanted = {
            let state = self.inner.state.lock();
            let open = state.active + state.idle.len();
            config
                .min_pool_size
                .saturating_sub(state.idle.len())
                .min(config.max_pool_size.saturating_sub(open))
        };

        let mut opened = 0;
        for _ in 0..wanted {
            let session = self.inner.driver.open_session().await?;
            let id = Uuid::new_v4();
            let now = Instant::now();

            let rejected = {
                let mut state = self.inner.state.lock();
                state.total_sessions_created += 1;
                if self.is_closed() {
                    state.sessions_closed += 1;
                    Some(session)
                } else {
                    state.idle.push_back(IdleSession {
                        id,
                        session,
                        created_at: now,
                        last_used: now,
                    });
                    None
                }
            };

            if let Some(mut session) = rejected {
                close_quietly(&mut session).await;
                break;
            }
            debug!("Created idle session {}", id);
            opened += 1;
        }
        Ok(opened)
    }
}

/// A checked-out session
pub struct PooledSession {
    id: Uuid,
    session: Option<Box<dyn DriverSession>>,
    created_at: Instant,
    broken: bool,
    pool: Arc<PoolInner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledSession {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Begin a transaction on this session.
    pub async fn begin_transaction(
        &mut self,
        mode: AccessMode,
        timeout: Duration,
    ) -> Result<Box<dyn DriverTransaction>> {
        match self.session.as_mut() {
            Some(session) => session.begin_transaction(mode, timeout).await,
            None => Err(Neo4jError::ConnectionError(format!(
                "session {} already released",
                self.id
            ))),
        }
    }

    /// Do not return this session to the idle set on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Hand the session back to the pool.
    pub async fn release(mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let discarded = self
            .pool
            .finish(self.id, session, self.created_at, self.broken);
        self.permit.take();

        if let Some(mut session) = discarded {
            close_quietly(&mut session).await;
        }
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let discarded = self.pool.finish(self.id, session, self.created_at, true);
        self.permit.take();

        if let Some(mut session) = discarded {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        close_quietly(&mut session).await;
                    });
                }
                Err(_) => debug!("No runtime to close dropped session {}", self.id),
            }
        }
    }
}

async fn close_quietly(session: &mut Box<dyn DriverSession>) {
    if let Err(e) = session.close().await {
        debug!("Error closing session: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::{Fault, MemoryDriver};

    fn config(max: usize, min: usize) -> SessionPoolConfig {
        SessionPoolConfig {
            max_pool_size: max,
            min_pool_size: min,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(SessionPoolConfig::default().validate().is_ok());
        assert!(config(0, 0).validate().is_err());
        assert!(config(2, 3).validate().is_err());
    }

    #[tokio::test]
    async fn test_acquire_and_release_reuses_session() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = SessionPool::new(driver.clone(), config(4, 0));

        let session = pool.acquire().await.unwrap();
        let first_id = session.id();
        assert_eq!(pool.metrics().active_sessions, 1);
        session.release().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.active_sessions, 0);
        assert_eq!(metrics.pooled_sessions, 1);

        let session = pool.acquire().await.unwrap();
        assert_eq!(session.id(), first_id);
        session.release().await;

        let metrics = pool.metrics();
        assert_eq!(metrics.total_sessions_created, 1);
        assert_eq!(metrics.total_acquired, 2);
        assert_eq!(metrics.total_released, 2);
        assert_eq!(driver.sessions_opened(), 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = SessionPool::new(Arc::new(MemoryDriver::new()), config(1, 0));

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(
            err,
            Neo4jError::AcquisitionTimeout {
                max_pool_size: 1,
                ..
            }
        ));
        assert_eq!(pool.metrics().acquisition_timeouts, 1);

        held.release().await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_gets_released_session() {
        let pool = SessionPool::new(
            Arc::new(MemoryDriver::new()),
            SessionPoolConfig {
                acquire_timeout: Duration::from_secs(2),
                ..config(1, 0)
            },
        );

        let held = pool.acquire().await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|s| s.id()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        held.release().await;

        let id = waiter.await.unwrap().unwrap();
        assert_eq!(id, held_id);
    }

    #[tokio::test]
    async fn test_dropped_session_is_discarded() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = SessionPool::new(driver.clone(), config(2, 0));

        let session = pool.acquire().await.unwrap();
        drop(session);

        let metrics = pool.metrics();
        assert_eq!(metrics.active_sessions, 0);
        assert_eq!(metrics.pooled_sessions, 0);
        assert_eq!(metrics.total_released, 1);
        assert_eq!(metrics.sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_broken_session_not_reused() {
        let pool = SessionPool::new(Arc::new(MemoryDriver::new()), config(2, 0));

        let mut session = pool.acquire().await.unwrap();
        let id = session.id();
        session.mark_broken();
        session.release().await;

        let session = pool.acquire().await.unwrap();
        assert_ne!(session.id(), id);
        assert_eq!(pool.metrics().total_sessions_created, 2);
    }

    #[tokio::test]
    async fn test_warm_up_and_sweep() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = SessionPool::new(
            driver.clone(),
            SessionPoolConfig {
                idle_timeout: Duration::from_millis(20),
                ..config(5, 2)
            },
        );

        assert_eq!(pool.warm_up().await.unwrap(), 2);
        assert_eq!(pool.metrics().pooled_sessions, 2);

        // Grow the idle set beyond the minimum
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        a.release().await;
        b.release().await;
        c.release().await;
        assert_eq!(pool.metrics().pooled_sessions, 3);

        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.sweep().await.unwrap();

        // Idle-expired sessions are evicted down to min_pool_size only
        assert_eq!(pool.metrics().pooled_sessions, 2);
    }

    #[tokio::test]
    async fn test_max_lifetime_discards_on_release() {
        let pool = SessionPool::new(
            Arc::new(MemoryDriver::new()),
            SessionPoolConfig {
                max_lifetime: Duration::from_millis(10),
                ..config(2, 0)
            },
        );

        let session = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.release().await;

        assert_eq!(pool.metrics().pooled_sessions, 0);
        assert_eq!(pool.metrics().sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_expired_sessions_closed_when_open_fails() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = SessionPool::new(
            driver.clone(),
            SessionPoolConfig {
                idle_timeout: Duration::from_millis(10),
                ..config(2, 0)
            },
        );

        pool.acquire().await.unwrap().release().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        driver.set_open_fault(Some(Fault::ConnectionReset));
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(err, Neo4jError::ConnectionError(_)));

        assert_eq!(driver.sessions_closed(), 1);
        let metrics = pool.metrics();
        assert_eq!(metrics.sessions_closed, 1);
        assert_eq!(metrics.pooled_sessions, 0);
        assert_eq!(metrics.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_slow_session_open_counts_against_acquire_timeout() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = SessionPool::new(driver.clone(), config(2, 0));
        driver.set_open_latency(Duration::from_millis(500));

        let start = Instant::now();
        let err = pool.acquire().await.err().unwrap();
        assert!(start.elapsed() < Duration::from_millis(400));
        assert!(matches!(err, Neo4jError::AcquisitionTimeout { .. }));
        assert_eq!(pool.metrics().acquisition_timeouts, 1);

        // The slot is free again once the open is abandoned
        driver.set_open_latency(Duration::ZERO);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_close_rejects_new_acquisitions() {
        let driver = Arc::new(MemoryDriver::new());
        let pool = SessionPool::new(driver.clone(), config(2, 1));
        pool.warm_up().await.unwrap();

        pool.close().await.unwrap();

        assert!(matches!(pool.acquire().await, Err(Neo4jError::PoolClosed)));
        assert_eq!(pool.metrics().pooled_sessions, 0);
        assert!(driver.is_closed());
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_session() {
        let pool = SessionPool::new(Arc::new(MemoryDriver::new()), config(2, 0));
        let session = pool.acquire().await.unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            session.release().await;
        });

        pool.close().await.unwrap();
        releaser.await.unwrap();

        let metrics = pool.metrics();
        assert_eq!(metrics.active_sessions, 0);
        assert_eq!(metrics.total_released, 1);
        // Released after close was requested, so it was discarded
        assert_eq!(metrics.pooled_sessions, 0);
    }
}
