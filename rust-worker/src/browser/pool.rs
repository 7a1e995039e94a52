//! Bounded pool of reusable browser sessions.
//!
//! A FIFO semaphore caps concurrent leases, so waiters are served in
//! arrival order. Idle sessions are reused before new ones are created.
//! A lease is returned with [`BrowserSessionPool::release`]; a lease that is
//! dropped instead (task aborted, panic) frees its permit immediately and
//! leaves the session for the reaper to close.
//!
//! Session creation runs in its own tracked task. A caller that gives up
//! while a browser is starting does not lose it: the finished session is
//! parked in the idle set, and shutdown waits for creations in flight.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{Browser, SessionHandle};
use crate::util::backoff;

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub create_attempts: u32,
    pub create_backoff: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_sessions: 2,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            create_attempts: 3,
            create_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no browser session became available within {0:?}")]
    PoolExhausted(Duration),

    #[error("browser sessions unavailable after {attempts} attempts: {message}")]
    PoolUnavailable { attempts: u32, message: String },

    #[error("session pool is shut down")]
    Closed,
}

/// Pool accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_sessions: usize,
    pub leased: usize,
    pub idle: usize,
    pub created: usize,
    pub destroyed: usize,
    pub orphaned: usize,
}

struct PooledSession {
    handle: SessionHandle,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolInner {
    browser: Arc<dyn Browser>,
    settings: PoolSettings,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PooledSession>>,
    /// Sessions waiting for the reaper, with the reason they are closed.
    retiring: Mutex<Vec<(SessionHandle, &'static str)>>,
    creating: TaskTracker,
    leased: AtomicUsize,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    orphaned: AtomicUsize,
}

impl PoolInner {
    fn idle(&self) -> std::sync::MutexGuard<'_, VecDeque<PooledSession>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retiring(&self) -> std::sync::MutexGuard<'_, Vec<(SessionHandle, &'static str)>> {
        self.retiring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, session: &PooledSession, now: Instant) -> bool {
        now.duration_since(session.created_at) >= self.settings.max_lifetime
            || now.duration_since(session.idle_since) >= self.settings.idle_timeout
    }

    async fn destroy(&self, handle: &SessionHandle, reason: &'static str) {
        if let Err(e) = self.browser.close_session(handle).await {
            warn!(session_id = %handle, error = %e, "pool_session_close_failed");
        }
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        debug!(session_id = %handle, reason = reason, "pool_session_destroyed");
    }
}

/// A session leased to exactly one job.
pub struct SessionLease {
    pool: Arc<PoolInner>,
    session: Option<PooledSession>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn handle(&self) -> &SessionHandle {
        // Only `None` after release consumed the lease.
        match &self.session {
            Some(session) => &session.handle,
            None => unreachable!("lease used after release"),
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.session.as_ref().map(|s| &s.handle))
            .finish_non_exhaustive()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!(session_id = %session.handle, "pool_session_orphaned");
            self.pool.leased.fetch_sub(1, Ordering::SeqCst);
            self.pool.orphaned.fetch_add(1, Ordering::SeqCst);
            self.pool.retiring().push((session.handle, "orphan_reclaimed"));
        }
    }
}

#[derive(Clone)]
pub struct BrowserSessionPool {
    inner: Arc<PoolInner>,
}

impl BrowserSessionPool {
    pub fn new(browser: Arc<dyn Browser>, settings: PoolSettings) -> Self {
        let max = settings.max_sessions.max(1);
        Self {
            inner: Arc::new(PoolInner {
                browser,
                permits: Arc::new(Semaphore::new(max)),
                settings: PoolSettings {
                    max_sessions: max,
                    ..settings
                },
                idle: Mutex::new(VecDeque::new()),
                retiring: Mutex::new(Vec::new()),
                creating: TaskTracker::new(),
                leased: AtomicUsize::new(0),
                created: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                orphaned: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait (first-come, first-served) for a session.
    pub async fn acquire(&self, timeout: Duration) -> Result<SessionLease, PoolError> {
        let permits = Arc::clone(&self.inner.permits);
        let permit = match tokio::time::timeout(timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "pool_acquire_timeout");
                return Err(PoolError::PoolExhausted(timeout));
            }
        };

        match self.take_idle() {
            Some(session) => Ok(self.lease(session, permit)),
            None => self.create_detached(permit).await,
        }
    }

    fn lease(&self, session: PooledSession, permit: OwnedSemaphorePermit) -> SessionLease {
        self.inner.leased.fetch_add(1, Ordering::SeqCst);
        debug!(session_id = %session.handle, "pool_session_leased");
        SessionLease {
            pool: Arc::clone(&self.inner),
            session: Some(session),
            _permit: permit,
        }
    }

    /// Create a session on a tracked task that finishes even if the caller
    /// is dropped. An unclaimed session goes back through `release`.
    async fn create_detached(&self, permit: OwnedSemaphorePermit) -> Result<SessionLease, PoolError> {
        let (tx, rx) = oneshot::channel();
        let pool = self.clone();
        self.inner.creating.spawn(async move {
            let created = pool
                .create()
                .await
                .map(|session| pool.lease(session, permit));
            if let Err(Ok(unclaimed)) = tx.send(created) {
                debug!(session_id = %unclaimed.handle(), "pool_session_unclaimed");
                pool.release(unclaimed, true).await;
            }
        });

        match rx.await {
            Ok(created) => created,
            Err(_) => Err(PoolError::Closed),
        }
    }

    /// Return a lease. Unhealthy or over-age sessions are destroyed and not
    /// replaced until demand requires it.
    pub async fn release(&self, mut lease: SessionLease, healthy: bool) {
        let Some(mut session) = lease.session.take() else {
            return;
        };
        self.inner.leased.fetch_sub(1, Ordering::SeqCst);

        let now = Instant::now();
        let too_old = now.duration_since(session.created_at) >= self.inner.settings.max_lifetime;

        if healthy && !too_old && !self.inner.permits.is_closed() {
            session.idle_since = now;
            debug!(session_id = %session.handle, "pool_session_released");
            self.inner.idle().push_back(session);
        } else {
            let reason = if !healthy { "unhealthy" } else { "max_lifetime" };
            self.inner.destroy(&session.handle, reason).await;
        }
        // The permit is freed only now, after the session is back or gone.
        drop(lease);
    }

    /// Newest fresh idle session. Expired ones met on the way are handed
    /// to the reaper.
    fn take_idle(&self) -> Option<PooledSession> {
        let now = Instant::now();
        let mut idle = self.inner.idle();
        while let Some(session) = idle.pop_back() {
            if !self.inner.is_expired(&session, now) {
                return Some(session);
            }
            self.inner.retiring().push((session.handle, "expired"));
        }
        None
    }

    async fn create(&self) -> Result<PooledSession, PoolError> {
        let attempts = self.inner.settings.create_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.inner.browser.new_session().await {
                Ok(handle) => {
                    self.inner.created.fetch_add(1, Ordering::SeqCst);
                    info!(session_id = %handle, attempt = attempt, "pool_session_created");
                    let now = Instant::now();
                    return Ok(PooledSession {
                        handle,
                        created_at: now,
                        idle_since: now,
                    });
                }
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "pool_session_create_failed");
                    last_error = e.message;
                    if attempt < attempts {
                        sleep(backoff::exponential(self.inner.settings.create_backoff, attempt)).await;
                    }
                }
            }
        }

        Err(PoolError::PoolUnavailable {
            attempts,
            message: last_error,
        })
    }

    /// Destroy idle sessions past their idle timeout or lifetime, and any
    /// sessions retired since the last pass (orphaned or found expired).
    pub async fn reap(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<PooledSession> = {
            let mut idle = self.inner.idle();
            let (expired, keep): (Vec<_>, Vec<_>) =
                idle.drain(..).partition(|s| self.inner.is_expired(s, now));
            idle.extend(keep);
            expired
        };
        let retiring = std::mem::take(&mut *self.inner.retiring());

        let reaped = expired.len() + retiring.len();
        for session in expired {
            self.inner.destroy(&session.handle, "reaped").await;
        }
        for (handle, reason) in retiring {
            self.inner.destroy(&handle, reason).await;
        }

        if reaped > 0 {
            info!(reaped = reaped, "pool_reaped");
        }
        reaped
    }

    /// Run [`reap`](Self::reap) every `every` until the pool shuts down.
    pub fn spawn_reaper(&self, every: Duration) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if pool.inner.permits.is_closed() {
                    break;
                }
                pool.reap().await;
            }
        })
    }

    /// Refuse new leases, let sessions being created finish, then close
    /// every idle and retired session.
    pub async fn shutdown(&self) {
        self.inner.permits.close();
        self.inner.creating.close();
        self.inner.creating.wait().await;

        let idle: Vec<PooledSession> = self.inner.idle().drain(..).collect();
        let retiring = std::mem::take(&mut *self.inner.retiring());
        let closing = idle
            .iter()
            .map(|s| &s.handle)
            .chain(retiring.iter().map(|(handle, _)| handle))
            .map(|handle| self.inner.destroy(handle, "shutdown"));
        futures::future::join_all(closing).await;
        info!("pool_shutdown_complete");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            max_sessions: self.inner.settings.max_sessions,
            leased: self.inner.leased.load(Ordering::SeqCst),
            idle: self.inner.idle().len(),
            created: self.inner.created.load(Ordering::SeqCst),
            destroyed: self.inner.destroyed.load(Ordering::SeqCst),
            orphaned: self.inner.orphaned.load(Ordering::SeqCst),
        }
    }
}
