//! Bounded connection pool over a `ServerSet`.
//!
//! Every connection the pool holds was produced by its server set. At most
//! `max_connections` exist at once (idle, checked out, or being created), so
//! checked-out connections never exceed that bound either. A background task
//! health checks stale idle connections and tops the pool back up to
//! `min_connections`.

use crate::config::ClientConfig;
use crate::connection::LdapConnection;
use crate::error::{LdapError, Result};
use crate::metrics::{PoolStatistics, PoolStatisticsSnapshot};
use crate::server_set::ServerSet;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How idle connections are checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthCheckKind {
    /// "Who am I?" extended operation; any response counts as healthy.
    #[default]
    WhoAmI,
    /// Local connection state only, no traffic.
    ConnectionState,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub name: String,
    pub min_connections: usize,
    pub max_connections: usize,
    pub checkout_timeout: Duration,
    /// Zero disables background health checking.
    pub health_check_interval: Duration,
    pub staleness_threshold: Duration,
    pub health_check: HealthCheckKind,
    pub health_check_timeout: Duration,
    pub max_connection_age: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_connections: 1,
            max_connections: 10,
            checkout_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
            staleness_threshold: Duration::from_secs(30),
            health_check: HealthCheckKind::WhoAmI,
            health_check_timeout: Duration::from_secs(3),
            max_connection_age: None,
        }
    }
}

struct PoolSlot {
    connection: LdapConnection,
    created_at: Instant,
    /// Last successful use or health check.
    last_validated: Instant,
}

impl PoolSlot {
    fn new(connection: LdapConnection) -> Self {
        let now = Instant::now();
        Self {
            connection,
            created_at: now,
            last_validated: now,
        }
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PoolSlot>,
    /// Checked out by callers or held by the health checker.
    checked_out: usize,
    pending_creates: usize,
    closed: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.idle.len() + self.checked_out + self.pending_creates
    }
}

struct PoolInner {
    options: PoolOptions,
    server_set: Arc<ServerSet>,
    state: Mutex<PoolState>,
    available: Notify,
    statistics: PoolStatistics,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Slot being created. Dropping it unfinished gives the slot back, so a
/// cancelled checkout cannot leak capacity.
struct CreateReservation<'a> {
    inner: &'a PoolInner,
    finished: bool,
}

impl<'a> CreateReservation<'a> {
    fn finish(mut self, update: impl FnOnce(&mut PoolState)) {
        self.finished = true;
        let mut state = lock(&self.inner.state);
        state.pending_creates -= 1;
        update(&mut state);
    }
}

impl Drop for CreateReservation<'_> {
    fn drop(&mut self) {
        if !self.finished {
            lock(&self.inner.state).pending_creates -= 1;
            self.inner.available.notify_one();
        }
    }
}

enum Acquire {
    Idle(PoolSlot),
    Create,
    Wait,
}

impl PoolInner {
    fn debug(&self, event: &str) {
        self.server_set.options().debug.pool(&self.options.name, event);
    }

    /// Reserve a creation slot while fewer than `limit` connections exist.
    fn reserve_below(&self, limit: usize) -> Option<CreateReservation<'_>> {
        let mut state = lock(&self.state);
        if state.closed || state.total() >= limit.min(self.options.max_connections) {
            return None;
        }
        state.pending_creates += 1;
        Some(CreateReservation {
            inner: self,
            finished: false,
        })
    }

    fn acquire(&self) -> Result<Acquire> {
        let mut defunct = Vec::new();
        let action = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(LdapError::PoolClosed);
            }
            loop {
                match state.idle.pop_back() {
                    Some(slot) if slot.connection.is_usable() => {
                        state.checked_out += 1;
                        break Acquire::Idle(slot);
                    }
                    Some(slot) => defunct.push(slot),
                    None if state.total() < self.options.max_connections => {
                        state.pending_creates += 1;
                        break Acquire::Create;
                    }
                    None => break Acquire::Wait,
                }
            }
        };
        for slot in defunct {
            self.statistics.inc_closed_defunct();
            slot.connection.terminate("defunct pooled connection");
        }
        Ok(action)
    }

    async fn create(&self) -> Result<LdapConnection> {
        match self.server_set.get_connection().await {
            Ok(connection) => {
                self.statistics.inc_connection_created();
                self.debug("connection created");
                Ok(connection)
            }
            Err(e) => {
                self.statistics.inc_failed_connection_attempt();
                warn!(pool = %self.options.name, error = %e, "failed to create pooled connection");
                Err(e)
            }
        }
    }

    /// Return a checked-out slot. Unhealthy or expired connections are
    /// closed and replaced in the background.
    fn release(self: &Arc<Self>, mut slot: PoolSlot, healthy: bool) {
        let healthy = healthy && slot.connection.is_usable();
        let expired = self
            .options
            .max_connection_age
            .map_or(false, |age| slot.created_at.elapsed() >= age);

        let (discard, closed) = {
            let mut state = lock(&self.state);
            state.checked_out = state.checked_out.saturating_sub(1);
            if state.closed {
                (Some(slot), true)
            } else if !healthy {
                self.statistics.inc_release_unhealthy();
                self.statistics.inc_closed_defunct();
                (Some(slot), false)
            } else if expired {
                self.statistics.inc_release_healthy();
                self.statistics.inc_closed_expired();
                (Some(slot), false)
            } else {
                self.statistics.inc_release_healthy();
                slot.last_validated = Instant::now();
                state.idle.push_back(slot);
                (None, false)
            }
        };
        self.available.notify_one();

        if let Some(slot) = discard {
            let reason = if closed {
                "pool closed"
            } else if healthy {
                "connection reached maximum age"
            } else {
                "released as unhealthy"
            };
            debug!(pool = %self.options.name, endpoint = %slot.connection.endpoint(), reason, "discarding connection");
            dispose(slot.connection, reason);
            if !closed {
                self.spawn_replenish();
            }
        }
    }

    fn spawn_replenish(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(self);
        runtime.spawn(async move {
            if let Some(inner) = weak.upgrade() {
                inner.replenish().await;
            }
        });
    }

    /// Create connections until `min_connections` exist.
    async fn replenish(&self) {
        loop {
            let Some(reservation) = self.reserve_below(self.options.min_connections) else {
                return;
            };
            match self.create().await {
                Ok(connection) => {
                    let mut closed = false;
                    let mut slot = Some(PoolSlot::new(connection));
                    reservation.finish(|state| {
                        if state.closed {
                            closed = true;
                        } else if let Some(slot) = slot.take() {
                            state.idle.push_back(slot);
                        }
                    });
                    if let Some(slot) = slot {
                        dispose(slot.connection, "pool closed");
                    }
                    if closed {
                        return;
                    }
                    self.available.notify_one();
                }
                Err(_) => return,
            }
        }
    }

    async fn check(&self, connection: &LdapConnection) -> bool {
        if !connection.is_usable() {
            return false;
        }
        match self.options.health_check {
            HealthCheckKind::ConnectionState => true,
            HealthCheckKind::WhoAmI => {
                match tokio::time::timeout(self.options.health_check_timeout, connection.who_am_i()).await {
                    Ok(Ok(_)) => true,
                    // the server answered, even if it refused the operation
                    Ok(Err(LdapError::OperationFailed { .. })) => true,
                    Ok(Err(_)) | Err(_) => false,
                }
            }
        }
    }

    /// Check idle connections unused for longer than the staleness threshold.
    async fn run_health_check(self: &Arc<Self>) {
        let stale: Vec<PoolSlot> = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            let threshold = self.options.staleness_threshold;
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|slot| slot.last_validated.elapsed() >= threshold);
            state.idle = fresh;
            state.checked_out += stale.len();
            stale.into_iter().collect()
        };
        if stale.is_empty() {
            return;
        }
        self.debug(&format!("health checking {} idle connections", stale.len()));
        for slot in stale {
            self.statistics.inc_health_check();
            let healthy = self.check(&slot.connection).await;
            if !healthy {
                self.statistics.inc_health_check_failure();
                warn!(pool = %self.options.name, endpoint = %slot.connection.endpoint(), "pooled connection failed health check");
                let mut state = lock(&self.state);
                state.checked_out = state.checked_out.saturating_sub(1);
                drop(state);
                self.statistics.inc_closed_defunct();
                dispose(slot.connection, "failed health check");
                continue;
            }
            let mut slot = slot;
            slot.last_validated = Instant::now();
            let leftover = {
                let mut state = lock(&self.state);
                state.checked_out = state.checked_out.saturating_sub(1);
                if state.closed {
                    Some(slot)
                } else {
                    state.idle.push_front(slot);
                    None
                }
            };
            match leftover {
                Some(slot) => dispose(slot.connection, "pool closed"),
                None => self.available.notify_one(),
            }
        }
    }
}

/// Close a connection the pool no longer wants. Graceful when a runtime is
/// available, immediate otherwise.
fn dispose(connection: LdapConnection, reason: &'static str) {
    if !connection.is_usable() {
        connection.terminate(reason);
        return;
    }
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                connection.close().await;
            });
        }
        Err(_) => connection.terminate(reason),
    }
}

async fn health_loop(pool: Weak<PoolInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if lock(&inner.state).closed {
            return;
        }
        inner.run_health_check().await;
        inner.replenish().await;
    }
}

/// Shared handle to a pool. Clones refer to the same pool.
#[derive(Clone)]
pub struct LdapConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for LdapConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("LdapConnectionPool")
            .field("name", &self.inner.options.name)
            .field("available", &state.idle.len())
            .field("checked_out", &state.checked_out)
            .field("max_connections", &self.inner.options.max_connections)
            .finish()
    }
}

impl LdapConnectionPool {
    /// Create the pool and its `min_connections` initial connections. Fails
    /// if any initial connection cannot be established.
    pub async fn new(server_set: Arc<ServerSet>, options: PoolOptions) -> Result<Self> {
        if options.max_connections == 0 || options.min_connections > options.max_connections {
            return Err(LdapError::Config(format!(
                "invalid pool bounds: min {} max {}",
                options.min_connections, options.max_connections
            )));
        }
        let inner = Arc::new(PoolInner {
            options,
            server_set,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            statistics: PoolStatistics::new(),
            health_task: Mutex::new(None),
        });

        for _ in 0..inner.options.min_connections {
            let Some(reservation) = inner.reserve_below(inner.options.min_connections) else {
                break;
            };
            let connection = inner.create().await?;
            reservation.finish(|state| state.idle.push_back(PoolSlot::new(connection)));
        }

        let interval = inner.options.health_check_interval;
        if !interval.is_zero() {
            let task = tokio::spawn(health_loop(Arc::downgrade(&inner), interval));
            *lock(&inner.health_task) = Some(task);
        }
        info!(
            pool = %inner.options.name,
            min = inner.options.min_connections,
            max = inner.options.max_connections,
            "connection pool started"
        );
        Ok(Self { inner })
    }

    /// Server set and pool options from config.
    pub async fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        let server_set = Arc::new(ServerSet::from_config(config)?);
        Ok(Self::new(server_set, config.pool_options()).await?)
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn server_set(&self) -> &Arc<ServerSet> {
        &self.inner.server_set
    }

    /// Check out with the configured checkout timeout.
    pub async fn checkout(&self) -> Result<PooledConnection> {
        self.checkout_timeout(self.inner.options.checkout_timeout).await
    }

    /// Wait up to `timeout` for an idle connection or free capacity. Creating
    /// a new connection is bounded by the connect timeout, not `timeout`.
    pub async fn checkout_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
        let inner = &self.inner;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut waited = false;
        loop {
            let notified = inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match inner.acquire()? {
                Acquire::Idle(slot) => {
                    if waited {
                        inner.statistics.inc_checkout_after_wait();
                    } else {
                        inner.statistics.inc_checkout_immediate();
                    }
                    return Ok(self.wrap(slot));
                }
                Acquire::Create => {
                    let reservation = CreateReservation {
                        inner,
                        finished: false,
                    };
                    match inner.create().await {
                        Ok(connection) => {
                            reservation.finish(|state| state.checked_out += 1);
                            inner.statistics.inc_checkout_new_connection();
                            return Ok(self.wrap(PoolSlot::new(connection)));
                        }
                        Err(e) => {
                            drop(reservation);
                            inner.statistics.inc_checkout_failed();
                            return Err(e);
                        }
                    }
                }
                Acquire::Wait => {
                    waited = true;
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        inner.statistics.inc_checkout_failed();
                        inner.debug("checkout timed out");
                        return Err(LdapError::PoolExhausted {
                            max_connections: inner.options.max_connections,
                            waited: timeout,
                        });
                    }
                }
            }
        }
    }

    fn wrap(&self, slot: PoolSlot) -> PooledConnection {
        PooledConnection {
            slot: Some(slot),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Return a connection. `healthy == false` closes it and never returns it
    /// to service.
    pub fn release(&self, connection: PooledConnection, healthy: bool) {
        connection.release(healthy);
    }

    /// Run one health-check pass now.
    pub async fn check_idle_connections(&self) {
        self.inner.run_health_check().await;
        self.inner.replenish().await;
    }

    pub fn available(&self) -> usize {
        lock(&self.inner.state).idle.len()
    }

    pub fn checked_out(&self) -> usize {
        lock(&self.inner.state).checked_out
    }

    /// Idle, checked out and being created.
    pub fn total(&self) -> usize {
        lock(&self.inner.state).total()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    pub fn statistics(&self) -> PoolStatisticsSnapshot {
        self.inner.statistics.snapshot()
    }

    /// Prometheus exposition of this pool's counters and gauges.
    pub fn render_metrics(&self) -> String {
        let (available, checked_out) = {
            let state = lock(&self.inner.state);
            (state.idle.len(), state.checked_out)
        };
        self.inner
            .statistics
            .render(&self.inner.options.name, available, checked_out)
    }

    /// Close idle connections and stop health checking. Waiting checkouts fail
    /// with `PoolClosed`; checked-out connections are closed on release.
    pub async fn close(&self) {
        let idle: Vec<PoolSlot> = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.idle.drain(..).collect()
        };
        if let Some(task) = lock(&self.inner.health_task).take() {
            task.abort();
        }
        self.inner.available.notify_waiters();
        for slot in idle {
            self.inner.statistics.inc_closed_unneeded();
            slot.connection.close().await;
        }
        info!(pool = %self.inner.options.name, "connection pool closed");
    }
}

/// A checked-out connection. Dereferences to `LdapConnection`; dropping it
/// releases it, healthy if the connection is still usable.
pub struct PooledConnection {
    slot: Option<PoolSlot>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub fn release(mut self, healthy: bool) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot, healthy);
        }
    }

    /// Close this connection and let the pool replace it.
    pub fn discard(self) {
        self.release(false);
    }

    pub fn created_at(&self) -> Option<Instant> {
        self.slot.as_ref().map(|s| s.created_at)
    }
}

impl Deref for PooledConnection {
    type Target = LdapConnection;

    fn deref(&self) -> &LdapConnection {
        match &self.slot {
            Some(slot) => &slot.connection,
            // slot is only taken by release, which consumes self
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.slot {
            Some(slot) => f.debug_tuple("PooledConnection").field(&slot.connection).finish(),
            None => f.write_str("PooledConnection(released)"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            let healthy = slot.connection.is_usable();
            self.pool.release(slot, healthy);
        }
    }
}
