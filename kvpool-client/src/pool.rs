//! # Connection Pool
//!
//! Purpose: Bound the number of live physical connections, reuse idle ones,
//! and block callers up to a maximum wait when the pool is exhausted.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: The mutex guards only bookkeeping; connects and
//!    closes happen outside it.
//! 3. **Reserve, Then Connect**: A slot is counted before the slow connect so
//!    concurrent callers can never overshoot `max_total`.
//! 4. **LIFO Reuse**: The most recently returned connection is handed out
//!    first; the oldest idle ones age out through eviction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::event::{EventBus, RuntimeEvent};

/// Default idle age after which the evictor may close a connection.
pub const DEFAULT_MIN_EVICTABLE_IDLE_TIME: Duration = Duration::from_secs(30 * 60);

/// Bounded-pool sizing and wait policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Maximum live connections (idle + borrowed).
    pub max_total: usize,
    /// Maximum idle connections retained; extra returns are closed.
    pub max_idle: usize,
    /// Idle connections kept warm when deciding between reuse and connect.
    pub min_idle: usize,
    /// How long `acquire` blocks when exhausted; `None` waits forever.
    pub max_wait: Option<Duration>,
    /// Evictor cadence; `None` disables idle eviction.
    pub time_between_eviction_runs: Option<Duration>,
    /// Idle age at which the evictor closes a connection.
    pub min_evictable_idle_time: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        PoolPolicy {
            max_total: 8,
            max_idle: 8,
            min_idle: 0,
            max_wait: None,
            time_between_eviction_runs: None,
            min_evictable_idle_time: DEFAULT_MIN_EVICTABLE_IDLE_TIME,
        }
    }
}

impl PoolPolicy {
    pub fn new(max_total: usize, max_idle: usize, min_idle: usize, max_wait: Option<Duration>) -> Self {
        PoolPolicy {
            max_total,
            max_idle,
            min_idle,
            max_wait,
            ..PoolPolicy::default()
        }
    }

    /// Enables the idle evictor.
    pub fn with_eviction(mut self, every: Duration, min_evictable_idle_time: Duration) -> Self {
        self.time_between_eviction_runs = Some(every);
        self.min_evictable_idle_time = min_evictable_idle_time;
        self
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.max_idle > self.max_total {
            return Err(ClientError::invalid(format!(
                "max_idle ({}) must not exceed max_total ({})",
                self.max_idle, self.max_total
            )));
        }
        if self.min_idle > self.max_idle {
            return Err(ClientError::invalid(format!(
                "min_idle ({}) must not exceed max_idle ({})",
                self.min_idle, self.max_idle
            )));
        }
        if self.time_between_eviction_runs.is_some_and(|every| every.is_zero()) {
            return Err(ClientError::invalid("eviction interval must be positive"));
        }
        Ok(())
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Live connections, idle and borrowed.
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    /// Callers currently blocked in `acquire`.
    pub waiting: usize,
    /// Physical connections ever established.
    pub created: u64,
    /// Physical connections closed or discarded.
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
    /// Acquisitions that failed with `PoolExhausted`.
    pub exhausted: u64,
}

/// Outcome of a checkout: either a reusable connection or a reserved slot
/// the caller must fill with a new connection.
pub(crate) enum Checkout {
    Idle(Connection),
    Reserved,
}

struct IdleConnection {
    conn: Connection,
    idle_since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConnection>,
    total: usize,
    waiting: usize,
    closed: bool,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    destroyed: AtomicU64,
    borrowed: AtomicU64,
    returned: AtomicU64,
    exhausted: AtomicU64,
}

pub(crate) struct ConnectionPool {
    policy: PoolPolicy,
    address: String,
    events: EventBus,
    state: Mutex<PoolState>,
    available: Condvar,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl ConnectionPool {
    pub(crate) fn new(policy: PoolPolicy, address: String, events: EventBus) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(policy.max_idle),
            total: 0,
            waiting: 0,
            closed: false,
        };
        ConnectionPool {
            policy,
            address,
            events,
            state: Mutex::new(state),
            available: Condvar::new(),
            next_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
        }
    }

    pub(crate) fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Takes an idle connection or reserves a slot for a new one.
    ///
    /// **Logic**:
    /// 1. Reuse an idle connection if `min_idle` still holds afterwards, or if
    ///    no new connection may be opened anyway.
    /// 2. Otherwise reserve a slot while `total < max_total`.
    /// 3. Otherwise wait for a return, up to `max_wait`.
    pub(crate) fn checkout(&self) -> ClientResult<Checkout> {
        let started = Instant::now();
        let deadline = self.policy.max_wait.map(|wait| started + wait);
        let mut state = self.state.lock();
        let mut expired = false;

        loop {
            if state.closed {
                return Err(ClientError::FactoryClosed);
            }

            let can_create = state.total < self.policy.max_total;
            if state.idle.len() > self.policy.min_idle || !can_create {
                if let Some(entry) = state.idle.pop_back() {
                    return Ok(Checkout::Idle(entry.conn));
                }
            }
            if can_create {
                state.total += 1;
                return Ok(Checkout::Reserved);
            }
            if expired {
                self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                return Err(ClientError::PoolExhausted {
                    waited: started.elapsed(),
                });
            }

            state.waiting += 1;
            match deadline {
                Some(deadline) => {
                    expired = self.available.wait_until(&mut state, deadline).timed_out();
                }
                None => self.available.wait(&mut state),
            }
            state.waiting -= 1;
        }
    }

    /// Reserves a slot if fewer than `min_idle` connections are idle.
    pub(crate) fn reserve_for_min_idle(&self) -> ClientResult<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ClientError::FactoryClosed);
        }
        if state.idle.len() < self.policy.min_idle && state.total < self.policy.max_total {
            state.total += 1;
            return Ok(true);
        }
        Ok(false)
    }

    /// Gives back a reserved slot whose connect attempt failed.
    pub(crate) fn cancel_reservation(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        self.notify(&state);
    }

    /// Accounts for a freshly established connection.
    pub(crate) fn register_created(&self, conn: &Connection) {
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(id = conn.id(), address = %self.address, "physical connection established");
        self.events.publish(RuntimeEvent::Connected {
            id: conn.id(),
            address: self.address.clone(),
        });
    }

    pub(crate) fn note_borrowed(&self) {
        self.counters.borrowed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a borrowed connection.
    pub(crate) fn release(&self, conn: Connection) {
        self.counters.returned.fetch_add(1, Ordering::Relaxed);
        self.checkin(conn);
    }

    /// Puts a healthy connection into the idle set, or closes it when the
    /// pool is closed or already holds `max_idle` idle connections.
    pub(crate) fn checkin(&self, conn: Connection) {
        if conn.is_broken() {
            self.discard(conn);
            return;
        }

        let mut state = self.state.lock();
        if state.closed || state.idle.len() >= self.policy.max_idle {
            state.total = state.total.saturating_sub(1);
            self.notify(&state);
            drop(state);
            self.close_physical(conn);
            return;
        }
        state.idle.push_back(IdleConnection {
            conn,
            idle_since: Instant::now(),
        });
        self.notify(&state);
    }

    /// Closes a connection that must never be reused.
    pub(crate) fn discard(&self, conn: Connection) {
        {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
            self.notify(&state);
        }
        self.close_physical(conn);
    }

    /// Frees the slot of a connection that was lost in flight.
    pub(crate) fn forget(&self) {
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        self.cancel_reservation();
    }

    /// Closes idle connections older than `min_evictable_idle_time`, keeping
    /// at least `min_idle`.
    pub(crate) fn evict_idle(&self) -> usize {
        let threshold = self.policy.min_evictable_idle_time;
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            while state.idle.len() > self.policy.min_idle {
                match state.idle.front() {
                    Some(entry) if entry.idle_since.elapsed() >= threshold => {
                        if let Some(entry) = state.idle.pop_front() {
                            evicted.push(entry.conn);
                        }
                    }
                    _ => break,
                }
            }
            state.total = state.total.saturating_sub(evicted.len());
            if !evicted.is_empty() {
                self.available.notify_all();
            }
        }

        let count = evicted.len();
        for conn in evicted {
            self.close_physical(conn);
        }
        count
    }

    /// Closes the pool: idle connections are closed at once, borrowed ones
    /// get until `grace` to come back.
    ///
    /// Returns the number of connections still borrowed when the grace ran out.
    pub(crate) fn close(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;
        let drained: Vec<IdleConnection> = {
            let mut state = self.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            self.available.notify_all();
            drained
        };
        for entry in drained {
            self.close_physical(entry.conn);
        }

        let mut state = self.state.lock();
        while state.total > 0 {
            if self.available.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.total
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            active: state.total.saturating_sub(state.idle.len()),
            waiting: state.waiting,
            created: self.counters.created.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            borrowed: self.counters.borrowed.load(Ordering::Relaxed),
            returned: self.counters.returned.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
        }
    }

    fn notify(&self, state: &PoolState) {
        // Once closed, both blocked acquirers and the closer must observe it.
        if state.closed {
            self.available.notify_all();
        } else {
            self.available.notify_one();
        }
    }

    fn close_physical(&self, conn: Connection) {
        self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
        debug!(id = conn.id(), address = %self.address, "physical connection closed");
        self.events.publish(RuntimeEvent::Disconnected {
            id: conn.id(),
            address: self.address.clone(),
        });
    }
}

/// Periodically evicts stale idle connections until the pool closes.
pub(crate) async fn run_evictor(pool: Arc<ConnectionPool>, every: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if pool.is_closed() {
            break;
        }
        let evicted = pool.evict_idle();
        if evicted > 0 {
            debug!(evicted, "evicted idle connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(policy: PoolPolicy) -> ConnectionPool {
        ConnectionPool::new(policy, "127.0.0.1:6379".to_string(), EventBus::new(16))
    }

    #[test]
    fn accepts_valid_policies() {
        for (total, idle, min) in [(0, 0, 0), (1, 1, 1), (8, 8, 0), (16, 4, 2)] {
            assert!(PoolPolicy::new(total, idle, min, None).validate().is_ok());
        }
    }

    #[test]
    fn rejects_inverted_bounds() {
        assert!(PoolPolicy::new(2, 3, 0, None).validate().is_err());
        assert!(PoolPolicy::new(4, 2, 3, None).validate().is_err());
        assert!(PoolPolicy::default()
            .with_eviction(Duration::ZERO, Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    fn reserves_until_max_total_then_times_out() {
        let pool = pool(PoolPolicy::new(2, 2, 0, Some(Duration::from_millis(30))));
        assert!(matches!(pool.checkout(), Ok(Checkout::Reserved)));
        assert!(matches!(pool.checkout(), Ok(Checkout::Reserved)));

        let started = Instant::now();
        let err = pool.checkout().err().unwrap();
        assert!(matches!(err, ClientError::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(30));

        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.exhausted, 1);
    }

    #[test]
    fn cancelled_reservation_wakes_a_waiter() {
        let pool = Arc::new(pool(PoolPolicy::new(1, 1, 0, Some(Duration::from_secs(2)))));
        assert!(matches!(pool.checkout(), Ok(Checkout::Reserved)));

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || matches!(pool.checkout(), Ok(Checkout::Reserved)))
        };
        std::thread::sleep(Duration::from_millis(50));
        pool.cancel_reservation();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn close_fails_blocked_and_future_checkouts() {
        let pool = Arc::new(pool(PoolPolicy::new(1, 1, 0, None)));
        assert!(matches!(pool.checkout(), Ok(Checkout::Reserved)));

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.checkout().err())
        };
        std::thread::sleep(Duration::from_millis(50));
        let outstanding = pool.close(Duration::from_millis(20));
        assert_eq!(outstanding, 1);
        assert!(matches!(waiter.join().unwrap(), Some(ClientError::FactoryClosed)));
        assert!(matches!(pool.checkout(), Err(ClientError::FactoryClosed)));
        assert!(pool.is_closed());
    }

    #[test]
    fn min_idle_reservation_stops_at_bounds() {
        let pool = pool(PoolPolicy::new(3, 2, 2, None));
        assert!(pool.reserve_for_min_idle().unwrap());
        assert!(pool.reserve_for_min_idle().unwrap());
        assert!(pool.reserve_for_min_idle().unwrap());
        // max_total reached while nothing is idle yet.
        assert!(!pool.reserve_for_min_idle().unwrap());
    }
}
