//! # Client Resources
//!
//! Purpose: Own the thread pools and the event bus shared by every connection
//! a process opens, so their cost is paid once.
//!
//! ## Design Principles
//! 1. **Shared Handle**: `ClientResources` is a cheap `Arc` clone; factories
//!    hold a counted lease on top of it.
//! 2. **Two Runtimes**: Network I/O and computation (telemetry, event
//!    delivery, eviction) never compete for the same workers.
//! 3. **Explicit Shutdown**: Worker threads stop only through `shutdown`, after
//!    every lease is returned.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};
use crate::event::{EventBus, DEFAULT_EVENT_BUS_CAPACITY};
use crate::latency::{emit_latencies, CommandLatencyCollector};

/// Default interval between command latency events.
pub const DEFAULT_EVENT_EMIT_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Builder for [`ClientResources`].
#[derive(Debug, Clone)]
pub struct ClientResourcesBuilder {
    io_threads: usize,
    compute_threads: usize,
    emit_interval: Duration,
    latency_tracking: bool,
    reset_latencies_after_event: bool,
    event_bus_capacity: usize,
}

impl Default for ClientResourcesBuilder {
    fn default() -> Self {
        ClientResourcesBuilder {
            io_threads: 1,
            compute_threads: 1,
            emit_interval: DEFAULT_EVENT_EMIT_INTERVAL,
            latency_tracking: true,
            reset_latencies_after_event: true,
            event_bus_capacity: DEFAULT_EVENT_BUS_CAPACITY,
        }
    }
}

impl ClientResourcesBuilder {
    pub fn io_threads(mut self, count: usize) -> Self {
        self.io_threads = count;
        self
    }

    pub fn compute_threads(mut self, count: usize) -> Self {
        self.compute_threads = count;
        self
    }

    /// Cadence of `CommandLatencyEvent` publication.
    pub fn event_emit_interval(mut self, interval: Duration) -> Self {
        self.emit_interval = interval;
        self
    }

    /// Enables or disables per-command latency recording.
    pub fn latency_tracking(mut self, enabled: bool) -> Self {
        self.latency_tracking = enabled;
        self
    }

    /// Clears collected latencies after each published event.
    pub fn reset_latencies_after_event(mut self, reset: bool) -> Self {
        self.reset_latencies_after_event = reset;
        self
    }

    pub fn event_bus_capacity(mut self, capacity: usize) -> Self {
        self.event_bus_capacity = capacity;
        self
    }

    /// Validates the settings and starts the worker threads.
    pub fn build(self) -> ClientResult<ClientResources> {
        if self.io_threads == 0 {
            return Err(ClientError::invalid("io thread count must be positive"));
        }
        if self.compute_threads == 0 {
            return Err(ClientError::invalid("computation thread count must be positive"));
        }
        if self.emit_interval.is_zero() {
            return Err(ClientError::invalid("event emit interval must be positive"));
        }

        let io = Builder::new_multi_thread()
            .worker_threads(self.io_threads)
            .thread_name("kvpool-io")
            .enable_all()
            .build()?;
        let compute = Builder::new_multi_thread()
            .worker_threads(self.compute_threads)
            .thread_name("kvpool-compute")
            .enable_all()
            .build()?;

        let event_bus = EventBus::new(self.event_bus_capacity);
        let latency = Arc::new(CommandLatencyCollector::new(
            self.latency_tracking,
            self.reset_latencies_after_event,
        ));
        compute.spawn(emit_latencies(
            latency.clone(),
            event_bus.clone(),
            self.emit_interval,
        ));

        info!(
            io_threads = self.io_threads,
            compute_threads = self.compute_threads,
            emit_interval_ms = self.emit_interval.as_millis() as u64,
            "client resources started"
        );

        Ok(ClientResources {
            inner: Arc::new(ResourcesInner {
                io_threads: self.io_threads,
                compute_threads: self.compute_threads,
                emit_interval: self.emit_interval,
                io_handle: io.handle().clone(),
                compute_handle: compute.handle().clone(),
                io: Mutex::new(Some(io)),
                compute: Mutex::new(Some(compute)),
                event_bus,
                latency,
                in_flight: IoGate::default(),
                leases: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

struct ResourcesInner {
    io_threads: usize,
    compute_threads: usize,
    emit_interval: Duration,
    io_handle: Handle,
    compute_handle: Handle,
    io: Mutex<Option<Runtime>>,
    compute: Mutex<Option<Runtime>>,
    event_bus: EventBus,
    latency: Arc<CommandLatencyCollector>,
    in_flight: IoGate,
    leases: AtomicUsize,
    shut_down: AtomicBool,
}

#[derive(Default)]
struct GateState {
    in_flight: usize,
    closed: bool,
}

/// Counts blocking `run_io` calls so shutdown can let them finish.
#[derive(Default)]
struct IoGate {
    state: Mutex<GateState>,
    drained: Condvar,
}

impl IoGate {
    fn enter(&self) -> Option<IoTicket<'_>> {
        let mut state = self.state.lock();
        if state.closed {
            return None;
        }
        state.in_flight += 1;
        Some(IoTicket { gate: self })
    }

    /// Refuses new work, then waits until nothing is in flight or `deadline` passes.
    ///
    /// Returns the number of calls still running.
    fn close_and_drain(&self, deadline: Instant) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        while state.in_flight > 0 {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.in_flight
    }
}

struct IoTicket<'a> {
    gate: &'a IoGate,
}

impl Drop for IoTicket<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.gate.drained.notify_all();
        }
    }
}

impl Drop for ResourcesInner {
    fn drop(&mut self) {
        // Never block here: the last handle may be dropped on a worker thread.
        if let Some(runtime) = self.io.get_mut().take() {
            runtime.shutdown_background();
        }
        if let Some(runtime) = self.compute.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

/// Process-wide runtime resources shared by connection factories.
///
/// Shutdown ordering: every [`ConnectionFactory`](crate::ConnectionFactory)
/// built on these resources must be closed before [`shutdown`](Self::shutdown)
/// is called. Debug builds assert this.
#[derive(Clone)]
pub struct ClientResources {
    inner: Arc<ResourcesInner>,
}

impl ClientResources {
    pub fn builder() -> ClientResourcesBuilder {
        ClientResourcesBuilder::default()
    }

    /// Creates resources with the given pool sizes and latency cadence.
    pub fn create(
        io_threads: usize,
        compute_threads: usize,
        emit_interval: Duration,
    ) -> ClientResult<Self> {
        ClientResourcesBuilder::default()
            .io_threads(io_threads)
            .compute_threads(compute_threads)
            .event_emit_interval(emit_interval)
            .build()
    }

    pub fn io_thread_count(&self) -> usize {
        self.inner.io_threads
    }

    pub fn compute_thread_count(&self) -> usize {
        self.inner.compute_threads
    }

    pub fn event_emit_interval(&self) -> Duration {
        self.inner.emit_interval
    }

    /// The process-wide event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.inner.event_bus
    }

    /// Number of factories currently holding a lease.
    pub fn lease_count(&self) -> usize {
        self.inner.leases.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub(crate) fn latency(&self) -> &CommandLatencyCollector {
        &self.inner.latency
    }

    pub(crate) fn lease(&self) -> ResourceLease {
        self.inner.leases.fetch_add(1, Ordering::AcqRel);
        ResourceLease {
            resources: self.clone(),
        }
    }

    /// Runs `future` on an I/O worker and blocks the calling thread for its result.
    ///
    /// `shutdown` waits for calls already running here, up to its timeout.
    /// A panic inside `future` surfaces as an I/O error.
    /// Must not be called from inside an async context.
    pub(crate) fn run_io<F, T>(&self, future: F) -> ClientResult<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let _ticket = self
            .inner
            .in_flight
            .enter()
            .ok_or(ClientError::ResourcesShutdown)?;
        let (tx, rx) = oneshot::channel();
        self.inner.io_handle.spawn(async move {
            let _ = tx.send(tokio::spawn(future).await);
        });
        // A runtime shutting down drops the task and with it the sender.
        match rx.blocking_recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) if err.is_panic() => {
                warn!("i/o task panicked");
                Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "i/o task panicked",
                )))
            }
            Ok(Err(_)) | Err(_) => Err(ClientError::ResourcesShutdown),
        }
    }

    /// Spawns a task on the computation runtime.
    pub fn spawn_compute<F>(&self, future: F) -> ClientResult<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.is_shut_down() {
            return Err(ClientError::ResourcesShutdown);
        }
        Ok(self.inner.compute_handle.spawn(future))
    }

    /// Stops both runtimes, waiting up to `timeout` for in-flight work.
    ///
    /// New I/O is refused at once. Commands and connects already running get
    /// until `timeout` to finish; whatever is left is then dropped with the
    /// workers. Idempotent. Must run on a plain thread, after every factory
    /// using these resources has been closed.
    pub fn shutdown(&self, timeout: Duration) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let leases = self.lease_count();
        if leases > 0 {
            warn!(leases, "client resources shut down while factories still hold them");
        }
        debug_assert_eq!(leases, 0, "close every connection factory before shutting down client resources");

        let started = Instant::now();
        let pending = self.inner.in_flight.close_and_drain(started + timeout);
        if pending > 0 {
            warn!(pending, "i/o still in flight at shutdown timeout; cancelling");
        }
        let remaining = timeout.saturating_sub(started.elapsed());
        if let Some(runtime) = self.inner.io.lock().take() {
            runtime.shutdown_timeout(remaining);
        }
        let remaining = timeout.saturating_sub(started.elapsed());
        if let Some(runtime) = self.inner.compute.lock().take() {
            runtime.shutdown_timeout(remaining);
        }
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "client resources shut down");
    }
}

/// Counted claim on [`ClientResources`] held by one factory.
pub(crate) struct ResourceLease {
    resources: ClientResources,
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        self.resources.inner.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_thread_counts() {
        let err = ClientResources::create(0, 1, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, ClientError::InvalidConfiguration(_)));
        let err = ClientResources::create(1, 0, Duration::from_secs(1)).err().unwrap();
        assert!(matches!(err, ClientError::InvalidConfiguration(_)));
    }

    #[test]
    fn exposes_configured_sizes() {
        let resources = ClientResources::create(2, 3, Duration::from_secs(5)).unwrap();
        assert_eq!(resources.io_thread_count(), 2);
        assert_eq!(resources.compute_thread_count(), 3);
        assert_eq!(resources.event_emit_interval(), Duration::from_secs(5));
        resources.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn run_io_executes_on_io_workers() {
        let resources = ClientResources::create(1, 1, Duration::from_secs(60)).unwrap();
        let name = resources
            .run_io(async { std::thread::current().name().map(str::to_string) })
            .unwrap();
        assert_eq!(name.as_deref(), Some("kvpool-io"));
        resources.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn panicking_io_task_is_an_io_error() {
        let resources = ClientResources::create(1, 1, Duration::from_secs(60)).unwrap();
        let err = resources
            .run_io::<_, ()>(async { panic!("corrupt frame") })
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Io(_)), "{err}");
        assert!(!resources.is_shut_down());
        assert_eq!(resources.run_io(async { 7 }).unwrap(), 7);
        resources.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn shutdown_lets_running_io_finish() {
        let resources = ClientResources::create(1, 1, Duration::from_secs(60)).unwrap();
        let worker = {
            let resources = resources.clone();
            std::thread::spawn(move || {
                resources.run_io(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "done"
                })
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        resources.shutdown(Duration::from_secs(2));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(worker.join().unwrap().unwrap(), "done");
    }

    #[test]
    fn shutdown_cancels_io_still_running_at_timeout() {
        let resources = ClientResources::create(1, 1, Duration::from_secs(60)).unwrap();
        let worker = {
            let resources = resources.clone();
            std::thread::spawn(move || {
                resources.run_io(async { tokio::time::sleep(Duration::from_secs(30)).await })
            })
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        resources.shutdown(Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(worker.join().unwrap(), Err(ClientError::ResourcesShutdown)));
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_new_work() {
        let resources = ClientResources::create(1, 1, Duration::from_secs(60)).unwrap();
        resources.shutdown(Duration::from_millis(200));
        resources.shutdown(Duration::from_millis(200));
        assert!(resources.is_shut_down());
        assert!(matches!(resources.run_io(async { 1 }), Err(ClientError::ResourcesShutdown)));
        assert!(matches!(
            resources.spawn_compute(async {}),
            Err(ClientError::ResourcesShutdown)
        ));
    }

    #[test]
    fn leases_are_counted() {
        let resources = ClientResources::create(1, 1, Duration::from_secs(60)).unwrap();
        let first = resources.lease();
        let second = resources.lease();
        assert_eq!(resources.lease_count(), 2);
        drop(first);
        assert_eq!(resources.lease_count(), 1);
        drop(second);
        assert_eq!(resources.lease_count(), 0);
        resources.shutdown(Duration::from_secs(1));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "close every connection factory")]
    fn shutdown_with_live_lease_panics_in_debug() {
        let resources = ClientResources::create(1, 1, Duration::from_secs(60)).unwrap();
        let _lease = resources.lease();
        resources.shutdown(Duration::from_millis(100));
    }

    #[test]
    fn emits_latency_events_on_interval() {
        let resources = ClientResources::create(1, 1, Duration::from_millis(20)).unwrap();
        let mut rx = resources.event_bus().subscribe();
        resources.latency().record("GET", Duration::from_micros(150));

        let event = resources
            .run_io(async move {
                tokio::time::timeout(Duration::from_secs(2), rx.recv()).await
            })
            .unwrap()
            .expect("latency event within timeout")
            .unwrap();
        match event {
            crate::event::RuntimeEvent::CommandLatency(event) => {
                assert_eq!(event.latencies["GET"].count, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        resources.shutdown(Duration::from_secs(1));
    }
}
