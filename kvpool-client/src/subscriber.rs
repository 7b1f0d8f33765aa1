//! # Latency Event Subscriber
//!
//! Purpose: Forward aggregated command latencies from the event bus to a sink
//! without touching the command path.
//!
//! ## Design Principles
//! 1. **Filter, Then Forward**: Only `CommandLatency` events reach the sink;
//!    batching and cadence belong to the publisher.
//! 2. **Isolation**: Sink errors and panics are caught and logged, never
//!    propagated into the bus or the commands.
//! 3. **Hard Detach**: Once `detach` returns, the sink is never called again.

use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Level};

use crate::error::ClientResult;
use crate::event::{CommandLatencies, RuntimeEvent};
use crate::resources::ClientResources;

/// Result returned by a latency sink.
pub type SinkResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Destination for per-command latency reports.
pub trait LatencySink: Send + Sync + 'static {
    fn report(&self, latencies: &CommandLatencies) -> SinkResult;
}

impl<F> LatencySink for F
where
    F: Fn(&CommandLatencies) -> SinkResult + Send + Sync + 'static,
{
    fn report(&self, latencies: &CommandLatencies) -> SinkResult {
        self(latencies)
    }
}

/// Writes each report as a JSON debug log line, only when debug logging is on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl LatencySink for LogSink {
    fn report(&self, latencies: &CommandLatencies) -> SinkResult {
        if tracing::enabled!(Level::DEBUG) {
            let rendered = serde_json::to_string(latencies)?;
            debug!(latencies = %rendered, "command latency report");
        }
        Ok(())
    }
}

struct Delivery {
    // `None` once detached; the lock also serializes detach with an in-flight report.
    sink: Mutex<Option<Box<dyn LatencySink>>>,
}

impl Delivery {
    /// Returns false once detached.
    fn forward(&self, latencies: &CommandLatencies) -> bool {
        let guard = self.sink.lock();
        let Some(sink) = guard.as_ref() else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| sink.report(latencies))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "latency sink failed; report dropped"),
            Err(_) => warn!("latency sink panicked; report dropped"),
        }
        true
    }

    fn detach(&self) {
        self.sink.lock().take();
    }
}

/// Attaches latency sinks to a resource set's event bus.
pub struct LatencyEventSubscriber;

impl LatencyEventSubscriber {
    /// Subscribes `sink` to the latency events of `resources`.
    ///
    /// Delivery runs on the computation runtime. Events published before this
    /// call are not delivered.
    pub fn attach(
        resources: &ClientResources,
        sink: impl LatencySink,
    ) -> ClientResult<LatencySubscription> {
        let sink: Box<dyn LatencySink> = Box::new(sink);
        let mut events = resources.event_bus().subscribe();
        let delivery = Arc::new(Delivery {
            sink: Mutex::new(Some(sink)),
        });

        let task = {
            let delivery = delivery.clone();
            resources.spawn_compute(async move {
                loop {
                    match events.recv().await {
                        Ok(RuntimeEvent::CommandLatency(event)) => {
                            if !delivery.forward(&event.latencies) {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "latency subscriber lagged behind the event bus");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })?
        };

        debug!(
            emit_interval_ms = resources.event_emit_interval().as_millis() as u64,
            "latency subscriber attached"
        );
        Ok(LatencySubscription {
            delivery,
            task: Some(task),
        })
    }
}

/// Live subscription; dropping it detaches the sink.
pub struct LatencySubscription {
    delivery: Arc<Delivery>,
    task: Option<JoinHandle<()>>,
}

impl LatencySubscription {
    /// Stops delivery. No sink call starts or runs after this returns.
    pub fn detach(mut self) {
        self.stop();
    }

    pub fn is_attached(&self) -> bool {
        self.delivery.sink.lock().is_some()
    }

    fn stop(&mut self) {
        self.delivery.detach();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for LatencySubscription {
    fn drop(&mut self) {
        self.stop();
    }
}
