//! # Runtime Event Bus
//!
//! Purpose: Carry runtime telemetry (connection lifecycle, aggregated command
//! latencies) from the client internals to any number of observers.
//!
//! ## Design Principles
//! 1. **Publish/Subscribe**: Each subscriber owns an independent receiver.
//! 2. **Never Block Publishers**: A slow subscriber lags and skips events; the
//!    publisher never waits.
//! 3. **Tagged Union**: Observers match on the variant they care about.

use std::collections::BTreeMap;

use serde::Serialize;
use tokio::sync::broadcast;

/// Number of events buffered per subscriber before it starts lagging.
pub const DEFAULT_EVENT_BUS_CAPACITY: usize = 1024;

/// Latency statistics for one command type over one emit interval.
///
/// All values are in microseconds. Percentiles are bucket upper bounds, so
/// they overestimate by at most one bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LatencyStats {
    /// Number of completed commands.
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
}

/// Per-command latency map, keyed by upper-cased command name.
pub type CommandLatencies = BTreeMap<String, LatencyStats>;

/// Aggregated latencies published once per emit interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLatencyEvent {
    pub latencies: CommandLatencies,
}

/// Events published on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A physical connection was established and authenticated.
    Connected { id: u64, address: String },
    /// A physical connection was closed or discarded.
    Disconnected { id: u64, address: String },
    /// Periodic command latency report.
    CommandLatency(CommandLatencyEvent),
}

/// Handle to the process-wide event bus.
///
/// Cloning is cheap; all clones publish into the same channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    /// Publishes an event to every current subscriber.
    ///
    /// Events published while nobody listens are dropped.
    pub fn publish(&self, event: RuntimeEvent) {
        let _ = self.sender.send(event);
    }

    /// Attaches a new independent receiver.
    ///
    /// The receiver sees only events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    /// Number of receivers currently attached.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(DEFAULT_EVENT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_receive_independently() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(RuntimeEvent::Connected {
            id: 1,
            address: "127.0.0.1:6379".to_string(),
        });

        assert!(matches!(first.try_recv(), Ok(RuntimeEvent::Connected { id: 1, .. })));
        assert!(matches!(second.try_recv(), Ok(RuntimeEvent::Connected { id: 1, .. })));
        assert!(first.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let bus = EventBus::new(8);
        bus.publish(RuntimeEvent::Disconnected {
            id: 3,
            address: "localhost:6379".to_string(),
        });
        let mut late = bus.subscribe();
        assert!(late.try_recv().is_err());
    }
}
