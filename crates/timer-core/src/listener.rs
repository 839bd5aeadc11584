//! Event surface raised to collaborators (race engine, UI, plugins).
//!
//! Listeners implement [`TimerListener`]; every method has a no-op default
//! so an implementation only overrides the events it cares about. The
//! orchestrator holds one listener, usually a [`ListenerSet`] fanning out to
//! several.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

/// Where a lap came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LapSource {
    /// Detected by a node in real time.
    Realtime,
    /// Injected by an operator.
    Manual,
}

/// Receiver for timer events. Timestamps are milliseconds relative to the
/// race start.
#[allow(unused_variables)]
pub trait TimerListener: Send + Sync {
    /// A polled RSSI sample.
    fn on_rssi_sample(&self, node: usize, timestamp_ms: i64, rssi: i32) {}

    /// A polled peak-lifetime sample.
    fn on_lifetime_sample(&self, node: usize, timestamp_ms: i64, lifetime: i32) {}

    /// A completed pass.
    fn on_pass(&self, node: usize, lap_timestamp_ms: i64, source: LapSource, rssi: Option<i32>) {}

    /// Enter edge of a crossing.
    fn on_enter_triggered(&self, node: usize, timestamp_ms: i64, rssi: Option<i32>) {}

    /// Exit edge of a crossing.
    fn on_exit_triggered(&self, node: usize, timestamp_ms: i64, rssi: Option<i32>) {}

    /// An extremum reported by on-node analytics.
    fn on_extremum_history(&self, node: usize, timestamp_ms: i64, rssi: i32, duration_ms: i32) {}

    /// Node retuned.
    fn on_frequency_changed(&self, node: usize, frequency: u16) {}

    /// Enter-at level changed.
    fn on_enter_trigger_changed(&self, node: usize, level: i32) {}

    /// Exit-at level changed.
    fn on_exit_trigger_changed(&self, node: usize, level: i32) {}

    /// Human-readable status line.
    fn on_log(&self, message: &str) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullListener;

impl TimerListener for NullListener {}

/// Fixed list of listeners receiving every event in order.
#[derive(Default, Clone)]
pub struct ListenerSet {
    listeners: Vec<Arc<dyn TimerListener>>,
}

impl ListenerSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener (builder style).
    pub fn with(mut self, listener: Arc<dyn TimerListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Number of listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// `true` when no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl TimerListener for ListenerSet {
    fn on_rssi_sample(&self, node: usize, timestamp_ms: i64, rssi: i32) {
        for l in &self.listeners {
            l.on_rssi_sample(node, timestamp_ms, rssi);
        }
    }

    fn on_lifetime_sample(&self, node: usize, timestamp_ms: i64, lifetime: i32) {
        for l in &self.listeners {
            l.on_lifetime_sample(node, timestamp_ms, lifetime);
        }
    }

    fn on_pass(&self, node: usize, lap_timestamp_ms: i64, source: LapSource, rssi: Option<i32>) {
        for l in &self.listeners {
            l.on_pass(node, lap_timestamp_ms, source, rssi);
        }
    }

    fn on_enter_triggered(&self, node: usize, timestamp_ms: i64, rssi: Option<i32>) {
        for l in &self.listeners {
            l.on_enter_triggered(node, timestamp_ms, rssi);
        }
    }

    fn on_exit_triggered(&self, node: usize, timestamp_ms: i64, rssi: Option<i32>) {
        for l in &self.listeners {
            l.on_exit_triggered(node, timestamp_ms, rssi);
        }
    }

    fn on_extremum_history(&self, node: usize, timestamp_ms: i64, rssi: i32, duration_ms: i32) {
        for l in &self.listeners {
            l.on_extremum_history(node, timestamp_ms, rssi, duration_ms);
        }
    }

    fn on_frequency_changed(&self, node: usize, frequency: u16) {
        for l in &self.listeners {
            l.on_frequency_changed(node, frequency);
        }
    }

    fn on_enter_trigger_changed(&self, node: usize, level: i32) {
        for l in &self.listeners {
            l.on_enter_trigger_changed(node, level);
        }
    }

    fn on_exit_trigger_changed(&self, node: usize, level: i32) {
        for l in &self.listeners {
            l.on_exit_trigger_changed(node, level);
        }
    }

    fn on_log(&self, message: &str) {
        for l in &self.listeners {
            l.on_log(message);
        }
    }
}

/// Logs events through `tracing`. RSSI samples are logged at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl TimerListener for TracingListener {
    fn on_rssi_sample(&self, node: usize, timestamp_ms: i64, rssi: i32) {
        tracing::trace!(node, timestamp_ms, rssi, "RSSI sample");
    }

    fn on_pass(&self, node: usize, lap_timestamp_ms: i64, source: LapSource, rssi: Option<i32>) {
        info!(node, lap_timestamp_ms, ?source, ?rssi, "Pass");
    }

    fn on_enter_triggered(&self, node: usize, timestamp_ms: i64, rssi: Option<i32>) {
        debug!(node, timestamp_ms, ?rssi, "Enter");
    }

    fn on_exit_triggered(&self, node: usize, timestamp_ms: i64, rssi: Option<i32>) {
        debug!(node, timestamp_ms, ?rssi, "Exit");
    }

    fn on_frequency_changed(&self, node: usize, frequency: u16) {
        info!(node, frequency, "Frequency changed");
    }

    fn on_enter_trigger_changed(&self, node: usize, level: i32) {
        info!(node, level, "Enter-at level changed");
    }

    fn on_exit_trigger_changed(&self, node: usize, level: i32) {
        info!(node, level, "Exit-at level changed");
    }

    fn on_log(&self, message: &str) {
        info!("{}", message);
    }
}

/// Owned copy of a listener callback.
#[derive(Debug, Clone, PartialEq)]
pub enum TimerEvent {
    /// See [`TimerListener::on_rssi_sample`].
    RssiSample {
        /// Node index.
        node: usize,
        /// Sample time.
        timestamp_ms: i64,
        /// Sample value.
        rssi: i32,
    },
    /// See [`TimerListener::on_lifetime_sample`].
    LifetimeSample {
        /// Node index.
        node: usize,
        /// Sample time.
        timestamp_ms: i64,
        /// Lifetime value.
        lifetime: i32,
    },
    /// See [`TimerListener::on_pass`].
    Pass {
        /// Node index.
        node: usize,
        /// Pass time.
        lap_timestamp_ms: i64,
        /// Origin of the lap.
        source: LapSource,
        /// Peak RSSI of the pass.
        rssi: Option<i32>,
    },
    /// See [`TimerListener::on_enter_triggered`].
    Enter {
        /// Node index.
        node: usize,
        /// Edge time.
        timestamp_ms: i64,
        /// RSSI at the edge.
        rssi: Option<i32>,
    },
    /// See [`TimerListener::on_exit_triggered`].
    Exit {
        /// Node index.
        node: usize,
        /// Edge time.
        timestamp_ms: i64,
        /// RSSI at the edge.
        rssi: Option<i32>,
    },
    /// See [`TimerListener::on_extremum_history`].
    Extremum {
        /// Node index.
        node: usize,
        /// First time the extremum was seen.
        timestamp_ms: i64,
        /// Extremum value.
        rssi: i32,
        /// How long it lasted.
        duration_ms: i32,
    },
    /// See [`TimerListener::on_frequency_changed`].
    FrequencyChanged {
        /// Node index.
        node: usize,
        /// New frequency.
        frequency: u16,
    },
    /// See [`TimerListener::on_enter_trigger_changed`].
    EnterTriggerChanged {
        /// Node index.
        node: usize,
        /// New level.
        level: i32,
    },
    /// See [`TimerListener::on_exit_trigger_changed`].
    ExitTriggerChanged {
        /// Node index.
        node: usize,
        /// New level.
        level: i32,
    },
    /// See [`TimerListener::on_log`].
    Log(String),
}

/// Forwards events into a broadcast channel. Sends to a channel with no
/// subscribers are dropped.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: broadcast::Sender<TimerEvent>,
}

impl ChannelListener {
    /// Create a listener and its first receiver.
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<TimerEvent>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    /// Another receiver for the same stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TimerEvent> {
        self.tx.subscribe()
    }

    fn send(&self, event: TimerEvent) {
        let _ = self.tx.send(event);
    }
}

impl TimerListener for ChannelListener {
    fn on_rssi_sample(&self, node: usize, timestamp_ms: i64, rssi: i32) {
        self.send(TimerEvent::RssiSample {
            node,
            timestamp_ms,
            rssi,
        });
    }

    fn on_lifetime_sample(&self, node: usize, timestamp_ms: i64, lifetime: i32) {
        self.send(TimerEvent::LifetimeSample {
            node,
            timestamp_ms,
            lifetime,
        });
    }

    fn on_pass(&self, node: usize, lap_timestamp_ms: i64, source: LapSource, rssi: Option<i32>) {
        self.send(TimerEvent::Pass {
            node,
            lap_timestamp_ms,
            source,
            rssi,
        });
    }

    fn on_enter_triggered(&self, node: usize, timestamp_ms: i64, rssi: Option<i32>) {
        self.send(TimerEvent::Enter {
            node,
            timestamp_ms,
            rssi,
        });
    }

    fn on_exit_triggered(&self, node: usize, timestamp_ms: i64, rssi: Option<i32>) {
        self.send(TimerEvent::Exit {
            node,
            timestamp_ms,
            rssi,
        });
    }

    fn on_extremum_history(&self, node: usize, timestamp_ms: i64, rssi: i32, duration_ms: i32) {
        self.send(TimerEvent::Extremum {
            node,
            timestamp_ms,
            rssi,
            duration_ms,
        });
    }

    fn on_frequency_changed(&self, node: usize, frequency: u16) {
        self.send(TimerEvent::FrequencyChanged { node, frequency });
    }

    fn on_enter_trigger_changed(&self, node: usize, level: i32) {
        self.send(TimerEvent::EnterTriggerChanged { node, level });
    }

    fn on_exit_trigger_changed(&self, node: usize, level: i32) {
        self.send(TimerEvent::ExitTriggerChanged { node, level });
    }

    fn on_log(&self, message: &str) {
        self.send(TimerEvent::Log(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct PassCounter(AtomicUsize);

    impl TimerListener for PassCounter {
        fn on_pass(&self, _: usize, _: i64, _: LapSource, _: Option<i32>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_listener_set_fans_out() {
        let a = Arc::new(PassCounter::default());
        let b = Arc::new(PassCounter::default());
        let set = ListenerSet::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(NullListener));
        assert_eq!(set.len(), 3);

        set.on_pass(0, 1000, LapSource::Realtime, Some(120));
        set.on_log("ignored by counters");

        assert_eq!(a.0.load(Ordering::SeqCst), 1);
        assert_eq!(b.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_channel_listener_forwards_events() {
        let (listener, mut rx) = ChannelListener::new(16);
        listener.on_enter_triggered(2, 150, Some(90));
        listener.on_log("hello");

        assert_eq!(
            rx.recv().await.unwrap(),
            TimerEvent::Enter {
                node: 2,
                timestamp_ms: 150,
                rssi: Some(90)
            }
        );
        assert_eq!(rx.recv().await.unwrap(), TimerEvent::Log("hello".into()));
    }

    #[test]
    fn test_channel_listener_without_receivers() {
        let (listener, rx) = ChannelListener::new(4);
        drop(rx);
        listener.on_frequency_changed(0, 5800);
    }
}
