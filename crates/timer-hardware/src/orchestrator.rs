//! The poll orchestrator.
//!
//! [`Orchestrator`] owns every discovered node. Once spawned it runs as an
//! actor: a single task alternates between poll cycles on a fixed interval
//! and commands arriving through a [`TimerHandle`]. Commands are applied
//! between cycles, so they never interleave with a node's poll sequence.
//!
//! Nodes are grouped by link. Each cycle polls the groups concurrently and
//! the nodes within a group one after another; the shared-link gate keeps
//! traffic on one link serial anyway.
//!
//! Per node, in timer mode:
//!
//! 1. `READ_RSSI` (sample, lap counter, crossing flag)
//! 2. fold into the crossing tracker
//! 3. commit enter, then exit, then lap, reading each one's stats
//! 4. analytics (loop time, lifetime, extremum)
//! 5. RSSI stats for one node per cycle
//! 6. level captures
//! 7. realtime lifetime for firmware without on-node persistence
//!
//! A stats read that fails after the poll reported an event does not lose
//! the event: it is committed with the poll's own timestamp and RSSI.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use timer_core::calibration::{Calibration, CalibrationPolicy};
use timer_core::protocol::{feature, is_valid_rssi, NodeMode};
use timer_core::{LapSource, TimerError, TimerListener, TimerResult};

use crate::link::SharedLink;
use crate::node::Node;
use crate::transport::{Clock, IoStats};

// =============================================================================
// Configuration
// =============================================================================

/// Poll loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Time between poll cycles.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    /// Firmware loop time above which a warning is logged.
    #[serde(default = "default_warn_loop_time_us")]
    pub warn_loop_time_us: u32,
    /// Laps closer together than this are flagged (never dropped).
    #[serde(default)]
    pub min_lap_time_ms: i64,
    /// Extrema considered by the realtime lifetime estimate.
    #[serde(default = "default_realtime_window")]
    pub realtime_window: usize,
    /// Read RSSI stats from one node per cycle.
    #[serde(default = "default_true")]
    pub rssi_stats_rotation: bool,
}

fn default_update_interval_ms() -> u64 {
    100
}

fn default_warn_loop_time_us() -> u32 {
    1500
}

fn default_realtime_window() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_update_interval_ms(),
            warn_loop_time_us: default_warn_loop_time_us(),
            min_lap_time_ms: 0,
            realtime_window: default_realtime_window(),
            rssi_stats_rotation: true,
        }
    }
}

/// Manual level capture settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// How long a capture averages samples.
    #[serde(default = "default_capture_duration_ms")]
    pub capture_duration_ms: i64,
    /// Minimum distance between a captured enter level and the node peak.
    #[serde(default = "default_enter_at_peak_margin")]
    pub enter_at_peak_margin: i32,
}

fn default_capture_duration_ms() -> i64 {
    3000
}

fn default_enter_at_peak_margin() -> i32 {
    5
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_duration_ms: default_capture_duration_ms(),
            enter_at_peak_margin: default_enter_at_peak_margin(),
        }
    }
}

// =============================================================================
// Public views
// =============================================================================

/// Race timing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaceState {
    /// A race is running.
    pub racing: bool,
    /// Race start, clock milliseconds. Listener timestamps are relative to it.
    pub start_ms: i64,
}

impl RaceState {
    fn relative(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - self.start_ms
    }
}

/// Point-in-time view of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSummary {
    /// Logical index.
    pub index: usize,
    /// Link name.
    pub link: String,
    /// Processor address.
    pub address: u8,
    /// Sub-node on a multi-node processor.
    pub multi_node_index: Option<u8>,
    /// Board slot.
    pub slot_index: Option<u8>,
    /// Tuned frequency.
    pub frequency: u16,
    /// Enter-at level.
    pub enter_at_level: i32,
    /// Exit-at level.
    pub exit_at_level: i32,
    /// Operating mode.
    pub mode: NodeMode,
    /// Latest RSSI.
    pub current_rssi: Option<i32>,
    /// Latest peak lifetime.
    pub current_lifetime: Option<i32>,
    /// Committed lap counter.
    pub pass_count: Option<u8>,
    /// Crossing in progress.
    pub crossing: bool,
    /// Node-wide RSSI peak.
    pub node_peak_rssi: i32,
    /// Node-wide RSSI nadir.
    pub node_nadir_rssi: i32,
    /// Firmware loop time.
    pub loop_time_us: u32,
    /// Filtered history samples recorded this race.
    pub history_len: usize,
    /// Exchange counters.
    pub io: IoStats,
}

impl NodeSummary {
    fn of(node: &Node) -> Self {
        let s = &node.state;
        Self {
            index: s.index,
            link: node.processor().link.clone(),
            address: node.processor().address,
            multi_node_index: s.multi_node_index,
            slot_index: s.slot_index,
            frequency: s.frequency,
            enter_at_level: s.enter_at_level,
            exit_at_level: s.exit_at_level,
            mode: s.mode,
            current_rssi: s.current_rssi.map(|r| r.rssi),
            current_lifetime: s.current_lifetime,
            pass_count: s.pass_count(),
            crossing: s.is_crossing(),
            node_peak_rssi: s.node_peak_rssi,
            node_nadir_rssi: s.node_nadir_rssi,
            loop_time_us: s.loop_time_us,
            history_len: s.history.len(),
            io: *node.stats(),
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

type Reply<T> = oneshot::Sender<T>;

enum Command {
    SetFrequency(usize, u16, Reply<TimerResult<u16>>),
    SetEnterAtLevel(usize, i32, Reply<TimerResult<i32>>),
    SetExitAtLevel(usize, i32, Reply<TimerResult<i32>>),
    StartCaptureEnter(usize, Reply<TimerResult<bool>>),
    StartCaptureExit(usize, Reply<TimerResult<bool>>),
    SetMode(usize, NodeMode, Reply<TimerResult<NodeMode>>),
    ForceEndCrossing(usize, Reply<TimerResult<()>>),
    ReadRssiHistory(usize, Reply<TimerResult<Vec<u8>>>),
    SimulateLap(usize, Reply<TimerResult<i64>>),
    SendStatusMessage(u8, u8, Reply<TimerResult<usize>>),
    RaceStart(Option<i64>, Reply<i64>),
    RaceStop(Reply<Vec<(usize, Calibration)>>),
    Snapshot(Reply<Vec<NodeSummary>>),
    ErrorReport(Reply<String>),
}

/// Cloneable command surface of a running [`Orchestrator`].
#[derive(Clone)]
pub struct TimerHandle {
    tx: mpsc::Sender<Command>,
    stop: Arc<watch::Sender<bool>>,
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl TimerHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> TimerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| TimerError::Shutdown)?;
        rx.await.map_err(|_| TimerError::Shutdown)
    }

    /// Tune a node. Returns the frequency the node accepted.
    pub async fn set_frequency(&self, node: usize, frequency: u16) -> TimerResult<u16> {
        self.request(|r| Command::SetFrequency(node, frequency, r)).await?
    }

    /// Set a node's enter-at level.
    pub async fn set_enter_at_level(&self, node: usize, level: i32) -> TimerResult<i32> {
        self.request(|r| Command::SetEnterAtLevel(node, level, r)).await?
    }

    /// Set a node's exit-at level.
    pub async fn set_exit_at_level(&self, node: usize, level: i32) -> TimerResult<i32> {
        self.request(|r| Command::SetExitAtLevel(node, level, r)).await?
    }

    /// Start averaging the enter-at level. `false` when one is running.
    pub async fn start_capture_enter_at_level(&self, node: usize) -> TimerResult<bool> {
        self.request(|r| Command::StartCaptureEnter(node, r)).await?
    }

    /// Start averaging the exit-at level. `false` when one is running.
    pub async fn start_capture_exit_at_level(&self, node: usize) -> TimerResult<bool> {
        self.request(|r| Command::StartCaptureExit(node, r)).await?
    }

    /// Switch a node's operating mode.
    pub async fn set_mode(&self, node: usize, mode: NodeMode) -> TimerResult<NodeMode> {
        self.request(|r| Command::SetMode(node, mode, r)).await?
    }

    /// End a crossing the node is stuck in.
    pub async fn force_end_crossing(&self, node: usize) -> TimerResult<()> {
        self.request(|r| Command::ForceEndCrossing(node, r)).await?
    }

    /// Fetch the node's raw RSSI history buffer.
    pub async fn read_rssi_history(&self, node: usize) -> TimerResult<Vec<u8>> {
        self.request(|r| Command::ReadRssiHistory(node, r)).await?
    }

    /// Raise a manual pass. Returns its race-relative timestamp.
    pub async fn simulate_lap(&self, node: usize) -> TimerResult<i64> {
        self.request(|r| Command::SimulateLap(node, r)).await?
    }

    /// Forward a status message to the first node that accepts it.
    /// Returns that node's index.
    pub async fn send_status_message(&self, kind: u8, data: u8) -> TimerResult<usize> {
        self.request(|r| Command::SendStatusMessage(kind, data, r)).await?
    }

    /// Start a race at `start_ms` (clock milliseconds; now when `None`).
    /// Returns the effective start time.
    pub async fn race_start(&self, start_ms: Option<i64>) -> TimerResult<i64> {
        self.request(|r| Command::RaceStart(start_ms, r)).await
    }

    /// Stop the race and auto-calibrate. Returns the applied calibrations.
    pub async fn race_stop(&self) -> TimerResult<Vec<(usize, Calibration)>> {
        self.request(Command::RaceStop).await
    }

    /// Summaries of every node.
    pub async fn snapshot(&self) -> TimerResult<Vec<NodeSummary>> {
        self.request(Command::Snapshot).await
    }

    /// Communication error report.
    pub async fn error_report(&self) -> TimerResult<String> {
        self.request(Command::ErrorReport).await
    }

    /// Ask the poll loop to stop. It finishes the node exchange in flight.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

struct NodeGroup {
    link: Arc<SharedLink>,
    nodes: Vec<Node>,
}

struct PollContext<'a> {
    listener: &'a dyn TimerListener,
    poll: &'a PollConfig,
    capture: &'a CaptureConfig,
    clock: Clock,
    race: RaceState,
    rssi_stats_node: Option<usize>,
    stop: &'a watch::Receiver<bool>,
}

/// Owner of all nodes and driver of the poll loop.
pub struct Orchestrator {
    groups: Vec<NodeGroup>,
    listener: Arc<dyn TimerListener>,
    poll: PollConfig,
    capture: CaptureConfig,
    calibration: CalibrationPolicy,
    clock: Clock,
    race: RaceState,
    update_count: u64,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("groups", &self.groups.len())
            .field("nodes", &self.node_count())
            .field("race", &self.race)
            .finish()
    }
}

impl Orchestrator {
    /// Take ownership of `nodes`. `clock` must be the clock the nodes'
    /// transports were created with.
    pub fn new(nodes: Vec<Node>, listener: Arc<dyn TimerListener>, clock: Clock) -> Self {
        let mut groups: Vec<NodeGroup> = Vec::new();
        for node in nodes {
            let link = Arc::clone(node.io().link());
            match groups.iter_mut().find(|g| Arc::ptr_eq(&g.link, &link)) {
                Some(group) => group.nodes.push(node),
                None => groups.push(NodeGroup {
                    link,
                    nodes: vec![node],
                }),
            }
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            groups,
            listener,
            poll: PollConfig::default(),
            capture: CaptureConfig::default(),
            calibration: CalibrationPolicy::default(),
            clock,
            race: RaceState::default(),
            update_count: 0,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    /// Replace the poll settings.
    pub fn with_poll_config(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Replace the capture settings.
    pub fn with_capture_config(mut self, capture: CaptureConfig) -> Self {
        self.capture = capture;
        self
    }

    /// Replace the calibration policy.
    pub fn with_calibration(mut self, calibration: CalibrationPolicy) -> Self {
        self.calibration = calibration;
        self
    }

    /// Number of nodes.
    pub fn node_count(&self) -> usize {
        self.groups.iter().map(|g| g.nodes.len()).sum()
    }

    /// Current race state.
    pub fn race(&self) -> RaceState {
        self.race
    }

    fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.groups.iter().flat_map(|g| g.nodes.iter())
    }

    fn node_mut(&mut self, index: usize) -> TimerResult<&mut Node> {
        self.groups
            .iter_mut()
            .flat_map(|g| g.nodes.iter_mut())
            .find(|n| n.index() == index)
            .ok_or(TimerError::InvalidNodeIndex(index))
    }

    /// Run the loop on a new task. The task resolves to the final error
    /// report once [`TimerHandle::shutdown`] is called or every handle is
    /// dropped.
    pub fn spawn(self) -> (TimerHandle, JoinHandle<String>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = TimerHandle {
            tx,
            stop: Arc::clone(&self.stop_tx),
        };
        (handle, tokio::spawn(self.run(rx)))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> String {
        let mut stop = self.stop_rx.clone();
        let mut ticker = interval(Duration::from_millis(self.poll.update_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let summary = format!(
            "Polling {} nodes on {} links",
            self.node_count(),
            self.groups.len()
        );
        info!("{}", summary);
        self.listener.on_log(&summary);

        loop {
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = ticker.tick() => self.poll_once().await,
            }
        }

        let report = self.error_report();
        info!("{}", report);
        self.listener.on_log(&report);
        report
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::SetFrequency(node, frequency, reply) => {
                let _ = reply.send(self.set_frequency(node, frequency).await);
            }
            Command::SetEnterAtLevel(node, level, reply) => {
                let _ = reply.send(self.set_level(node, level, true).await);
            }
            Command::SetExitAtLevel(node, level, reply) => {
                let _ = reply.send(self.set_level(node, level, false).await);
            }
            Command::StartCaptureEnter(node, reply) => {
                let _ = reply.send(self.start_capture(node, true));
            }
            Command::StartCaptureExit(node, reply) => {
                let _ = reply.send(self.start_capture(node, false));
            }
            Command::SetMode(node, mode, reply) => {
                let _ = reply.send(self.set_mode(node, mode).await);
            }
            Command::ForceEndCrossing(node, reply) => {
                let result = match self.node_mut(node) {
                    Ok(n) => n.force_end_crossing().await.map_err(TimerError::from),
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::ReadRssiHistory(node, reply) => {
                let result = match self.node_mut(node) {
                    Ok(n) => n.read_rssi_history().await.map_err(TimerError::from),
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            Command::SimulateLap(node, reply) => {
                let _ = reply.send(self.simulate_lap(node));
            }
            Command::SendStatusMessage(kind, data, reply) => {
                let _ = reply.send(self.send_status_message(kind, data).await);
            }
            Command::RaceStart(start_ms, reply) => {
                let _ = reply.send(self.race_start(start_ms));
            }
            Command::RaceStop(reply) => {
                let _ = reply.send(self.race_stop().await);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::ErrorReport(reply) => {
                let _ = reply.send(self.error_report());
            }
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Tune node `index`, notifying listeners when the frequency changes.
    pub async fn set_frequency(&mut self, index: usize, frequency: u16) -> TimerResult<u16> {
        let listener = Arc::clone(&self.listener);
        let node = self.node_mut(index)?;
        let previous = node.state.frequency;
        let got = node.set_frequency(frequency).await?;
        if got != frequency {
            warn!(node = index, wanted = frequency, got, "Frequency not accepted");
        }
        if got != previous {
            listener.on_frequency_changed(index, got);
        }
        Ok(got)
    }

    async fn set_level(&mut self, index: usize, level: i32, is_enter: bool) -> TimerResult<i32> {
        let listener = Arc::clone(&self.listener);
        let node = self.node_mut(index)?;
        apply_level(node, level, is_enter, listener.as_ref()).await
    }

    fn start_capture(&mut self, index: usize, is_enter: bool) -> TimerResult<bool> {
        let now_ms = self.clock.now_ms();
        let duration = self.capture.capture_duration_ms;
        let node = self.node_mut(index)?;
        let started = if is_enter {
            node.state.start_capture_enter_at_level(now_ms, duration)
        } else {
            node.state.start_capture_exit_at_level(now_ms, duration)
        };
        if started {
            info!(node = index, kind = if is_enter { "enter" } else { "exit" }, duration_ms = duration, "Capturing level");
        }
        Ok(started)
    }

    async fn set_mode(&mut self, index: usize, mode: NodeMode) -> TimerResult<NodeMode> {
        let node = self.node_mut(index)?;
        let got = node.set_mode(mode).await?;
        if got == NodeMode::Scanner {
            node.state.scan_data.clear();
        }
        Ok(got)
    }

    fn simulate_lap(&mut self, index: usize) -> TimerResult<i64> {
        self.node_mut(index)?;
        let lap_ms = self.race.relative(self.clock.now_ms());
        info!(node = index, lap_ms, "Simulated lap");
        self.listener.on_pass(index, lap_ms, LapSource::Manual, None);
        Ok(lap_ms)
    }

    async fn send_status_message(&mut self, kind: u8, data: u8) -> TimerResult<usize> {
        let mut last_err = TimerError::Transport("no nodes".to_string());
        for node in self.groups.iter_mut().flat_map(|g| g.nodes.iter_mut()) {
            match node.send_status_message(kind, data).await {
                Ok(()) => return Ok(node.index()),
                Err(err) => last_err = err.into(),
            }
        }
        Err(last_err)
    }

    /// Start a race; resets per-race node state.
    pub fn race_start(&mut self, start_ms: Option<i64>) -> i64 {
        let start_ms = start_ms.unwrap_or_else(|| self.clock.now_ms());
        for node in self.groups.iter_mut().flat_map(|g| g.nodes.iter_mut()) {
            node.state.reset();
            node.clear_recent();
        }
        self.race = RaceState {
            racing: true,
            start_ms,
        };
        info!(start_ms, "Race started");
        start_ms
    }

    /// Stop the race, fold pass peaks into history and auto-calibrate.
    pub async fn race_stop(&mut self) -> Vec<(usize, Calibration)> {
        self.race.racing = false;
        let listener = Arc::clone(&self.listener);
        let mut applied = Vec::new();
        for node in self.groups.iter_mut().flat_map(|g| g.nodes.iter_mut()) {
            node.state.merge_pass_history();
            let (enter, exit) = (node.state.enter_at_level, node.state.exit_at_level);
            let Some(cal) = node.state.ai_calibrate(&self.calibration) else {
                continue;
            };
            // ai_calibrate already moved the state; restore so apply_level
            // notifies on the real change.
            node.state.enter_at_level = enter;
            node.state.exit_at_level = exit;
            let index = node.index();
            if let Err(err) = apply_level(node, cal.enter_at_level, true, listener.as_ref()).await {
                warn!(node = index, %err, "Unable to apply calibrated enter-at level");
            }
            if let Err(err) = apply_level(node, cal.exit_at_level, false, listener.as_ref()).await {
                warn!(node = index, %err, "Unable to apply calibrated exit-at level");
            }
            listener.on_log(&format!(
                "Node {} calibrated: enter {} -> {}, exit {} -> {}",
                index + 1,
                enter,
                cal.enter_at_level,
                exit,
                cal.exit_at_level
            ));
            applied.push((index, cal));
        }
        info!(calibrated = applied.len(), "Race stopped");
        applied
    }

    /// Summaries of every node in index order.
    pub fn snapshot(&self) -> Vec<NodeSummary> {
        let mut out: Vec<NodeSummary> = self.nodes().map(NodeSummary::of).collect();
        out.sort_by_key(|s| s.index);
        out
    }

    /// Per-node communication error report.
    pub fn error_report(&self) -> String {
        let mut lines = vec!["Node communication statistics:".to_string()];
        let mut nodes: Vec<&Node> = self.nodes().collect();
        nodes.sort_by_key(|n| n.index());
        for node in nodes {
            lines.push(format!(
                "  Node {} ({}@{:#04x}{}): {}",
                node.index() + 1,
                node.processor().link,
                node.processor().address,
                node.state
                    .multi_node_index
                    .map(|s| format!("/{}", s))
                    .unwrap_or_default(),
                node.stats().error_report()
            ));
        }
        lines.join("\n")
    }

    // =========================================================================
    // Polling
    // =========================================================================

    /// Run one poll cycle over every node.
    pub async fn poll_once(&mut self) {
        let node_count = self.node_count();
        let rssi_stats_node = (self.poll.rssi_stats_rotation && node_count > 0)
            .then(|| (self.update_count % node_count as u64) as usize);
        let ctx = PollContext {
            listener: self.listener.as_ref(),
            poll: &self.poll,
            capture: &self.capture,
            clock: self.clock,
            race: self.race,
            rssi_stats_node,
            stop: &self.stop_rx,
        };
        join_all(self.groups.iter_mut().map(|group| poll_group(group, &ctx))).await;
        self.update_count = self.update_count.wrapping_add(1);
    }
}

async fn apply_level(node: &mut Node, level: i32, is_enter: bool, listener: &dyn TimerListener) -> TimerResult<i32> {
    let wire = u8::try_from(level)
        .ok()
        .filter(|_| is_valid_rssi(level))
        .ok_or(TimerError::InvalidLevel(level))?;
    let index = node.index();
    let previous = if is_enter {
        node.state.enter_at_level
    } else {
        node.state.exit_at_level
    };
    let got = if is_enter {
        node.set_enter_at_level(wire).await?
    } else {
        node.set_exit_at_level(wire).await?
    };
    let got = i32::from(got);
    if got != previous {
        if is_enter {
            listener.on_enter_trigger_changed(index, got);
        } else {
            listener.on_exit_trigger_changed(index, got);
        }
    }
    Ok(got)
}

async fn poll_group(group: &mut NodeGroup, ctx: &PollContext<'_>) {
    for node in &mut group.nodes {
        if *ctx.stop.borrow() {
            debug!(link = %group.link.name(), "Stop requested, ending cycle");
            return;
        }
        match node.state.mode {
            NodeMode::Timer if node.state.frequency != 0 => poll_timer(node, ctx).await,
            NodeMode::Timer | NodeMode::RssiHistory => {}
            NodeMode::Scanner => poll_scanner(node).await,
        }
    }
}

async fn poll_scanner(node: &mut Node) {
    match node.read_scan_history().await {
        Ok(samples) => {
            for sample in samples {
                node.state.scan_data.insert(sample.frequency, sample.rssi);
            }
        }
        Err(err) => debug!(node = node.index(), %err, "Scan history read failed"),
    }
}

fn valid(rssi: u8) -> Option<i32> {
    let rssi = i32::from(rssi);
    is_valid_rssi(rssi).then_some(rssi)
}

async fn poll_timer(node: &mut Node, ctx: &PollContext<'_>) {
    let index = node.index();
    let (reading, sent_ms) = match node.poll_rssi().await {
        Ok(r) => r,
        Err(err) => {
            debug!(node = index, %err, "RSSI poll failed");
            return;
        }
    };

    let raw_rssi = i32::from(reading.rssi);
    let rssi = node.state.check_rssi(raw_rssi);
    let lap = node.state.is_new_lap(
        sent_ms,
        ctx.poll.min_lap_time_ms,
        raw_rssi,
        reading.lap_id,
        reading.crossing,
    );
    if let Some(rssi) = rssi {
        ctx.listener.on_rssi_sample(index, ctx.race.relative(sent_ms), rssi);
        node.state.record_sample(sent_ms, rssi, ctx.race.racing);
    }

    if lap.entered {
        commit_crossing(node, ctx, true, sent_ms, rssi).await;
    }
    if lap.exited {
        commit_crossing(node, ctx, false, sent_ms, rssi).await;
    }
    if lap.new_lap {
        if lap.under_min_lap {
            info!(node = index, min_lap_time_ms = ctx.poll.min_lap_time_ms, "Pass sooner than minimum lap time");
        }
        commit_lap(node, ctx, reading.lap_id, sent_ms, rssi).await;
    }

    let on_node_lifetime = node.supports(feature::PEAK_HOMOLOGY);
    match node.read_analytics().await {
        Ok((analytics, extremum_ms)) => {
            let lifetime = i32::from(analytics.lifetime);
            node.state
                .process_analytics(lifetime, u32::from(analytics.loop_time_us));
            if on_node_lifetime {
                ctx.listener
                    .on_lifetime_sample(index, ctx.race.relative(sent_ms), lifetime);
            }
            if let Some(extremum) = valid(analytics.extremum_rssi) {
                ctx.listener.on_extremum_history(
                    index,
                    ctx.race.relative(extremum_ms),
                    extremum,
                    i32::from(analytics.extremum_duration_ms),
                );
            }
            if u32::from(analytics.loop_time_us) > ctx.poll.warn_loop_time_us {
                warn!(node = index, loop_time_us = analytics.loop_time_us, limit = ctx.poll.warn_loop_time_us, "Node loop time over limit");
            }
        }
        Err(err) => debug!(node = index, %err, "Analytics read failed"),
    }

    if ctx.rssi_stats_node == Some(index) {
        match node.read_rssi_stats().await {
            Ok(stats) => node.state.process_rssi_stats(valid(stats.peak), valid(stats.nadir)),
            Err(err) => debug!(node = index, %err, "RSSI stats read failed"),
        }
    }

    if node.state.is_capturing() {
        let outcome = node
            .state
            .process_capturing(ctx.clock.now_ms(), ctx.capture.enter_at_peak_margin);
        // The state already holds the captured level; write it through.
        if let Some(level) = outcome.enter_at_level {
            write_captured(node, level, true, ctx.listener).await;
        }
        if let Some(level) = outcome.exit_at_level {
            write_captured(node, level, false, ctx.listener).await;
        }
    }

    if !on_node_lifetime {
        if let Some(rssi) = rssi {
            if let Some(lifetime) = node.realtime_lifetime(rssi, ctx.poll.realtime_window) {
                node.state.current_lifetime = Some(lifetime);
                ctx.listener
                    .on_lifetime_sample(index, ctx.race.relative(sent_ms), lifetime);
            }
        }
    }
}

async fn write_captured(node: &mut Node, level: i32, is_enter: bool, listener: &dyn TimerListener) {
    let index = node.index();
    let Some(wire) = u8::try_from(level).ok().filter(|_| is_valid_rssi(level)) else {
        warn!(node = index, level, "Captured level out of range");
        return;
    };
    let result = if is_enter {
        node.set_enter_at_level(wire).await
    } else {
        node.set_exit_at_level(wire).await
    };
    match result {
        Ok(got) if is_enter => listener.on_enter_trigger_changed(index, i32::from(got)),
        Ok(got) => listener.on_exit_trigger_changed(index, i32::from(got)),
        Err(err) => warn!(node = index, %err, "Unable to write captured level"),
    }
}

async fn commit_crossing(
    node: &mut Node,
    ctx: &PollContext<'_>,
    is_enter: bool,
    poll_ms: i64,
    poll_rssi: Option<i32>,
) {
    let index = node.index();
    let (count, timestamp_ms, rssi, lifetime) = match node.read_crossing_stats(is_enter).await {
        Ok((stats, ts)) => (stats.count, ts, valid(stats.rssi), Some(i32::from(stats.lifetime))),
        Err(err) => {
            warn!(node = index, is_enter, %err, "Crossing stats unavailable, using poll sample");
            (node.state.pass_count().unwrap_or(0), poll_ms, poll_rssi, None)
        }
    };
    node.state
        .process_crossing(is_enter, count, timestamp_ms, rssi, lifetime);
    let relative = ctx.race.relative(timestamp_ms);
    if is_enter {
        ctx.listener.on_enter_triggered(index, relative, rssi);
    } else {
        ctx.listener.on_exit_triggered(index, relative, rssi);
    }
}

async fn commit_lap(
    node: &mut Node,
    ctx: &PollContext<'_>,
    poll_lap_id: u8,
    poll_ms: i64,
    poll_rssi: Option<i32>,
) {
    let index = node.index();
    let (lap_id, timestamp_ms, peak, nadir) = match node.read_lap_stats().await {
        Ok((stats, ts)) => (stats.lap_id, ts, valid(stats.peak_rssi), valid(stats.nadir_rssi)),
        Err(err) => {
            warn!(node = index, %err, "Lap stats unavailable, using poll sample");
            (poll_lap_id, poll_ms, poll_rssi, None)
        }
    };
    node.state
        .process_lap_stats(lap_id, timestamp_ms, peak, nadir, ctx.race.racing);
    ctx.listener
        .on_pass(index, ctx.race.relative(timestamp_ms), LapSource::Realtime, peak);
}
