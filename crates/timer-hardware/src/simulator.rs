//! In-memory node processors.
//!
//! [`SimulatedBus`] is a [`Link`] hosting any number of simulated
//! processors, each with one or more timing nodes. Nodes detect crossings
//! the way firmware does: a crossing starts when RSSI reaches the enter-at
//! level and ends (completing a lap at the crossing peak) when it falls
//! below the exit-at level. RSSI comes from a deterministic synthetic
//! waveform or is set directly through a [`SimulatorHandle`].
//!
//! The handle also injects faults (failed or corrupted exchanges) and
//! exposes node registers for assertions.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use timer_core::codec::{checksum, validate};
use timer_core::protocol::{opcode, size, REVISION_VERIFICATION};

use crate::link::Link;

// =============================================================================
// Simulated node
// =============================================================================

/// Triangular RSSI pulse repeated every `period_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticSignal {
    /// Time between pulse centres.
    pub period_ms: i64,
    /// Offset of the first pulse centre from `period_ms / 2`.
    pub phase_ms: i64,
    /// Baseline RSSI.
    pub floor: u8,
    /// Pulse peak RSSI.
    pub peak: u8,
    /// Pulse base width.
    pub width_ms: i64,
}

impl SyntheticSignal {
    fn rssi_at(&self, now_ms: i64) -> u8 {
        let period = self.period_ms.max(1);
        let t = (now_ms + self.phase_ms).rem_euclid(period);
        let distance = (t - period / 2).abs() as f64;
        let half = (self.width_ms.max(2) / 2) as f64;
        let shape = (1.0 - distance / half).max(0.0);
        let span = f64::from(self.peak.saturating_sub(self.floor));
        (f64::from(self.floor) + span * shape).round() as u8
    }
}

/// Registers and detector state of one simulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimNode {
    /// Tuned frequency.
    pub frequency: u16,
    /// Enter-at level.
    pub enter_at_level: u8,
    /// Exit-at level.
    pub exit_at_level: u8,
    /// Mode register.
    pub mode: u8,
    /// Slot index on the board.
    pub slot: u8,
    /// Current RSSI.
    pub rssi: u8,
    /// Completed laps (wraps).
    pub lap_id: u8,
    /// Crossing in progress.
    pub crossing: bool,
    /// Lap counter at the last enter edge.
    pub enter_count: u8,
    /// Lap counter at the last exit edge.
    pub exit_count: u8,
    /// Highest RSSI since power-up.
    pub node_peak: u8,
    /// Lowest RSSI since power-up.
    pub node_nadir: u8,
    /// Last status message received.
    pub last_status: Option<u16>,
    synthetic: Option<SyntheticSignal>,
    lap_ms: i64,
    enter_ms: i64,
    enter_rssi: u8,
    exit_ms: i64,
    exit_rssi: u8,
    pass_peak: u8,
    pass_peak_ms: i64,
    pass_nadir: u8,
    history: Vec<u8>,
}

impl SimNode {
    /// Idle node tuned to `frequency` with levels 96/80.
    pub fn new(frequency: u16) -> Self {
        Self {
            frequency,
            enter_at_level: 96,
            exit_at_level: 80,
            mode: 0,
            slot: 0,
            rssi: 40,
            lap_id: 0,
            crossing: false,
            enter_count: 0,
            exit_count: 0,
            node_peak: 40,
            node_nadir: 40,
            last_status: None,
            synthetic: None,
            lap_ms: 0,
            enter_ms: 0,
            enter_rssi: 0,
            exit_ms: 0,
            exit_rssi: 0,
            pass_peak: 0,
            pass_peak_ms: 0,
            pass_nadir: u8::MAX,
            history: Vec::new(),
        }
    }

    /// Set trigger levels.
    pub fn with_levels(mut self, enter_at_level: u8, exit_at_level: u8) -> Self {
        self.enter_at_level = enter_at_level;
        self.exit_at_level = exit_at_level;
        self
    }

    /// Set the board slot.
    pub fn with_slot(mut self, slot: u8) -> Self {
        self.slot = slot;
        self
    }

    /// Drive RSSI from a synthetic waveform.
    pub fn with_signal(mut self, signal: SyntheticSignal) -> Self {
        self.synthetic = Some(signal);
        self
    }

    fn update(&mut self, now_ms: i64) {
        if let Some(signal) = self.synthetic {
            self.apply_rssi(signal.rssi_at(now_ms), now_ms);
        }
    }

    fn apply_rssi(&mut self, rssi: u8, now_ms: i64) {
        self.rssi = rssi;
        self.node_peak = self.node_peak.max(rssi);
        self.node_nadir = self.node_nadir.min(rssi);
        self.history.push(rssi);
        if self.history.len() > size::RSSI_HISTORY {
            self.history.remove(0);
        }

        if !self.crossing {
            self.pass_nadir = self.pass_nadir.min(rssi);
            if rssi >= self.enter_at_level {
                self.crossing = true;
                self.enter_count = self.lap_id;
                self.enter_ms = now_ms;
                self.enter_rssi = rssi;
                self.pass_peak = rssi;
                self.pass_peak_ms = now_ms;
            }
        } else {
            if rssi > self.pass_peak {
                self.pass_peak = rssi;
                self.pass_peak_ms = now_ms;
            }
            if rssi < self.exit_at_level {
                self.end_crossing(now_ms);
            }
        }
    }

    fn end_crossing(&mut self, now_ms: i64) {
        self.crossing = false;
        self.lap_id = self.lap_id.wrapping_add(1);
        self.exit_count = self.lap_id;
        self.exit_ms = now_ms;
        self.exit_rssi = self.rssi;
        self.lap_ms = self.pass_peak_ms;
    }

    fn read(&mut self, command: u8, now_ms: i64) -> Option<Vec<u8>> {
        let since = |t: i64| u16::try_from((now_ms - t).max(0)).unwrap_or(u16::MAX).to_be_bytes();
        let payload = match command {
            opcode::READ_MODE => vec![self.mode],
            opcode::READ_FREQUENCY => self.frequency.to_be_bytes().to_vec(),
            opcode::READ_ENTER_AT_LEVEL => vec![self.enter_at_level],
            opcode::READ_EXIT_AT_LEVEL => vec![self.exit_at_level],
            opcode::READ_NODE_SLOTIDX => vec![self.slot],
            opcode::READ_RSSI => {
                self.update(now_ms);
                vec![self.rssi, self.lap_id, u8::from(self.crossing)]
            }
            opcode::READ_LAP_STATS => {
                let ms = since(self.lap_ms);
                let nadir = if self.pass_nadir == u8::MAX { 0 } else { self.pass_nadir };
                vec![self.lap_id, ms[0], ms[1], self.pass_peak, nadir]
            }
            opcode::READ_ENTER_STATS => {
                let ms = since(self.enter_ms);
                vec![self.enter_count, ms[0], ms[1], self.enter_rssi, self.pass_peak.saturating_sub(self.pass_nadir)]
            }
            opcode::READ_EXIT_STATS => {
                let ms = since(self.exit_ms);
                vec![self.exit_count, ms[0], ms[1], self.exit_rssi, self.pass_peak.saturating_sub(self.pass_nadir)]
            }
            opcode::READ_RSSI_STATS => vec![self.node_peak, self.node_nadir],
            opcode::READ_ANALYTICS => {
                let lifetime = self.pass_peak.saturating_sub(self.pass_nadir).min(127);
                let ms = since(self.pass_peak_ms);
                vec![lifetime, 0x01, 0xF4, self.pass_peak, ms[0], ms[1], 0x00, 0x0A]
            }
            opcode::READ_RSSI_HISTORY => {
                let mut out = vec![0u8; size::RSSI_HISTORY];
                let offset = size::RSSI_HISTORY - self.history.len();
                out[offset..].copy_from_slice(&self.history);
                out
            }
            opcode::READ_SCAN_HISTORY => {
                let mut out = Vec::with_capacity(size::SCAN_HISTORY);
                for (i, step) in [0u16, 5, 10].into_iter().enumerate() {
                    let freq = self.frequency.wrapping_add(step);
                    out.extend_from_slice(&freq.to_be_bytes());
                    out.push(self.rssi.saturating_sub(u8::try_from(i * 4).unwrap_or(0)));
                }
                out
            }
            _ => return None,
        };
        Some(payload)
    }

    fn write(&mut self, command: u8, data: &[u8], now_ms: i64) -> bool {
        match (command, data) {
            (opcode::WRITE_FREQUENCY, [hi, lo]) => self.frequency = u16::from_be_bytes([*hi, *lo]),
            (opcode::WRITE_MODE, [mode]) => self.mode = *mode,
            (opcode::WRITE_ENTER_AT_LEVEL, [level]) => self.enter_at_level = *level,
            (opcode::WRITE_EXIT_AT_LEVEL, [level]) => self.exit_at_level = *level,
            (opcode::FORCE_END_CROSSING, _) => {
                if self.crossing {
                    self.end_crossing(now_ms);
                }
            }
            (opcode::SEND_STATUS_MESSAGE, [hi, lo]) => self.last_status = Some(u16::from_be_bytes([*hi, *lo])),
            _ => return false,
        }
        true
    }
}

// =============================================================================
// Simulated processor
// =============================================================================

/// A processor at one bus address, hosting one or more nodes.
#[derive(Debug, Clone)]
pub struct SimProcessor {
    api_level: u8,
    revision_marker: u8,
    feature_flags: u16,
    firmware_version: String,
    reported_count: Option<u8>,
    nodes: Vec<SimNode>,
    selected: usize,
}

impl SimProcessor {
    /// Processor speaking `api_level`.
    pub fn new(api_level: u8) -> Self {
        Self {
            api_level,
            revision_marker: REVISION_VERIFICATION,
            feature_flags: 0,
            firmware_version: "1.1.4".to_string(),
            reported_count: None,
            nodes: Vec::new(),
            selected: 0,
        }
    }

    /// Add a node.
    pub fn with_node(mut self, node: SimNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Set the feature flags register.
    pub fn with_feature_flags(mut self, flags: u16) -> Self {
        self.feature_flags = flags;
        self
    }

    /// Report `count` from the multi-node count register regardless of the
    /// nodes actually hosted.
    pub fn with_reported_count(mut self, count: u8) -> Self {
        self.reported_count = Some(count);
        self
    }

    /// Corrupt the revision marker byte (an unrelated device).
    pub fn with_revision_marker(mut self, marker: u8) -> Self {
        self.revision_marker = marker;
        self
    }

    fn read(&mut self, address: u8, command: u8, now_ms: i64) -> Option<Vec<u8>> {
        let text = |s: &str| {
            let mut out = vec![0u8; size::TEXT_BLOCK];
            let bytes = s.as_bytes();
            let n = bytes.len().min(size::TEXT_BLOCK);
            out[..n].copy_from_slice(&bytes[..n]);
            out
        };
        match command {
            opcode::READ_ADDRESS => Some(vec![address]),
            opcode::READ_REVISION_CODE => Some(vec![self.revision_marker, self.api_level]),
            opcode::READ_FEATURE_FLAGS => Some(self.feature_flags.to_be_bytes().to_vec()),
            opcode::READ_MULTINODE_COUNT => {
                let count = self
                    .reported_count
                    .unwrap_or_else(|| u8::try_from(self.nodes.len()).unwrap_or(u8::MAX));
                Some(vec![count])
            }
            opcode::READ_CURNODE_INDEX => Some(vec![u8::try_from(self.selected).unwrap_or(0)]),
            opcode::READ_FW_VERSION => Some(text(&self.firmware_version)),
            opcode::READ_FW_PROCTYPE => Some(text("SIM")),
            opcode::READ_FW_BUILDDATE => Some(text("Jan 01 2024")),
            opcode::READ_FW_BUILDTIME => Some(text("12:00:00")),
            opcode::READ_TIME_MILLIS => Some(u32::try_from(now_ms).unwrap_or(0).to_be_bytes().to_vec()),
            _ => self.nodes.get_mut(self.selected)?.read(command, now_ms),
        }
    }

    fn write(&mut self, command: u8, data: &[u8], now_ms: i64) -> bool {
        if command == opcode::WRITE_CURNODE_INDEX {
            if let [index] = data {
                if usize::from(*index) < self.nodes.len() {
                    self.selected = usize::from(*index);
                    return true;
                }
            }
            return false;
        }
        match self.nodes.get_mut(self.selected) {
            Some(node) => node.write(command, data, now_ms),
            None => false,
        }
    }
}

// =============================================================================
// Bus
// =============================================================================

#[derive(Debug, Default)]
struct Faults {
    fail_next: u32,
    corrupt_next: u32,
    corrupt_command: Option<(u8, u32)>,
}

impl Faults {
    fn take_corrupt(&mut self, command: u8) -> bool {
        if let Some((target, remaining)) = &mut self.corrupt_command {
            if *target == command && *remaining > 0 {
                *remaining -= 1;
                return true;
            }
        }
        if self.corrupt_next > 0 {
            self.corrupt_next -= 1;
            return true;
        }
        false
    }
}

#[derive(Debug)]
struct BusState {
    processors: BTreeMap<u8, SimProcessor>,
    started: Instant,
    faults: Faults,
    exchanges: u64,
    log: Vec<(u8, u8)>,
}

impl BusState {
    fn now_ms(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

/// In-memory [`Link`] hosting simulated processors.
#[derive(Debug)]
pub struct SimulatedBus {
    name: String,
    addressable: bool,
    state: Arc<Mutex<BusState>>,
}

/// Test and CLI control over a [`SimulatedBus`] after it has been handed
/// to a `SharedLink`.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    state: Arc<Mutex<BusState>>,
}

impl SimulatedBus {
    /// Empty addressable bus.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addressable: true,
            state: Arc::new(Mutex::new(BusState {
                processors: BTreeMap::new(),
                started: Instant::now(),
                faults: Faults::default(),
                exchanges: 0,
                log: Vec::new(),
            })),
        }
    }

    /// Place `processor` at `address`.
    pub fn with_processor(self, address: u8, processor: SimProcessor) -> Self {
        self.state.lock().processors.insert(address, processor);
        self
    }

    /// Behave like a point-to-point serial link: the device address is
    /// ignored and the lowest-addressed processor answers.
    pub fn point_to_point(mut self) -> Self {
        self.addressable = false;
        self
    }

    /// Control handle sharing this bus's state.
    pub fn handle(&self) -> SimulatorHandle {
        SimulatorHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn target<'a>(&self, state: &'a mut BusState, device: u8) -> Option<(u8, &'a mut SimProcessor)> {
        if self.addressable {
            state.processors.get_mut(&device).map(|p| (device, p))
        } else {
            state.processors.iter_mut().next().map(|(a, p)| (*a, p))
        }
    }
}

fn no_response(device: u8) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("no response from {:#04x}", device))
}

#[async_trait]
impl Link for SimulatedBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_addressable(&self) -> bool {
        self.addressable
    }

    async fn request(&mut self, device: u8, command: u8, _response_len: usize) -> io::Result<Vec<u8>> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.exchanges += 1;
        state.log.push((device, command));
        if state.faults.fail_next > 0 {
            state.faults.fail_next -= 1;
            return Err(no_response(device));
        }
        let now_ms = state.now_ms();
        let corrupt = state.faults.take_corrupt(command);

        let (address, processor) = self.target(state, device).ok_or_else(|| no_response(device))?;
        let mut raw = processor
            .read(address, command, now_ms)
            .ok_or_else(|| no_response(device))?;
        raw.push(checksum(&raw));
        if corrupt {
            if let Some(last) = raw.last_mut() {
                *last ^= 0xFF;
            }
        }
        Ok(raw)
    }

    async fn send(&mut self, device: u8, frame: &[u8]) -> io::Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.exchanges += 1;
        let Some(&command) = frame.first() else {
            return Ok(());
        };
        state.log.push((device, command));
        if state.faults.fail_next > 0 {
            state.faults.fail_next -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated write failure"));
        }
        let now_ms = state.now_ms();
        let Some((_, processor)) = self.target(state, device) else {
            return Err(no_response(device));
        };

        // Frame-scope checksum: command ++ data ++ checksum.
        let accepted = validate(frame) && processor.write(command, &frame[1..frame.len() - 1], now_ms);
        if !accepted {
            debug!(addr = device, cmd = command, "Simulated processor ignored write");
        }
        Ok(())
    }
}

impl SimulatorHandle {
    /// Fail the next `n` exchanges.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().faults.fail_next = n;
    }

    /// Corrupt the checksum of the next `n` responses.
    pub fn corrupt_next(&self, n: u32) {
        self.state.lock().faults.corrupt_next = n;
    }

    /// Corrupt the checksum of the next `n` responses to `command` only.
    pub fn corrupt_command(&self, command: u8, n: u32) {
        self.state.lock().faults.corrupt_command = Some((command, n));
    }

    /// Exchanges handled so far.
    pub fn exchanges(&self) -> u64 {
        self.state.lock().exchanges
    }

    /// `(device, command)` of every exchange so far.
    pub fn command_log(&self) -> Vec<(u8, u8)> {
        self.state.lock().log.clone()
    }

    /// Forget the command log.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Feed an RSSI sample to node `sub` of the processor at `address`.
    pub fn set_rssi(&self, address: u8, sub: usize, rssi: u8) {
        let mut state = self.state.lock();
        let now_ms = state.now_ms();
        if let Some(node) = state
            .processors
            .get_mut(&address)
            .and_then(|p| p.nodes.get_mut(sub))
        {
            node.apply_rssi(rssi, now_ms);
        }
    }

    /// Copy of node `sub` at `address`.
    pub fn node(&self, address: u8, sub: usize) -> Option<SimNode> {
        self.state
            .lock()
            .processors
            .get(&address)
            .and_then(|p| p.nodes.get(sub).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> (SimulatedBus, SimulatorHandle) {
        let bus = SimulatedBus::new("sim")
            .with_processor(8, SimProcessor::new(36).with_node(SimNode::new(5658)))
            .with_processor(
                10,
                SimProcessor::new(36)
                    .with_node(SimNode::new(5695).with_slot(1))
                    .with_node(SimNode::new(5760).with_slot(2)),
            );
        let handle = bus.handle();
        (bus, handle)
    }

    #[tokio::test]
    async fn test_reads_are_checksummed() {
        let (mut bus, _) = bus();
        let raw = bus.request(8, opcode::READ_REVISION_CODE, 3).await.unwrap();
        assert_eq!(raw, vec![0x25, 36, 0x25 + 36]);
        assert!(validate(&raw));
    }

    #[tokio::test]
    async fn test_missing_address_times_out() {
        let (mut bus, _) = bus();
        let err = bus.request(12, opcode::READ_ADDRESS, 2).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_sub_node_selection() {
        let (mut bus, _) = bus();
        bus.send(10, &[opcode::WRITE_CURNODE_INDEX, 1, opcode::WRITE_CURNODE_INDEX + 1])
            .await
            .unwrap();
        let raw = bus.request(10, opcode::READ_NODE_SLOTIDX, 2).await.unwrap();
        assert_eq!(raw[0], 2);
    }

    #[tokio::test]
    async fn test_crossing_detection() {
        let (mut bus, handle) = bus();
        handle.set_rssi(8, 0, 100);
        assert!(handle.node(8, 0).unwrap().crossing);
        handle.set_rssi(8, 0, 120);
        handle.set_rssi(8, 0, 60);

        let node = handle.node(8, 0).unwrap();
        assert!(!node.crossing);
        assert_eq!(node.lap_id, 1);
        assert_eq!(node.enter_count, 0);
        assert_eq!(node.exit_count, 1);

        let raw = bus.request(8, opcode::READ_LAP_STATS, 6).await.unwrap();
        assert_eq!(raw[0], 1);
        assert_eq!(raw[3], 120);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let (mut bus, handle) = bus();
        handle.fail_next(1);
        assert!(bus.request(8, opcode::READ_ADDRESS, 2).await.is_err());
        handle.corrupt_next(1);
        let raw = bus.request(8, opcode::READ_ADDRESS, 2).await.unwrap();
        assert!(!validate(&raw));
        let raw = bus.request(8, opcode::READ_ADDRESS, 2).await.unwrap();
        assert!(validate(&raw));
        assert_eq!(handle.exchanges(), 3);
    }

    #[tokio::test]
    async fn test_targeted_corruption() {
        let (mut bus, handle) = bus();
        handle.corrupt_command(opcode::READ_LAP_STATS, 1);
        let raw = bus.request(8, opcode::READ_RSSI, 4).await.unwrap();
        assert!(validate(&raw));
        let raw = bus.request(8, opcode::READ_LAP_STATS, 6).await.unwrap();
        assert!(!validate(&raw));
        let raw = bus.request(8, opcode::READ_LAP_STATS, 6).await.unwrap();
        assert!(validate(&raw));
    }

    #[tokio::test]
    async fn test_invalid_write_checksum_ignored() {
        let (mut bus, handle) = bus();
        bus.send(8, &[opcode::WRITE_ENTER_AT_LEVEL, 90, 0]).await.unwrap();
        assert_eq!(handle.node(8, 0).unwrap().enter_at_level, 96);
        bus.send(8, &[opcode::WRITE_ENTER_AT_LEVEL, 90, 0x71 + 90]).await.unwrap();
        assert_eq!(handle.node(8, 0).unwrap().enter_at_level, 90);
    }

    #[test]
    fn test_synthetic_signal_shape() {
        let signal = SyntheticSignal {
            period_ms: 1000,
            phase_ms: 0,
            floor: 40,
            peak: 140,
            width_ms: 200,
        };
        assert_eq!(signal.rssi_at(0), 40);
        assert_eq!(signal.rssi_at(500), 140);
        assert_eq!(signal.rssi_at(550), 90);
        assert_eq!(signal.rssi_at(1500), 140);
    }
}
