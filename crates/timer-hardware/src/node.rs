//! A discovered timing node: its state plus its transport.
//!
//! Register reads used by the poll loop go out with zero retries; the loop
//! itself is the retry. Configuration writes use the node's retry budget
//! and are validated by reading the register back.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::warn;

use timer_core::codec::unpack_u8;
use timer_core::homology::calculate_realtime_peak_persistent_homology;
use timer_core::protocol::{
    opcode, parse_scan_history, size, Analytics, CrossingStats, LapStats, NodeMode, RssiReading,
    RssiStats, ScanSample,
};
use timer_core::{CodecError, NodeState};

use crate::discovery::ProcessorInfo;
use crate::transport::{IoStats, NodeIo, TransportError, TransportResult};

/// Samples kept for the realtime peak-lifetime estimate.
const RECENT_SAMPLES: usize = 64;

/// A polled node.
#[derive(Debug)]
pub struct Node {
    /// Timing state.
    pub state: NodeState,
    io: NodeIo,
    processor: Arc<ProcessorInfo>,
    recent: VecDeque<i32>,
}

fn malformed(command: u8) -> impl FnOnce(CodecError) -> TransportError {
    move |source| TransportError::Malformed { command, source }
}

fn event_time(node: usize, sent_ms: i64, ms_since: u16) -> i64 {
    if ms_since == u16::MAX {
        warn!(node, "Event at maximum lookback; timestamp is a lower bound");
    }
    sent_ms - i64::from(ms_since)
}

impl Node {
    /// Wrap state and transport for a node hosted by `processor`.
    pub fn new(state: NodeState, io: NodeIo, processor: Arc<ProcessorInfo>) -> Self {
        Self {
            state,
            io,
            processor,
            recent: VecDeque::with_capacity(RECENT_SAMPLES),
        }
    }

    /// Logical node index.
    pub fn index(&self) -> usize {
        self.state.index
    }

    /// Processor hosting this node.
    pub fn processor(&self) -> &Arc<ProcessorInfo> {
        &self.processor
    }

    /// Transport handle.
    pub fn io(&self) -> &NodeIo {
        &self.io
    }

    /// Exchange counters.
    pub fn stats(&self) -> &IoStats {
        self.io.stats()
    }

    /// Whether the hosting firmware advertises `flag`.
    pub fn supports(&self, flag: u16) -> bool {
        self.processor.feature_flags & flag != 0
    }

    // =========================================================================
    // Poll reads
    // =========================================================================

    /// `READ_RSSI`, timestamped at the node.
    pub async fn poll_rssi(&mut self) -> TransportResult<(RssiReading, i64)> {
        let (payload, sent_ms) = self.io.read_timed(opcode::READ_RSSI, size::RSSI, 0).await?;
        let reading = RssiReading::parse(&payload).map_err(malformed(opcode::READ_RSSI))?;
        Ok((reading, sent_ms))
    }

    /// Enter or exit statistics, with the edge time resolved.
    pub async fn read_crossing_stats(&mut self, is_enter: bool) -> TransportResult<(CrossingStats, i64)> {
        let command = if is_enter {
            opcode::READ_ENTER_STATS
        } else {
            opcode::READ_EXIT_STATS
        };
        let (payload, sent_ms) = self.io.read_timed(command, size::CROSSING_STATS, 0).await?;
        let stats = CrossingStats::parse(&payload).map_err(malformed(command))?;
        Ok((stats, event_time(self.index(), sent_ms, stats.ms_since)))
    }

    /// Lap statistics, with the pass time resolved.
    pub async fn read_lap_stats(&mut self) -> TransportResult<(LapStats, i64)> {
        let (payload, sent_ms) = self
            .io
            .read_timed(opcode::READ_LAP_STATS, size::LAP_STATS, 0)
            .await?;
        let stats = LapStats::parse(&payload).map_err(malformed(opcode::READ_LAP_STATS))?;
        Ok((stats, event_time(self.index(), sent_ms, stats.ms_since)))
    }

    /// On-node analytics, with the extremum start time resolved.
    pub async fn read_analytics(&mut self) -> TransportResult<(Analytics, i64)> {
        let (payload, sent_ms) = self
            .io
            .read_timed(opcode::READ_ANALYTICS, size::ANALYTICS, 0)
            .await?;
        let analytics = Analytics::parse(&payload).map_err(malformed(opcode::READ_ANALYTICS))?;
        Ok((analytics, event_time(self.index(), sent_ms, analytics.extremum_ms_since)))
    }

    /// Node-wide peak and nadir.
    pub async fn read_rssi_stats(&mut self) -> TransportResult<RssiStats> {
        let payload = self
            .io
            .read_block(opcode::READ_RSSI_STATS, size::RSSI_STATS, 0)
            .await?;
        RssiStats::parse(&payload).map_err(malformed(opcode::READ_RSSI_STATS))
    }

    /// Frequency-scan samples (scanner mode).
    pub async fn read_scan_history(&mut self) -> TransportResult<Vec<ScanSample>> {
        let payload = self
            .io
            .read_block(opcode::READ_SCAN_HISTORY, size::SCAN_HISTORY, 0)
            .await?;
        parse_scan_history(&payload).map_err(malformed(opcode::READ_SCAN_HISTORY))
    }

    /// Raw on-node RSSI history buffer.
    pub async fn read_rssi_history(&mut self) -> TransportResult<Vec<u8>> {
        let retries = self.io.max_retries();
        self.io
            .read_block(opcode::READ_RSSI_HISTORY, size::RSSI_HISTORY, retries)
            .await
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Load frequency, mode and trigger levels from the node. Individual
    /// failures leave the current value in place.
    pub async fn load_settings(&mut self, max_retries: u32) {
        if let Ok(frequency) = self.io.get_u16(opcode::READ_FREQUENCY, max_retries).await {
            self.state.frequency = frequency;
        }
        if let Ok(mode) = self.io.get_u8(opcode::READ_MODE, max_retries).await {
            match NodeMode::try_from(mode) {
                Ok(mode) => self.state.mode = mode,
                Err(raw) => warn!(node = self.index(), mode = raw, "Unknown node mode"),
            }
        }
        if let Ok(level) = self.io.get_u8(opcode::READ_ENTER_AT_LEVEL, max_retries).await {
            self.state.enter_at_level = i32::from(level);
        }
        if let Ok(level) = self.io.get_u8(opcode::READ_EXIT_AT_LEVEL, max_retries).await {
            self.state.exit_at_level = i32::from(level);
        }
    }

    /// Board slot of this node.
    pub async fn read_slot_index(&mut self, max_retries: u32) -> TransportResult<u8> {
        let payload = self
            .io
            .read_block(opcode::READ_NODE_SLOTIDX, 1, max_retries)
            .await?;
        unpack_u8(&payload).map_err(malformed(opcode::READ_NODE_SLOTIDX))
    }

    /// Tune the receiver. Returns the frequency the node reports.
    pub async fn set_frequency(&mut self, frequency: u16) -> TransportResult<u16> {
        let retries = self.io.max_retries();
        let got = self
            .io
            .set_and_validate_u16(opcode::WRITE_FREQUENCY, opcode::READ_FREQUENCY, frequency, retries)
            .await?;
        self.state.frequency = got;
        Ok(got)
    }

    /// Set the enter-at level. Returns the level the node reports.
    pub async fn set_enter_at_level(&mut self, level: u8) -> TransportResult<u8> {
        let retries = self.io.max_retries();
        let got = self
            .io
            .set_and_validate_u8(opcode::WRITE_ENTER_AT_LEVEL, opcode::READ_ENTER_AT_LEVEL, level, retries)
            .await?;
        self.state.enter_at_level = i32::from(got);
        Ok(got)
    }

    /// Set the exit-at level. Returns the level the node reports.
    pub async fn set_exit_at_level(&mut self, level: u8) -> TransportResult<u8> {
        let retries = self.io.max_retries();
        let got = self
            .io
            .set_and_validate_u8(opcode::WRITE_EXIT_AT_LEVEL, opcode::READ_EXIT_AT_LEVEL, level, retries)
            .await?;
        self.state.exit_at_level = i32::from(got);
        Ok(got)
    }

    /// Switch operating mode.
    pub async fn set_mode(&mut self, mode: NodeMode) -> TransportResult<NodeMode> {
        let retries = self.io.max_retries();
        let got = self
            .io
            .set_and_validate_u8(opcode::WRITE_MODE, opcode::READ_MODE, mode.as_u8(), retries)
            .await?;
        match NodeMode::try_from(got) {
            Ok(mode) => {
                self.state.mode = mode;
                Ok(mode)
            }
            Err(value) => Err(TransportError::Unexpected {
                command: opcode::READ_MODE,
                value,
            }),
        }
    }

    /// Make the node end a crossing in progress.
    pub async fn force_end_crossing(&mut self) -> TransportResult<()> {
        self.io.set_u8(opcode::FORCE_END_CROSSING, 0).await
    }

    /// Forward a status message (`kind << 8 | data`) to the node.
    pub async fn send_status_message(&mut self, kind: u8, data: u8) -> TransportResult<()> {
        self.io
            .set_u16(opcode::SEND_STATUS_MESSAGE, u16::from_be_bytes([kind, data]))
            .await
    }

    // =========================================================================
    // Realtime lifetime
    // =========================================================================

    /// Push `rssi` into the recent window and return the lifetime of the
    /// peak born at it, if any.
    pub fn realtime_lifetime(&mut self, rssi: i32, window: usize) -> Option<i32> {
        if self.recent.len() == RECENT_SAMPLES {
            self.recent.pop_front();
        }
        self.recent.push_back(rssi);
        let values: Vec<i32> = self.recent.iter().copied().collect();
        calculate_realtime_peak_persistent_homology(&values, window).map(|cc| cc.lifetime())
    }

    /// Drop the recent window (race start).
    pub fn clear_recent(&mut self) {
        self.recent.clear();
    }
}
