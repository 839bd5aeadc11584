//! Per-node timing state.
//!
//! [`NodeState`] is everything the orchestrator knows about one receiver:
//! tuning, trigger levels, the latest readings, the RSSI history and the
//! crossing/lap reconciliation state. It performs no I/O.
//!
//! The committed lap counter lives inside the private [`CrossingTracker`]
//! and only moves through [`NodeState::process_lap_stats`]; pending
//! crossing flags only clear through [`NodeState::process_crossing`].

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::calibration::{calibrate, clamp_enter_to_peak, Calibration, CalibrationPolicy, LevelCapture};
use crate::crossing::{CrossingTracker, LapPoll};
use crate::extremum::{Decision, ExtremumFilter};
use crate::history::RssiHistory;
use crate::protocol::{is_valid_rssi, NodeMode};

/// A timestamped RSSI reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiSample {
    /// Timestamp in milliseconds.
    pub timestamp_ms: i64,
    /// RSSI value.
    pub rssi: i32,
}

/// Levels produced by a finished capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOutcome {
    /// New enter-at level, when its capture finished.
    pub enter_at_level: Option<i32>,
    /// New exit-at level, when its capture finished.
    pub exit_at_level: Option<i32>,
}

/// Mutable state of one logical node.
#[derive(Debug, Clone)]
pub struct NodeState {
    /// Logical seat number, stable for the process lifetime.
    pub index: usize,
    /// Sub-address on a multi-node processor.
    pub multi_node_index: Option<u8>,
    /// Physical slot on a multi-node board.
    pub slot_index: Option<u8>,
    /// Tuned frequency in MHz (0 = disabled).
    pub frequency: u16,
    /// Enter-at trigger level.
    pub enter_at_level: i32,
    /// Exit-at trigger level.
    pub exit_at_level: i32,
    /// Operating mode.
    pub mode: NodeMode,
    /// Latest polled RSSI.
    pub current_rssi: Option<RssiSample>,
    /// Latest peak lifetime.
    pub current_lifetime: Option<i32>,
    /// Highest RSSI reported by the node.
    pub node_peak_rssi: i32,
    /// Lowest RSSI reported by the node.
    pub node_nadir_rssi: i32,
    /// Peak RSSI of the last pass.
    pub pass_peak_rssi: Option<i32>,
    /// Nadir RSSI before the last pass.
    pub pass_nadir_rssi: Option<i32>,
    /// Firmware loop time in microseconds.
    pub loop_time_us: u32,
    /// Filtered RSSI history for the current race.
    pub history: RssiHistory,
    /// Pass peaks captured during the race, merged into history at stop.
    pub pass_history: Vec<(f64, i32)>,
    /// RSSI at the last committed enter edge.
    pub enter_at_sample: Option<RssiSample>,
    /// RSSI at the last committed exit edge.
    pub exit_at_sample: Option<RssiSample>,
    /// At least one crossing was seen this race.
    pub first_cross_flag: bool,
    /// Recalibrate levels from history when the race stops.
    pub ai_calibrate: bool,
    /// Latest scan samples keyed by frequency.
    pub scan_data: BTreeMap<u16, u8>,
    /// Rejected out-of-range RSSI readings.
    pub bad_rssi_count: u32,
    crossing: CrossingTracker,
    extremum: ExtremumFilter,
    sample_index: usize,
    prev_sample_ms: Option<i64>,
    cap_enter: LevelCapture,
    cap_exit: LevelCapture,
}

impl NodeState {
    /// Fresh state for a newly discovered node.
    pub fn new(index: usize, multi_node_index: Option<u8>) -> Self {
        Self {
            index,
            multi_node_index,
            slot_index: None,
            frequency: 0,
            enter_at_level: 0,
            exit_at_level: 0,
            mode: NodeMode::Timer,
            current_rssi: None,
            current_lifetime: None,
            node_peak_rssi: 0,
            node_nadir_rssi: 0,
            pass_peak_rssi: None,
            pass_nadir_rssi: None,
            loop_time_us: 0,
            history: RssiHistory::new(),
            pass_history: Vec::new(),
            enter_at_sample: None,
            exit_at_sample: None,
            first_cross_flag: false,
            ai_calibrate: true,
            scan_data: BTreeMap::new(),
            bad_rssi_count: 0,
            crossing: CrossingTracker::new(),
            extremum: ExtremumFilter::new(),
            sample_index: 0,
            prev_sample_ms: None,
            cap_enter: LevelCapture::new(),
            cap_exit: LevelCapture::new(),
        }
    }

    /// Committed lap counter.
    pub fn pass_count(&self) -> Option<u8> {
        self.crossing.pass_count()
    }

    /// Node-reported crossing flag from the latest poll.
    pub fn is_crossing(&self) -> bool {
        self.crossing.is_crossing()
    }

    /// Fold a `READ_RSSI` poll into the crossing state.
    pub fn is_new_lap(
        &mut self,
        timestamp_ms: i64,
        min_lap_time_ms: i64,
        rssi: i32,
        lap_id: u8,
        cross_flag: bool,
    ) -> LapPoll {
        self.current_rssi = Some(RssiSample { timestamp_ms, rssi });
        self.crossing
            .is_new_lap(timestamp_ms, min_lap_time_ms, lap_id, cross_flag)
    }

    /// Commit an enter or exit edge and record its sample.
    pub fn process_crossing(
        &mut self,
        is_enter: bool,
        count: u8,
        timestamp_ms: i64,
        rssi: Option<i32>,
        lifetime: Option<i32>,
    ) {
        debug!(
            node = self.index,
            kind = if is_enter { "enter" } else { "exit" },
            count,
            timestamp_ms,
            ?rssi,
            ?lifetime,
            "Crossing"
        );
        if let Some(pass_count) = self.pass_count() {
            if count.wrapping_sub(pass_count) > 1 {
                warn!(node = self.index, pass_count, count, "Missed crossing");
            }
        }
        self.crossing.commit_crossing(is_enter);
        let sample = rssi.map(|rssi| RssiSample { timestamp_ms, rssi });
        if is_enter {
            self.first_cross_flag = true;
            self.enter_at_sample = sample;
        } else {
            self.exit_at_sample = sample;
        }
    }

    /// Commit a lap. Pass peaks are kept for the post-race history merge
    /// while `racing`.
    pub fn process_lap_stats(
        &mut self,
        lap_id: u8,
        timestamp_ms: i64,
        peak_rssi: Option<i32>,
        nadir_rssi: Option<i32>,
        racing: bool,
    ) -> u8 {
        debug!(node = self.index, lap_id, timestamp_ms, ?peak_rssi, ?nadir_rssi, "Pass");
        if let Some(enter) = self.enter_at_sample {
            if enter.timestamp_ms > timestamp_ms {
                warn!(node = self.index, enter = enter.timestamp_ms, pass = timestamp_ms, "Enter timestamp after pass");
            }
        }
        if let Some(exit) = self.exit_at_sample {
            if exit.timestamp_ms < timestamp_ms {
                warn!(node = self.index, exit = exit.timestamp_ms, pass = timestamp_ms, "Exit timestamp before pass");
            }
        }
        let delta = self.crossing.commit_lap(lap_id, timestamp_ms);
        if peak_rssi.is_some() {
            self.pass_peak_rssi = peak_rssi;
        }
        if nadir_rssi.is_some() {
            self.pass_nadir_rssi = nadir_rssi;
        }
        self.enter_at_sample = None;
        self.exit_at_sample = None;
        if racing {
            if let Some(peak) = peak_rssi {
                self.pass_history.push((timestamp_ms as f64, peak));
            }
        }
        delta
    }

    /// Record node-wide peak/nadir.
    pub fn process_rssi_stats(&mut self, peak: Option<i32>, nadir: Option<i32>) {
        if let Some(peak) = peak {
            self.node_peak_rssi = peak;
        }
        if let Some(nadir) = nadir {
            self.node_nadir_rssi = nadir;
        }
    }

    /// Record analytics readings.
    pub fn process_analytics(&mut self, lifetime: i32, loop_time_us: u32) {
        self.current_lifetime = Some(lifetime);
        self.loop_time_us = loop_time_us;
    }

    /// Validate a reading, counting rejects. Returns the value when valid.
    pub fn check_rssi(&mut self, rssi: i32) -> Option<i32> {
        if is_valid_rssi(rssi) {
            return Some(rssi);
        }
        self.bad_rssi_count += 1;
        if self.bad_rssi_count <= 10 || self.bad_rssi_count % 100 == 0 {
            warn!(node = self.index, rssi, count = self.bad_rssi_count, "RSSI reading out of range; rejected");
        }
        None
    }

    /// Feed a polled sample through the extremum filter into history.
    /// Only shape-bearing samples are stored, and only while `racing`.
    pub fn record_sample(&mut self, timestamp_ms: i64, rssi: i32, racing: bool) {
        let decision = self.extremum.push(self.sample_index, rssi);
        self.sample_index += 1;
        if let (Decision::Keep { value, .. }, Some(prev_ms)) = (decision, self.prev_sample_ms) {
            if racing {
                self.history.append(prev_ms as f64, value);
            }
        }
        self.prev_sample_ms = Some(timestamp_ms);
    }

    /// Start an averaging capture of the enter-at level.
    pub fn start_capture_enter_at_level(&mut self, now_ms: i64, duration_ms: i64) -> bool {
        self.cap_enter.start(now_ms, duration_ms)
    }

    /// Start an averaging capture of the exit-at level.
    pub fn start_capture_exit_at_level(&mut self, now_ms: i64, duration_ms: i64) -> bool {
        self.cap_exit.start(now_ms, duration_ms)
    }

    /// Whether either capture is running.
    pub fn is_capturing(&self) -> bool {
        self.cap_enter.is_active() || self.cap_exit.is_active()
    }

    /// Feed the current RSSI into running captures and apply finished ones.
    pub fn process_capturing(&mut self, now_ms: i64, enter_peak_margin: i32) -> CaptureOutcome {
        let mut outcome = CaptureOutcome::default();
        let Some(current) = self.current_rssi else {
            return outcome;
        };
        if let Some(level) = self.cap_enter.sample(current.rssi, now_ms) {
            let level = clamp_enter_to_peak(level, self.node_peak_rssi, enter_peak_margin);
            info!(node = self.index, level, count = self.cap_enter.count(), "Finished capture of enter-at level");
            self.enter_at_level = level;
            outcome.enter_at_level = Some(level);
        }
        if let Some(level) = self.cap_exit.sample(current.rssi, now_ms) {
            info!(node = self.index, level, count = self.cap_exit.count(), "Finished capture of exit-at level");
            self.exit_at_level = level;
            outcome.exit_at_level = Some(level);
        }
        outcome
    }

    /// Recalibrate trigger levels from the race history. Returns `None`
    /// when disabled, no crossing was seen, or the history is degenerate.
    pub fn ai_calibrate(&mut self, policy: &CalibrationPolicy) -> Option<Calibration> {
        if !self.ai_calibrate || !self.first_cross_flag || self.history.is_empty() {
            return None;
        }
        match calibrate(self.history.values(), self.enter_at_level, self.exit_at_level, policy) {
            Some(cal) => {
                info!(
                    node = self.index,
                    lo = cal.lifetime_break.0,
                    hi = cal.lifetime_break.1,
                    from_enter = self.enter_at_level,
                    from_exit = self.exit_at_level,
                    to_enter = cal.enter_at_level,
                    to_exit = cal.exit_at_level,
                    "AI calibrating node"
                );
                self.enter_at_level = cal.enter_at_level;
                self.exit_at_level = cal.exit_at_level;
                Some(cal)
            }
            None => {
                info!(node = self.index, "AI calibration skipped: no usable break");
                None
            }
        }
    }

    /// Merge captured pass peaks into history (race stop).
    pub fn merge_pass_history(&mut self) {
        let passes = std::mem::take(&mut self.pass_history);
        self.history.merge(&passes);
    }

    /// Clear race-scoped state (race start).
    pub fn reset(&mut self) {
        self.crossing.reset();
        self.extremum.reset();
        self.sample_index = 0;
        self.prev_sample_ms = None;
        self.history.clear();
        self.pass_history.clear();
        self.enter_at_sample = None;
        self.exit_at_sample = None;
        self.first_cross_flag = false;
        self.current_lifetime = None;
    }
}
