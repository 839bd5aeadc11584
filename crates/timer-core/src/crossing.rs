//! Crossing/lap reconciliation.
//!
//! Nodes report a lap counter and a live "inside the gate" flag. Polling is
//! sparse, so edges of the flag can be missed entirely, or a lap can tick
//! over before the poll that would have shown the exit. [`CrossingTracker`]
//! turns the polled stream into enter/exit/lap events that stay reported
//! until the orchestrator commits them:
//!
//! 1. [`CrossingTracker::is_new_lap`] folds one poll into the pending flags.
//!    It never touches the committed lap counter (except on the very first
//!    poll, which only seeds state).
//! 2. [`CrossingTracker::commit_crossing`] and [`CrossingTracker::commit_lap`]
//!    acknowledge events once their statistics have been processed.
//!
//! When a lap is detected, every half of the crossing cycle that was not
//! committed yet is reported. With no edge observed at all that is both
//! halves; with only an enter observed it is the exit too. A rare double
//! report is preferred over silently losing a crossing.
//!
//! Committing a lap closes the cycle: leftover pending enter/exit flags are
//! cleared so they cannot leak into the next lap.

use tracing::{debug, warn};

/// Result of folding one poll into the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LapPoll {
    /// A lap is waiting to be committed.
    pub new_lap: bool,
    /// An enter edge is waiting to be committed.
    pub entered: bool,
    /// An exit edge is waiting to be committed.
    pub exited: bool,
    /// The pending lap came sooner than the minimum lap time after the last
    /// committed one. Informational only.
    pub under_min_lap: bool,
}

impl LapPoll {
    /// `(new_lap, entered, exited)`.
    pub fn flags(&self) -> (bool, bool, bool) {
        (self.new_lap, self.entered, self.exited)
    }

    /// `true` when any event is pending.
    pub fn any(&self) -> bool {
        self.new_lap || self.entered || self.exited
    }
}

/// Per-node crossing and lap state.
#[derive(Debug, Clone, Default)]
pub struct CrossingTracker {
    initialized: bool,
    pass_count: Option<u8>,
    last_lap_ms: Option<i64>,
    last_seen_cross_flag: bool,
    last_seen_lap_id: u8,
    pending_lap: bool,
    pending_enter: bool,
    pending_exit: bool,
    crossing_cycle_seen: bool,
    enter_committed: bool,
    exit_committed: bool,
}

impl CrossingTracker {
    /// A tracker waiting for its first poll.
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed lap counter, `None` before the first poll.
    pub fn pass_count(&self) -> Option<u8> {
        self.pass_count
    }

    /// Whether a crossing-flag edge was seen since the last committed lap.
    pub fn crossing_cycle_seen(&self) -> bool {
        self.crossing_cycle_seen
    }

    /// Last crossing flag reported by the node.
    pub fn is_crossing(&self) -> bool {
        self.last_seen_cross_flag
    }

    /// Fold one poll into the tracker.
    ///
    /// `min_lap_time_ms` only feeds [`LapPoll::under_min_lap`]; it never
    /// suppresses an event.
    pub fn is_new_lap(
        &mut self,
        now_ms: i64,
        min_lap_time_ms: i64,
        lap_id: u8,
        cross_flag: bool,
    ) -> LapPoll {
        if !self.initialized {
            self.initialized = true;
            self.last_seen_cross_flag = cross_flag;
            self.last_seen_lap_id = lap_id;
            self.pass_count = Some(lap_id);
            return LapPoll::default();
        }

        if cross_flag != self.last_seen_cross_flag {
            if cross_flag {
                self.pending_enter = true;
            } else {
                self.pending_exit = true;
            }
            self.crossing_cycle_seen = true;
        }

        if lap_id != self.last_seen_lap_id {
            self.pending_lap = true;
            // Synthesize whichever halves of the cycle were never committed.
            self.pending_enter |= !self.enter_committed;
            self.pending_exit |= !self.exit_committed;
        }

        self.last_seen_cross_flag = cross_flag;
        self.last_seen_lap_id = lap_id;

        let under_min_lap = self.pending_lap
            && min_lap_time_ms > 0
            && self
                .last_lap_ms
                .is_some_and(|last| now_ms - last < min_lap_time_ms);

        LapPoll {
            new_lap: self.pending_lap,
            entered: self.pending_enter,
            exited: self.pending_exit,
            under_min_lap,
        }
    }

    /// Acknowledge an enter (`is_enter`) or exit edge. The other half is
    /// left untouched.
    pub fn commit_crossing(&mut self, is_enter: bool) {
        if is_enter {
            self.pending_enter = false;
            self.enter_committed = true;
        } else {
            self.pending_exit = false;
            self.exit_committed = true;
        }
    }

    /// Commit a lap and start a new crossing cycle. Returns the counter
    /// delta (modulo 256) relative to the previous committed value.
    pub fn commit_lap(&mut self, lap_id: u8, lap_ms: i64) -> u8 {
        let previous = self.pass_count.unwrap_or(lap_id.wrapping_sub(1));
        let delta = lap_id.wrapping_sub(previous);
        if delta != 1 {
            warn!(previous, lap_id, delta, "Missed pass: lap counter jumped");
        }
        if self.pending_enter || self.pending_exit {
            debug!(
                enter = self.pending_enter,
                exit = self.pending_exit,
                "Clearing uncommitted crossing flags at lap commit"
            );
        }
        self.pass_count = Some(lap_id);
        self.last_lap_ms = Some(lap_ms);
        self.pending_lap = false;
        self.pending_enter = false;
        self.pending_exit = false;
        self.crossing_cycle_seen = false;
        self.enter_committed = false;
        self.exit_committed = false;
        delta
    }

    /// Forget everything; the next poll re-initializes.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
