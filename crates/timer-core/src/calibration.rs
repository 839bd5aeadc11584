//! Trigger-level calibration.
//!
//! Two sources of enter/exit levels:
//!
//! - [`calibrate`] derives levels from a recorded RSSI trace using peak
//!   persistence: components whose lifetime reaches the natural break are
//!   treated as gate passes and the levels are placed between the weakest
//!   pass peak and the highest floor those passes merged down to.
//! - [`LevelCapture`] averages live samples for a fixed time window, for
//!   the manual "hold the drone at the gate" procedure.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::homology::{calculate_peak_persistent_homology, find_break};
use crate::protocol::MAX_RSSI;

/// Tunable margins for [`calibrate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationPolicy {
    /// Enter level as a fraction of the way from floor to peak.
    #[serde(default = "default_enter_fraction")]
    pub enter_fraction: f64,
    /// Exit level as a fraction of the way from floor to peak.
    #[serde(default = "default_exit_fraction")]
    pub exit_fraction: f64,
    /// How far to move from the current levels toward the new ones (0..=1).
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Minimum `peak - floor` span worth calibrating on.
    #[serde(default = "default_min_break_width")]
    pub min_break_width: i32,
}

fn default_enter_fraction() -> f64 {
    0.5
}

fn default_exit_fraction() -> f64 {
    0.25
}

fn default_learning_rate() -> f64 {
    0.5
}

fn default_min_break_width() -> i32 {
    2
}

impl Default for CalibrationPolicy {
    fn default() -> Self {
        Self {
            enter_fraction: default_enter_fraction(),
            exit_fraction: default_exit_fraction(),
            learning_rate: default_learning_rate(),
            min_break_width: default_min_break_width(),
        }
    }
}

/// Outcome of a successful calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    /// New enter-at level.
    pub enter_at_level: i32,
    /// New exit-at level.
    pub exit_at_level: i32,
    /// Lifetime break `(lo, hi)` separating noise from passes.
    pub lifetime_break: (i32, i32),
    /// Weakest pass peak.
    pub peak: i32,
    /// Highest floor between passes.
    pub floor: i32,
}

/// Derive new trigger levels from `values`.
///
/// Returns `None` for degenerate traces (no break, or a span narrower than
/// [`CalibrationPolicy::min_break_width`]); callers keep their levels.
pub fn calibrate(
    values: &[i32],
    current_enter: i32,
    current_exit: i32,
    policy: &CalibrationPolicy,
) -> Option<Calibration> {
    let ccs = calculate_peak_persistent_homology(values);
    let (lo, hi) = find_break(&ccs)?;

    let passes = ccs.iter().filter(|cc| cc.lifetime() >= hi);
    let peak = passes.clone().map(|cc| cc.birth.1).min()?;
    let floor = passes.map(|cc| cc.death.1).max()?;
    let span = peak - floor;
    if span < policy.min_break_width {
        debug!(lo, hi, peak, floor, "Calibration span too narrow");
        return None;
    }

    let target = |fraction: f64| f64::from(floor) + f64::from(span) * fraction;
    let blend = |current: i32, target: f64| {
        let level = f64::from(current) + (target - f64::from(current)) * policy.learning_rate;
        (level.round() as i32).clamp(1, MAX_RSSI - 1)
    };

    Some(Calibration {
        enter_at_level: blend(current_enter, target(policy.enter_fraction)),
        exit_at_level: blend(current_exit, target(policy.exit_fraction)),
        lifetime_break: (lo, hi),
        peak,
        floor,
    })
}

/// Lower an enter level that sits within `margin` of the node peak.
pub fn clamp_enter_to_peak(level: i32, node_peak: i32, margin: i32) -> i32 {
    if node_peak > 0 && node_peak - level < margin {
        node_peak - margin
    } else {
        level
    }
}

/// Time-boxed averaging capture of a trigger level.
#[derive(Debug, Clone, Default)]
pub struct LevelCapture {
    end_ms: Option<i64>,
    total: i64,
    count: u32,
}

impl LevelCapture {
    /// Idle capture.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin capturing until `now_ms + duration_ms`. Returns `false` when a
    /// capture is already running.
    pub fn start(&mut self, now_ms: i64, duration_ms: i64) -> bool {
        if self.end_ms.is_some() {
            return false;
        }
        self.end_ms = Some(now_ms + duration_ms);
        self.total = 0;
        self.count = 0;
        true
    }

    /// Whether a capture is running.
    pub fn is_active(&self) -> bool {
        self.end_ms.is_some()
    }

    /// Add a sample. Returns the averaged level once the window has elapsed.
    pub fn sample(&mut self, rssi: i32, now_ms: i64) -> Option<i32> {
        let end = self.end_ms?;
        self.total += i64::from(rssi);
        self.count += 1;
        if now_ms < end {
            return None;
        }
        self.end_ms = None;
        let level = (self.total as f64 / f64::from(self.count)).round() as i32;
        Some(level)
    }

    /// Samples accumulated by the running (or last) capture.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Abandon a running capture.
    pub fn cancel(&mut self) {
        self.end_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn race_trace() -> Vec<i32> {
        // Three passes peaking near 120 over a noisy ~40 floor.
        vec![
            40, 42, 39, 41, 60, 90, 118, 95, 60, 43, 40, 44, 41, 70, 100, 122, 99, 65, 42, 41,
            45, 40, 80, 110, 120, 85, 50, 42, 40,
        ]
    }

    #[test]
    fn test_calibrate_places_levels_between_floor_and_peak() {
        let policy = CalibrationPolicy {
            learning_rate: 1.0,
            ..Default::default()
        };
        let cal = calibrate(&race_trace(), 0, 0, &policy).unwrap();
        assert_eq!(cal.peak, 118);
        assert!(cal.floor >= 39 && cal.floor <= 45, "floor {}", cal.floor);
        assert!(cal.enter_at_level > cal.exit_at_level);
        assert!(cal.exit_at_level > cal.floor);
        assert!(cal.enter_at_level < cal.peak);
    }

    #[test]
    fn test_calibrate_learning_rate_blends() {
        let full = calibrate(
            &race_trace(),
            100,
            90,
            &CalibrationPolicy {
                learning_rate: 1.0,
                ..Default::default()
            },
        )
        .unwrap();
        let half = calibrate(&race_trace(), 100, 90, &CalibrationPolicy::default()).unwrap();
        let expected = ((100.0 + f64::from(full.enter_at_level)) / 2.0).round() as i32;
        assert!((half.enter_at_level - expected).abs() <= 1);
    }

    #[test]
    fn test_calibrate_flat_trace_is_no_change() {
        let policy = CalibrationPolicy::default();
        assert_eq!(calibrate(&[50; 20], 90, 80, &policy), None);
        assert_eq!(calibrate(&[], 90, 80, &policy), None);
    }

    #[test]
    fn test_calibrate_narrow_span_is_no_change() {
        let policy = CalibrationPolicy {
            min_break_width: 200,
            ..Default::default()
        };
        assert_eq!(calibrate(&race_trace(), 90, 80, &policy), None);
    }

    #[test]
    fn test_clamp_enter_to_peak() {
        assert_eq!(clamp_enter_to_peak(98, 100, 5), 95);
        assert_eq!(clamp_enter_to_peak(90, 100, 5), 90);
        assert_eq!(clamp_enter_to_peak(98, 0, 5), 98);
    }

    #[test]
    fn test_level_capture_averages_window() {
        let mut cap = LevelCapture::new();
        assert!(cap.start(1000, 3000));
        assert!(!cap.start(1500, 3000));
        assert_eq!(cap.sample(80, 1100), None);
        assert_eq!(cap.sample(90, 2000), None);
        assert_eq!(cap.sample(91, 4000), Some(87));
        assert!(!cap.is_active());
        assert_eq!(cap.sample(50, 4100), None);
    }

    #[test]
    fn test_level_capture_cancel() {
        let mut cap = LevelCapture::new();
        cap.start(0, 100);
        cap.cancel();
        assert!(!cap.is_active());
        assert!(cap.start(10, 100));
    }
}
