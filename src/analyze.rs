//! Offline analysis of a recorded RSSI trace.
//!
//! Input is a CSV file with `time,rssi` columns. The report lists the most
//! persistent peaks, the lifetime break separating passes from noise and
//! the trigger levels the race-stop calibrator would aim for.

use std::fmt;
use std::io;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::{debug, warn};

use timer_core::calibration::{calibrate, Calibration, CalibrationPolicy};
use timer_core::extremum::extremum_indices;
use timer_core::homology::{
    calculate_peak_persistent_homology, calculate_realtime_peak_persistent_homology, find_break,
    sort_by_lifetime, ConnectedComponent,
};
use timer_core::protocol::is_valid_rssi;

/// Samples looked back over for each realtime estimate.
const REALTIME_LOOKBACK: usize = 64;

/// Components printed in the report.
const REPORT_COMPONENTS: usize = 10;

#[derive(Debug, Deserialize)]
struct Row {
    time: f64,
    rssi: i32,
}

/// A recorded trace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    /// Sample times.
    pub times: Vec<f64>,
    /// Sample values.
    pub values: Vec<i32>,
    /// Rows dropped for out-of-range RSSI.
    pub rejected: usize,
}

/// Read a `time,rssi` CSV stream.
pub fn read_trace<R: io::Read>(reader: R) -> anyhow::Result<Trace> {
    let mut csv = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut trace = Trace::default();
    for (line, row) in csv.deserialize::<Row>().enumerate() {
        let row = row.with_context(|| format!("Malformed row {}", line + 2))?;
        if !is_valid_rssi(row.rssi) {
            trace.rejected += 1;
            continue;
        }
        trace.times.push(row.time);
        trace.values.push(row.rssi);
    }
    if trace.rejected > 0 {
        warn!(rejected = trace.rejected, "Dropped out-of-range RSSI samples");
    }
    Ok(trace)
}

/// Read a `time,rssi` CSV file.
pub fn read_trace_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Trace> {
    let path = path.as_ref();
    let file = std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    read_trace(file).with_context(|| format!("Failed to read {}", path.display()))
}

/// Analysis results.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Samples analysed.
    pub samples: usize,
    /// Samples kept by the extremum filter.
    pub extrema: usize,
    /// Components, most persistent first.
    pub components: Vec<ConnectedComponent>,
    /// Noise/pass lifetime break.
    pub lifetime_break: Option<(i32, i32)>,
    /// Target levels.
    pub suggested: Option<Calibration>,
    /// Samples whose realtime lifetime reached the break.
    pub realtime_detections: usize,
    /// Extrema window used for the realtime estimate.
    pub window: usize,
}

/// Analyse `trace`. `window` is the realtime extrema window.
pub fn analyze(trace: &Trace, policy: &CalibrationPolicy, window: usize) -> Analysis {
    let values = &trace.values;
    let mut components = calculate_peak_persistent_homology(values);
    sort_by_lifetime(&mut components);
    let lifetime_break = find_break(&components);

    let target = CalibrationPolicy {
        learning_rate: 1.0,
        ..policy.clone()
    };
    let suggested = calibrate(values, 0, 0, &target);

    let realtime_detections = match lifetime_break {
        Some((_, hi)) => (0..values.len())
            .filter(|&i| {
                let from = (i + 1).saturating_sub(REALTIME_LOOKBACK);
                calculate_realtime_peak_persistent_homology(&values[from..=i], window)
                    .is_some_and(|cc| cc.lifetime() >= hi)
            })
            .count(),
        None => 0,
    };
    debug!(samples = values.len(), ?lifetime_break, realtime_detections, "Trace analysed");

    Analysis {
        samples: values.len(),
        extrema: extremum_indices(values).len(),
        components,
        lifetime_break,
        suggested,
        realtime_detections,
        window,
    }
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Samples: {} ({} extrema)", self.samples, self.extrema)?;
        writeln!(f, "Most persistent peaks:")?;
        for cc in self.components.iter().take(REPORT_COMPONENTS) {
            writeln!(f, "  {}", cc)?;
        }
        match self.lifetime_break {
            Some((lo, hi)) => writeln!(f, "Lifetime break: noise <= {}, passes >= {}", lo, hi)?,
            None => writeln!(f, "Lifetime break: none (fewer than two distinct lifetimes)")?,
        }
        match &self.suggested {
            Some(cal) => {
                writeln!(f, "Pass peak (weakest): {}", cal.peak)?;
                writeln!(f, "Floor (highest): {}", cal.floor)?;
                writeln!(f, "Suggested enter-at level: {}", cal.enter_at_level)?;
                writeln!(f, "Suggested exit-at level: {}", cal.exit_at_level)?;
            }
            None => writeln!(f, "Suggested levels: none (trace too flat)")?,
        }
        write!(
            f,
            "Realtime detections (window {}): {}",
            self.window, self.realtime_detections
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRACE: [i32; 29] = [
        40, 42, 39, 41, 60, 90, 118, 95, 60, 43, 40, 44, 41, 70, 100, 122, 99, 65, 42, 41, 45, 40,
        80, 110, 120, 85, 50, 42, 40,
    ];

    fn csv_text(values: &[i32]) -> String {
        let mut out = String::from("time,rssi\n");
        for (i, v) in values.iter().enumerate() {
            out.push_str(&format!("{}, {}\n", i * 100, v));
        }
        out
    }

    #[test]
    fn test_read_trace_drops_invalid_samples() {
        let text = "time,rssi\n0,40\n100,0\n200,255\n300,41\n";
        let trace = read_trace(text.as_bytes()).unwrap();
        assert_eq!(trace.values, vec![40, 41]);
        assert_eq!(trace.times, vec![0.0, 300.0]);
        assert_eq!(trace.rejected, 2);
    }

    #[test]
    fn test_read_trace_reports_malformed_rows() {
        let text = "time,rssi\n0,40\nabc,def\n";
        let err = read_trace(text.as_bytes()).unwrap_err();
        assert!(format!("{:#}", err).contains("row 3"));
    }

    #[test]
    fn test_analysis_of_race_trace() {
        let trace = read_trace(csv_text(&TRACE).as_bytes()).unwrap();
        let analysis = analyze(&trace, &CalibrationPolicy::default(), 10);

        assert_eq!(analysis.samples, TRACE.len());
        assert!(analysis.extrema < TRACE.len());
        assert!(analysis.lifetime_break.is_some());
        assert_eq!(analysis.components[0].birth.1, 122);

        let cal = analysis.suggested.unwrap();
        assert_eq!(cal.peak, 118);
        assert!(cal.enter_at_level > cal.exit_at_level);
        assert!(cal.exit_at_level > cal.floor);

        let report = analysis.to_string();
        assert!(report.contains("Suggested enter-at level"));
        assert!(report.contains("window 10"));
    }

    #[test]
    fn test_flat_trace_has_no_suggestion() {
        let trace = read_trace(csv_text(&[50, 50, 50, 50]).as_bytes()).unwrap();
        let analysis = analyze(&trace, &CalibrationPolicy::default(), 10);
        assert!(analysis.suggested.is_none());
        assert_eq!(analysis.realtime_detections, 0);
    }
}
