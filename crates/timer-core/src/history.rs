//! Compacted RSSI history.
//!
//! Timestamps are kept ascending and unique. Long flat runs are reduced to
//! their two endpoints: appending a value equal to the last two stored
//! values moves the last point forward instead of growing the buffer.

use crate::error::{TimerError, TimerResult};

/// Ordered `(timestamp, value)` buffer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RssiHistory {
    times: Vec<f64>,
    values: Vec<i32>,
}

impl RssiHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents.
    pub fn set(&mut self, times: &[f64], values: &[i32]) -> TimerResult<()> {
        if times.len() != values.len() {
            return Err(TimerError::HistoryLengthMismatch {
                times: times.len(),
                values: values.len(),
            });
        }
        self.times = times.to_vec();
        self.values = values.to_vec();
        Ok(())
    }

    /// Append a sample, collapsing flat runs.
    pub fn append(&mut self, time: f64, value: i32) {
        let n = self.values.len();
        if n >= 2 && self.values[n - 1] == value && self.values[n - 2] == value {
            self.times[n - 1] = time;
        } else {
            self.times.push(time);
            self.values.push(value);
        }
    }

    /// Merge authoritative samples captured at crossing instants.
    ///
    /// A sample whose timestamp already exists overwrites the stored value;
    /// any other sample is inserted in timestamp order.
    pub fn merge(&mut self, samples: &[(f64, i32)]) {
        for &(time, value) in samples {
            let idx = self.times.partition_point(|t| *t < time);
            if self.times.get(idx) == Some(&time) {
                self.values[idx] = value;
            } else {
                self.times.insert(idx, time);
                self.values.insert(idx, value);
            }
        }
    }

    /// Borrow timestamps and values.
    pub fn get(&self) -> (&[f64], &[i32]) {
        (&self.times, &self.values)
    }

    /// Stored timestamps.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Stored values.
    pub fn values(&self) -> &[i32] {
        &self.values
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// `true` when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Drop all samples.
    pub fn clear(&mut self) {
        self.times.clear();
        self.values.clear();
    }
}
