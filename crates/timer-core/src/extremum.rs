//! Streaming three-point extremum filter.
//!
//! Samples arrive one at a time. A decision for sample `i` can only be made
//! once sample `i + 1` is known, so every push returns the verdict for the
//! *previous* sample and the very first push returns [`Decision::Pending`].
//!
//! With `left = sign(cur - prev)` and `right = sign(next - cur)`:
//!
//! | left | right | verdict |
//! |------|-------|---------|
//! | ±1   | same  | drop (monotonic through `cur`) |
//! | 0    | 0     | drop (inside a plateau) |
//! | otherwise |  | keep (peak, nadir or plateau edge) |
//!
//! The first sample of a stream has no left neighbour and is always kept.

/// Verdict for one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No sample is ready to be classified yet.
    Pending,
    /// The sample is an extremum or plateau edge.
    Keep {
        /// Index of the decided sample.
        index: usize,
        /// Its value.
        value: i32,
    },
    /// The sample carries no shape information.
    Drop {
        /// Index of the decided sample.
        index: usize,
    },
}

impl Decision {
    /// The kept value, if any.
    pub fn kept(self) -> Option<i32> {
        match self {
            Decision::Keep { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// One-sample-lookahead extremum classifier.
#[derive(Debug, Clone, Default)]
pub struct ExtremumFilter {
    prev: Option<i32>,
    current: Option<(usize, i32)>,
}

impl ExtremumFilter {
    /// Create an empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next sample and classify the one before it.
    pub fn push(&mut self, index: usize, value: i32) -> Decision {
        let decision = match (self.prev, self.current) {
            (_, None) => Decision::Pending,
            (None, Some((ci, cv))) => Decision::Keep {
                index: ci,
                value: cv,
            },
            (Some(pv), Some((ci, cv))) => classify(pv, (ci, cv), value),
        };
        self.prev = self.current.map(|(_, v)| v);
        self.current = Some((index, value));
        decision
    }

    /// The sample still awaiting its lookahead, if any.
    pub fn pending(&self) -> Option<(usize, i32)> {
        self.current
    }

    /// Forget all state.
    pub fn reset(&mut self) {
        self.prev = None;
        self.current = None;
    }
}

fn classify(prev: i32, (index, cur): (usize, i32), next: i32) -> Decision {
    let left = cur.cmp(&prev);
    let right = next.cmp(&cur);
    // Equal signs are either strictly monotonic or plateau interior.
    if left == right {
        Decision::Drop { index }
    } else {
        Decision::Keep { index, value: cur }
    }
}

/// Run the filter over a whole slice. The result has one entry per decided
/// sample (`values.len() - 1` entries); the last sample is never decided.
pub fn filter_values(values: &[i32]) -> Vec<Option<i32>> {
    let mut filter = ExtremumFilter::new();
    values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| match filter.push(i, *v) {
            Decision::Pending => None,
            d => Some(d.kept()),
        })
        .collect()
}

/// Indices of the kept samples of `values`, excluding the undecided last one.
pub fn extremum_indices(values: &[i32]) -> Vec<usize> {
    let mut filter = ExtremumFilter::new();
    values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| match filter.push(i, *v) {
            Decision::Keep { index, .. } => Some(index),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_reference_sequence() {
        let out = filter_values(&[2, 5, 5, 5, 4, 8, 9, 7, 7, 1, 3]);
        assert_eq!(
            out,
            vec![
                Some(2),
                Some(5),
                None,
                Some(5),
                Some(4),
                None,
                Some(9),
                Some(7),
                Some(7),
                Some(1)
            ]
        );
    }

    #[test]
    fn test_first_push_is_pending() {
        let mut f = ExtremumFilter::new();
        assert_eq!(f.push(0, 10), Decision::Pending);
        assert_eq!(f.pending(), Some((0, 10)));
        assert_eq!(f.push(1, 12), Decision::Keep { index: 0, value: 10 });
    }

    #[test]
    fn test_monotonic_run_dropped() {
        let mut f = ExtremumFilter::new();
        f.push(0, 1);
        f.push(1, 2);
        assert_eq!(f.push(2, 3), Decision::Drop { index: 1 });
        assert_eq!(f.push(3, 2), Decision::Keep { index: 2, value: 3 });
    }

    #[test]
    fn test_extremum_indices() {
        assert_eq!(
            extremum_indices(&[2, 5, 5, 5, 4, 8, 9, 7, 7, 1, 3]),
            vec![0, 1, 3, 4, 6, 7, 8, 9]
        );
    }

    #[test]
    fn test_reset() {
        let mut f = ExtremumFilter::new();
        f.push(0, 1);
        f.push(1, 2);
        f.reset();
        assert_eq!(f.push(5, 9), Decision::Pending);
    }
}
