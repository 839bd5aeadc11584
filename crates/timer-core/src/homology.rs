//! 0-dimensional persistent homology over a 1-D RSSI trace.
//!
//! Samples are visited from highest to lowest value. Each local maximum
//! births a connected component; when a sample joins two components the one
//! with the lower birth dies there. A component's lifetime (birth value
//! minus death value) measures how prominent its peak is, which separates
//! real gate passes from noise without a fixed threshold.

use std::cmp::Ordering;

use crate::extremum::extremum_indices;

/// A peak component: born at its maximum, dead where it merged into a
/// taller neighbour (or at the global minimum for the tallest peaks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectedComponent {
    /// `(index, value)` of the peak.
    pub birth: (usize, i32),
    /// `(index, value)` where the component merged away.
    pub death: (usize, i32),
    left: usize,
    right: usize,
}

impl ConnectedComponent {
    fn new(idx: usize, birth: (usize, i32), death: (usize, i32)) -> Self {
        Self {
            birth,
            death,
            left: idx,
            right: idx,
        }
    }

    /// `|birth.value - death.value|`
    pub fn lifetime(&self) -> i32 {
        (self.birth.1 - self.death.1).abs()
    }
}

impl std::fmt::Display for ConnectedComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({}, {}) -> ({}, {})",
            self.birth.0, self.birth.1, self.death.0, self.death.1
        )
    }
}

/// Visit order: value descending, index descending, with every run of
/// equal, index-contiguous samples reordered centre-first so a plateau is
/// born at its middle.
fn visit_order(data: &[i32]) -> Vec<usize> {
    let mut idxs: Vec<usize> = (0..data.len()).collect();
    idxs.sort_by(|&a, &b| data[b].cmp(&data[a]).then(b.cmp(&a)));

    let mut out = Vec::with_capacity(idxs.len());
    let mut start = 0;
    while start < idxs.len() {
        let mut end = start + 1;
        while end < idxs.len()
            && data[idxs[end]] == data[idxs[start]]
            && idxs[end - 1] == idxs[end] + 1
        {
            end += 1;
        }
        // idxs[start..end] is a descending contiguous run of equal values.
        let run: Vec<usize> = idxs[start..end].iter().rev().copied().collect();
        let center = (run.len() - 1) / 2;
        out.push(run[center]);
        for step in 1..run.len() {
            if center + step < run.len() {
                out.push(run[center + step]);
            }
            if step <= center {
                out.push(run[center - step]);
            }
        }
        start = end;
    }
    out
}

/// Compute peak persistence for `data`. Components are returned in birth
/// order (tallest first).
pub fn calculate_peak_persistent_homology(data: &[i32]) -> Vec<ConnectedComponent> {
    let order = visit_order(data);
    let Some(&min_idx) = order.last() else {
        return Vec::new();
    };
    let n = data.len();
    let min_point = (min_idx, data[min_idx]);

    let mut ccs: Vec<ConnectedComponent> = Vec::new();
    let mut idx_to_cc: Vec<Option<usize>> = vec![None; n];

    for &i in &order {
        let left = if i > 0 { idx_to_cc[i - 1] } else { None };
        let right = if i + 1 < n { idx_to_cc[i + 1] } else { None };
        match (left, right) {
            (None, None) => {
                ccs.push(ConnectedComponent::new(i, (i, data[i]), min_point));
                idx_to_cc[i] = Some(ccs.len() - 1);
            }
            (Some(l), None) => {
                ccs[l].right += 1;
                idx_to_cc[i] = Some(l);
            }
            (None, Some(r)) => {
                ccs[r].left -= 1;
                idx_to_cc[i] = Some(r);
            }
            (Some(l), Some(r)) => {
                if ccs[l].birth.1 > ccs[r].birth.1 {
                    ccs[r].death = (i, data[i]);
                    ccs[l].right = ccs[r].right;
                    idx_to_cc[i] = Some(l);
                    let edge = ccs[l].right;
                    idx_to_cc[edge] = Some(l);
                } else {
                    ccs[l].death = (i, data[i]);
                    ccs[r].left = ccs[l].left;
                    idx_to_cc[i] = Some(r);
                    let edge = ccs[r].left;
                    idx_to_cc[edge] = Some(r);
                }
            }
        }
    }
    ccs
}

/// Sort most prominent first. Equal lifetimes keep their relative order.
pub fn sort_by_lifetime(ccs: &mut [ConnectedComponent]) {
    ccs.sort_by_key(|cc| std::cmp::Reverse(cc.lifetime()));
}

/// Two-class natural-breaks split of the component lifetimes.
///
/// Returns `(lo, hi)`: the largest lifetime of the lower (noise) class and
/// the next distinct lifetime above it. `None` when fewer than two distinct
/// lifetimes exist.
pub fn find_break(ccs: &[ConnectedComponent]) -> Option<(i32, i32)> {
    let mut lifetimes: Vec<i32> = ccs.iter().map(ConnectedComponent::lifetime).collect();
    lifetimes.sort_unstable();

    let n = lifetimes.len();
    let mut prefix = Vec::with_capacity(n + 1);
    let mut prefix_sq = Vec::with_capacity(n + 1);
    prefix.push(0.0f64);
    prefix_sq.push(0.0f64);
    for &v in &lifetimes {
        let v = f64::from(v);
        prefix.push(prefix[prefix.len() - 1] + v);
        prefix_sq.push(prefix_sq[prefix_sq.len() - 1] + v * v);
    }
    let ssd = |from: usize, to: usize| {
        let count = (to - from) as f64;
        let sum = prefix[to] - prefix[from];
        (prefix_sq[to] - prefix_sq[from]) - sum * sum / count
    };

    let mut best: Option<(f64, usize)> = None;
    for k in 1..n {
        // Only split between distinct values.
        if lifetimes[k - 1] == lifetimes[k] {
            continue;
        }
        let cost = ssd(0, k) + ssd(k, n);
        match best {
            Some((c, _)) if c.partial_cmp(&cost) != Some(Ordering::Greater) => {}
            _ => best = Some((cost, k)),
        }
    }
    best.map(|(_, k)| (lifetimes[k - 1], lifetimes[k]))
}

/// Persistence restricted to the latest `window_size` extrema of `values`
/// plus the current (last) sample.
///
/// Returns the component born at the current sample, with indices mapped
/// back into `values`, or `None` when the current sample is not a birth.
pub fn calculate_realtime_peak_persistent_homology(
    values: &[i32],
    window_size: usize,
) -> Option<ConnectedComponent> {
    let current = values.len().checked_sub(1)?;
    let mut idxs = extremum_indices(values);
    let skip = idxs.len().saturating_sub(window_size);
    idxs.drain(..skip);
    if idxs.last() != Some(&current) {
        idxs.push(current);
    }

    let window: Vec<i32> = idxs.iter().map(|&i| values[i]).collect();
    let local_current = idxs.len() - 1;
    calculate_peak_persistent_homology(&window)
        .into_iter()
        .find(|cc| cc.birth.0 == local_current)
        .map(|cc| ConnectedComponent {
            birth: (idxs[cc.birth.0], cc.birth.1),
            death: (idxs[cc.death.0], cc.death.1),
            left: idxs[cc.left],
            right: idxs[cc.right],
        })
}
