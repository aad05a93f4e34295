//! Landmark pruning and hash generation over the sliding window of marks.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::fingerprint::peaks::Mark;

/// One landmark: a hash anchored at the time of its finalized frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hash: u32,
    pub time: f64,
}

/// Bounds of the landmark neighborhood.
#[derive(Debug, Clone, Copy)]
pub struct LandmarkWindow {
    /// Number of frequency bins, the radix of the hash.
    pub bins: usize,
    /// Frequency reach for both pruning (inclusive) and pairing (exclusive).
    pub df: usize,
    /// How many frames back a peak may look for pairing partners.
    pub dt: usize,
    /// Pairs emitted per anchor peak at most.
    pub pairs_per_peak: usize,
}

/// `f2 + B·(f1 + B·Δt)`
pub fn landmark_hash(f1: usize, f2: usize, dt: usize, bins: usize) -> u32 {
    (f2 + bins * (f1 + bins * dt)) as u32
}

/// Split a hash back into `(f1, f2, Δt)`.
pub fn landmark_parts(hash: u32, bins: usize) -> (usize, usize, usize) {
    let hash = hash as usize;
    let f2 = hash % bins;
    let f1 = (hash / bins) % bins;
    let dt = hash / (bins * bins);
    (f1, f2, dt)
}

/// Suppress peaks of frames `..=t0` that a stronger, later peak within `df`
/// bins dominates.
///
/// Frame `t0` is checked against every later frame. Frames before it were
/// already checked against everything but the newest frame on earlier calls,
/// so only the newest frame is consulted for them.
pub fn prune<const K: usize>(marks: &mut VecDeque<Mark<K>>, t0: usize, df: usize) {
    let Some(newest) = marks.len().checked_sub(1) else {
        return;
    };

    for i in 0..=t0.min(newest) {
        let later = if i == t0 { i + 1 } else { newest };

        for slot in 0..K {
            let Some(peak) = marks[i].slot(slot) else {
                continue;
            };

            let dominated = (later..marks.len()).any(|k| {
                marks[k]
                    .peaks()
                    .any(|other| other.bin.abs_diff(peak.bin) <= df && other.value > peak.value)
            });

            if dominated {
                marks[i].suppress(slot);
            }
        }
    }
}

/// Pair every surviving peak of frame `t0` with up to `pairs_per_peak`
/// surviving peaks from frames `t0, t0-1, ...`, nearest frames first.
pub fn emit<const K: usize>(
    marks: &VecDeque<Mark<K>>,
    t0: usize,
    window: &LandmarkWindow,
) -> Vec<Fingerprint> {
    let anchor = &marks[t0];
    let earliest = t0.saturating_sub(window.dt);
    let mut fingerprints = Vec::new();

    for peak in anchor.peaks() {
        let partners = (earliest..=t0)
            .rev()
            .flat_map(|j| {
                let mark = &marks[j];
                mark.peaks().map(move |other| (mark.frame, other))
            })
            .filter(|(_, other)| other.bin != peak.bin && other.bin.abs_diff(peak.bin) < window.df)
            .take(window.pairs_per_peak);

        for (frame, other) in partners {
            fingerprints.push(Fingerprint {
                hash: landmark_hash(peak.bin, other.bin, anchor.frame - frame, window.bins),
                time: anchor.time,
            });
        }
    }

    fingerprints
}
