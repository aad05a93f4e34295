//! Per-frame peak selection against a decaying per-bin threshold.

/// A spectral peak: frequency bin and its log-magnitude.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub bin: usize,
    pub value: f64,
}

/// The strongest peaks of one frame, strongest first.
///
/// Holds at most `K` peaks. Empty slots and suppressed peaks are `None`
/// and never take part in pruning or pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct Mark<const K: usize> {
    pub frame: usize,
    pub time: f64,
    slots: [Option<Peak>; K],
}

impl<const K: usize> Mark<K> {
    pub fn new(frame: usize, time: f64) -> Self {
        Self {
            frame,
            time,
            slots: [None; K],
        }
    }

    /// Insert `peak` ahead of the first slot holding a weaker (or no) peak,
    /// shifting the rest down. The weakest peak falls off the end.
    pub fn insert(&mut self, peak: Peak) {
        let Some(position) = self
            .slots
            .iter()
            .position(|slot| slot.map_or(true, |held| peak.value > held.value))
        else {
            return;
        };

        for j in (position + 1..K).rev() {
            self.slots[j] = self.slots[j - 1];
        }
        self.slots[position] = Some(peak);
    }

    pub fn suppress(&mut self, slot: usize) {
        self.slots[slot] = None;
    }

    pub fn slot(&self, slot: usize) -> Option<Peak> {
        self.slots[slot]
    }

    /// Live peaks in slot order.
    pub fn peaks(&self) -> impl Iterator<Item = Peak> + '_ {
        self.slots.iter().flatten().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

/// Per-bin adaptive threshold in the log domain.
#[derive(Debug, Clone, Default)]
pub struct Threshold {
    levels: Vec<f64>,
    decay: f64,
}

impl Threshold {
    pub fn new(decay: f64) -> Self {
        Self {
            levels: Vec::new(),
            decay,
        }
    }

    pub fn reset(&mut self, spectrum: &[f64]) {
        self.levels.clear();
        self.levels.extend_from_slice(spectrum);
    }

    pub fn levels(&self) -> &[f64] {
        &self.levels
    }

    /// Lower every bin by the fixed log-domain decay.
    pub fn decay(&mut self) {
        let decay = self.decay;
        self.levels.iter_mut().for_each(|level| *level += decay);
    }
}

/// Build the mark for one frame: every bin above its threshold competes for
/// the `K` slots.
pub fn pick_peaks<const K: usize>(
    spectrum: &[f64],
    threshold: &Threshold,
    frame: usize,
    time: f64,
) -> Mark<K> {
    let mut mark = Mark::new(frame, time);

    for (bin, (&value, &level)) in spectrum.iter().zip(threshold.levels()).enumerate() {
        if value > level {
            mark.insert(Peak { bin, value });
        }
    }

    mark
}
