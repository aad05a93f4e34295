//! Live-capture cleanup applied to each frame before windowing:
//! peak normalization, an adaptive noise gate and a short median filter.

/// Half-width of the neighborhood used for the local noise estimate.
const LOCAL_WINDOW: usize = 32;
/// Gate floor used while no global noise floor is known.
const DEFAULT_NOISE_FLOOR: f64 = 0.1;
const MEDIAN_WIDTH: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    adaptive_threshold: bool,
    noise_floor: f64,
}

impl Preprocessor {
    pub fn new(adaptive_threshold: bool) -> Self {
        Self {
            adaptive_threshold,
            noise_floor: 0.0,
        }
    }

    pub fn noise_floor(&self) -> f64 {
        self.noise_floor
    }

    pub fn process(&mut self, frame: &[f64]) -> Vec<f64> {
        if self.adaptive_threshold {
            self.noise_floor = global_noise_floor(frame);
        }

        let peak = frame.iter().fold(0.0_f64, |max, s| max.max(s.abs()));
        if peak == 0.0 {
            return frame.to_vec();
        }

        let normalized: Vec<f64> = frame.iter().map(|s| s / peak).collect();
        let floor = if self.noise_floor > 0.0 {
            self.noise_floor
        } else {
            DEFAULT_NOISE_FLOOR
        };

        let gated: Vec<f64> = normalized
            .iter()
            .enumerate()
            .map(|(i, &sample)| {
                let start = i.saturating_sub(LOCAL_WINDOW);
                let end = (i + LOCAL_WINDOW).min(normalized.len());
                let gate = floor.max(local_noise(&normalized[start..end]) * 2.0);
                let strength = sample.abs();

                if strength < gate {
                    0.0
                } else {
                    sample * ((strength - gate) / gate).min(1.0)
                }
            })
            .collect();

        median_filter(&gated, MEDIAN_WIDTH)
    }
}

/// 1.5x the first-quartile absolute amplitude of `window`.
fn local_noise(window: &[f64]) -> f64 {
    let sorted = sorted_amplitudes(window);
    sorted[sorted.len() / 4] * 1.5
}

/// Twice the mean of the quietest quarter of the frame.
fn global_noise_floor(frame: &[f64]) -> f64 {
    let sorted = sorted_amplitudes(frame);
    let quietest = &sorted[..sorted.len() / 4];
    if quietest.is_empty() {
        return 0.0;
    }
    quietest.iter().sum::<f64>() / quietest.len() as f64 * 2.0
}

fn sorted_amplitudes(samples: &[f64]) -> Vec<f64> {
    let mut amplitudes: Vec<f64> = samples.iter().map(|s| s.abs()).collect();
    amplitudes.sort_by(f64::total_cmp);
    amplitudes
}

fn median_filter(signal: &[f64], width: usize) -> Vec<f64> {
    let half = width / 2;
    let mut window = Vec::with_capacity(width);

    (0..signal.len())
        .map(|i| {
            window.clear();
            window.extend_from_slice(&signal[i.saturating_sub(half)..(i + half + 1).min(signal.len())]);
            window.sort_by(f64::total_cmp);
            window[window.len() / 2]
        })
        .collect()
}
