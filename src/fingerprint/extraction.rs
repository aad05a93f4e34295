//! Spectral extraction helpers.
//!
//! Windows one frame of PCM samples and turns it into the log-magnitude
//! spectrum consumed by the peak picker.

use std::f64::consts::PI;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

/// Floor added to every magnitude so silent bins never hit `ln(0)`.
const MAGNITUDE_FLOOR: f64 = 1e-6;

/// Reusable FFT plan, Hann window and scratch buffer for one frame size.
pub struct SpectralFrameProcessor {
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    buffer: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectralFrameProcessor {
    pub fn new(frame_size: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(frame_size);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];

        Self {
            fft,
            window: hann_window(frame_size),
            buffer: vec![Complex::default(); frame_size],
            scratch,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.window.len()
    }

    /// Compute `ln(1e-6 + |X[k]|)` for the first `n/2` bins of the windowed frame.
    ///
    /// `samples` must hold exactly one frame.
    pub fn process(&mut self, samples: &[f64]) -> Vec<f64> {
        let n = self.frame_size();
        debug_assert_eq!(samples.len(), n);

        for ((slot, &sample), &w) in self.buffer.iter_mut().zip(samples).zip(&self.window) {
            *slot = Complex { re: sample * w, im: 0.0 };
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        self.buffer[..n / 2]
            .iter()
            .map(|c| (MAGNITUDE_FLOOR + (c.re * c.re + c.im * c.im).sqrt()).ln())
            .collect()
    }
}

fn hann_window(size: usize) -> Vec<f64> {
    let n = size as f64;
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1.0)).cos()))
        .collect()
}
