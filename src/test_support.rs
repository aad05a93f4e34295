//! Deterministic signal fixtures shared by unit tests.

use std::io::Cursor;

use crate::fingerprint::SAMPLE_RATE;

/// Seeded white noise at half scale, as s16le PCM.
pub fn white_noise(seconds: f64, seed: u64) -> Vec<u8> {
    let mut state = seed;
    samples_to_pcm((0..sample_count(seconds)).map(|_| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 33) as f64 / (1u64 << 31) as f64 * 2.0 - 1.0
    }), 0.5)
}

pub fn sine(seconds: f64, freq: f64, amplitude: f64) -> Vec<u8> {
    let step = 2.0 * std::f64::consts::PI * freq / SAMPLE_RATE as f64;
    samples_to_pcm((0..sample_count(seconds)).map(|i| (step * i as f64).sin()), amplitude)
}

/// Consecutive tones of `seconds_each`, given as `(frequency, amplitude)`.
/// Phase runs on across note changes.
pub fn tone_steps(notes: &[(f64, f64)], seconds_each: f64) -> Vec<u8> {
    let per_note = sample_count(seconds_each);
    notes
        .iter()
        .enumerate()
        .flat_map(|(n, &(freq, amplitude))| {
            let step = 2.0 * std::f64::consts::PI * freq / SAMPLE_RATE as f64;
            samples_to_pcm(
                (n * per_note..(n + 1) * per_note).map(move |i| (step * i as f64).sin()),
                amplitude,
            )
        })
        .collect()
}

pub fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &sample in samples {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

pub fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

fn sample_count(seconds: f64) -> usize {
    (SAMPLE_RATE as f64 * seconds) as usize
}

fn samples_to_pcm(samples: impl Iterator<Item = f64>, amplitude: f64) -> Vec<u8> {
    samples
        .flat_map(|s| ((amplitude * s * 32767.0) as i16).to_le_bytes())
        .collect()
}
