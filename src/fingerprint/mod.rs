//! Fingerprint pipeline glue.
//!
//! Wires framing, spectral analysis, peak picking, pruning and hashing into a
//! streaming transform over 16-bit little-endian mono PCM at 22050 Hz.

use std::collections::VecDeque;

use futures::{future, stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::fingerprint::{
    extraction::SpectralFrameProcessor,
    hashing::LandmarkWindow,
    peaks::{pick_peaks, Mark, Threshold},
    preprocess::Preprocessor,
};

pub mod decode;
pub mod extraction;
pub mod hashing;
pub mod peaks;
pub mod preprocess;

pub use hashing::{landmark_parts, Fingerprint};

pub const SAMPLE_RATE: u32 = 22_050;
pub const BYTES_PER_SAMPLE: usize = 2;
pub const FRAME_SIZE: usize = 512;
pub const HOP_SIZE: usize = FRAME_SIZE / 2;
/// Spectrum length, also the radix of landmark hashes.
pub const BINS: usize = FRAME_SIZE / 2;
pub const PEAKS_PER_FRAME: usize = 5;

const PAIRS_PER_PEAK: usize = 3;
const WINDOW_DF: usize = 60;
const WINDOW_DT: usize = 96;
/// Frames that must follow a frame before it is finalized.
const PRUNING_DT: usize = 24;
const THRESHOLD_DECAY: f64 = 0.995;

const FRAME_BYTES: usize = FRAME_SIZE * BYTES_PER_SAMPLE;
const HOP_BYTES: usize = HOP_SIZE * BYTES_PER_SAMPLE;

const LANDMARK_WINDOW: LandmarkWindow = LandmarkWindow {
    bins: BINS,
    df: WINDOW_DF,
    dt: WINDOW_DT,
    pairs_per_peak: PAIRS_PER_PEAK,
};

/// Where the audio came from. Live captures are cleaned up before analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    File,
    Live,
}

impl Mode {
    pub fn from_live_flag(live: bool) -> Self {
        if live {
            Mode::Live
        } else {
            Mode::File
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FingerprintOptions {
    pub preprocess: bool,
    pub adaptive_threshold: bool,
}

impl From<Mode> for FingerprintOptions {
    fn from(mode: Mode) -> Self {
        let live = mode == Mode::Live;
        Self {
            preprocess: live,
            adaptive_threshold: live,
        }
    }
}

/// Landmarks produced when one frame is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintBatch {
    pub frame: usize,
    pub fingerprints: Vec<Fingerprint>,
}

/// Streaming fingerprinter for a single PCM stream.
///
/// Bytes must be pushed in stream order. Trailing bytes short of a full
/// frame stay buffered and are never analysed on their own.
pub struct Fingerprinter {
    buffer: Vec<u8>,
    cursor: usize,
    frame_index: usize,
    marks: VecDeque<Mark<PEAKS_PER_FRAME>>,
    threshold: Threshold,
    spectral: SpectralFrameProcessor,
    preprocessor: Option<Preprocessor>,
    samples: Vec<f64>,
}

impl Fingerprinter {
    pub fn new(mode: Mode) -> Self {
        Self::with_options(mode.into())
    }

    pub fn with_options(options: FingerprintOptions) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: 0,
            frame_index: 0,
            marks: VecDeque::with_capacity(WINDOW_DT + PRUNING_DT + 1),
            threshold: Threshold::new(THRESHOLD_DECAY.ln()),
            spectral: SpectralFrameProcessor::new(FRAME_SIZE),
            preprocessor: options
                .preprocess
                .then(|| Preprocessor::new(options.adaptive_threshold)),
            samples: Vec::with_capacity(FRAME_SIZE),
        }
    }

    /// Append `chunk` and analyse every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FingerprintBatch> {
        self.buffer.extend_from_slice(chunk);

        let mut batches = Vec::new();
        while self.buffer.len() - self.cursor >= FRAME_BYTES {
            if let Some(batch) = self.process_frame() {
                batches.push(batch);
            }
            self.cursor += HOP_BYTES;
            self.frame_index += 1;
        }

        self.buffer.drain(..self.cursor);
        self.cursor = 0;

        batches
    }

    pub fn frames_processed(&self) -> usize {
        self.frame_index
    }

    /// Bytes waiting for the next frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len() - self.cursor
    }

    fn process_frame(&mut self) -> Option<FingerprintBatch> {
        let bytes = &self.buffer[self.cursor..self.cursor + FRAME_BYTES];
        self.samples.clear();
        self.samples.extend(
            bytes
                .chunks_exact(BYTES_PER_SAMPLE)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f64 / 32768.0),
        );

        let spectrum = match self.preprocessor.as_mut() {
            Some(preprocessor) => {
                let cleaned = preprocessor.process(&self.samples);
                self.spectral.process(&cleaned)
            }
            None => self.spectral.process(&self.samples),
        };

        if self.marks.is_empty() {
            self.threshold.reset(&spectrum);
        }

        let time = (self.frame_index * HOP_SIZE) as f64 / SAMPLE_RATE as f64;
        self.marks
            .push_back(pick_peaks(&spectrum, &self.threshold, self.frame_index, time));

        let mut batch = None;
        if let Some(t0) = self.marks.len().checked_sub(PRUNING_DT + 1) {
            hashing::prune(&mut self.marks, t0, WINDOW_DF);

            let fingerprints = hashing::emit(&self.marks, t0, &LANDMARK_WINDOW);
            if !fingerprints.is_empty() {
                batch = Some(FingerprintBatch {
                    frame: self.marks[t0].frame,
                    fingerprints,
                });
            }

            let expired = (t0 + 1).saturating_sub(WINDOW_DT);
            self.marks.drain(..expired);
        }

        self.threshold.decay();

        batch
    }
}

/// Fingerprint a complete PCM buffer in one go.
pub fn fingerprint_pcm(pcm: &[u8], mode: Mode) -> Vec<FingerprintBatch> {
    Fingerprinter::new(mode).push(pcm)
}

/// Decode an audio file and fingerprint it.
pub fn fingerprint_audio(audio: &[u8], mode: Mode) -> Result<Vec<Fingerprint>, decode::DecodeError> {
    let pcm = decode::ingest(audio)?;
    Ok(flatten(fingerprint_pcm(&pcm, mode)))
}

pub fn flatten(batches: Vec<FingerprintBatch>) -> Vec<Fingerprint> {
    batches.into_iter().flat_map(|batch| batch.fingerprints).collect()
}

/// Lazily fingerprint a stream of PCM chunks, one batch per finalized frame.
pub fn fingerprint_stream<S>(chunks: S, mode: Mode) -> impl Stream<Item = FingerprintBatch>
where
    S: Stream,
    S::Item: AsRef<[u8]>,
{
    chunks
        .scan(Fingerprinter::new(mode), |fingerprinter, chunk| {
            future::ready(Some(stream::iter(fingerprinter.push(chunk.as_ref()))))
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sine, tone_steps, white_noise};

    fn hashes(batches: &[FingerprintBatch]) -> Vec<u32> {
        batches
            .iter()
            .flat_map(|b| b.fingerprints.iter().map(|f| f.hash))
            .collect()
    }

    #[test]
    fn empty_and_short_input_produce_nothing() {
        let mut fingerprinter = Fingerprinter::new(Mode::File);
        assert!(fingerprinter.push(&[]).is_empty());
        assert!(fingerprinter.push(&vec![0x11; FRAME_BYTES - 1]).is_empty());

        assert_eq!(fingerprinter.frames_processed(), 0);
        assert_eq!(fingerprinter.buffered(), FRAME_BYTES - 1);
    }

    #[test]
    fn frames_advance_by_one_hop() {
        let mut fingerprinter = Fingerprinter::new(Mode::File);
        fingerprinter.push(&vec![0; FRAME_BYTES - 1]);
        fingerprinter.push(&[0]);
        assert_eq!(fingerprinter.frames_processed(), 1);
        assert_eq!(fingerprinter.buffered(), FRAME_BYTES - HOP_BYTES);

        fingerprinter.push(&vec![0; HOP_BYTES * 3 + 1]);
        assert_eq!(fingerprinter.frames_processed(), 4);
        assert_eq!(fingerprinter.buffered(), FRAME_BYTES - HOP_BYTES + 1);
    }

    #[test]
    fn identical_input_gives_identical_fingerprints() {
        let pcm = white_noise(3.0, 7);

        let first = fingerprint_pcm(&pcm, Mode::File);
        let second = fingerprint_pcm(&pcm, Mode::File);

        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn chunk_boundaries_do_not_change_the_output() {
        let pcm = white_noise(3.0, 11);
        let whole = fingerprint_pcm(&pcm, Mode::File);

        let mut fingerprinter = Fingerprinter::new(Mode::File);
        let pieces: Vec<FingerprintBatch> = pcm
            .chunks(777)
            .flat_map(|chunk| fingerprinter.push(chunk))
            .collect();

        assert_eq!(whole, pieces);
    }

    #[test]
    fn batches_are_anchored_at_their_frame_time() {
        let batches = fingerprint_pcm(&white_noise(3.0, 3), Mode::File);

        assert!(batches.windows(2).all(|w| w[0].frame < w[1].frame));
        for batch in &batches {
            let expected = (batch.frame * HOP_SIZE) as f64 / SAMPLE_RATE as f64;
            assert!(!batch.fingerprints.is_empty());
            assert!(batch.fingerprints.iter().all(|f| f.time == expected));
        }
    }

    #[test]
    fn hashes_stay_inside_the_landmark_window() {
        let batches = fingerprint_pcm(&white_noise(4.0, 5), Mode::File);

        for hash in hashes(&batches) {
            let (f1, f2, dt) = landmark_parts(hash, BINS);
            assert_ne!(f1, f2);
            assert!(f1.abs_diff(f2) < WINDOW_DF);
            assert!(dt <= WINDOW_DT);
        }
    }

    #[test]
    fn steady_tone_leaves_nothing_to_pair() {
        // one bin wins every frame, and a landmark needs two distinct bins
        for freq in [440.0, 1000.0, 3000.0] {
            assert!(fingerprint_pcm(&sine(2.0, freq, 0.5), Mode::File).is_empty());
        }
    }

    #[test]
    fn fading_tone_steps_pair_within_their_bins() {
        // 1000 Hz sits at bin 23.2, 1400 Hz at bin 32.5
        let pcm = tone_steps(&[(1000.0, 0.6), (1400.0, 0.3)], 1.0);

        let first = fingerprint_pcm(&pcm, Mode::File);
        assert!(!first.is_empty());
        assert_eq!(first, fingerprint_pcm(&pcm, Mode::File));

        let near_a_tone = |bin: usize| (22..=25).contains(&bin) || (31..=35).contains(&bin);
        for hash in hashes(&first) {
            let (f1, f2, _) = landmark_parts(hash, BINS);
            assert!(near_a_tone(f1) && near_a_tone(f2), "bins {f1}, {f2}");
        }
    }

    #[test]
    fn live_mode_changes_the_hash_sequence() {
        let pcm = white_noise(3.0, 7);

        let file = hashes(&fingerprint_pcm(&pcm, Mode::File));
        let live = hashes(&fingerprint_pcm(&pcm, Mode::Live));

        assert!(!live.is_empty());
        assert_ne!(file, live);
    }

    #[test]
    fn silence_is_handled_in_both_modes() {
        let pcm = vec![0; 2 * SAMPLE_RATE as usize];

        let file = fingerprint_pcm(&pcm, Mode::File);
        let live = fingerprint_pcm(&pcm, Mode::Live);

        // the gate leaves an all-zero frame alone, so both paths agree
        assert_eq!(file, live);
    }

    #[tokio::test]
    async fn stream_adapter_matches_push() {
        let pcm = white_noise(2.0, 9);
        let expected = fingerprint_pcm(&pcm, Mode::Live);

        let chunks = stream::iter(pcm.chunks(4096).map(<[u8]>::to_vec).collect::<Vec<_>>());
        let streamed: Vec<FingerprintBatch> = fingerprint_stream(chunks, Mode::Live).collect().await;

        assert_eq!(expected, streamed);
    }

    #[test]
    fn mode_options() {
        assert_eq!(
            FingerprintOptions::from(Mode::Live),
            FingerprintOptions {
                preprocess: true,
                adaptive_threshold: true
            }
        );
        assert_eq!(FingerprintOptions::from(Mode::File), FingerprintOptions::default());
        assert_eq!(Mode::from_live_flag(true), Mode::Live);
    }
}
