//! Container decoding into the PCM format the fingerprinter consumes:
//! mono, 22050 Hz, signed 16-bit little-endian.

use std::io::Cursor;

use rayon::{iter::ParallelIterator, slice::ParallelSlice};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use thiserror::Error;

use crate::fingerprint::{BYTES_PER_SAMPLE, SAMPLE_RATE};

const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported or unrecognised audio format: {0}")]
    UnsupportedFormat(#[source] SymphoniaError),

    #[error("no decodable audio track")]
    NoTrack,

    #[error("audio track does not declare {0}")]
    MissingParameter(&'static str),

    #[error("failed to create decoder: {0}")]
    Codec(#[source] SymphoniaError),

    #[error("decoding failed: {0}")]
    Corrupt(#[source] SymphoniaError),

    #[error("resampling failed: {0}")]
    Resample(String),
}

/// Decode `bytes` to fingerprinter-ready PCM.
pub fn ingest(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let (samples, rate, channels) = decode_audio(bytes)?;
    let mono = to_mono(&samples, channels);
    let resampled = resample(&mono, rate, SAMPLE_RATE)?;

    Ok(to_pcm16(&resampled))
}

fn to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        pcm.extend_from_slice(&value.to_le_bytes());
    }
    pcm
}

fn resample(input: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>, DecodeError> {
    if input_rate == output_rate || input.is_empty() {
        return Ok(input.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        oversampling_factor: 64,
        interpolation: SincInterpolationType::Linear,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        2.0,
        params,
        RESAMPLE_CHUNK,
        1,
    )
    .map_err(|e| DecodeError::Resample(e.to_string()))?;

    let expected = (input.len() as f64 * output_rate as f64 / input_rate as f64).round() as usize;
    let delay = resampler.output_delay();

    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);
    let mut position = 0;

    while position + RESAMPLE_CHUNK <= input.len() {
        let chunk = [&input[position..position + RESAMPLE_CHUNK]];
        let result = resampler
            .process(&chunk, None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;

        output.extend_from_slice(&result[0]);
        position += RESAMPLE_CHUNK;
    }

    // Pad the tail, then keep feeding silence until the filter delay is flushed.
    let mut padded = vec![0.0; RESAMPLE_CHUNK];
    let remaining = input.len() - position;
    padded[..remaining].copy_from_slice(&input[position..]);

    while output.len() < expected + delay {
        let result = resampler
            .process(&[&padded[..]], None)
            .map_err(|e| DecodeError::Resample(e.to_string()))?;
        output.extend_from_slice(&result[0]);
        padded.fill(0.0);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected);

    Ok(output)
}

fn to_mono(input: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return input.to_vec();
    }

    input
        .par_chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn decode_audio(bytes: &[u8]) -> Result<(Vec<f32>, u32, usize), DecodeError> {
    let cursor = Cursor::new(bytes.to_vec());
    let media_source_stream = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut format = get_format(media_source_stream)?;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or(DecodeError::NoTrack)?;

    let mut decoder = get_decoder(&track.codec_params)?;

    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut channels = track.codec_params.channels.map(|c| c.count());
    let mut samples = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(DecodeError::Corrupt(e)),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // a damaged packet is skipped, the stream carries on
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(DecodeError::Corrupt(e)),
        };

        let spec = *decoded.spec();
        sample_rate.get_or_insert(spec.rate);
        channels.get_or_insert(spec.channels.count());

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    let sample_rate = sample_rate.ok_or(DecodeError::MissingParameter("a sample rate"))?;
    let channels = channels.ok_or(DecodeError::MissingParameter("a channel layout"))?;

    Ok((samples, sample_rate, channels))
}

fn get_format(media_source_stream: MediaSourceStream) -> Result<Box<dyn FormatReader>, DecodeError> {
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            media_source_stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(DecodeError::UnsupportedFormat)?;

    Ok(probed.format)
}

fn get_decoder(params: &symphonia::core::codecs::CodecParameters) -> Result<Box<dyn Decoder>, DecodeError> {
    symphonia::default::get_codecs()
        .make(params, &DecoderOptions::default())
        .map_err(DecodeError::Codec)
}
