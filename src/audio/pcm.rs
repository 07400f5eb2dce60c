//! PCM sample conversion and batch framing.
//!
//! The transport carries 16-bit signed little-endian PCM at 16 kHz mono;
//! capture hardware delivers interleaved `f32` at whatever rate and channel
//! count it likes. This module holds [`to_transport_format`] (the one-pass
//! downmix + resample bridging the two), the i16 byte conversions, and
//! [`FrameBatcher`], which regroups arbitrary sample slices into the fixed
//! ~100 ms batches the VAD evaluates.

/// Sample rate of everything past the resampler (Hz).
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Samples per VAD/emission batch: 100 ms at 16 kHz.
pub const BATCH_SAMPLES: usize = 1_600;

/// Duration of one batch in milliseconds.
pub const BATCH_MS: u64 = 100;

// ---------------------------------------------------------------------------
// Sample conversion
// ---------------------------------------------------------------------------

/// Convert normalized `f32` samples to 16-bit signed PCM with clamping.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}

/// Pack i16 samples as little-endian bytes for the wire.
pub fn i16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Unpack little-endian bytes into i16 samples. `None` when the length is
/// odd (cannot be raw 16-bit PCM).
pub fn le_bytes_to_i16(bytes: &[u8]) -> Option<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// to_transport_format
// ---------------------------------------------------------------------------

/// Convert one interleaved capture buffer at the device's native format to
/// mono samples at [`TARGET_SAMPLE_RATE`], in a single pass.
///
/// Channels are averaged per frame; rate conversion linearly interpolates
/// between the two nearest source frames (plenty for speech-band VAD and
/// server-side recognition). Output length is
/// `frames * TARGET_SAMPLE_RATE / source_rate`, rounded up, so 100 ms of
/// device audio stays 100 ms — [`BATCH_SAMPLES`] per batch downstream.
///
/// Zero channels, a zero rate or an empty buffer yield an empty vector.
pub fn to_transport_format(samples: &[f32], channels: u16, source_rate: u32) -> Vec<f32> {
    if channels == 0 || source_rate == 0 || samples.is_empty() {
        return Vec::new();
    }
    let width = channels as usize;
    let frames = samples.len() / width;
    if frames == 0 {
        return Vec::new();
    }

    let mono_at = |frame: usize| -> f32 {
        let start = frame * width;
        samples[start..start + width].iter().sum::<f32>() / width as f32
    };

    if source_rate == TARGET_SAMPLE_RATE {
        return (0..frames).map(mono_at).collect();
    }

    let step = source_rate as f64 / TARGET_SAMPLE_RATE as f64;
    let out_len = (frames as f64 / step).ceil() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * step;
        let left = (pos as usize).min(frames - 1);
        let right = (left + 1).min(frames - 1);
        let frac = (pos - left as f64) as f32;
        let a = mono_at(left);
        let b = mono_at(right);
        out.push(a + (b - a) * frac);
    }
    out
}

// ---------------------------------------------------------------------------
// FrameBatcher
// ---------------------------------------------------------------------------

/// Regroups sample slices of any size into fixed-size batches.
///
/// The capture callback pushes small fixed frames; the off-thread fallback
/// pushes whatever chunk sizes the driver produced. Both paths use this
/// batcher, so the batch sequence (and therefore every VAD decision) is
/// identical for identical sample input regardless of slicing.
pub struct FrameBatcher {
    pending: Vec<f32>,
    batch_samples: usize,
}

impl FrameBatcher {
    pub fn new(batch_samples: usize) -> Self {
        Self {
            pending: Vec::with_capacity(batch_samples),
            batch_samples,
        }
    }

    /// Append samples and return every batch completed by them, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let mut batches = Vec::new();
        while self.pending.len() >= self.batch_samples {
            let rest = self.pending.split_off(self.batch_samples);
            batches.push(std::mem::replace(&mut self.pending, rest));
        }
        batches
    }

    /// Drop any partial batch (capture stopped mid-batch).
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Samples waiting for the current batch to fill.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
