//! Audio capture, VAD gating, PCM framing and playback.
//!
//! # Pipeline
//!
//! ```text
//! microphone (cpal)                                         speakers (rodio)
//!      │                                                           ▲
//!      ▼                                                           │
//! ┌──────────┐   f32 chunks   ┌───────────┐   16 kHz mono    ┌───────────┐
//! │ capture  │───────────────▶│ pcm:      │─────────────────▶│ playback  │
//! │ (device) │   (mpsc)       │ transport │    ┌─────────┐   │ queue     │
//! └──────────┘                │ format    │    │ batcher │   └───────────┘
//!                             └───────────┘    └────┬────┘         ▲
//!                                                   ▼              │
//!                                          ┌─────────────┐  TTS chunks from
//!                                          │  VadGate    │  the session client
//!                                          │ onset/hold/ │
//!                                          │ silence     │
//!                                          └─────────────┘
//! ```
//!
//! Capture emits ~100 ms batches of 16-bit PCM only while speech is active
//! (or in the trailing hold); playback drains a strictly sequential queue
//! with barge-in keyed by interaction identity.

pub mod capture;
pub mod pcm;
pub mod playback;
pub mod vad;

// ── Public re-exports ──────────────────────────────────────────────────────

pub use capture::{
    AudioCapture, AudioChunk, CaptureCallback, CaptureError, CaptureEvent, CaptureProcessor,
    CaptureSession, StreamHandle,
};
pub use pcm::{
    f32_to_i16, i16_to_le_bytes, le_bytes_to_i16, to_transport_format, FrameBatcher,
    BATCH_SAMPLES, TARGET_SAMPLE_RATE,
};
pub use playback::{
    AudioPlayback, EnqueueOutcome, PlaybackError, PlaybackEvent, PlaybackEventCallback,
    PlaybackQueue,
};
pub use vad::{BatchDecision, VadConfig, VadGate, VadTransition};
