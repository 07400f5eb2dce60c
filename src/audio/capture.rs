//! Microphone capture via `cpal`, with VAD-gated emission.
//!
//! [`AudioCapture`] wraps the cpal host/device/stream lifecycle. On top of
//! it, [`CaptureSession`] runs the full input pipeline and reports three
//! callback events per utterance:
//!
//! | Event                       | Fires                                    |
//! |-----------------------------|------------------------------------------|
//! | [`CaptureEvent::SpeechStart`] | once, on VAD onset                     |
//! | [`CaptureEvent::Batch`]     | per emitted ~100 ms batch (active + hold) |
//! | [`CaptureEvent::Silence`]   | once, when the trailing hold expires     |
//!
//! Two processing paths exist. The primary one runs [`CaptureProcessor`]
//! directly inside the low-latency cpal callback; the fallback drains raw
//! [`AudioChunk`]s over a channel and processes them on a worker thread.
//! Both drive the same processor, so VAD decisions are identical for
//! identical sample input.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc;
use std::thread;
use thiserror::Error;

use crate::audio::pcm::{
    f32_to_i16, i16_to_le_bytes, to_transport_format, FrameBatcher, BATCH_SAMPLES,
};
use crate::audio::vad::{VadConfig, VadGate, VadTransition};

// ---------------------------------------------------------------------------
// AudioChunk
// ---------------------------------------------------------------------------

/// A single buffer of raw audio as delivered by the cpal callback.
///
/// Samples are interleaved `f32` in `[-1.0, 1.0]` at the device's native
/// rate; the processor downmixes and resamples before VAD.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

// ---------------------------------------------------------------------------
// CaptureError
// ---------------------------------------------------------------------------

/// Errors while acquiring or running the input device. All of them surface
/// to the caller of the recording-start operation; none affect the session
/// connection.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no input device found on the default audio host")]
    NoDevice,

    #[error("failed to query default input config: {0}")]
    DefaultConfig(#[from] cpal::DefaultStreamConfigError),

    #[error("failed to build input stream: {0}")]
    BuildStream(#[from] cpal::BuildStreamError),

    #[error("failed to start audio stream: {0}")]
    PlayStream(#[from] cpal::PlayStreamError),

    #[error("failed to spawn capture worker: {0}")]
    Worker(#[from] std::io::Error),

    #[error("capture worker exited during startup")]
    WorkerGone,
}

// ---------------------------------------------------------------------------
// StreamHandle / AudioCapture
// ---------------------------------------------------------------------------

/// RAII guard keeping the cpal stream alive; dropping it stops the
/// underlying hardware stream.
pub struct StreamHandle {
    _stream: cpal::Stream,
}

/// Microphone device wrapper built on `cpal`.
pub struct AudioCapture {
    device: cpal::Device,
    config: cpal::StreamConfig,
    sample_rate: u32,
    channels: u16,
}

impl AudioCapture {
    /// Open the system default input device with its preferred stream
    /// configuration.
    ///
    /// # Errors
    ///
    /// [`CaptureError::NoDevice`] when no input device is available, or
    /// [`CaptureError::DefaultConfig`] when the device cannot report a
    /// default configuration.
    pub fn new() -> Result<Self, CaptureError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(CaptureError::NoDevice)?;

        let supported = device.default_input_config()?;
        let channels = supported.channels();
        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.into();

        Ok(Self {
            device,
            config,
            sample_rate,
            channels,
        })
    }

    /// Primary path: run `process` on every hardware buffer, inside the
    /// low-latency audio callback.
    pub fn start_inline(
        &self,
        mut process: impl FnMut(&[f32]) + Send + 'static,
    ) -> Result<StreamHandle, CaptureError> {
        let stream = self.device.build_input_stream(
            &self.config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| process(data),
            |err: cpal::StreamError| {
                log::error!("capture: stream error: {err}");
            },
            None,
        )?;
        stream.play()?;
        Ok(StreamHandle { _stream: stream })
    }

    /// Fallback path: forward raw [`AudioChunk`]s over a channel for
    /// off-thread processing. Send errors (receiver dropped) are ignored so
    /// the audio thread never panics.
    pub fn start(&self, tx: mpsc::Sender<AudioChunk>) -> Result<StreamHandle, CaptureError> {
        let sample_rate = self.sample_rate;
        let channels = self.channels;

        let stream = self.device.build_input_stream(
            &self.config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let _ = tx.send(AudioChunk {
                    samples: data.to_vec(),
                    sample_rate,
                    channels,
                });
            },
            |err: cpal::StreamError| {
                log::error!("capture: stream error: {err}");
            },
            None,
        )?;
        stream.play()?;
        Ok(StreamHandle { _stream: stream })
    }

    /// Native sample rate of the capture stream in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Interleaved channels per hardware buffer.
    pub fn channels(&self) -> u16 {
        self.channels
    }
}

// ---------------------------------------------------------------------------
// CaptureEvent / CaptureProcessor
// ---------------------------------------------------------------------------

/// Events reported by the capture pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// VAD onset; a new utterance begins.
    SpeechStart,
    /// One emitted batch of 16-bit little-endian PCM at 16 kHz mono.
    Batch { pcm: Vec<u8> },
    /// Trailing hold expired; the utterance is over.
    Silence,
}

pub type CaptureCallback = Box<dyn FnMut(CaptureEvent) + Send>;

/// The per-buffer signal chain: downmix → resample → batch → VAD → events.
///
/// Pure with respect to I/O, so both capture paths (and tests) drive it
/// identically.
pub struct CaptureProcessor {
    sample_rate: u32,
    channels: u16,
    batcher: FrameBatcher,
    gate: VadGate,
    on_event: CaptureCallback,
}

impl CaptureProcessor {
    pub fn new(
        sample_rate: u32,
        channels: u16,
        vad: VadConfig,
        on_event: CaptureCallback,
    ) -> Self {
        Self {
            sample_rate,
            channels,
            batcher: FrameBatcher::new(BATCH_SAMPLES),
            gate: VadGate::new(vad),
            on_event,
        }
    }

    /// Feed one interleaved buffer at the device's native format.
    pub fn process(&mut self, samples: &[f32]) {
        let converted = to_transport_format(samples, self.channels, self.sample_rate);

        for batch in self.batcher.push(&converted) {
            let decision = self.gate.push_batch(&batch);
            if decision.transition == VadTransition::SpeechStart {
                (self.on_event)(CaptureEvent::SpeechStart);
            }
            if decision.emit {
                let pcm = i16_to_le_bytes(&f32_to_i16(&batch));
                (self.on_event)(CaptureEvent::Batch { pcm });
            }
            if decision.transition == VadTransition::SilenceEnd {
                (self.on_event)(CaptureEvent::Silence);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CaptureSession
// ---------------------------------------------------------------------------

/// One recording run: owns the device stream (via a dedicated thread, since
/// `cpal::Stream` cannot cross threads) and the processing pipeline.
///
/// [`stop`](Self::stop) and `Drop` tear everything down idempotently; the
/// stream guard is dropped on the owning thread, releasing the OS device
/// handle on every exit path.
pub struct CaptureSession {
    stop_tx: mpsc::Sender<()>,
    worker: Option<thread::JoinHandle<()>>,
}

impl CaptureSession {
    /// Start capturing with the primary in-callback processing path.
    ///
    /// # Errors
    ///
    /// Device acquisition and stream construction errors surface here;
    /// nothing is left running on failure.
    pub fn start(vad: VadConfig, on_event: CaptureCallback) -> Result<Self, CaptureError> {
        Self::spawn(vad, on_event, false)
    }

    /// Start capturing with the fallback channel-drain processing path.
    /// Functionally identical to [`start`](Self::start); kept for hosts
    /// where work inside the audio callback is unacceptable.
    pub fn start_deferred(vad: VadConfig, on_event: CaptureCallback) -> Result<Self, CaptureError> {
        Self::spawn(vad, on_event, true)
    }

    fn spawn(
        vad: VadConfig,
        on_event: CaptureCallback,
        deferred: bool,
    ) -> Result<Self, CaptureError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), CaptureError>>();

        let worker = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || run_capture(vad, on_event, deferred, stop_rx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!("capture: started ({})", if deferred { "deferred" } else { "inline" });
                Ok(Self {
                    stop_tx,
                    worker: Some(worker),
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(CaptureError::WorkerGone)
            }
        }
    }

    /// Stop capturing and release the device. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.stop_tx.send(());
            let _ = worker.join();
            log::info!("capture: stopped");
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture(
    vad: VadConfig,
    on_event: CaptureCallback,
    deferred: bool,
    stop_rx: mpsc::Receiver<()>,
    ready_tx: mpsc::Sender<Result<(), CaptureError>>,
) {
    let capture = match AudioCapture::new() {
        Ok(capture) => capture,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let mut processor =
        CaptureProcessor::new(capture.sample_rate(), capture.channels(), vad, on_event);

    if deferred {
        let (chunk_tx, chunk_rx) = mpsc::channel::<AudioChunk>();
        let handle = match capture.start(chunk_tx) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));

        // Drain chunks until stopped; the stream guard keeps feeding us.
        loop {
            if stop_rx.try_recv().is_ok() {
                break;
            }
            match chunk_rx.recv_timeout(std::time::Duration::from_millis(50)) {
                Ok(chunk) => processor.process(&chunk.samples),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        drop(handle);
    } else {
        let handle = match capture.start_inline(move |samples| processor.process(samples)) {
            Ok(handle) => handle,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };
        let _ = ready_tx.send(Ok(()));

        // Park until stop; recv also returns when the session is dropped.
        let _ = stop_rx.recv();
        drop(handle);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn vad(required: u32, hold_ms: u64) -> VadConfig {
        VadConfig {
            rms_threshold: 0.1,
            required_speech_chunks: required,
            silence_hold_ms: hold_ms,
        }
    }

    fn recording_processor(
        sample_rate: u32,
        channels: u16,
        config: VadConfig,
    ) -> (CaptureProcessor, Arc<Mutex<Vec<CaptureEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let processor = CaptureProcessor::new(
            sample_rate,
            channels,
            config,
            Box::new(move |event| sink.lock().unwrap().push(event)),
        );
        (processor, events)
    }

    fn loud_16k(batches: usize) -> Vec<f32> {
        vec![0.5; BATCH_SAMPLES * batches]
    }

    fn quiet_16k(batches: usize) -> Vec<f32> {
        vec![0.0; BATCH_SAMPLES * batches]
    }

    #[test]
    fn audio_chunk_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<AudioChunk>();
        assert_send::<CaptureEvent>();
    }

    #[test]
    fn processor_emits_onset_batches_and_silence() {
        let (mut processor, events) = recording_processor(16_000, 1, vad(2, 100));

        processor.process(&loud_16k(3));
        processor.process(&quiet_16k(1));

        let events = events.lock().unwrap();
        assert_eq!(events[0], CaptureEvent::SpeechStart);
        // onset at batch 2, emission for batches 2 and 3
        let batch_count = events
            .iter()
            .filter(|e| matches!(e, CaptureEvent::Batch { .. }))
            .count();
        assert_eq!(batch_count, 2);
        assert_eq!(*events.last().unwrap(), CaptureEvent::Silence);
    }

    #[test]
    fn idle_noise_emits_nothing() {
        let (mut processor, events) = recording_processor(16_000, 1, vad(2, 100));
        processor.process(&quiet_16k(10));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn emitted_batches_are_fixed_size_pcm() {
        let (mut processor, events) = recording_processor(16_000, 1, vad(1, 100));
        processor.process(&loud_16k(2));

        for event in events.lock().unwrap().iter() {
            if let CaptureEvent::Batch { pcm } = event {
                assert_eq!(pcm.len(), BATCH_SAMPLES * 2); // i16 LE
            }
        }
    }

    #[test]
    fn stereo_48k_input_reaches_batches() {
        // 48 kHz stereo buffers: 4800 interleaved frames → 1600 mono @ 16 kHz
        let (mut processor, events) = recording_processor(48_000, 2, vad(1, 100));
        let buffer = vec![0.5_f32; 4_800 * 2];
        processor.process(&buffer);
        processor.process(&buffer);

        let events = events.lock().unwrap();
        assert!(events.contains(&CaptureEvent::SpeechStart));
        assert!(events
            .iter()
            .any(|e| matches!(e, CaptureEvent::Batch { .. })));
    }

    /// The inline path feeds small hardware buffers, the deferred path
    /// whole chunks. Event sequences must match for identical samples.
    #[test]
    fn slicing_equivalence_across_paths() {
        let mut samples = Vec::new();
        samples.extend(loud_16k(4));
        samples.extend(quiet_16k(2));
        samples.extend(loud_16k(2));

        let (mut inline, inline_events) = recording_processor(16_000, 1, vad(2, 100));
        for frame in samples.chunks(512) {
            inline.process(frame);
        }

        let (mut deferred, deferred_events) = recording_processor(16_000, 1, vad(2, 100));
        for chunk in samples.chunks(4_096) {
            deferred.process(chunk);
        }

        assert_eq!(*inline_events.lock().unwrap(), *deferred_events.lock().unwrap());
    }
}
