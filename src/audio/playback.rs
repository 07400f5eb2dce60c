//! Sequential TTS playback with barge-in.
//!
//! Buffers play strictly in enqueue order, one at a time. Each buffer may
//! carry an interaction identity; enqueueing a buffer whose identity differs
//! from the one currently playing clears the queue and stops the in-flight
//! buffer immediately (a new user utterance or server response invalidates
//! stale audio).
//!
//! Decode order: a buffer is treated as raw 16-bit little-endian PCM at
//! 16 kHz mono first (the known streaming format); buffers that cannot be
//! raw PCM (odd length, or a recognizable container header) go through the
//! generic rodio decoder. Undecodable buffers are logged and skipped, the
//! queue continues.
//!
//! Notifications: playback-started fires once per contiguous playing period
//! (not once per buffer); playback-ended fires when the queue drains or on
//! cancel/barge-in, resetting the tracked interaction identity.
//!
//! The rodio output stream is not sendable, so a dedicated worker thread
//! owns it; [`AudioPlayback`] is the thread-safe handle the rest of the
//! widget talks to.

use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rodio::buffer::SamplesBuffer;
use rodio::{Decoder, OutputStream, Sink, Source};
use thiserror::Error;

use crate::audio::pcm::le_bytes_to_i16;

/// Raw-PCM buffers are interpreted at this rate, mono.
const PLAYBACK_SAMPLE_RATE: u32 = 16_000;

/// Poll interval while a buffer is playing.
const PLAYING_POLL: Duration = Duration::from_millis(20);

// ---------------------------------------------------------------------------
// PlaybackError / PlaybackEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("failed to open audio output: {0}")]
    Output(String),

    #[error("buffer not decodable: {0}")]
    Decode(String),

    #[error("failed to spawn playback worker: {0}")]
    Worker(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// A contiguous playing period began.
    Started,
    /// The queue drained or playback was cancelled.
    Ended,
}

pub type PlaybackEventCallback = Box<dyn Fn(PlaybackEvent) + Send>;

// ---------------------------------------------------------------------------
// PlaybackQueue
// ---------------------------------------------------------------------------

/// Outcome of an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// The buffer's interaction identity differed from the playing one:
    /// stale audio was discarded and the in-flight buffer must stop.
    pub interrupted: bool,
}

/// Pure queue + identity + playing-period bookkeeping.
///
/// The worker thread drives it, but all barge-in and notification decisions
/// live here so they are testable without an audio device.
pub struct PlaybackQueue {
    buffers: VecDeque<Vec<u8>>,
    current_interaction: Option<String>,
    playing: bool,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self {
            buffers: VecDeque::new(),
            current_interaction: None,
            playing: false,
        }
    }

    /// Add a buffer. An identity mismatch against the tracked interaction
    /// clears all queued buffers (barge-in); untagged buffers belong to the
    /// current interaction.
    pub fn enqueue(&mut self, interaction_id: Option<String>, bytes: Vec<u8>) -> EnqueueOutcome {
        let interrupted = matches!(
            (&self.current_interaction, &interaction_id),
            (Some(current), Some(new)) if current != new
        );
        if interrupted {
            log::debug!("playback: barge-in, dropping {} stale buffer(s)", self.buffers.len());
            self.buffers.clear();
        }
        if interaction_id.is_some() {
            self.current_interaction = interaction_id;
        }
        self.buffers.push_back(bytes);
        EnqueueOutcome { interrupted }
    }

    pub fn pop_buffer(&mut self) -> Option<Vec<u8>> {
        self.buffers.pop_front()
    }

    /// Mark a buffer as playing. Returns `true` when this begins a new
    /// contiguous playing period (playback-started should fire).
    pub fn note_playing(&mut self) -> bool {
        let started = !self.playing;
        self.playing = true;
        started
    }

    /// Mark playback stopped. Returns `true` when a playing period actually
    /// ended (playback-ended should fire). `reset_identity` clears the
    /// tracked interaction (drain/cancel paths; barge-in keeps the new one).
    pub fn note_idle(&mut self, reset_identity: bool) -> bool {
        if reset_identity {
            self.current_interaction = None;
        }
        let ended = self.playing;
        self.playing = false;
        ended
    }

    /// Drop everything and reset identity. Returns `true` when a playing
    /// period ended.
    pub fn cancel(&mut self) -> bool {
        self.buffers.clear();
        self.note_idle(true)
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn current_interaction(&self) -> Option<&str> {
        self.current_interaction.as_deref()
    }
}

impl Default for PlaybackQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn looks_like_container(bytes: &[u8]) -> bool {
    bytes.starts_with(b"RIFF")
        || bytes.starts_with(b"OggS")
        || bytes.starts_with(b"ID3")
        || bytes.starts_with(b"fLaC")
}

/// Decode one buffer into `(channels, sample_rate, samples)`.
fn decode_buffer(bytes: &[u8]) -> Result<(u16, u32, Vec<i16>), PlaybackError> {
    // raw-PCM interpretation first
    if !looks_like_container(bytes) {
        if let Some(samples) = le_bytes_to_i16(bytes) {
            if !samples.is_empty() {
                return Ok((1, PLAYBACK_SAMPLE_RATE, samples));
            }
        }
    }

    let decoder = Decoder::new(Cursor::new(bytes.to_vec()))
        .map_err(|e| PlaybackError::Decode(e.to_string()))?;
    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let samples: Vec<i16> = decoder.collect();
    if samples.is_empty() {
        return Err(PlaybackError::Decode("decoded to zero samples".into()));
    }
    Ok((channels, sample_rate, samples))
}

/// Normalized RMS of i16 samples, clamped to `[0, 1]`.
fn output_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_sq: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / i16::MAX as f64;
            v * v
        })
        .sum::<f64>()
        / samples.len() as f64;
    (mean_sq.sqrt() as f32).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// AudioPlayback
// ---------------------------------------------------------------------------

enum Command {
    Enqueue {
        interaction_id: Option<String>,
        bytes: Vec<u8>,
    },
    Cancel,
    Shutdown,
}

/// Thread-safe handle to the playback worker.
pub struct AudioPlayback {
    commands: Mutex<mpsc::Sender<Command>>,
    level: Arc<Mutex<f32>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AudioPlayback {
    /// Spawn the worker and open the default audio output.
    ///
    /// # Errors
    ///
    /// [`PlaybackError::Output`] when no output device is available.
    pub fn start(on_event: PlaybackEventCallback) -> Result<Self, PlaybackError> {
        let (command_tx, command_rx) = mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), PlaybackError>>();
        let level = Arc::new(Mutex::new(0.0_f32));

        let level_worker = Arc::clone(&level);
        let worker = thread::Builder::new()
            .name("audio-playback".into())
            .spawn(move || run_worker(command_rx, ready_tx, level_worker, on_event))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: Mutex::new(command_tx),
                level,
                worker: Mutex::new(Some(worker)),
            }),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(PlaybackError::Output("playback worker exited".into()))
            }
        }
    }

    /// Queue one buffer, tagged with the interaction it belongs to.
    pub fn enqueue(&self, interaction_id: Option<String>, bytes: Vec<u8>) {
        let _ = self.commands.lock().unwrap().send(Command::Enqueue {
            interaction_id,
            bytes,
        });
    }

    /// Stop the active buffer, empty the queue, reset the interaction
    /// identity. Fires playback-ended when anything was playing. Safe to
    /// call in any state.
    pub fn cancel(&self) {
        let _ = self.commands.lock().unwrap().send(Command::Cancel);
    }

    /// Current output energy in `[0, 1]`; zero when nothing is playing.
    pub fn level(&self) -> f32 {
        *self.level.lock().unwrap()
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        let _ = self.commands.lock().unwrap().send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(
    commands: mpsc::Receiver<Command>,
    ready_tx: mpsc::Sender<Result<(), PlaybackError>>,
    level: Arc<Mutex<f32>>,
    on_event: PlaybackEventCallback,
) {
    // The stream must outlive every sink; both stay on this thread.
    let (_stream, stream_handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(PlaybackError::Output(e.to_string())));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut queue = PlaybackQueue::new();
    let mut active: Option<Sink> = None;

    loop {
        let idle = active.is_none() && queue.is_empty();
        let command = if idle {
            match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        } else {
            match commands.recv_timeout(PLAYING_POLL) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        };

        match command {
            Some(Command::Enqueue {
                interaction_id,
                bytes,
            }) => {
                let outcome = queue.enqueue(interaction_id, bytes);
                if outcome.interrupted {
                    if let Some(sink) = active.take() {
                        sink.stop();
                    }
                    *level.lock().unwrap() = 0.0;
                    if queue.note_idle(false) {
                        on_event(PlaybackEvent::Ended);
                    }
                }
            }
            Some(Command::Cancel) => {
                if let Some(sink) = active.take() {
                    sink.stop();
                }
                *level.lock().unwrap() = 0.0;
                if queue.cancel() {
                    on_event(PlaybackEvent::Ended);
                }
            }
            Some(Command::Shutdown) => break,
            None => {}
        }

        // Advance: start the next buffer when the current one finished.
        let finished = active.as_ref().map(|s| s.empty()).unwrap_or(true);
        if !finished {
            continue;
        }
        active = None;

        advance_queue(&mut queue, &level, &on_event, |channels, sample_rate, samples| {
            let sink = match Sink::try_new(&stream_handle) {
                Ok(sink) => sink,
                Err(e) => {
                    log::error!("playback: cannot create sink: {e}");
                    return false;
                }
            };
            sink.append(SamplesBuffer::new(channels, sample_rate, samples));
            active = Some(sink);
            true
        });
    }

    if let Some(sink) = active.take() {
        sink.stop();
    }
    *level.lock().unwrap() = 0.0;
    if queue.note_idle(true) {
        on_event(PlaybackEvent::Ended);
    }
}

/// Pop buffers until one decodes and is handed off for playback, or the
/// queue drains. Undecodable buffers are logged and skipped without
/// stopping the advance, so a bad tail buffer cannot leave the level and
/// the playing-period state stuck. `play` returns `false` when the sink
/// could not be created; the buffer is consumed either way.
fn advance_queue(
    queue: &mut PlaybackQueue,
    level: &Mutex<f32>,
    on_event: &PlaybackEventCallback,
    mut play: impl FnMut(u16, u32, Vec<i16>) -> bool,
) {
    loop {
        match queue.pop_buffer() {
            Some(bytes) => match decode_buffer(&bytes) {
                Ok((channels, sample_rate, samples)) => {
                    let buffer_level = output_level(&samples);
                    if play(channels, sample_rate, samples) {
                        *level.lock().unwrap() = buffer_level;
                        if queue.note_playing() {
                            on_event(PlaybackEvent::Started);
                        }
                        return;
                    }
                }
                Err(e) => {
                    log::warn!("playback: dropping undecodable buffer: {e}");
                }
            },
            None => {
                *level.lock().unwrap() = 0.0;
                if queue.note_idle(true) {
                    on_event(PlaybackEvent::Ended);
                }
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::i16_to_le_bytes;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        i16_to_le_bytes(samples)
    }

    // ---- Queue / barge-in ---------------------------------------------------

    #[test]
    fn buffers_play_in_enqueue_order() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(Some("a".into()), vec![1]);
        queue.enqueue(Some("a".into()), vec![2]);
        queue.enqueue(None, vec![3]);

        assert_eq!(queue.pop_buffer(), Some(vec![1]));
        assert_eq!(queue.pop_buffer(), Some(vec![2]));
        assert_eq!(queue.pop_buffer(), Some(vec![3]));
        assert_eq!(queue.pop_buffer(), None);
    }

    #[test]
    fn same_interaction_never_interrupts() {
        let mut queue = PlaybackQueue::new();
        assert!(!queue.enqueue(Some("a".into()), vec![1]).interrupted);
        assert!(!queue.enqueue(Some("a".into()), vec![2]).interrupted);
        assert!(!queue.enqueue(None, vec![3]).interrupted);
        assert_eq!(queue.current_interaction(), Some("a"));
    }

    #[test]
    fn differing_interaction_clears_queue_and_adopts_new_identity() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(Some("a".into()), vec![1]);
        queue.enqueue(Some("a".into()), vec![2]);

        let outcome = queue.enqueue(Some("b".into()), vec![9]);
        assert!(outcome.interrupted);
        assert_eq!(queue.current_interaction(), Some("b"));
        // only the new buffer survives
        assert_eq!(queue.pop_buffer(), Some(vec![9]));
        assert_eq!(queue.pop_buffer(), None);
    }

    #[test]
    fn untagged_buffer_onto_empty_queue_sets_no_identity() {
        let mut queue = PlaybackQueue::new();
        assert!(!queue.enqueue(None, vec![1]).interrupted);
        assert_eq!(queue.current_interaction(), None);
        // a tagged buffer later adopts its identity without interrupting
        assert!(!queue.enqueue(Some("x".into()), vec![2]).interrupted);
        assert_eq!(queue.current_interaction(), Some("x"));
    }

    /// The full barge-in notification contract: exactly one ended, then a
    /// fresh started when the new interaction's buffer plays.
    #[test]
    fn barge_in_fires_one_ended_then_fresh_started() {
        let mut queue = PlaybackQueue::new();

        queue.enqueue(Some("a".into()), vec![1]);
        queue.pop_buffer();
        assert!(queue.note_playing()); // Started for A

        let outcome = queue.enqueue(Some("b".into()), vec![2]);
        assert!(outcome.interrupted);
        assert!(queue.note_idle(false)); // exactly one Ended
        assert!(!queue.note_idle(false)); // not a second one

        queue.pop_buffer();
        assert!(queue.note_playing()); // fresh Started for B
        assert_eq!(queue.current_interaction(), Some("b"));
    }

    #[test]
    fn started_fires_once_per_contiguous_period() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(Some("a".into()), vec![1]);
        queue.enqueue(Some("a".into()), vec![2]);

        queue.pop_buffer();
        assert!(queue.note_playing());
        // second buffer of the same period: no new Started
        queue.pop_buffer();
        assert!(!queue.note_playing());

        // drained
        assert!(queue.note_idle(true));
        assert_eq!(queue.current_interaction(), None);
    }

    #[test]
    fn cancel_resets_everything_and_reports_ended_once() {
        let mut queue = PlaybackQueue::new();
        queue.enqueue(Some("a".into()), vec![1]);
        queue.pop_buffer();
        queue.note_playing();

        assert!(queue.cancel());
        assert!(queue.is_empty());
        assert_eq!(queue.current_interaction(), None);
        // cancel while idle is a no-op
        assert!(!queue.cancel());
    }

    // ---- Decode -------------------------------------------------------------

    #[test]
    fn even_length_bytes_decode_as_raw_pcm() {
        let samples = vec![0i16, 1000, -1000, i16::MAX];
        let (channels, rate, decoded) = decode_buffer(&pcm(&samples)).expect("decode");
        assert_eq!(channels, 1);
        assert_eq!(rate, PLAYBACK_SAMPLE_RATE);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn odd_length_garbage_fails_both_paths() {
        assert!(decode_buffer(&[1, 2, 3]).is_err());
    }

    #[test]
    fn empty_buffer_is_undecodable() {
        assert!(decode_buffer(&[]).is_err());
    }

    #[test]
    fn riff_header_routes_to_generic_decoder() {
        // A valid RIFF/WAVE file: 16-bit mono 16 kHz, four samples.
        let samples = [100i16, -100, 200, -200];
        let data_len = (samples.len() * 2) as u32;
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_len).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&1u16.to_le_bytes()); // mono
        wav.extend_from_slice(&16_000u32.to_le_bytes());
        wav.extend_from_slice(&32_000u32.to_le_bytes()); // byte rate
        wav.extend_from_slice(&2u16.to_le_bytes()); // block align
        wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            wav.extend_from_slice(&s.to_le_bytes());
        }

        let (channels, rate, decoded) = decode_buffer(&wav).expect("decode wav");
        assert_eq!(channels, 1);
        assert_eq!(rate, 16_000);
        assert_eq!(decoded.len(), samples.len());
    }

    // ---- Queue advancing ----------------------------------------------------

    fn event_recorder() -> (PlaybackEventCallback, Arc<Mutex<Vec<PlaybackEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let callback: PlaybackEventCallback =
            Box::new(move |event| sink.lock().unwrap().push(event));
        (callback, events)
    }

    /// An undecodable buffer at the tail of the queue must not stall the
    /// drain: the queue still empties, the level drops to zero and exactly
    /// one ended notification fires.
    #[test]
    fn undecodable_tail_buffer_still_drains_and_fires_ended() {
        let (on_event, events) = event_recorder();
        let level = Mutex::new(0.0_f32);
        let mut queue = PlaybackQueue::new();
        queue.enqueue(Some("a".into()), pcm(&[500; 160]));
        queue.enqueue(Some("a".into()), vec![1, 2, 3]); // cannot decode

        let mut played = 0;
        advance_queue(&mut queue, &level, &on_event, |_, _, _| {
            played += 1;
            true
        });
        assert_eq!(played, 1);
        assert!(*level.lock().unwrap() > 0.0);

        // first buffer finished; the garbage buffer is skipped straight
        // through to the drained state
        advance_queue(&mut queue, &level, &on_event, |_, _, _| {
            played += 1;
            true
        });
        assert_eq!(played, 1);
        assert!(queue.is_empty());
        assert_eq!(queue.current_interaction(), None);
        assert_eq!(*level.lock().unwrap(), 0.0);
        assert_eq!(
            *events.lock().unwrap(),
            vec![PlaybackEvent::Started, PlaybackEvent::Ended]
        );
    }

    #[test]
    fn advance_skips_past_garbage_to_the_next_playable_buffer() {
        let (on_event, events) = event_recorder();
        let level = Mutex::new(0.0_f32);
        let mut queue = PlaybackQueue::new();
        queue.enqueue(Some("a".into()), vec![9]); // cannot decode
        queue.enqueue(Some("a".into()), pcm(&[1000; 160]));

        let mut played = Vec::new();
        advance_queue(&mut queue, &level, &on_event, |_, _, samples| {
            played.push(samples.len());
            true
        });

        assert_eq!(played, vec![160]);
        assert!(*level.lock().unwrap() > 0.0);
        assert_eq!(*events.lock().unwrap(), vec![PlaybackEvent::Started]);
    }

    #[test]
    fn advance_on_empty_queue_while_idle_stays_silent() {
        let (on_event, events) = event_recorder();
        let level = Mutex::new(0.0_f32);
        let mut queue = PlaybackQueue::new();

        advance_queue(&mut queue, &level, &on_event, |_, _, _| true);

        // never playing, so no spurious ended notification
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(*level.lock().unwrap(), 0.0);
    }

    // ---- Level --------------------------------------------------------------

    #[test]
    fn level_is_zero_for_silence_and_bounded_for_signal() {
        assert_eq!(output_level(&[]), 0.0);
        assert_eq!(output_level(&[0, 0, 0]), 0.0);

        let loud = output_level(&[i16::MAX; 64]);
        assert!(loud > 0.99 && loud <= 1.0);

        let half = output_level(&[i16::MAX / 2; 64]);
        assert!(half > 0.45 && half < 0.55);
    }
}
