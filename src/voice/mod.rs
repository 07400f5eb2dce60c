//! Voice mediation between capture, playback and the session.
//!
//! [`VoiceCoordinator`] owns no transport and no audio device directly: it
//! wires [`CaptureSession`] events onto a [`FrameTransport`] and translates
//! UI intent (start/stop recording, TTS on/off) into audio operations.
//!
//! | Capture event | Coordinator action                                      |
//! |---------------|---------------------------------------------------------|
//! | speech onset  | new interaction id, cancel in-flight playback (barge-in) |
//! | batch         | forward as outbound binary frame                        |
//! | silence       | send `input.audio_end` for the active interaction       |

use std::sync::{Arc, Mutex};

use crate::audio::capture::{CaptureCallback, CaptureEvent, CaptureSession};
use crate::audio::playback::{AudioPlayback, PlaybackError, PlaybackEvent};
use crate::audio::vad::VadConfig;
use crate::protocol::client::{PlaybackSink, SendError, SessionClient};
use crate::store::ConversationStore;

// ---------------------------------------------------------------------------
// Trait seams
// ---------------------------------------------------------------------------

/// Outbound surface the coordinator uses; the session client implements it.
/// A seam rather than a concrete dependency so voice flow is testable
/// without a socket.
pub trait FrameTransport: Send + Sync {
    fn send_audio_frame(&self, pcm: Vec<u8>) -> Result<(), SendError>;
    fn send_input_end(&self, interaction_id: &str) -> Result<(), SendError>;
    fn send_control(
        &self,
        values: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SendError>;
}

impl FrameTransport for SessionClient {
    fn send_audio_frame(&self, pcm: Vec<u8>) -> Result<(), SendError> {
        SessionClient::send_audio_frame(self, pcm)
    }

    fn send_input_end(&self, interaction_id: &str) -> Result<(), SendError> {
        SessionClient::send_input_end(self, interaction_id)
    }

    fn send_control(
        &self,
        values: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), SendError> {
        SessionClient::send_control(self, values)
    }
}

/// The one playback operation the coordinator needs.
pub trait PlaybackControl: Send + Sync {
    fn cancel(&self);
}

impl PlaybackControl for AudioPlayback {
    fn cancel(&self) {
        AudioPlayback::cancel(self);
    }
}

/// Inbound TTS routing: the session client pushes decoded chunks here.
impl PlaybackSink for AudioPlayback {
    fn enqueue(&self, interaction_id: Option<String>, bytes: Vec<u8>) {
        AudioPlayback::enqueue(self, interaction_id, bytes);
    }
}

// ---------------------------------------------------------------------------
// VoiceCoordinator
// ---------------------------------------------------------------------------

pub struct VoiceCoordinator {
    transport: Arc<dyn FrameTransport>,
    playback: Arc<dyn PlaybackControl>,
    store: ConversationStore,
    vad: VadConfig,
    capture: Mutex<Option<CaptureSession>>,
    /// Identity of the utterance currently being streamed (or just
    /// finished); rotated on every speech onset.
    interaction: Arc<Mutex<Option<String>>>,
}

impl VoiceCoordinator {
    pub fn new(
        transport: Arc<dyn FrameTransport>,
        store: ConversationStore,
        playback: Arc<dyn PlaybackControl>,
        vad: VadConfig,
    ) -> Self {
        Self {
            transport,
            playback,
            store,
            vad,
            capture: Mutex::new(None),
            interaction: Arc::new(Mutex::new(None)),
        }
    }

    /// Build the playback engine wired to the store's `speaking` flag.
    pub fn create_playback(store: ConversationStore) -> Result<Arc<AudioPlayback>, PlaybackError> {
        let playback = AudioPlayback::start(Box::new(move |event| match event {
            PlaybackEvent::Started => store.mutate(|s| s.speaking = true),
            PlaybackEvent::Ended => store.mutate(|s| s.speaking = false),
        }))?;
        Ok(Arc::new(playback))
    }

    // ── Recording ──────────────────────────────────────────────────────────

    /// Begin microphone capture. No-op when already recording.
    ///
    /// # Errors
    ///
    /// Device acquisition failures surface here and leave the recording
    /// state rolled back; they never affect the connection.
    pub fn start_recording(&self) -> Result<(), crate::audio::capture::CaptureError> {
        let mut guard = self.capture.lock().unwrap();
        if guard.is_some() {
            return Ok(());
        }

        let callback = Self::capture_callback(
            Arc::clone(&self.transport),
            Arc::clone(&self.playback),
            Arc::clone(&self.interaction),
        );
        let session = CaptureSession::start(self.vad.clone(), callback)?;
        *guard = Some(session);
        drop(guard);

        self.store.mutate(|s| s.recording = true);
        log::info!("voice: recording started");
        Ok(())
    }

    /// Stop capture and release the device. Safe to call in any state.
    pub fn stop_recording(&self) {
        let session = self.capture.lock().unwrap().take();
        if let Some(mut session) = session {
            session.stop();
            self.store.mutate(|s| s.recording = false);
            log::info!("voice: recording stopped");
        }
    }

    /// Returns the new recording state.
    pub fn toggle_recording(&self) -> Result<bool, crate::audio::capture::CaptureError> {
        if self.is_recording() {
            self.stop_recording();
            Ok(false)
        } else {
            self.start_recording()?;
            Ok(true)
        }
    }

    pub fn is_recording(&self) -> bool {
        self.capture.lock().unwrap().is_some()
    }

    /// The event bridge from capture to transport. Associated function so
    /// the logic is testable with synthetic events.
    fn capture_callback(
        transport: Arc<dyn FrameTransport>,
        playback: Arc<dyn PlaybackControl>,
        interaction: Arc<Mutex<Option<String>>>,
    ) -> CaptureCallback {
        Box::new(move |event| match event {
            CaptureEvent::SpeechStart => {
                let id = uuid::Uuid::new_v4().to_string();
                log::debug!("voice: speech onset, interaction {id}");
                *interaction.lock().unwrap() = Some(id);
                // user speech always interrupts assistant speech
                playback.cancel();
            }
            CaptureEvent::Batch { pcm } => {
                if let Err(e) = transport.send_audio_frame(pcm) {
                    log::debug!("voice: dropping audio frame: {e}");
                }
            }
            CaptureEvent::Silence => {
                let id = interaction.lock().unwrap().clone();
                if let Some(id) = id {
                    log::debug!("voice: utterance {id} ended");
                    if let Err(e) = transport.send_input_end(&id) {
                        log::debug!("voice: input-end not sent: {e}");
                    }
                }
            }
        })
    }

    // ── TTS ────────────────────────────────────────────────────────────────

    /// Flip the TTS flag. Disabling cancels any in-flight playback
    /// immediately; the server is informed either way via a config frame.
    pub fn set_tts_enabled(&self, enabled: bool) {
        self.store.mutate(|s| s.tts_enabled = enabled);
        if !enabled {
            self.playback.cancel();
        }
        let mut values = serde_json::Map::new();
        values.insert("ttsEnabled".into(), enabled.into());
        if let Err(e) = self.transport.send_control(values) {
            log::debug!("voice: TTS preference not sent: {e}");
        }
        log::info!("voice: TTS {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Returns the new TTS state.
    pub fn toggle_tts(&self) -> bool {
        let enabled = !self.store.snapshot().tts_enabled;
        self.set_tts_enabled(enabled);
        enabled
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
