//! Connection lifecycle and frame dispatch.
//!
//! [`SessionClient`] owns the transport. One `connect()` call performs the
//! credential exchange, opens the WebSocket with session options encoded as
//! query parameters, then spawns two tasks: an outbound pump draining a
//! bounded channel into the socket, and an inbound loop dispatching frames
//! in arrival order. Abnormal closures feed a fixed-delay, bounded-attempt
//! reconnect scheduler; a normal closure or explicit `disconnect()` never
//! reconnects.
//!
//! ```text
//!  Idle ──connect()──▶ Authenticating ──▶ Connecting ──▶ Open
//!                            │                │           │ close
//!                            ▼ auth fail      ▼ open fail ▼
//!                          Closed ◀──────────────── Closed/Reconnecting
//! ```
//!
//! Every spawned task carries the epoch of the connection it belongs to;
//! `disconnect()` and each new connection bump the epoch so a stale task
//! can never mutate the lifecycle of its successor.

use std::borrow::Cow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::protocol::assembler::TurnAssembler;
use crate::protocol::auth::{AuthClient, AuthError};
use crate::protocol::frames::{ClientFrame, ServerFrame};
use crate::store::ConversationStore;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Explicit/normal closure; never triggers reconnection.
pub const CLOSE_NORMAL: u16 = 1000;
/// Server closed because the short-lived credential expired.
pub const CLOSE_AUTH_EXPIRED: u16 = 4401;
/// Synthetic code used when the stream ends without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

const OUTBOUND_QUEUE_DEPTH: usize = 64;

// ---------------------------------------------------------------------------
// Options, errors, traits
// ---------------------------------------------------------------------------

/// Fixed-delay, bounded-attempt reconnect policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay between an abnormal closure and the next attempt.
    pub interval_ms: u64,
    /// Attempt ceiling; exceeding it is terminal until an explicit
    /// `connect()`.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 3_000,
            max_attempts: 5,
        }
    }
}

/// Everything `connect()` needs, supplied by the embedding configuration.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Transport URL (`ws://` or `wss://`).
    pub endpoint: String,
    /// Publicly embeddable token exchanged for a short-lived credential.
    pub site_token: String,
    /// Initial language tag sent as a connection parameter.
    pub language: String,
    pub reconnect: ReconnectPolicy,
    /// Timeout for the credential exchange request.
    pub auth_timeout_secs: u64,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Authenticating,
    Connecting,
    Open,
    Closed,
    Reconnecting,
}

/// Errors surfaced by `connect()`.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("transport failed: {0}")]
    Transport(String),
}

/// Errors surfaced by the outbound send operations. Never fatal to the
/// session; callers log and move on.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    #[error("outbound queue unavailable: {0}")]
    Queue(String),

    #[error("failed to encode outbound frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Consumer of inbound TTS audio. The playback engine implements this; the
/// client only routes bytes and never owns the audio device.
pub trait PlaybackSink: Send + Sync {
    /// Hand over one decoded-from-transport audio buffer, tagged with the
    /// interaction it belongs to when the JSON path supplied one.
    fn enqueue(&self, interaction_id: Option<String>, bytes: Vec<u8>);
}

// ---------------------------------------------------------------------------
// Reconnect decision
// ---------------------------------------------------------------------------

/// Outcome of an abnormal-closure evaluation. Pure so the policy is testable
/// without a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectDecision {
    /// Schedule one attempt after the policy delay.
    Schedule(Duration),
    /// Ceiling reached; terminal until an explicit `connect()`.
    Exhausted,
    /// Normal closure or reconnection disabled; stay closed quietly.
    Stay,
}

fn decide_reconnect(close_code: u16, attempts: u32, policy: &ReconnectPolicy) -> ReconnectDecision {
    if close_code == CLOSE_NORMAL || !policy.enabled {
        return ReconnectDecision::Stay;
    }
    if attempts >= policy.max_attempts {
        return ReconnectDecision::Exhausted;
    }
    ReconnectDecision::Schedule(Duration::from_millis(policy.interval_ms))
}

// ---------------------------------------------------------------------------
// SessionClient
// ---------------------------------------------------------------------------

enum Outbound {
    Frame(ClientFrame),
    Audio(Vec<u8>),
    Close(u16),
}

struct Lifecycle {
    connection: ConnectionState,
    /// Cached short-lived credential; cleared on 4401 and on explicit
    /// disconnect.
    credential: Option<String>,
    /// Reconnect attempts consumed since the last successful open.
    attempts: u32,
    /// Bumped on every successful open and on `disconnect()`; stale tasks
    /// compare and bail.
    epoch: u64,
    outbound: Option<mpsc::Sender<Outbound>>,
    /// At most one pending reconnect timer.
    reconnect_timer: Option<tokio::task::JoinHandle<()>>,
    /// Language tag applied at the next (re)connect.
    language: String,
}

struct Shared {
    options: SessionOptions,
    store: ConversationStore,
    auth: AuthClient,
    lifecycle: Mutex<Lifecycle>,
    assembler: Mutex<TurnAssembler>,
    playback: Mutex<Option<Arc<dyn PlaybackSink>>>,
}

/// Cheap-to-clone handle to one widget session. All clones share lifecycle
/// state; the coordinator and the demo host each hold one.
#[derive(Clone)]
pub struct SessionClient {
    shared: Arc<Shared>,
}

impl SessionClient {
    pub fn new(options: SessionOptions, store: ConversationStore) -> Self {
        let auth = AuthClient::new(options.auth_timeout_secs);
        let language = options.language.clone();
        Self {
            shared: Arc::new(Shared {
                auth,
                assembler: Mutex::new(TurnAssembler::new(store.clone())),
                store,
                lifecycle: Mutex::new(Lifecycle {
                    connection: ConnectionState::Idle,
                    credential: None,
                    attempts: 0,
                    epoch: 0,
                    outbound: None,
                    reconnect_timer: None,
                    language,
                }),
                playback: Mutex::new(None),
                options,
            }),
        }
    }

    /// Register the playback engine that receives inbound TTS audio.
    pub fn set_playback(&self, sink: Arc<dyn PlaybackSink>) {
        *self.shared.playback.lock().unwrap() = Some(sink);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lifecycle.lock().unwrap().connection
    }

    // ── Lifecycle ──────────────────────────────────────────────────────────

    /// Authenticate (reusing a cached credential when one exists) and open
    /// the transport. No-op when already `Open`.
    pub async fn connect(&self) -> Result<(), SessionError> {
        {
            let mut lc = self.shared.lifecycle.lock().unwrap();
            match lc.connection {
                ConnectionState::Open
                | ConnectionState::Authenticating
                | ConnectionState::Connecting => return Ok(()),
                _ => {}
            }
            if let Some(timer) = lc.reconnect_timer.take() {
                timer.abort();
            }
            lc.connection = ConnectionState::Authenticating;
        }
        self.shared.store.mutate(|s| {
            s.connecting = true;
            s.last_error = None;
        });

        let credential = match self.obtain_credential().await {
            Ok(c) => c,
            Err(e) => {
                self.fail_connect(&e.to_string());
                return Err(e.into());
            }
        };

        let url = {
            let mut lc = self.shared.lifecycle.lock().unwrap();
            lc.connection = ConnectionState::Connecting;
            session_url(
                &self.shared.options.endpoint,
                &credential,
                &lc.language,
                self.shared.store.snapshot().tts_enabled,
            )
        };

        let (ws, _response) = match connect_async(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                self.handle_open_failure(&e.to_string());
                return Err(SessionError::Transport(e.to_string()));
            }
        };

        let (sink, source) = ws.split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let epoch = {
            let mut lc = self.shared.lifecycle.lock().unwrap();
            lc.connection = ConnectionState::Open;
            lc.attempts = 0;
            lc.epoch += 1;
            lc.outbound = Some(tx);
            lc.epoch
        };
        self.shared.store.mutate(|s| {
            s.connected = true;
            s.connecting = false;
        });
        log::info!("session: connected to {}", self.shared.options.endpoint);

        tokio::spawn(pump_outbound(sink, rx));
        let client = self.clone();
        tokio::spawn(async move { client.run_inbound(source, epoch).await });
        Ok(())
    }

    /// Cancel any pending reconnect, close the transport with the normal
    /// code and drop the cached credential. Idempotent.
    pub fn disconnect(&self) {
        let outbound = {
            let mut lc = self.shared.lifecycle.lock().unwrap();
            if let Some(timer) = lc.reconnect_timer.take() {
                timer.abort();
            }
            lc.attempts = 0;
            lc.credential = None;
            lc.connection = ConnectionState::Closed;
            lc.epoch += 1;
            lc.outbound.take()
        };
        if let Some(tx) = outbound {
            let _ = tx.try_send(Outbound::Close(CLOSE_NORMAL));
        }
        self.shared.assembler.lock().unwrap().reset();
        self.shared.store.mutate(|s| {
            s.connected = false;
            s.connecting = false;
            s.typing = false;
        });
        log::info!("session: disconnected");
    }

    async fn obtain_credential(&self) -> Result<String, AuthError> {
        let cached = self.shared.lifecycle.lock().unwrap().credential.clone();
        if let Some(credential) = cached {
            log::debug!("session: reusing cached credential");
            return Ok(credential);
        }
        let credential = self
            .shared
            .auth
            .exchange(&self.shared.options.endpoint, &self.shared.options.site_token)
            .await?;
        self.shared.lifecycle.lock().unwrap().credential = Some(credential.clone());
        Ok(credential)
    }

    /// Authentication failed: terminal until the next explicit `connect()`,
    /// never retried automatically.
    fn fail_connect(&self, reason: &str) {
        log::error!("session: connect failed: {reason}");
        self.shared.lifecycle.lock().unwrap().connection = ConnectionState::Closed;
        let reason = reason.to_string();
        self.shared.store.mutate(move |s| {
            s.connecting = false;
            s.last_error = Some(reason);
        });
    }

    /// The transport could not be opened. This counts as an abnormal closure
    /// for the reconnect policy, so a brief server outage keeps consuming
    /// attempts instead of dying on the first failed retry.
    fn handle_open_failure(&self, reason: &str) {
        log::error!("session: transport open failed: {reason}");
        let decision = {
            let mut lc = self.shared.lifecycle.lock().unwrap();
            let decision =
                decide_reconnect(CLOSE_ABNORMAL, lc.attempts, &self.shared.options.reconnect);
            match decision {
                ReconnectDecision::Schedule(_) => {
                    lc.attempts += 1;
                    lc.connection = ConnectionState::Reconnecting;
                }
                ReconnectDecision::Exhausted | ReconnectDecision::Stay => {
                    lc.connection = ConnectionState::Closed;
                }
            }
            decision
        };
        let reason = reason.to_string();
        self.shared.store.mutate(move |s| {
            s.connecting = false;
            s.last_error = Some(reason);
        });
        match decision {
            ReconnectDecision::Schedule(delay) => self.schedule_reconnect(delay),
            ReconnectDecision::Exhausted => {
                log::warn!("session: reconnect attempts exhausted");
            }
            ReconnectDecision::Stay => {}
        }
    }

    // ── Outbound ───────────────────────────────────────────────────────────

    /// Queue a text-input frame. Whitespace-only submissions are silently
    /// ignored.
    pub fn send_text(&self, text: &str) -> Result<(), SendError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        self.queue(Outbound::Frame(ClientFrame::TextInput {
            text: trimmed.to_string(),
        }))
    }

    /// Queue a `session.config` control frame with arbitrary key/values.
    pub fn send_control(&self, values: serde_json::Map<String, serde_json::Value>) -> Result<(), SendError> {
        self.queue(Outbound::Frame(ClientFrame::Config { values }))
    }

    /// Queue one raw PCM frame as a binary transport message.
    pub fn send_audio_frame(&self, pcm: Vec<u8>) -> Result<(), SendError> {
        self.queue(Outbound::Audio(pcm))
    }

    /// Queue the end-of-utterance marker for `interaction_id`.
    pub fn send_input_end(&self, interaction_id: &str) -> Result<(), SendError> {
        self.queue(Outbound::Frame(ClientFrame::AudioInputEnd {
            interaction_id: interaction_id.to_string(),
        }))
    }

    /// Update the language tag: applied to the next (re)connect URL and
    /// pushed to the live session as a control frame when one is open.
    pub fn set_language(&self, language: &str) {
        self.shared.lifecycle.lock().unwrap().language = language.to_string();
        let mut values = serde_json::Map::new();
        values.insert("language".into(), language.into());
        if let Err(e) = self.send_control(values) {
            log::debug!("session: language update not sent: {e}");
        }
    }

    fn queue(&self, outbound: Outbound) -> Result<(), SendError> {
        let lc = self.shared.lifecycle.lock().unwrap();
        if lc.connection != ConnectionState::Open {
            return Err(SendError::NotConnected);
        }
        match &lc.outbound {
            Some(tx) => tx
                .try_send(outbound)
                .map_err(|e| SendError::Queue(e.to_string())),
            None => Err(SendError::NotConnected),
        }
    }

    // ── Inbound ────────────────────────────────────────────────────────────

    async fn run_inbound(self, mut source: WsSource, epoch: u64) {
        let mut close_code = CLOSE_ABNORMAL;
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => self.dispatch_text(&text),
                Ok(Message::Binary(bytes)) => self.dispatch_audio(None, bytes),
                Ok(Message::Close(frame)) => {
                    close_code = frame
                        .map(|f| u16::from(f.code))
                        .unwrap_or(CLOSE_ABNORMAL);
                    log::info!("session: server closed connection (code {close_code})");
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Err(e) => {
                    log::warn!("session: transport error: {e}");
                    break;
                }
            }
        }
        self.handle_closed(epoch, close_code);
    }

    fn dispatch_text(&self, raw: &str) {
        let frame = match ServerFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed frames are dropped; the connection stays up.
                log::warn!("session: dropping malformed frame: {e}");
                return;
            }
        };
        match frame {
            ServerFrame::Audio { data, context } => match BASE64.decode(&data) {
                Ok(bytes) => {
                    let interaction = context.and_then(|c| c.interaction_id);
                    self.dispatch_audio(interaction, bytes);
                }
                Err(e) => log::warn!("session: dropping undecodable audio frame: {e}"),
            },
            other => self.shared.assembler.lock().unwrap().handle(&other),
        }
    }

    /// Route one TTS chunk to playback. Local TTS gating happens here: when
    /// the flag is off, inbound audio is dropped regardless of what the
    /// server negotiated at connect time.
    fn dispatch_audio(&self, interaction_id: Option<String>, bytes: Vec<u8>) {
        if !self.shared.store.snapshot().tts_enabled {
            return;
        }
        let sink = self.shared.playback.lock().unwrap().clone();
        match sink {
            Some(sink) => sink.enqueue(interaction_id, bytes),
            None => log::debug!("session: no playback sink registered; audio dropped"),
        }
    }

    // ── Closure handling ───────────────────────────────────────────────────

    fn handle_closed(&self, epoch: u64, close_code: u16) {
        let decision = {
            let mut lc = self.shared.lifecycle.lock().unwrap();
            if lc.epoch != epoch {
                // A disconnect() or newer connection superseded this task.
                return;
            }
            lc.outbound = None;
            if close_code == CLOSE_AUTH_EXPIRED {
                log::info!("session: credential expired; will re-authenticate");
                lc.credential = None;
            }
            let decision = decide_reconnect(close_code, lc.attempts, &self.shared.options.reconnect);
            match decision {
                ReconnectDecision::Schedule(_) => {
                    lc.attempts += 1;
                    lc.connection = ConnectionState::Reconnecting;
                }
                ReconnectDecision::Exhausted | ReconnectDecision::Stay => {
                    lc.connection = ConnectionState::Closed;
                }
            }
            decision
        };
        self.shared.assembler.lock().unwrap().reset();
        self.shared.store.mutate(|s| {
            s.connected = false;
            s.typing = false;
        });

        match decision {
            ReconnectDecision::Schedule(delay) => self.schedule_reconnect(delay),
            ReconnectDecision::Exhausted => {
                log::warn!("session: reconnect attempts exhausted");
                self.shared
                    .store
                    .mutate(|s| s.last_error = Some("connection lost; reconnect attempts exhausted".into()));
            }
            ReconnectDecision::Stay => {}
        }
    }

    fn schedule_reconnect(&self, delay: Duration) {
        let attempt = self.shared.lifecycle.lock().unwrap().attempts;
        log::info!(
            "session: scheduling reconnect attempt {attempt} in {} ms",
            delay.as_millis()
        );
        let client = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // Back to Closed so connect() proceeds past its no-op check.
                let mut lc = client.shared.lifecycle.lock().unwrap();
                if lc.connection != ConnectionState::Reconnecting {
                    return;
                }
                lc.connection = ConnectionState::Closed;
            }
            if let Err(e) = client.connect().await {
                log::warn!("session: reconnect attempt failed: {e}");
            }
        });
        let mut lc = self.shared.lifecycle.lock().unwrap();
        if let Some(previous) = lc.reconnect_timer.replace(timer) {
            // Only one pending timer at a time.
            previous.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound pump
// ---------------------------------------------------------------------------

async fn pump_outbound(mut sink: WsSink, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        let message = match outbound {
            Outbound::Frame(frame) => match frame.encode() {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    log::error!("session: failed to encode outbound frame: {e}");
                    continue;
                }
            },
            Outbound::Audio(bytes) => Message::Binary(bytes),
            Outbound::Close(code) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: Cow::Borrowed(""),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
        };
        if let Err(e) = sink.send(message).await {
            log::warn!("session: outbound send failed: {e}");
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// URL construction
// ---------------------------------------------------------------------------

/// Append credential and session options to the transport URL. Values are
/// percent-encoded; credentials and language tags are server-provided
/// strings and must not be able to corrupt the query.
fn session_url(endpoint: &str, credential: &str, language: &str, tts_enabled: bool) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!(
        "{endpoint}{separator}token={}&language={}&tts={}",
        urlencoding::encode(credential),
        urlencoding::encode(language),
        if tts_enabled { "1" } else { "0" }
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
