//! Embeddable conversational voice-agent core.
//!
//! This crate implements the non-visual half of a chat/voice widget: a
//! WebSocket session client, a streaming message assembler, an observable
//! conversation store, VAD-gated microphone streaming, and a sequential
//! TTS playback queue. A renderer (terminal demo, GUI, web shell) sits on
//! top and only ever consumes store snapshots and issues intents.
//!
//! # Architecture
//!
//! ```text
//!              ┌────────────────────────────────────────────────┐
//!              │                VoiceCoordinator                │
//!              │  mic on/off · TTS on/off · barge-in mediation  │
//!              └───────┬───────────────────────────┬────────────┘
//!                      │                           │
//!              ┌───────▼────────┐          ┌───────▼────────┐
//!              │ audio::capture │          │ SessionClient  │
//!              │  cpal → VAD →  │  frames  │  auth → ws →   │
//!              │  16 kHz PCM    │─────────▶│  dispatch      │
//!              └────────────────┘          └───────┬────────┘
//!                                                  │ server frames
//!                      ┌───────────────────────────┼───────────┐
//!                      │                           │           │
//!              ┌───────▼────────┐          ┌───────▼────────┐  │ audio
//!              │ TurnAssembler  │─────────▶│ Conversation   │  │
//!              │  deltas → turns│  mutate  │ Store (+subs)  │  │
//!              └────────────────┘          └────────────────┘  │
//!                                          ┌───────────────────▼──┐
//!                                          │   audio::playback    │
//!                                          │ sequential, barge-in │
//!                                          └──────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voice_agent_widget::config::WidgetConfig;
//! use voice_agent_widget::protocol::SessionClient;
//! use voice_agent_widget::store::ConversationStore;
//! use voice_agent_widget::voice::VoiceCoordinator;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = WidgetConfig::load()?;
//! let store = ConversationStore::new(config.tts_enabled);
//! let _sub = store.subscribe(Box::new(|state| {
//!     if let Some(turn) = state.turns.last() {
//!         println!("[{}] {}", turn.role.as_str(), turn.content);
//!     }
//! }));
//!
//! let session = SessionClient::new(config.session_config(), store.clone());
//! let playback = VoiceCoordinator::create_playback(store.clone())?;
//! session.set_playback(playback.clone());
//! let coordinator = Arc::new(VoiceCoordinator::new(
//!     Arc::new(session.clone()),
//!     store.clone(),
//!     playback,
//!     config.audio.vad_config(),
//! ));
//!
//! session.connect().await?;
//! session.send_text("hello")?;
//! coordinator.toggle_recording()?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod config;
pub mod protocol;
pub mod store;
pub mod voice;
