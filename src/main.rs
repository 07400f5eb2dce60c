//! Terminal demo host for the voice-agent widget core.
//!
//! Stands in for the DOM renderer an embedding page would provide: it
//! subscribes to the conversation store, prints turn updates, and maps
//! stdin lines to UI intents.
//!
//! # Startup sequence
//!
//! 1. Initialise logging.
//! 2. Load [`WidgetConfig`] from disk (returns default on first run).
//! 3. Build store, session client and playback engine.
//! 4. Connect and loop over stdin until EOF (Ctrl-D disconnects).
//!
//! # Commands
//!
//! | Input        | Intent                          |
//! |--------------|---------------------------------|
//! | plain text   | send as a text-input frame      |
//! | `/mic`       | toggle recording                |
//! | `/tts`       | toggle TTS playback             |
//! | `/lang <tag>`| switch conversation language    |
//! | `/clear`     | clear the conversation          |
//! | `/quit`      | disconnect and exit             |

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use voice_agent_widget::audio::vad::VadConfig;
use voice_agent_widget::config::WidgetConfig;
use voice_agent_widget::protocol::SessionClient;
use voice_agent_widget::store::{ConversationStore, TurnKind};
use voice_agent_widget::voice::VoiceCoordinator;

// ---------------------------------------------------------------------------
// Turn printer
// ---------------------------------------------------------------------------

/// Print the newest turn whenever the store changes. Streaming turns are
/// reprinted in place on the same line prefix, so deltas stay readable.
fn print_latest(state: &voice_agent_widget::store::ConversationState) {
    let Some(turn) = state.turns.last() else {
        return;
    };
    let marker = match turn.kind {
        TurnKind::Status => "…",
        TurnKind::Error => "!",
        TurnKind::Text => {
            if turn.finalized {
                " "
            } else {
                "~"
            }
        }
    };
    println!("[{}{marker}] {}", turn.role.as_str(), turn.content);
}

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("voice-agent-widget demo starting up");

    // 2. Configuration
    let config = WidgetConfig::load().unwrap_or_else(|e| {
        log::warn!("Failed to load config ({e}); using defaults");
        WidgetConfig::default()
    });
    let vad: VadConfig = config.audio.vad_config();

    // 3. Core wiring
    let store = ConversationStore::new(config.tts_enabled);
    let _printer = store.subscribe(Box::new(print_latest));

    let session = SessionClient::new(config.session_config(), store.clone());

    // Playback may be unavailable (headless host) — degrade gracefully and
    // run text-only.
    let playback = match VoiceCoordinator::create_playback(store.clone()) {
        Ok(playback) => {
            session.set_playback(playback.clone());
            Some(playback)
        }
        Err(e) => {
            log::warn!("Audio output unavailable ({e}); TTS playback disabled");
            None
        }
    };
    let coordinator = playback.map(|playback| {
        VoiceCoordinator::new(Arc::new(session.clone()), store.clone(), playback, vad)
    });

    // 4. Connect and serve stdin intents
    if let Err(e) = session.connect().await {
        log::error!("Initial connect failed: {e}");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "/quit" => break,
            "/clear" => store.clear_turns(),
            "/mic" => match &coordinator {
                Some(coordinator) => match coordinator.toggle_recording() {
                    Ok(on) => println!("(microphone {})", if on { "on" } else { "off" }),
                    Err(e) => log::error!("Recording unavailable: {e}"),
                },
                None => log::warn!("No audio support in this host"),
            },
            "/tts" => match &coordinator {
                Some(coordinator) => {
                    let on = coordinator.toggle_tts();
                    println!("(TTS {})", if on { "on" } else { "off" });
                }
                None => log::warn!("No audio support in this host"),
            },
            _ => {
                if let Some(tag) = line.strip_prefix("/lang ") {
                    session.set_language(tag.trim());
                    println!("(language set to {})", tag.trim());
                } else if let Err(e) = session.send_text(line) {
                    log::warn!("Not sent: {e}");
                }
            }
        }
    }

    if let Some(coordinator) = &coordinator {
        coordinator.stop_recording();
    }
    session.disconnect();
    log::info!("demo: goodbye");
    Ok(())
}
