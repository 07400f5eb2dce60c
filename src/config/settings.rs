//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::audio::vad::{VadConfig, REQUIRED_SPEECH_CHUNKS, RMS_SPEECH_THRESHOLD, SILENCE_HOLD_MS};
use crate::protocol::client::{ReconnectPolicy, SessionOptions};

// ---------------------------------------------------------------------------
// SessionSettings
// ---------------------------------------------------------------------------

/// Settings for the agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Transport URL (`ws://` or `wss://`). The auth endpoint is derived
    /// from it, so only one URL needs configuring.
    pub endpoint: String,
    /// Publicly embeddable site token, exchanged for a short-lived
    /// credential at connect time.
    pub site_token: String,
    /// Initial conversation language as a BCP-47 tag.
    pub language: String,
    /// Maximum seconds to wait for the credential exchange.
    pub auth_timeout_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            endpoint: "wss://localhost:8080/widget/ws".into(),
            site_token: String::new(),
            language: "en".into(),
            auth_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// ReconnectSettings
// ---------------------------------------------------------------------------

/// Reconnect policy after abnormal closures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectSettings {
    pub enabled: bool,
    /// Fixed delay between an abnormal closure and the next attempt (ms).
    pub interval_ms: u64,
    /// Attempt ceiling; exceeding it leaves the session closed until an
    /// explicit reconnect.
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 3_000,
            max_attempts: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// AudioSettings
// ---------------------------------------------------------------------------

/// Settings for capture-side voice-activity detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSettings {
    /// RMS energy above which a ~100 ms batch counts as speech (0.0 – 1.0).
    pub rms_threshold: f32,
    /// Consecutive speech batches required before onset fires.
    pub required_speech_chunks: u32,
    /// Silence that must persist before an utterance ends (ms).
    pub silence_hold_ms: u64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            rms_threshold: RMS_SPEECH_THRESHOLD,
            required_speech_chunks: REQUIRED_SPEECH_CHUNKS,
            silence_hold_ms: SILENCE_HOLD_MS,
        }
    }
}

impl AudioSettings {
    pub fn vad_config(&self) -> VadConfig {
        VadConfig {
            rms_threshold: self.rms_threshold,
            required_speech_chunks: self.required_speech_chunks,
            silence_hold_ms: self.silence_hold_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// WidgetConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level widget configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_agent_widget::config::WidgetConfig;
///
/// // Load (returns Default when file is missing)
/// let config = WidgetConfig::load().unwrap();
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WidgetConfig {
    pub session: SessionSettings,
    pub reconnect: ReconnectSettings,
    pub audio: AudioSettings,
    /// Whether server-synthesized speech is played back.
    pub tts_enabled: bool,
}

impl WidgetConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(WidgetConfig::default())` when the file does not exist
    /// yet (first-run scenario) so callers never need to special-case a
    /// missing file.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path (useful for tests).
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path (useful for tests).
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Everything `SessionClient` needs, in one value.
    pub fn session_config(&self) -> SessionOptions {
        SessionOptions {
            endpoint: self.session.endpoint.clone(),
            site_token: self.session.site_token.clone(),
            language: self.session.language.clone(),
            reconnect: ReconnectPolicy {
                enabled: self.reconnect.enabled,
                interval_ms: self.reconnect.interval_ms,
                max_attempts: self.reconnect.max_attempts,
            },
            auth_timeout_secs: self.session.auth_timeout_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
