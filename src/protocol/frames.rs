//! JSON wire frames, tagged by a `type` field.
//!
//! | Direction | Tag                     | Payload                               |
//! |-----------|-------------------------|---------------------------------------|
//! | out       | `input.text`            | `text`                                |
//! | out       | `input.audio_end`       | `interactionId`                       |
//! | out       | `session.config`        | arbitrary key/value                   |
//! | in        | `stream.stt`            | `text`, `is_final`                    |
//! | in        | `stream.llm`            | `delta`, `content`                    |
//! | in        | `response.start` / `response.end`             | —               |
//! | in        | `response.audio_start` / `response.audio_end` | —               |
//! | in        | `status`                | `message`\|`status`, `target`, `details` |
//! | in        | `service.message`       | `content`, `messageType`, `localized`, `target` |
//! | in        | `error`                 | `message`, `target`                   |
//! | in        | `audio`                 | base64 `data`, `context.interaction_id` |
//!
//! Raw microphone PCM (out) and TTS chunks on the binary path (in) travel as
//! binary transport messages and never pass through these types.
//!
//! Parsing is deliberately lenient on payload fields (all optional or
//! defaulted): a frame with a known tag but missing fields still dispatches,
//! and only an unknown tag or invalid JSON is treated as a parse failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// ServerFrame
// ---------------------------------------------------------------------------

/// Inbound JSON frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Transcription delta for the user's live utterance.
    #[serde(rename = "stream.stt")]
    Transcript {
        #[serde(default)]
        text: String,
        #[serde(default)]
        is_final: bool,
    },

    /// Assistant text delta. Servers send either incremental `delta`s or a
    /// whole-`content` replacement; `delta` wins when both are present.
    #[serde(rename = "stream.llm")]
    AssistantDelta {
        #[serde(default)]
        delta: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },

    #[serde(rename = "response.start")]
    ResponseStart,

    #[serde(rename = "response.end")]
    ResponseEnd,

    #[serde(rename = "response.audio_start")]
    ResponseAudioStart,

    #[serde(rename = "response.audio_end")]
    ResponseAudioEnd,

    /// Transient progress indicator ("thinking", "transcribing", …).
    #[serde(rename = "status")]
    Status {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        status: Option<String>,
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        details: Option<Value>,
    },

    /// Server-originated, user-facing notice (not a transport error).
    #[serde(rename = "service.message")]
    ServiceMessage {
        #[serde(default)]
        content: Option<String>,
        #[serde(rename = "messageType", default)]
        message_type: Option<String>,
        #[serde(default)]
        localized: bool,
        #[serde(default)]
        target: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        target: Option<String>,
    },

    /// TTS chunk on the JSON path: base64 payload plus the interaction it
    /// belongs to (used for barge-in matching).
    #[serde(rename = "audio")]
    Audio {
        data: String,
        #[serde(default)]
        context: Option<AudioContext>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioContext {
    #[serde(default)]
    pub interaction_id: Option<String>,
}

impl ServerFrame {
    /// Parse a text transport message. Unknown tags and invalid JSON come
    /// back as an error the dispatcher logs and drops.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// ---------------------------------------------------------------------------
// ClientFrame
// ---------------------------------------------------------------------------

/// Outbound JSON frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "input.text")]
    TextInput { text: String },

    /// VAD-detected end of utterance, referencing the active interaction.
    #[serde(rename = "input.audio_end")]
    AudioInputEnd {
        #[serde(rename = "interactionId")]
        interaction_id: String,
    },

    /// Session config change (language, TTS flag, …). Keys are flattened
    /// next to the tag.
    #[serde(rename = "session.config")]
    Config {
        #[serde(flatten)]
        values: serde_json::Map<String, Value>,
    },
}

impl ClientFrame {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transcript_frame() {
        let frame = ServerFrame::parse(r#"{"type":"stream.stt","text":"hello","is_final":true}"#)
            .expect("parse");
        match frame {
            ServerFrame::Transcript { text, is_final } => {
                assert_eq!(text, "hello");
                assert!(is_final);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn transcript_fields_default_when_missing() {
        let frame = ServerFrame::parse(r#"{"type":"stream.stt"}"#).expect("parse");
        match frame {
            ServerFrame::Transcript { text, is_final } => {
                assert!(text.is_empty());
                assert!(!is_final);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_unit_lifecycle_frames() {
        assert!(matches!(
            ServerFrame::parse(r#"{"type":"response.start"}"#).unwrap(),
            ServerFrame::ResponseStart
        ));
        assert!(matches!(
            ServerFrame::parse(r#"{"type":"response.audio_end"}"#).unwrap(),
            ServerFrame::ResponseAudioEnd
        ));
    }

    #[test]
    fn parses_audio_frame_with_context() {
        let frame = ServerFrame::parse(
            r#"{"type":"audio","data":"AAAA","context":{"interaction_id":"abc"}}"#,
        )
        .expect("parse");
        match frame {
            ServerFrame::Audio { data, context } => {
                assert_eq!(data, "AAAA");
                assert_eq!(context.unwrap().interaction_id.as_deref(), Some("abc"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_a_parse_error() {
        assert!(ServerFrame::parse(r#"{"type":"no.such.frame"}"#).is_err());
        assert!(ServerFrame::parse("not json at all").is_err());
    }

    #[test]
    fn encodes_text_input() {
        let json = ClientFrame::TextInput {
            text: "hi".into(),
        }
        .encode()
        .expect("encode");
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "input.text");
        assert_eq!(value["text"], "hi");
    }

    #[test]
    fn encodes_config_with_flattened_keys() {
        let mut values = serde_json::Map::new();
        values.insert("language".into(), "en".into());
        values.insert("ttsEnabled".into(), true.into());

        let json = ClientFrame::Config { values }.encode().expect("encode");
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "session.config");
        assert_eq!(value["language"], "en");
        assert_eq!(value["ttsEnabled"], true);
    }

    #[test]
    fn encodes_audio_end_with_camel_case_key() {
        let json = ClientFrame::AudioInputEnd {
            interaction_id: "xyz".into(),
        }
        .encode()
        .expect("encode");
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "input.audio_end");
        assert_eq!(value["interactionId"], "xyz");
    }
}
