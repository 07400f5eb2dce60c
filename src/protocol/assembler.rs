//! Streaming message assembly.
//!
//! Inbound partial-result frames must fold into the correct existing turn
//! instead of appending duplicates. [`TurnAssembler`] owns that folding
//! logic and is the only writer of turn content:
//!
//! | Frame              | Effect on the store                                |
//! |--------------------|----------------------------------------------------|
//! | `stream.stt`       | update the live caption turn in place; finalize on `is_final` |
//! | `stream.llm`       | open/append the single open assistant turn         |
//! | `response.start`   | prune status turns (reset in case the previous response closed uncleanly) |
//! | `response.end`     | close the open turn; prune statuses unless TTS audio is still pending |
//! | `response.audio_*` | audio-end releases the statuses held back at response-end |
//! | `status`           | upsert the one live status turn per `(role, target)` |
//! | `error` / `service.message` | prune statuses, close the open turn, append an error turn |
//!
//! The assembler never touches the transport; it is driven by the session
//! client's dispatch loop and is directly testable against a store.

use crate::protocol::frames::ServerFrame;
use crate::store::{ConversationStore, Role, Turn, TurnKind};

/// Label shown when a status frame carries neither message nor keyword.
const DEFAULT_STATUS_LABEL: &str = "Working…";

// ---------------------------------------------------------------------------
// TurnAssembler
// ---------------------------------------------------------------------------

/// Folds server frames into conversation turns.
pub struct TurnAssembler {
    store: ConversationStore,
    /// Id of the currently open (streaming) assistant turn, if any. At most
    /// one open assistant turn exists at a time.
    open_turn: Option<String>,
}

impl TurnAssembler {
    pub fn new(store: ConversationStore) -> Self {
        Self {
            store,
            open_turn: None,
        }
    }

    /// Dispatch one inbound frame. `audio` frames are routed to playback by
    /// the session client before reaching this point.
    pub fn handle(&mut self, frame: &ServerFrame) {
        match frame {
            ServerFrame::Transcript { text, is_final } => self.on_transcript(text, *is_final),
            ServerFrame::AssistantDelta { delta, content } => {
                // Incremental deltas win; `content` is a whole-message fallback.
                if let Some(text) = delta.as_deref().or(content.as_deref()) {
                    self.on_assistant_delta(text);
                }
            }
            ServerFrame::ResponseStart => self.on_response_start(),
            ServerFrame::ResponseEnd => self.on_response_end(),
            ServerFrame::ResponseAudioStart => {
                log::debug!("assembler: audio synthesis started");
            }
            ServerFrame::ResponseAudioEnd => self.on_response_audio_end(),
            ServerFrame::Status {
                message,
                status,
                target,
                ..
            } => self.on_status(message.as_deref(), status.as_deref(), target.as_deref()),
            ServerFrame::ServiceMessage {
                content,
                message_type,
                localized,
                target,
            } => self.on_service_message(
                content.as_deref(),
                message_type.as_deref(),
                *localized,
                target.as_deref(),
            ),
            ServerFrame::Error { message, target } => {
                self.on_error(message.as_deref(), target.as_deref())
            }
            ServerFrame::Audio { .. } => {
                log::debug!("assembler: audio frame reached the assembler; ignored");
            }
        }
    }

    /// Forget the open-turn marker (connection dropped or conversation
    /// cleared). Does not mutate the store.
    pub fn reset(&mut self) {
        self.open_turn = None;
    }

    // ── Transcripts ────────────────────────────────────────────────────────

    /// One mutable "live caption" turn absorbs interim transcripts; the
    /// final transcript finalizes it (or creates it when none is live).
    fn on_transcript(&mut self, text: &str, is_final: bool) {
        self.store.mutate(|state| {
            match state.turns.last_mut() {
                Some(last)
                    if last.role == Role::User
                        && last.kind == TurnKind::Text
                        && !last.finalized =>
                {
                    last.content = text.to_string();
                    last.finalized = is_final;
                }
                _ => {
                    let mut turn = Turn::new(Role::User, TurnKind::Text, text);
                    turn.finalized = is_final;
                    state.turns.push(turn);
                }
            }
        });
        if is_final {
            log::debug!("assembler: transcript finalized ({} chars)", text.len());
        }
    }

    // ── Assistant generation ───────────────────────────────────────────────

    fn on_assistant_delta(&mut self, text: &str) {
        // Append to the open turn when one exists and is still in the store.
        if let Some(id) = self.open_turn.clone() {
            let mut appended = false;
            self.store.mutate(|state| {
                if let Some(turn) = state.turn_mut(&id) {
                    turn.content.push_str(text);
                    appended = true;
                }
            });
            if appended {
                return;
            }
            // The turn vanished (conversation cleared mid-stream).
            self.open_turn = None;
        }

        let turn = Turn::new(Role::Assistant, TurnKind::Text, text);
        let id = turn.id.clone();
        self.store.mutate(|state| {
            state.prune_status_turns();
            state.turns.push(turn);
            state.typing = true;
        });
        self.open_turn = Some(id);
        log::debug!("assembler: opened assistant turn");
    }

    fn on_response_start(&mut self) {
        self.store.mutate(|state| state.prune_status_turns());
    }

    fn on_response_end(&mut self) {
        let open = self.open_turn.take();
        self.store.mutate(|state| {
            if let Some(id) = open.as_deref() {
                if let Some(turn) = state.turn_mut(id) {
                    turn.finalized = true;
                }
            }
            state.typing = false;
            // With TTS on, synthesis outlives generation: keep status turns
            // until the audio-end frame arrives.
            if !state.tts_enabled {
                state.prune_status_turns();
            }
        });
        log::debug!("assembler: response closed");
    }

    fn on_response_audio_end(&mut self) {
        self.store.mutate(|state| state.prune_status_turns());
    }

    // ── Status ─────────────────────────────────────────────────────────────

    fn on_status(&mut self, message: Option<&str>, status: Option<&str>, target: Option<&str>) {
        let role = Role::from_target(target);
        let content = message
            .or(status)
            .unwrap_or(DEFAULT_STATUS_LABEL)
            .to_string();

        self.store.mutate(|state| {
            if let Some(turn) = state.status_turn_mut(role, target) {
                turn.content = content.clone();
                if let Some(keyword) = status {
                    turn.metadata
                        .insert("status".into(), keyword.to_string().into());
                }
                return;
            }
            let mut turn = Turn::new(role, TurnKind::Status, content.clone());
            if let Some(t) = target {
                turn.metadata.insert("target".into(), t.to_string().into());
            }
            if let Some(keyword) = status {
                turn.metadata
                    .insert("status".into(), keyword.to_string().into());
            }
            state.turns.push(turn);
        });
    }

    // ── Errors and notices ─────────────────────────────────────────────────

    fn on_error(&mut self, message: Option<&str>, target: Option<&str>) {
        let text = message.unwrap_or("The agent reported an error.").to_string();
        log::warn!("assembler: server error: {text}");
        self.append_error_turn(text, target, None, false);
    }

    /// Same turn-construction policy as `error`, but this is user-facing
    /// information from the server, not a connection failure.
    fn on_service_message(
        &mut self,
        content: Option<&str>,
        message_type: Option<&str>,
        localized: bool,
        target: Option<&str>,
    ) {
        let text = content.unwrap_or("Service notice").to_string();
        log::info!("assembler: service message: {text}");
        self.append_error_turn(text, target, message_type, localized);
    }

    fn append_error_turn(
        &mut self,
        text: String,
        target: Option<&str>,
        message_type: Option<&str>,
        localized: bool,
    ) {
        let role = Role::from_target(target);
        let open = self.open_turn.take();

        self.store.mutate(|state| {
            state.prune_status_turns();
            if let Some(id) = open.as_deref() {
                if let Some(turn) = state.turn_mut(id) {
                    turn.finalized = true;
                }
            }
            state.typing = false;

            let mut turn = Turn::new(role, TurnKind::Error, text.clone());
            if let Some(t) = target {
                turn.metadata.insert("target".into(), t.to_string().into());
            }
            if let Some(mt) = message_type {
                turn.metadata
                    .insert("messageType".into(), mt.to_string().into());
                turn.metadata.insert("localized".into(), localized.into());
            }
            state.turns.push(turn);
            state.last_error = Some(text.clone());
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(tts_enabled: bool) -> (TurnAssembler, ConversationStore) {
        let store = ConversationStore::new(tts_enabled);
        let assembler = TurnAssembler::new(store.clone());
        (assembler, store)
    }

    fn transcript(text: &str, is_final: bool) -> ServerFrame {
        ServerFrame::Transcript {
            text: text.into(),
            is_final,
        }
    }

    fn delta(text: &str) -> ServerFrame {
        ServerFrame::AssistantDelta {
            delta: Some(text.into()),
            content: None,
        }
    }

    fn status(message: Option<&str>, keyword: Option<&str>, target: Option<&str>) -> ServerFrame {
        ServerFrame::Status {
            message: message.map(String::from),
            status: keyword.map(String::from),
            target: target.map(String::from),
            details: None,
        }
    }

    // ---- Transcript folding -----------------------------------------------

    #[test]
    fn interim_transcripts_fold_into_one_turn() {
        let (mut asm, store) = setup(false);

        asm.handle(&transcript("he", false));
        asm.handle(&transcript("hel", false));
        asm.handle(&transcript("hello there", true));

        let state = store.snapshot();
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.turns[0].content, "hello there");
        assert!(state.turns[0].finalized);
        assert_eq!(state.turns[0].role, Role::User);
    }

    #[test]
    fn final_transcript_without_interims_creates_finalized_turn() {
        let (mut asm, store) = setup(false);
        asm.handle(&transcript("all at once", true));

        let state = store.snapshot();
        assert_eq!(state.turns.len(), 1);
        assert!(state.turns[0].finalized);
    }

    #[test]
    fn new_utterance_after_final_starts_a_new_turn() {
        let (mut asm, store) = setup(false);
        asm.handle(&transcript("first", true));
        asm.handle(&transcript("second", false));

        let state = store.snapshot();
        assert_eq!(state.turns.len(), 2);
        assert_eq!(state.turns[1].content, "second");
        assert!(!state.turns[1].finalized);
    }

    // ---- Assistant deltas --------------------------------------------------

    #[test]
    fn deltas_concatenate_into_one_open_turn() {
        let (mut asm, store) = setup(false);

        asm.handle(&ServerFrame::ResponseStart);
        asm.handle(&delta("Hel"));
        asm.handle(&delta("lo "));
        asm.handle(&delta("world"));
        asm.handle(&ServerFrame::ResponseEnd);

        let state = store.snapshot();
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.turns[0].content, "Hello world");
        assert!(state.turns[0].finalized);
        assert!(!state.typing);
    }

    #[test]
    fn at_most_one_open_assistant_turn() {
        let (mut asm, store) = setup(false);
        asm.handle(&delta("a"));
        asm.handle(&delta("b"));
        asm.handle(&delta("c"));

        let state = store.snapshot();
        let open: Vec<_> = state
            .turns
            .iter()
            .filter(|t| t.role == Role::Assistant && t.kind == TurnKind::Text && !t.finalized)
            .collect();
        assert_eq!(open.len(), 1);
        assert!(state.typing);
    }

    #[test]
    fn content_field_used_when_delta_absent() {
        let (mut asm, store) = setup(false);
        asm.handle(&ServerFrame::AssistantDelta {
            delta: None,
            content: Some("whole message".into()),
        });
        asm.handle(&ServerFrame::ResponseEnd);

        let state = store.snapshot();
        assert_eq!(state.turns[0].content, "whole message");
    }

    #[test]
    fn first_delta_opens_typing_and_prunes_statuses() {
        let (mut asm, store) = setup(false);
        asm.handle(&status(Some("thinking"), None, Some("assistant")));
        assert_eq!(store.snapshot().turns.len(), 1);

        asm.handle(&delta("Hi"));
        let state = store.snapshot();
        assert!(state.typing);
        assert!(state.turns.iter().all(|t| t.kind != TurnKind::Status));
    }

    #[test]
    fn deltas_after_response_end_open_a_fresh_turn() {
        let (mut asm, store) = setup(false);
        asm.handle(&delta("first"));
        asm.handle(&ServerFrame::ResponseEnd);
        asm.handle(&delta("second"));

        let state = store.snapshot();
        assert_eq!(state.turns.len(), 2);
        assert_eq!(state.turns[1].content, "second");
        assert!(!state.turns[1].finalized);
    }

    // ---- Status upsert -----------------------------------------------------

    #[test]
    fn status_for_same_pair_updates_in_place() {
        let (mut asm, store) = setup(false);
        asm.handle(&status(Some("Thinking"), None, Some("assistant")));
        asm.handle(&status(Some("Still thinking"), None, Some("assistant")));

        let state = store.snapshot();
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.turns[0].content, "Still thinking");
    }

    #[test]
    fn status_for_different_targets_coexist() {
        let (mut asm, store) = setup(false);
        asm.handle(&status(Some("Transcribing"), None, Some("user")));
        asm.handle(&status(Some("Thinking"), None, Some("assistant")));

        let state = store.snapshot();
        assert_eq!(state.turns.len(), 2);
        assert_eq!(state.turns[0].role, Role::User);
        assert_eq!(state.turns[1].role, Role::Assistant);
    }

    #[test]
    fn status_content_fallback_chain() {
        let (mut asm, store) = setup(false);
        asm.handle(&status(None, Some("synthesizing"), Some("a")));
        assert_eq!(store.snapshot().turns[0].content, "synthesizing");

        let (mut asm, store) = setup(false);
        asm.handle(&status(None, None, Some("a")));
        assert_eq!(store.snapshot().turns[0].content, DEFAULT_STATUS_LABEL);
    }

    // ---- Status pruning and the TTS exception ------------------------------

    #[test]
    fn response_end_prunes_statuses_when_tts_disabled() {
        let (mut asm, store) = setup(false);
        asm.handle(&status(Some("thinking"), None, None));
        asm.handle(&delta("answer"));
        asm.handle(&status(Some("synthesizing"), None, None));
        asm.handle(&ServerFrame::ResponseEnd);

        let state = store.snapshot();
        assert!(state.turns.iter().all(|t| t.kind != TurnKind::Status));
    }

    #[test]
    fn response_end_keeps_statuses_until_audio_end_when_tts_enabled() {
        let (mut asm, store) = setup(true);
        asm.handle(&delta("answer"));
        asm.handle(&status(Some("synthesizing"), None, None));
        asm.handle(&ServerFrame::ResponseEnd);

        // text generation finished, audio pending: status survives
        let state = store.snapshot();
        assert!(state.turns.iter().any(|t| t.kind == TurnKind::Status));
        assert!(!state.typing);

        asm.handle(&ServerFrame::ResponseAudioEnd);
        let state = store.snapshot();
        assert!(state.turns.iter().all(|t| t.kind != TurnKind::Status));
    }

    // ---- Errors and service messages ---------------------------------------

    #[test]
    fn error_closes_open_turn_and_appends_error_turn() {
        let (mut asm, store) = setup(true);
        asm.handle(&status(Some("thinking"), None, None));
        asm.handle(&delta("partial ans"));
        asm.handle(&ServerFrame::Error {
            message: Some("model overloaded".into()),
            target: None,
        });

        let state = store.snapshot();
        assert!(state.turns.iter().all(|t| t.kind != TurnKind::Status));
        assert!(!state.typing);
        assert_eq!(state.last_error.as_deref(), Some("model overloaded"));

        let error_turn = state.turns.last().unwrap();
        assert_eq!(error_turn.kind, TurnKind::Error);
        assert_eq!(error_turn.role, Role::Assistant);

        // the partial turn was closed, not removed
        let partial = &state.turns[0];
        assert_eq!(partial.content, "partial ans");
        assert!(partial.finalized);

        // a later delta must open a brand-new turn
        asm.handle(&delta("retry"));
        assert_eq!(store.snapshot().turns.len(), 3);
    }

    #[test]
    fn error_role_derived_from_target() {
        let (mut asm, store) = setup(false);
        asm.handle(&ServerFrame::Error {
            message: Some("mic rejected".into()),
            target: Some("user".into()),
        });
        assert_eq!(store.snapshot().turns[0].role, Role::User);
    }

    #[test]
    fn service_message_carries_metadata() {
        let (mut asm, store) = setup(false);
        asm.handle(&ServerFrame::ServiceMessage {
            content: Some("Quota nearly used up".into()),
            message_type: Some("quota".into()),
            localized: true,
            target: None,
        });

        let state = store.snapshot();
        let turn = &state.turns[0];
        assert_eq!(turn.kind, TurnKind::Error);
        assert_eq!(
            turn.metadata.get("messageType").and_then(|v| v.as_str()),
            Some("quota")
        );
        assert_eq!(
            turn.metadata.get("localized").and_then(|v| v.as_bool()),
            Some(true)
        );
    }

    // ---- Reset -------------------------------------------------------------

    #[test]
    fn reset_forgets_open_turn() {
        let (mut asm, store) = setup(false);
        asm.handle(&delta("abc"));
        asm.reset();
        asm.handle(&delta("def"));

        let state = store.snapshot();
        assert_eq!(state.turns.len(), 2);
        assert_eq!(state.turns[1].content, "def");
    }

    #[test]
    fn delta_survives_conversation_clear_mid_stream() {
        let (mut asm, store) = setup(false);
        asm.handle(&delta("abc"));
        store.clear_turns();
        asm.handle(&delta("def"));

        let state = store.snapshot();
        assert_eq!(state.turns.len(), 1);
        assert_eq!(state.turns[0].content, "def");
    }
}
