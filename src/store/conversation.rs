//! Conversation turns, UI flags and the observable store.
//!
//! The store is the only shared mutable state the widget exposes. Renderers
//! never hold references into it: they receive owned [`ConversationState`]
//! snapshots (via [`ConversationStore::snapshot`] or subscriber callbacks)
//! and re-render from those.
//!
//! Mutation and notification form one atomic step: [`ConversationStore::mutate`]
//! applies the closure, clones a snapshot and invokes every subscriber while
//! still holding the store lock, so no observer can see a half-applied update
//! and no two notifications interleave. Subscriber callbacks therefore must
//! not call back into the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;

use serde_json::Value;

// ---------------------------------------------------------------------------
// Role / TurnKind
// ---------------------------------------------------------------------------

/// Who a turn is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Lowercase wire/display name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    /// Role a server-side error or notification is attached to, derived from
    /// the frame's `target` field: `"user"` maps to the user column, anything
    /// else (including absent) to the assistant column.
    pub fn from_target(target: Option<&str>) -> Self {
        match target {
            Some("user") => Role::User,
            _ => Role::Assistant,
        }
    }
}

/// What kind of content a turn carries.
///
/// | Variant  | Produced by                                  |
/// |----------|----------------------------------------------|
/// | Text     | typed input, transcripts, assistant replies  |
/// | Status   | transient progress indicators ("thinking…")  |
/// | Error    | error frames and service notifications       |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    Text,
    Status,
    Error,
}

// ---------------------------------------------------------------------------
// Turn
// ---------------------------------------------------------------------------

/// One entry in the conversation transcript.
#[derive(Debug, Clone)]
pub struct Turn {
    /// Stable identity, assigned at creation.
    pub id: String,
    pub role: Role,
    pub kind: TurnKind,
    /// Display text. Grows in place while a turn is streaming.
    pub content: String,
    pub created_at: SystemTime,
    /// Free-form annotations (`target`, `status`, `messageType`, …).
    pub metadata: HashMap<String, Value>,
    /// A finalized turn no longer accepts streaming updates.
    pub finalized: bool,
}

impl Turn {
    pub fn new(role: Role, kind: TurnKind, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            kind,
            content: content.into(),
            created_at: SystemTime::now(),
            metadata: HashMap::new(),
            finalized: false,
        }
    }

    /// Builder-style metadata insertion for freshly constructed turns.
    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// The `target` annotation, when present (status/error turns carry it).
    pub fn target(&self) -> Option<&str> {
        self.metadata.get("target").and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// ConversationState
// ---------------------------------------------------------------------------

/// Snapshot of everything a renderer needs.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    /// Transcript in arrival order.
    pub turns: Vec<Turn>,
    /// Transport is open.
    pub connected: bool,
    /// A connect or reconnect attempt is in flight.
    pub connecting: bool,
    /// The assistant has an open streaming turn.
    pub typing: bool,
    /// Microphone capture is running.
    pub recording: bool,
    /// TTS audio is currently playing.
    pub speaking: bool,
    /// Inbound TTS audio is admitted and played.
    pub tts_enabled: bool,
    /// Most recent user-visible failure, cleared on the next connect.
    pub last_error: Option<String>,
}

impl ConversationState {
    /// Mutable handle to the turn with the given id, if still present.
    pub fn turn_mut(&mut self, id: &str) -> Option<&mut Turn> {
        self.turns.iter_mut().find(|t| t.id == id)
    }

    /// The newest turn matching `role` and `kind`, searched from the tail.
    pub fn last_turn_mut(&mut self, role: Role, kind: TurnKind) -> Option<&mut Turn> {
        self.turns
            .iter_mut()
            .rev()
            .find(|t| t.role == role && t.kind == kind)
    }

    /// The live status turn for `(role, target)`, if one exists. At most one
    /// such turn is ever present; the assembler upserts into it.
    pub fn status_turn_mut(&mut self, role: Role, target: Option<&str>) -> Option<&mut Turn> {
        self.turns
            .iter_mut()
            .find(|t| t.kind == TurnKind::Status && t.role == role && t.target() == target)
    }

    /// Remove every status turn (response settled, or an error superseded
    /// the progress indicators).
    pub fn prune_status_turns(&mut self) {
        self.turns.retain(|t| t.kind != TurnKind::Status);
    }
}

// ---------------------------------------------------------------------------
// ConversationStore
// ---------------------------------------------------------------------------

type SubscriberFn = Box<dyn Fn(&ConversationState) + Send>;

struct Inner {
    state: ConversationState,
    subscribers: HashMap<u64, SubscriberFn>,
    next_subscriber_id: u64,
}

/// Shared, observable conversation state.
///
/// Cheap to clone (all clones share one underlying store). See the module
/// docs for the mutation/notification contract.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<Mutex<Inner>>,
}

impl ConversationStore {
    pub fn new(tts_enabled: bool) -> Self {
        let state = ConversationState {
            tts_enabled,
            ..ConversationState::default()
        };
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state,
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            })),
        }
    }

    /// Owned copy of the current state.
    pub fn snapshot(&self) -> ConversationState {
        self.inner.lock().unwrap().state.clone()
    }

    /// Apply `f` to the state and notify every subscriber with the resulting
    /// snapshot. The whole step runs under the store lock.
    pub fn mutate<F>(&self, f: F)
    where
        F: FnOnce(&mut ConversationState),
    {
        let inner = &mut *self.inner.lock().unwrap();
        f(&mut inner.state);
        let snapshot = inner.state.clone();
        for subscriber in inner.subscribers.values() {
            subscriber(&snapshot);
        }
    }

    /// Register an observer. It fires immediately with the current state so
    /// late subscribers start consistent, then on every mutation until the
    /// returned handle is dropped or [`Subscription::unsubscribe`]d.
    pub fn subscribe(&self, callback: SubscriberFn) -> Subscription {
        let id = {
            let inner = &mut *self.inner.lock().unwrap();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            callback(&inner.state);
            inner.subscribers.insert(id, callback);
            id
        };
        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Drop every turn while keeping connection/audio flags intact.
    pub fn clear_turns(&self) {
        self.mutate(|state| {
            state.turns.clear();
            state.typing = false;
        });
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// RAII handle for a registered observer. Dropping it (or calling
/// [`unsubscribe`](Self::unsubscribe)) deregisters the callback.
pub struct Subscription {
    store: Weak<Mutex<Inner>>,
    id: u64,
}

impl Subscription {
    /// Explicitly deregister. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            inner.lock().unwrap().subscribers.remove(&self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
