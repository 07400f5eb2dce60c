//! Observable conversation state.
//!
//! [`ConversationStore`] is the single source of truth the renderer reads.
//! All mutation goes through [`ConversationStore::mutate`], which notifies
//! every registered subscriber synchronously with a fresh snapshot before
//! the next mutation can begin.

pub mod conversation;

pub use conversation::{
    ConversationState, ConversationStore, Role, Subscription, Turn, TurnKind,
};
