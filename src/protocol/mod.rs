//! Session protocol: wire frames, authentication, streaming assembly and
//! the connection lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SessionClient                          │
//! │                                                             │
//! │   connect()                                                 │
//! │      │                                                      │
//! │      ▼                                                      │
//! │  ┌────────┐  site token   ┌───────────┐  credential + opts  │
//! │  │ auth   │──────────────▶│ WebSocket │────────────────────▶│
//! │  └────────┘   (reqwest)   └─────┬─────┘  (query params)     │
//! │                                 │                           │
//! │              inbound frames     ▼        outbound frames    │
//! │          ┌──────────────┬──────────────┬────────────┐       │
//! │          │ TurnAssembler│ PlaybackSink │ reconnect  │       │
//! │          │ (JSON turns) │ (TTS audio)  │ scheduler  │       │
//! │          └──────────────┴──────────────┴────────────┘       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod assembler;
pub mod auth;
pub mod client;
pub mod frames;

// ── Public re-exports ──────────────────────────────────────────────────────

pub use assembler::TurnAssembler;
pub use auth::{AuthClient, AuthError};
pub use client::{
    ConnectionState, PlaybackSink, ReconnectPolicy, SendError, SessionClient, SessionError,
    SessionOptions, CLOSE_AUTH_EXPIRED, CLOSE_NORMAL,
};
pub use frames::{ClientFrame, ServerFrame};
