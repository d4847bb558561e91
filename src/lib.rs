//! Hark - a voice interaction orchestrator
//!
//! Turns ambient audio into a conversation with a remote language model and
//! speaks the replies back, letting the model call user-defined tools inside
//! a capability-restricted sandbox.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  Triggers: wake phrase │ hotkeys │ UI commands        │
//! └───────────────────────┬──────────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────────┐
//! │  Daemon (state machine actor)                         │
//! │  capture → transcribe → generate ⇄ tools → speak      │
//! └───────────────────────┬──────────────────────────────┘
//!                         │
//! ┌───────────────────────▼──────────────────────────────┐
//! │  Local whisper │ cloud STT │ model transports │ TTS   │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod session;
pub mod speaker;
pub mod state;
pub mod tools;
pub mod transcription;
pub mod trigger;
pub mod voice;

pub use config::Config;
pub use daemon::{Daemon, DaemonHandle};
pub use error::{Error, Result};
