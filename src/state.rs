//! Session status transitions
//!
//! Pure and synchronous: the daemon feeds events in and acts on the
//! resulting transition. Events that do not apply to the current status are
//! logged and dropped, never queued.

use std::fmt;

/// What the assistant is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl Status {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Processing => "processing",
            Self::Speaking => "speaking",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that can move the status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Wake phrase detected
    WakeDetected,
    /// Start hotkey or UI start command
    StartRequested,
    /// Stop hotkey, Esc or UI cancel
    Cancel,
    UtteranceCaptured,
    /// Nothing was said within the wait window
    NoSpeech,
    /// Text typed into the UI
    TextSubmitted,
    /// Transcript was empty, or held only the keep-listening phrase
    NothingToSay,
    /// The stop phrase was heard
    StopPhrase,
    /// Reply finished generating
    ReplyReady { speak: bool },
    PlaybackFinished,
    /// User started talking over the assistant
    BargeIn,
    /// A stage failed; the error has been reported
    Failed,
}

impl Event {
    const fn name(self) -> &'static str {
        match self {
            Self::WakeDetected => "wake_detected",
            Self::StartRequested => "start_requested",
            Self::Cancel => "cancel",
            Self::UtteranceCaptured => "utterance_captured",
            Self::NoSpeech => "no_speech",
            Self::TextSubmitted => "text_submitted",
            Self::NothingToSay => "nothing_to_say",
            Self::StopPhrase => "stop_phrase",
            Self::ReplyReady { .. } => "reply_ready",
            Self::PlaybackFinished => "playback_finished",
            Self::BargeIn => "barge_in",
            Self::Failed => "failed",
        }
    }
}

/// Effect of applying an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved { from: Status, to: Status },
    /// Active work is cancelled and listening starts over
    Restarted { from: Status },
    Ignored,
}

/// The single owner of session status
#[derive(Debug, Clone)]
pub struct StateMachine {
    status: Status,
    extended: bool,
    extended_by_default: bool,
}

impl StateMachine {
    #[must_use]
    pub const fn new(extended_by_default: bool) -> Self {
        Self {
            status: Status::Idle,
            extended: extended_by_default,
            extended_by_default,
        }
    }

    #[must_use]
    pub const fn status(&self) -> Status {
        self.status
    }

    /// Whether finished turns go back to listening
    #[must_use]
    pub const fn is_extended(&self) -> bool {
        self.extended
    }

    /// Switch the current listening session to extended policy
    pub fn extend(&mut self) {
        if self.status != Status::Idle && !self.extended {
            tracing::info!("extended listening enabled");
            self.extended = true;
        }
    }

    /// Apply an event
    pub fn apply(&mut self, event: Event) -> Transition {
        use Status::{Idle, Listening, Processing, Speaking};

        let from = self.status;
        let after_turn = if self.extended { Listening } else { Idle };

        let to = match (from, event) {
            (Idle, Event::WakeDetected | Event::StartRequested) => Listening,
            (Listening | Processing | Speaking, Event::StartRequested) => {
                tracing::info!(from = %from, "restarting listening");
                self.status = Listening;
                return Transition::Restarted { from };
            }
            (Listening | Processing | Speaking, Event::Cancel | Event::Failed) => Idle,
            (Listening, Event::UtteranceCaptured) => Processing,
            (Processing, Event::StopPhrase) => Idle,
            (Idle, Event::TextSubmitted) => Processing,
            (Processing, Event::ReplyReady { speak: true }) => Speaking,
            (
                Processing,
                Event::NothingToSay | Event::ReplyReady { speak: false },
            )
            | (Listening, Event::NoSpeech)
            | (Speaking, Event::PlaybackFinished) => after_turn,
            (Speaking, Event::BargeIn) => Listening,
            _ => {
                tracing::debug!(status = %from, event = event.name(), "event ignored");
                return Transition::Ignored;
            }
        };

        self.status = to;
        if to == Idle {
            self.extended = self.extended_by_default;
        }
        tracing::debug!(from = %from, to = %to, event = event.name(), "status changed");
        Transition::Moved { from, to }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(false)
    }
}
