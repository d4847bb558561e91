//! The processing stage of one turn
//!
//! Transcribe, filter control phrases, then generate with the model and run
//! any tools it calls until it produces a final reply.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::events::UiEvent;
use crate::session::{MessageDelta, SessionManager, TurnOutcome};
use crate::tools::{LoopGuard, LoopVerdict, SecureExecutor, StopReason};
use crate::transcription::TranscriptionService;
use crate::voice::Utterance;
use crate::{Error, Result};

/// What a turn starts from
#[derive(Debug)]
pub enum TurnInput {
    Speech(Utterance),
    Text(String),
}

/// How the processing stage ended
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Reply {
        text: String,
        /// Speech produced by the model itself
        audio: Vec<f32>,
        /// Set when the loop guard cut the tool loop short
        stopped: Option<StopReason>,
        extend: bool,
    },
    /// Empty transcript, or only the keep-listening phrase
    NothingToSay { extend: bool },
    StopPhrase,
}

/// Result of matching control phrases in a transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhraseMatch {
    Stop,
    /// Keep listening; `remainder` is what else was said
    Extend { remainder: String },
    None,
}

/// Stop and keep-listening phrase matcher
#[derive(Debug, Clone)]
pub struct PhraseFilter {
    stop: String,
    extend: String,
}

impl PhraseFilter {
    #[must_use]
    pub fn new(stop: &str, extend: &str) -> Self {
        Self {
            stop: normalize(stop),
            extend: normalize(extend),
        }
    }

    /// Match on whole words, ignoring case and punctuation
    #[must_use]
    pub fn classify(&self, transcript: &str) -> PhraseMatch {
        let text = normalize(transcript);
        if contains_phrase(&text, &self.stop) {
            return PhraseMatch::Stop;
        }
        if contains_phrase(&text, &self.extend) {
            let padded = format!(" {text} ");
            let remainder = padded.replacen(&format!(" {} ", self.extend), " ", 1);
            return PhraseMatch::Extend {
                remainder: remainder.trim().to_string(),
            };
        }
        PhraseMatch::None
    }
}

fn contains_phrase(text: &str, phrase: &str) -> bool {
    !phrase.is_empty() && format!(" {text} ").contains(&format!(" {phrase} "))
}

/// Lowercase, punctuation to spaces, single-spaced
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Processing stage collaborators
pub struct Pipeline {
    transcription: Arc<TranscriptionService>,
    executor: Arc<SecureExecutor>,
    phrases: PhraseFilter,
    max_tool_rounds: usize,
    ui: broadcast::Sender<UiEvent>,
}

impl Pipeline {
    #[must_use]
    pub fn new(
        transcription: Arc<TranscriptionService>,
        executor: Arc<SecureExecutor>,
        phrases: PhraseFilter,
        max_tool_rounds: usize,
        ui: broadcast::Sender<UiEvent>,
    ) -> Self {
        Self {
            transcription,
            executor,
            phrases,
            max_tool_rounds,
            ui,
        }
    }

    fn emit(&self, event: UiEvent) {
        let _ = self.ui.send(event);
    }

    /// Run the processing stage for one input
    ///
    /// # Errors
    ///
    /// Returns `Error::Transcription` or `Error::Stream` when a stage fails,
    /// or `Error::Cancelled` when `cancel` fires. Tool failures are not
    /// errors; they are reported to the model.
    pub async fn run(
        &self,
        input: TurnInput,
        session: &mut SessionManager,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let (text, utterance) = match input {
            TurnInput::Text(text) => (text.trim().to_string(), None),
            TurnInput::Speech(utterance) => {
                let result = self.transcription.transcribe(&utterance, cancel).await?;
                (result.text, Some(utterance))
            }
        };

        if text.is_empty() {
            tracing::info!("empty transcript, nothing to send");
            return Ok(PipelineOutcome::NothingToSay { extend: false });
        }
        self.emit(UiEvent::Transcript {
            text: text.clone(),
            is_final: true,
        });

        let (user_text, audio, extend) = match self.phrases.classify(&text) {
            PhraseMatch::Stop => {
                tracing::info!("stop phrase heard");
                return Ok(PipelineOutcome::StopPhrase);
            }
            PhraseMatch::Extend { remainder } if remainder.is_empty() => {
                return Ok(PipelineOutcome::NothingToSay { extend: true });
            }
            // The recorded audio still contains the phrase, so only text is sent
            PhraseMatch::Extend { remainder } => (remainder, None, true),
            PhraseMatch::None => (text, utterance.map(|u| u.samples), false),
        };

        self.generate(&user_text, audio.as_deref(), extend, session, cancel)
            .await
    }

    async fn generate(
        &self,
        user_text: &str,
        audio: Option<&[f32]>,
        extend: bool,
        session: &mut SessionManager,
        cancel: &CancellationToken,
    ) -> Result<PipelineOutcome> {
        let (deltas, forwarded) = self.forward_deltas();
        let mut guard = LoopGuard::new(self.max_tool_rounds);
        let mut spoken: Vec<String> = Vec::new();

        let mut outcome = session.send(user_text, audio, &deltas, cancel).await;
        let result = loop {
            match outcome {
                Ok(TurnOutcome::Completed { text, audio, .. }) => {
                    spoken.push(text);
                    break Ok((audio, None));
                }
                Ok(TurnOutcome::ToolCalls { text, calls, .. }) => {
                    spoken.push(text);
                    if let Some(reason) = self.run_tools(&mut guard, &calls, session, cancel).await? {
                        session.close_open_tool_calls();
                        break Ok((Vec::new(), Some(reason)));
                    }
                    outcome = session.resume(&deltas, cancel).await;
                }
                Err(e) => {
                    if matches!(e, Error::Cancelled) {
                        session.close_open_tool_calls();
                    }
                    break Err(e);
                }
            }
        };

        drop(deltas);
        let _ = forwarded.await;
        let (audio, stopped) = result?;

        let text = spoken
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if let Some(reason) = &stopped {
            tracing::warn!(reason = %reason, "tool loop stopped");
            self.emit(UiEvent::Warning {
                reason: format!("Stopped repeating tool calls: {reason}"),
            });
        }
        self.emit(UiEvent::AssistantFinal {
            text: text.clone(),
            truncated: false,
        });

        Ok(PipelineOutcome::Reply {
            text,
            audio,
            stopped,
            extend,
        })
    }

    /// Execute one round of calls, appending a result for each
    ///
    /// Returns the guard's reason when the turn must stop.
    async fn run_tools(
        &self,
        guard: &mut LoopGuard,
        calls: &[crate::session::ToolCall],
        session: &mut SessionManager,
        cancel: &CancellationToken,
    ) -> Result<Option<StopReason>> {
        if let LoopVerdict::Stop(reason) = guard.begin_round() {
            return Ok(Some(reason));
        }

        for call in calls {
            if let LoopVerdict::Stop(reason) = guard.record(&call.name, &call.arguments) {
                return Ok(Some(reason));
            }

            let result = self.executor.execute_call(call, cancel).await;
            if cancel.is_cancelled() {
                session.close_open_tool_calls();
                return Err(Error::Cancelled);
            }

            self.emit(UiEvent::ToolResult {
                name: result.tool.clone(),
                ok: result.is_ok(),
                summary: result.summary(),
            });
            session.append_tool_result(&call.id, &result.payload())?;
        }
        Ok(None)
    }

    /// Relay streamed deltas to the UI until the sender is dropped
    fn forward_deltas(&self) -> (mpsc::UnboundedSender<MessageDelta>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ui = self.ui.clone();
        let handle = tokio::spawn(async move {
            let mut partial = String::new();
            while let Some(delta) = rx.recv().await {
                let event = match delta {
                    MessageDelta::Text(text) => {
                        partial.push_str(&text);
                        UiEvent::AssistantDelta { text }
                    }
                    MessageDelta::ToolCall(call) => UiEvent::ToolCall {
                        name: call.name,
                        invocation: call.arguments.to_string(),
                    },
                    // A dropped stream never reaches the final reply below
                    MessageDelta::Finished { truncated: true } if !partial.is_empty() => {
                        UiEvent::AssistantFinal {
                            text: std::mem::take(&mut partial),
                            truncated: true,
                        }
                    }
                    MessageDelta::Finished { .. } => {
                        partial.clear();
                        continue;
                    }
                    MessageDelta::Audio(_) => continue,
                };
                let _ = ui.send(event);
            }
        });
        (tx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> PhraseFilter {
        PhraseFilter::new("stop listening", "keep listening")
    }

    #[test]
    fn test_stop_phrase_ignores_case_and_punctuation() {
        assert_eq!(filter().classify("Stop listening."), PhraseMatch::Stop);
        assert_eq!(filter().classify("okay, STOP LISTENING!"), PhraseMatch::Stop);
    }

    #[test]
    fn test_stop_phrase_needs_whole_words() {
        assert_eq!(filter().classify("nonstop listening music"), PhraseMatch::None);
    }

    #[test]
    fn test_extend_phrase_is_stripped() {
        assert_eq!(
            filter().classify("Keep listening, what's the weather?"),
            PhraseMatch::Extend {
                remainder: "what's the weather".into()
            }
        );
        assert_eq!(
            filter().classify("keep listening"),
            PhraseMatch::Extend {
                remainder: String::new()
            }
        );
    }

    #[test]
    fn test_plain_text() {
        assert_eq!(filter().classify("buy oat milk"), PhraseMatch::None);
    }
}
