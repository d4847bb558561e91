//! Trigger sources: wake phrase and global hotkeys
//!
//! Triggers only report what happened. Whether a trigger starts, restarts
//! or is ignored is decided by the daemon from the current status.

mod hotkey;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

pub use hotkey::{HotkeyListener, HotkeyMap, parse_shortcut};

use crate::config::{ApiKeys, TriggerConfig};
use crate::transcription::{CloudSpeechEngine, SpeechEngine};
use crate::voice::{FrameSource, WakeDetection, WakeWordEngine};
use crate::{Error, Result};

/// Model used to verify wake phrase candidates
const WAKE_VERIFY_MODEL: &str = "whisper-1";

/// Something that asks to start or stop listening
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    WakePhrase(WakeDetection),
    HotkeyStart,
    HotkeyStop,
}

/// Build the wake phrase engine, or `None` when it is disabled
///
/// On a warning the caller continues with hotkeys only.
///
/// # Errors
///
/// Returns `ConfigurationWarning` for a missing credential or an empty
/// phrase list
pub fn wake_engine(trigger: &TriggerConfig, keys: &ApiKeys) -> Result<Option<WakeWordEngine>> {
    if !trigger.wake_word_enabled {
        return Ok(None);
    }

    let verifier: Option<Arc<dyn SpeechEngine>> = match &keys.wake_word {
        Some(key) => Some(Arc::new(CloudSpeechEngine::new_whisper(
            key.clone(),
            WAKE_VERIFY_MODEL.to_string(),
        )?)),
        None => None,
    };

    let engine = WakeWordEngine::new(trigger.wake_words.clone(), verifier)?;
    tracing::info!(words = ?trigger.wake_words, "wake phrase detection enabled");
    Ok(Some(engine))
}

/// Wait for the wake phrase on `source`
///
/// Returns `None` when cancelled or when the source ends.
///
/// # Errors
///
/// Returns the source's device error
pub async fn wait_for_wake(
    engine: &mut WakeWordEngine,
    source: &mut dyn FrameSource,
    cancel: &CancellationToken,
) -> Result<Option<TriggerEvent>> {
    match engine.listen(source, cancel).await {
        Ok(Some(detection)) => {
            tracing::info!(keyword = %detection.keyword_id, "wake phrase detected");
            Ok(Some(TriggerEvent::WakePhrase(detection)))
        }
        Ok(None) => Ok(None),
        Err(Error::Cancelled) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_wake_word_is_not_an_error() {
        let trigger = TriggerConfig::default();
        assert!(wake_engine(&trigger, &ApiKeys::default()).unwrap().is_none());
    }

    #[test]
    fn test_missing_credential_degrades_with_warning() {
        let trigger = TriggerConfig {
            wake_word_enabled: true,
            ..TriggerConfig::default()
        };
        let err = wake_engine(&trigger, &ApiKeys::default()).err().unwrap();
        assert!(matches!(err, Error::ConfigurationWarning(_)));
    }
}
