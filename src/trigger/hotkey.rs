//! Global hotkeys

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use global_hotkey::hotkey::{Code, HotKey, Modifiers};
use global_hotkey::{GlobalHotKeyEvent, GlobalHotKeyManager, HotKeyState};
use tokio::sync::mpsc;

use super::TriggerEvent;
use crate::{Error, Result};

/// How often the listener thread checks for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Parse a shortcut such as `Shift+Meta+Space`
///
/// # Errors
///
/// Returns `Error::Config` for unknown keys, a missing key, or more than one
/// non-modifier key
pub fn parse_shortcut(s: &str) -> Result<HotKey> {
    let mut modifiers = Modifiers::empty();
    let mut code: Option<Code> = None;

    for token in s.split('+').map(str::trim) {
        match token.to_lowercase().as_str() {
            "ctrl" | "control" => modifiers |= Modifiers::CONTROL,
            "alt" | "option" => modifiers |= Modifiers::ALT,
            "shift" => modifiers |= Modifiers::SHIFT,
            "super" | "win" | "meta" | "cmd" => modifiers |= Modifiers::SUPER,
            _ => {
                if code.is_some() {
                    return Err(Error::Config(format!("multiple keys in shortcut: {s:?}")));
                }
                code = Some(parse_key_code(token)?);
            }
        }
    }

    let code = code.ok_or_else(|| Error::Config(format!("no key in shortcut: {s:?}")))?;
    let modifiers = (!modifiers.is_empty()).then_some(modifiers);
    Ok(HotKey::new(modifiers, code))
}

fn parse_key_code(token: &str) -> Result<Code> {
    let lower = token.to_lowercase();
    let named = match lower.as_str() {
        "space" => Some(Code::Space),
        "enter" | "return" => Some(Code::Enter),
        "tab" => Some(Code::Tab),
        "escape" | "esc" => Some(Code::Escape),
        "backspace" => Some(Code::Backspace),
        "delete" | "del" => Some(Code::Delete),
        "insert" | "ins" => Some(Code::Insert),
        "home" => Some(Code::Home),
        "end" => Some(Code::End),
        "pageup" => Some(Code::PageUp),
        "pagedown" => Some(Code::PageDown),
        "up" => Some(Code::ArrowUp),
        "down" => Some(Code::ArrowDown),
        "left" => Some(Code::ArrowLeft),
        "right" => Some(Code::ArrowRight),
        _ => None,
    };
    if let Some(code) = named {
        return Ok(code);
    }

    // Letters, digits and function keys use their W3C code names
    let mut chars = token.chars();
    let w3c = match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_alphabetic() => format!("Key{}", c.to_ascii_uppercase()),
        (Some(c), None) if c.is_ascii_digit() => format!("Digit{c}"),
        (Some('f' | 'F'), Some(_)) if lower[1..].chars().all(|c| c.is_ascii_digit()) => lower.to_uppercase(),
        _ => return Err(Error::Config(format!("unknown key: {token:?}"))),
    };
    Code::from_str(&w3c).map_err(|_| Error::Config(format!("unknown key: {token:?}")))
}

/// Maps raw hotkey events to trigger events
#[derive(Debug, Clone, Copy)]
pub struct HotkeyMap {
    start: u32,
    stop: u32,
}

impl HotkeyMap {
    #[must_use]
    pub fn new(start: &HotKey, stop: &HotKey) -> Self {
        Self {
            start: start.id(),
            stop: stop.id(),
        }
    }

    /// Key presses of a registered hotkey; releases are ignored
    #[must_use]
    pub fn classify(&self, id: u32, state: HotKeyState) -> Option<TriggerEvent> {
        if state != HotKeyState::Pressed {
            return None;
        }
        if id == self.start {
            Some(TriggerEvent::HotkeyStart)
        } else if id == self.stop {
            Some(TriggerEvent::HotkeyStop)
        } else {
            None
        }
    }
}

/// Registered start and stop hotkeys
///
/// The manager lives on its own thread and unregisters when this is dropped.
pub struct HotkeyListener {
    running: Arc<AtomicBool>,
}

impl HotkeyListener {
    /// Register both shortcuts and forward presses to `events`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid shortcut, or
    /// `Error::ConfigurationWarning` when the platform refuses registration
    pub fn spawn(start: &str, stop: &str, events: mpsc::Sender<TriggerEvent>) -> Result<Self> {
        let start = parse_shortcut(start)?;
        let stop = parse_shortcut(stop)?;
        let map = HotkeyMap::new(&start, &stop);

        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("hark-hotkeys".to_string())
            .spawn(move || {
                let manager = match register(&[start, stop]) {
                    Ok(manager) => {
                        let _ = ready_tx.send(Ok(()));
                        manager
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                let receiver = GlobalHotKeyEvent::receiver();
                while thread_running.load(Ordering::Relaxed) {
                    let Ok(event) = receiver.recv_timeout(POLL_INTERVAL) else {
                        continue;
                    };
                    if let Some(trigger) = map.classify(event.id, event.state)
                        && events.blocking_send(trigger).is_err()
                    {
                        break;
                    }
                }

                let _ = manager.unregister_all(&[start, stop]);
                tracing::debug!("hotkeys unregistered");
            })
            .map_err(|e| Error::ConfigurationWarning(format!("failed to spawn hotkey thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| Error::ConfigurationWarning("hotkey thread exited during setup".to_string()))??;

        tracing::info!("global hotkeys registered");
        Ok(Self { running })
    }
}

impl Drop for HotkeyListener {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

fn register(hotkeys: &[HotKey]) -> Result<GlobalHotKeyManager> {
    let manager = GlobalHotKeyManager::new()
        .map_err(|e| Error::ConfigurationWarning(format!("hotkeys unavailable: {e}")))?;
    manager
        .register_all(hotkeys)
        .map_err(|e| Error::ConfigurationWarning(format!("failed to register hotkeys: {e}")))?;
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_default_start() {
        let hk = parse_shortcut("Shift+Meta+Space").unwrap();
        let expected = HotKey::new(Some(Modifiers::SHIFT | Modifiers::SUPER), Code::Space);
        assert_eq!(hk.id(), expected.id());
    }

    #[test]
    fn test_parse_letters_digits_and_function_keys() {
        assert_eq!(
            parse_shortcut("ctrl+alt+v").unwrap().id(),
            HotKey::new(Some(Modifiers::CONTROL | Modifiers::ALT), Code::KeyV).id()
        );
        assert_eq!(parse_shortcut("Alt+7").unwrap().id(), HotKey::new(Some(Modifiers::ALT), Code::Digit7).id());
        assert_eq!(parse_shortcut("F12").unwrap().id(), HotKey::new(None, Code::F12).id());
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_shortcut("Ctrl+Alt").is_err());
        assert!(parse_shortcut("Ctrl+Banana").is_err());
        assert!(parse_shortcut("Ctrl+A+B").is_err());
    }

    #[test]
    fn test_classify_presses_only() {
        let start = parse_shortcut("Shift+Meta+Space").unwrap();
        let stop = parse_shortcut("Escape").unwrap();
        let map = HotkeyMap::new(&start, &stop);

        assert_eq!(map.classify(start.id(), HotKeyState::Pressed), Some(TriggerEvent::HotkeyStart));
        assert_eq!(map.classify(stop.id(), HotKeyState::Pressed), Some(TriggerEvent::HotkeyStop));
        assert_eq!(map.classify(start.id(), HotKeyState::Released), None);
        assert_eq!(map.classify(0, HotKeyState::Pressed), None);
    }
}
