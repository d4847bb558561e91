//! Host facilities reachable from tool bodies
//!
//! The interpreter never touches the desktop directly: every side effect
//! goes through a [`Host`], so tests can substitute an in-memory one.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Upper bound on text returned by `net.get`, `fs.read` and `process.run`
pub const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Longest a `process.run` child may live, whatever the tool budget
pub const MAX_PROCESS_TIME: Duration = Duration::from_secs(30);

const PROCESS_POLL: Duration = Duration::from_millis(10);

/// Side effects available to tool bodies, one method per call
pub trait Host: Send + Sync {
    /// Replace clipboard contents
    fn clipboard_set(&self, text: &str) -> Result<()>;

    fn clipboard_get(&self) -> Result<String>;

    /// Insert text into the focused application through the clipboard
    fn keyboard_paste(&self, text: &str) -> Result<()>;

    /// Type text key by key into the focused application
    fn keyboard_type(&self, text: &str) -> Result<()>;

    /// Show a desktop notification
    fn notify(&self, title: &str, body: &str) -> Result<()>;

    fn http_get(&self, url: &str) -> Result<String>;

    fn read_file(&self, path: &str) -> Result<String>;

    /// Run a program without a shell and return its stdout
    ///
    /// The program is killed once `timeout` passes.
    fn run_process(&self, program: &str, args: &[String], timeout: Duration) -> Result<String>;
}

/// Host backed by the real desktop
#[derive(Debug, Default)]
pub struct DesktopHost {
    /// Kills running child programs when fired
    cancel: CancellationToken,
}

impl DesktopHost {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_cancel(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

fn clipboard() -> Result<arboard::Clipboard> {
    arboard::Clipboard::new().map_err(|e| Error::Tool(format!("clipboard unavailable: {e}")))
}

fn keyboard() -> Result<enigo::Enigo> {
    enigo::Enigo::new(&enigo::Settings::default())
        .map_err(|e| Error::Tool(format!("keyboard unavailable: {e}")))
}

/// Read at most [`MAX_OUTPUT_BYTES`], then discard the rest so the writer
/// never blocks on a full pipe
fn read_capped(mut reader: impl Read) -> String {
    let mut bytes = Vec::new();
    let _ = (&mut reader).take(MAX_OUTPUT_BYTES as u64).read_to_end(&mut bytes);
    let _ = std::io::copy(&mut reader, &mut std::io::sink());
    truncate(String::from_utf8_lossy(&bytes).into_owned())
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<String>> {
    pipe.map(|pipe| std::thread::spawn(move || read_capped(pipe)))
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader.and_then(|r| r.join().ok()).unwrap_or_default()
}

fn kill(child: &mut Child, program: &str) {
    if let Err(e) = child.kill() {
        tracing::debug!(program, error = %e, "kill failed");
    }
    let _ = child.wait();
}

fn truncate(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_BYTES {
        let mut cut = MAX_OUTPUT_BYTES;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

impl Host for DesktopHost {
    fn clipboard_set(&self, text: &str) -> Result<()> {
        clipboard()?
            .set_text(text.to_string())
            .map_err(|e| Error::Tool(format!("clipboard write failed: {e}")))
    }

    fn clipboard_get(&self) -> Result<String> {
        clipboard()?
            .get_text()
            .map_err(|e| Error::Tool(format!("clipboard read failed: {e}")))
    }

    fn keyboard_paste(&self, text: &str) -> Result<()> {
        use enigo::{Direction, Key, Keyboard};

        self.clipboard_set(text)?;
        // Give the clipboard owner a moment before the paste shortcut reads it
        std::thread::sleep(Duration::from_millis(50));

        let modifier = if cfg!(target_os = "macos") {
            Key::Meta
        } else {
            Key::Control
        };
        let mut enigo = keyboard()?;
        let press = |enigo: &mut enigo::Enigo, key, direction| {
            enigo
                .key(key, direction)
                .map_err(|e| Error::Tool(format!("key event failed: {e}")))
        };
        press(&mut enigo, modifier, Direction::Press)?;
        let pasted = press(&mut enigo, Key::Unicode('v'), Direction::Click);
        press(&mut enigo, modifier, Direction::Release)?;
        pasted
    }

    fn keyboard_type(&self, text: &str) -> Result<()> {
        use enigo::Keyboard;

        keyboard()?
            .text(text)
            .map_err(|e| Error::Tool(format!("typing failed: {e}")))
    }

    fn notify(&self, title: &str, body: &str) -> Result<()> {
        let status = if cfg!(target_os = "macos") {
            let script = format!(
                "display notification {} with title {}",
                applescript_quote(body),
                applescript_quote(title)
            );
            Command::new("osascript").args(["-e", &script]).status()
        } else {
            Command::new("notify-send").args([title, body]).status()
        };

        match status {
            Ok(s) if s.success() => Ok(()),
            Ok(s) => Err(Error::Tool(format!("notification command exited with {s}"))),
            Err(e) => Err(Error::Tool(format!("notifications unavailable: {e}"))),
        }
    }

    fn http_get(&self, url: &str) -> Result<String> {
        let parsed = url::Url::parse(url).map_err(|e| Error::Tool(format!("invalid url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::Tool(format!("unsupported scheme: {}", parsed.scheme())));
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        let response = client.get(parsed).send()?.error_for_status()?;

        let mut body = String::new();
        response
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_string(&mut body)?;
        Ok(body)
    }

    fn read_file(&self, path: &str) -> Result<String> {
        let mut bytes = Vec::new();
        std::fs::File::open(path)?
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut bytes)?;
        Ok(truncate(String::from_utf8_lossy(&bytes).into_owned()))
    }

    fn run_process(&self, program: &str, args: &[String], timeout: Duration) -> Result<String> {
        let timeout = timeout.min(MAX_PROCESS_TIME);
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if self.cancel.is_cancelled() {
                kill(&mut child, program);
                return Err(Error::Cancelled);
            }
            if Instant::now() >= deadline {
                tracing::debug!(program, timeout = ?timeout, "killing program");
                kill(&mut child, program);
                return Err(Error::Timeout(timeout));
            }
            std::thread::sleep(PROCESS_POLL);
        };

        let stdout = collect(stdout);
        if !status.success() {
            return Err(Error::Tool(format!(
                "{program} exited with {status}: {}",
                collect(stderr).trim()
            )));
        }
        Ok(stdout)
    }
}

fn applescript_quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_respects_char_boundary() {
        let text = "é".repeat(MAX_OUTPUT_BYTES);
        let cut = truncate(text);
        assert!(cut.len() <= MAX_OUTPUT_BYTES);
        assert!(cut.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_applescript_quote() {
        assert_eq!(applescript_quote(r#"say "hi""#), r#""say \"hi\"""#);
    }

    #[test]
    fn test_http_get_rejects_file_scheme() {
        let err = DesktopHost::new().http_get("file:///etc/passwd").unwrap_err();
        assert!(matches!(err, Error::Tool(m) if m.contains("scheme")));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_process_captures_stdout() {
        let out = DesktopHost::new()
            .run_process("echo", &["hello".to_string()], Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_process_killed_at_deadline() {
        let started = Instant::now();
        let err = DesktopHost::new()
            .run_process("sleep", &["30".to_string()], Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_process_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let host = DesktopHost::with_cancel(cancel.clone());
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            cancel.cancel();
        });

        let err = host
            .run_process("sleep", &["30".to_string()], Duration::from_secs(20))
            .unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, Error::Cancelled));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_read_file_stops_at_cap() {
        let text = DesktopHost::new().read_file("/dev/zero").unwrap();
        assert_eq!(text.len(), MAX_OUTPUT_BYTES);
    }
}
