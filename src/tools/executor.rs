//! Secure executor for model-invoked tools
//!
//! Every call goes through the same gate: arguments are validated against
//! the parameter schema, the body is statically checked against the granted
//! capabilities, and only then is it run under a deadline. Failures are
//! turned into structured tool errors for the model, never raw error text.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio_util::sync::CancellationToken;

use super::definition::ToolDefinition;
use super::host::{DesktopHost, Host};
use super::policy::{CapabilitySet, SandboxTier};
use super::schema;
use super::script::Program;
use crate::config::SandboxConfig;
use crate::session::ToolCall;
use crate::{Error, Result};

/// Hidden subcommand that runs one request in a child process
pub const SANDBOX_SUBCOMMAND: &str = "sandbox-exec";

/// Extra time the parent allows a child for process startup
const PROCESS_STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Time an abandoned sandbox gets to stop its own programs before it is killed
const SANDBOX_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Credentials stripped from the child environment
const SECRET_ENV: &[&str] = &[
    "OPENAI_API_KEY",
    "DEEPGRAM_API_KEY",
    "ELEVENLABS_API_KEY",
    "HARK_WAKE_WORD_KEY",
];

/// Category of a failed tool execution, as reported to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    SandboxViolation,
    InvalidArguments,
    Timeout,
    Runtime,
    UnknownFunction,
    Cancelled,
}

/// Structured tool failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl From<&Error> for ToolError {
    fn from(err: &Error) -> Self {
        let (kind, message) = match err {
            Error::SandboxViolation(m) => (ToolErrorKind::SandboxViolation, m.clone()),
            Error::InvalidArguments(m) => (ToolErrorKind::InvalidArguments, m.clone()),
            Error::Timeout(budget) => (
                ToolErrorKind::Timeout,
                format!("execution exceeded {}ms", budget.as_millis()),
            ),
            Error::Cancelled => (ToolErrorKind::Cancelled, "execution was cancelled".to_string()),
            Error::Tool(m) => (ToolErrorKind::Runtime, m.clone()),
            other => (ToolErrorKind::Runtime, other.to_string()),
        };
        Self { kind, message }
    }
}

/// Outcome of one body run, in the shape sent to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolReply {
    Ok { result: Value },
    Error { error: ToolError },
}

impl From<Result<Value>> for ToolReply {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(result) => Self::Ok { result },
            Err(e) => Self::Error {
                error: ToolError::from(&e),
            },
        }
    }
}

/// Result of executing one tool call
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub call_id: String,
    pub tool: String,
    pub reply: ToolReply,
}

impl ExecutionResult {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        matches!(self.reply, ToolReply::Ok { .. })
    }

    /// JSON payload appended to the session as the tool message
    #[must_use]
    pub fn payload(&self) -> String {
        serde_json::to_value(&self.reply)
            .unwrap_or_else(|_| json!({"status": "error"}))
            .to_string()
    }

    /// Short human-readable form for the UI
    #[must_use]
    pub fn summary(&self) -> String {
        let text = match &self.reply {
            ToolReply::Ok {
                result: Value::String(s),
            } => s.clone(),
            ToolReply::Ok { result } => result.to_string(),
            ToolReply::Error { error } => {
                let kind = serde_json::to_value(error.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                format!("{kind}: {}", error.message)
            }
        };
        truncate_chars(&text, 200)
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Request handed to a sandbox child process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub definition: ToolDefinition,
    pub arguments: Value,
    pub capabilities: CapabilitySet,
    pub timeout_ms: u64,
}

/// Validate and run a request against a host
///
/// Used directly by the in-process tier and by the child process.
#[must_use]
pub fn run_request(request: &SandboxRequest, host: &dyn Host) -> ToolReply {
    let budget = Duration::from_millis(request.timeout_ms);
    prepare(&request.definition, &request.arguments, &request.capabilities)
        .and_then(|program| program.run(&request.arguments, host, budget))
        .into()
}

/// Schema validation followed by the static check
fn prepare(
    definition: &ToolDefinition,
    arguments: &Value,
    capabilities: &CapabilitySet,
) -> Result<Program> {
    if !arguments.is_object() {
        return Err(Error::InvalidArguments(
            "arguments must be a JSON object".to_string(),
        ));
    }
    schema::validate(&definition.parameters, arguments)?;
    Program::compile(&definition.action, capabilities)
}

/// Runs user-defined tools in a capability-restricted sandbox
pub struct SecureExecutor {
    tools: HashMap<String, ToolDefinition>,
    capabilities: CapabilitySet,
    tier: SandboxTier,
    timeout: Duration,
    host: Arc<dyn Host>,
    sandbox_program: Option<PathBuf>,
}

impl SecureExecutor {
    #[must_use]
    pub fn new(
        tools: Vec<ToolDefinition>,
        capabilities: CapabilitySet,
        tier: SandboxTier,
        timeout: Duration,
        host: Arc<dyn Host>,
    ) -> Self {
        Self {
            tools: tools.into_iter().map(|t| (t.name.clone(), t)).collect(),
            capabilities,
            tier,
            timeout,
            host,
            sandbox_program: None,
        }
    }

    /// Executor over the desktop host
    #[must_use]
    pub fn from_config(tools: Vec<ToolDefinition>, sandbox: &SandboxConfig) -> Self {
        Self::new(
            tools,
            sandbox.capabilities.clone(),
            sandbox.tier,
            sandbox.timeout,
            Arc::new(DesktopHost::new()),
        )
    }

    /// Binary spawned for the process tier; defaults to the current executable
    #[must_use]
    pub fn with_sandbox_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.sandbox_program = Some(program.into());
        self
    }

    #[must_use]
    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    /// Every tool, sorted by name
    #[must_use]
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    #[must_use]
    pub const fn tier(&self) -> SandboxTier {
        self.tier
    }

    /// Statically check every body, returning the ones that fail
    #[must_use]
    pub fn check_all(&self) -> Vec<(String, Error)> {
        let mut failures: Vec<(String, Error)> = self
            .tools
            .values()
            .filter_map(|tool| {
                Program::compile(&tool.action, &self.capabilities)
                    .err()
                    .map(|e| (tool.name.clone(), e))
            })
            .collect();
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        failures
    }

    /// Execute a call requested by the model
    pub async fn execute_call(&self, call: &ToolCall, cancel: &CancellationToken) -> ExecutionResult {
        let reply = match self.tools.get(&call.name) {
            Some(definition) => self.execute(definition, &call.arguments, cancel).await.into(),
            None => ToolReply::Error {
                error: ToolError {
                    kind: ToolErrorKind::UnknownFunction,
                    message: format!("no function named '{}'", call.name),
                },
            },
        };

        match &reply {
            ToolReply::Ok { .. } => tracing::info!(tool = %call.name, call_id = %call.id, "tool executed"),
            ToolReply::Error { error } => tracing::warn!(
                tool = %call.name,
                call_id = %call.id,
                kind = ?error.kind,
                message = %error.message,
                "tool execution refused or failed"
            ),
        }

        ExecutionResult {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            reply,
        }
    }

    /// Validate and run one tool body
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArguments` or `Error::SandboxViolation` without
    /// running the body, `Error::Timeout` when the budget is exceeded,
    /// `Error::Cancelled` when `cancel` fires, or `Error::Tool` on runtime
    /// failure
    pub async fn execute(
        &self,
        definition: &ToolDefinition,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let program = prepare(definition, arguments, &self.capabilities)?;
        tracing::debug!(tool = %definition.name, tier = ?self.tier, "running tool body");

        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = async {
                match self.tier {
                    SandboxTier::InProcess => self.run_in_process(program, arguments).await,
                    SandboxTier::Process => self.run_in_child(definition, arguments).await,
                }
            } => result,
        }
    }

    async fn run_in_process(&self, program: Program, arguments: &Value) -> Result<Value> {
        let host = Arc::clone(&self.host);
        let arguments = arguments.clone();
        let budget = self.timeout;

        let task = tokio::task::spawn_blocking(move || program.run(&arguments, host.as_ref(), budget));

        match tokio::time::timeout(budget, task).await {
            Err(_) => Err(Error::Timeout(budget)),
            Ok(Err(e)) => Err(Error::Tool(format!("tool body aborted: {e}"))),
            Ok(Ok(result)) => result,
        }
    }

    async fn run_in_child(&self, definition: &ToolDefinition, arguments: &Value) -> Result<Value> {
        let program = match &self.sandbox_program {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let request = SandboxRequest {
            definition: definition.clone(),
            arguments: arguments.clone(),
            capabilities: self.capabilities.clone(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        };
        let mut input = serde_json::to_vec(&request)?;
        input.push(b'\n');

        let mut command = tokio::process::Command::new(&program);
        command
            .arg(SANDBOX_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in SECRET_ENV {
            command.env_remove(key);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Tool(format!("failed to spawn sandbox {}: {e}", program.display()))
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut sandbox = SandboxChild {
            stdin: child.stdin.take(),
            child: Some(child),
        };

        // stdin stays open; closing it is how the child learns it was abandoned
        if let Some(stdin) = sandbox.stdin.as_mut() {
            stdin.write_all(&input).await?;
            stdin.flush().await?;
        }

        let child = sandbox
            .child
            .as_mut()
            .ok_or_else(|| Error::Tool("sandbox process missing".to_string()))?;
        let (status, stdout, stderr) = tokio::time::timeout(self.timeout + PROCESS_STARTUP_GRACE, async {
            tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        })
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(Error::Tool(format!(
                "sandbox exited with {status}: {}",
                stderr.trim()
            )));
        }

        match serde_json::from_slice::<ToolReply>(&stdout)? {
            ToolReply::Ok { result } => Ok(result),
            ToolReply::Error { error } => Err(match error.kind {
                ToolErrorKind::SandboxViolation => Error::SandboxViolation(error.message),
                ToolErrorKind::InvalidArguments => Error::InvalidArguments(error.message),
                ToolErrorKind::Timeout => Error::Timeout(self.timeout),
                ToolErrorKind::Cancelled => Error::Cancelled,
                ToolErrorKind::Runtime | ToolErrorKind::UnknownFunction => Error::Tool(error.message),
            }),
        }
    }
}

async fn read_pipe(pipe: Option<impl AsyncRead + Unpin>) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut bytes).await?;
    }
    Ok(bytes)
}

/// A running sandbox process
///
/// Dropping it closes the child's stdin so the sandbox can stop any program
/// it started, and kills the child if it is still running after
/// [`SANDBOX_EXIT_GRACE`].
struct SandboxChild {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
}

impl Drop for SandboxChild {
    fn drop(&mut self) {
        drop(self.stdin.take());
        let Some(mut child) = self.child.take() else {
            return;
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if tokio::time::timeout(SANDBOX_EXIT_GRACE, child.wait()).await.is_err() {
                        tracing::debug!("sandbox still running after stdin closed, killing it");
                        let _ = child.kill().await;
                    }
                });
            }
            Err(_) => {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Capability;

    #[test]
    fn test_reply_wire_shape() {
        let ok = ToolReply::from(Ok(json!("Note pasted!")));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"status": "ok", "result": "Note pasted!"})
        );

        let err = ToolReply::from(Err(Error::SandboxViolation("process not granted".into())));
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"status": "error", "error": {"kind": "sandbox_violation", "message": "process not granted"}})
        );
    }

    #[test]
    fn test_timeout_maps_to_kind() {
        let error = ToolError::from(&Error::Timeout(Duration::from_secs(10)));
        assert_eq!(error.kind, ToolErrorKind::Timeout);
        assert_eq!(error.message, "execution exceeded 10000ms");
    }

    #[test]
    fn test_prepare_rejects_non_object_arguments() {
        let def = ToolDefinition::new("t", "", None, "return 1");
        let err = prepare(&def, &json!("oops"), &CapabilitySet::desktop_default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArguments(_)));
    }

    #[test]
    fn test_summary_truncates() {
        let result = ExecutionResult {
            call_id: "c".into(),
            tool: "t".into(),
            reply: ToolReply::Ok {
                result: json!("x".repeat(500)),
            },
        };
        assert_eq!(result.summary().chars().count(), 203);
    }

    #[test]
    fn test_check_all_reports_ungranted() {
        let executor = SecureExecutor::new(
            vec![
                ToolDefinition::new("ok", "", None, "return clock.now()"),
                ToolDefinition::new("net", "", None, "return net.get('https://example.com')"),
            ],
            [Capability::Clock].into_iter().collect(),
            SandboxTier::InProcess,
            Duration::from_secs(1),
            Arc::new(DesktopHost::new()),
        );
        let failures = executor.check_all();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "net");
    }
}
