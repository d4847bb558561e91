//! Tool-call loop guard
//!
//! Stops a turn whose tool calls stop making progress: the same call
//! fingerprint repeating, or the model requesting more tool rounds than
//! allowed.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Identical calls tolerated before the turn is stopped
const REPEAT_LIMIT: usize = 3;

/// Why the guard ended a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// More tool rounds than `max_tool_rounds`
    RoundLimit(usize),
    /// The same call with the same arguments repeated
    RepeatedCall { name: String, count: usize },
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundLimit(limit) => write!(f, "tool round limit of {limit} reached"),
            Self::RepeatedCall { name, count } => {
                write!(f, "{name} called {count} times with identical arguments")
            }
        }
    }
}

/// Guard verdict after a round or call is recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopVerdict {
    Continue,
    /// Repetition seen but still under the limit
    Warning,
    Stop(StopReason),
}

/// Per-turn loop guard
#[derive(Debug)]
pub struct LoopGuard {
    max_rounds: usize,
    rounds: usize,
    seen: HashMap<[u8; 32], usize>,
}

impl LoopGuard {
    #[must_use]
    pub fn new(max_rounds: usize) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
            rounds: 0,
            seen: HashMap::new(),
        }
    }

    /// Count one more round of tool execution
    pub fn begin_round(&mut self) -> LoopVerdict {
        self.rounds += 1;
        if self.rounds > self.max_rounds {
            LoopVerdict::Stop(StopReason::RoundLimit(self.max_rounds))
        } else {
            LoopVerdict::Continue
        }
    }

    /// Record a call and check it against earlier calls this turn
    pub fn record(&mut self, name: &str, arguments: &Value) -> LoopVerdict {
        let count = self.seen.entry(fingerprint(name, arguments)).or_insert(0);
        *count += 1;

        match *count {
            n if n >= REPEAT_LIMIT => {
                tracing::warn!(tool = %name, count = n, "tool call loop detected");
                LoopVerdict::Stop(StopReason::RepeatedCall {
                    name: name.to_string(),
                    count: n,
                })
            }
            1 => LoopVerdict::Continue,
            n => {
                tracing::debug!(tool = %name, count = n, "repeated tool call");
                LoopVerdict::Warning
            }
        }
    }

    #[must_use]
    pub const fn rounds(&self) -> usize {
        self.rounds
    }
}

/// SHA-256 over the tool name and its canonical argument JSON
fn fingerprint(name: &str, arguments: &Value) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0]);
    hasher.update(arguments.to_string().as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_distinct_calls_continue() {
        let mut guard = LoopGuard::new(8);
        assert_eq!(guard.record("save_note", &json!({"text": "a"})), LoopVerdict::Continue);
        assert_eq!(guard.record("save_note", &json!({"text": "b"})), LoopVerdict::Continue);
        assert_eq!(guard.record("paste", &json!({"text": "a"})), LoopVerdict::Continue);
    }

    #[test]
    fn test_third_identical_call_stops() {
        let mut guard = LoopGuard::new(8);
        let args = json!({"text": "buy oat milk"});
        assert_eq!(guard.record("save_note", &args), LoopVerdict::Continue);
        assert_eq!(guard.record("save_note", &args), LoopVerdict::Warning);
        assert_eq!(
            guard.record("save_note", &args),
            LoopVerdict::Stop(StopReason::RepeatedCall {
                name: "save_note".into(),
                count: 3
            })
        );
    }

    #[test]
    fn test_argument_key_order_is_irrelevant() {
        let mut guard = LoopGuard::new(8);
        guard.record("t", &json!({"a": 1, "b": 2}));
        assert_eq!(guard.record("t", &json!({"b": 2, "a": 1})), LoopVerdict::Warning);
    }

    #[test]
    fn test_round_limit() {
        let mut guard = LoopGuard::new(2);
        assert_eq!(guard.begin_round(), LoopVerdict::Continue);
        assert_eq!(guard.begin_round(), LoopVerdict::Continue);
        assert_eq!(guard.begin_round(), LoopVerdict::Stop(StopReason::RoundLimit(2)));
        assert_eq!(guard.rounds(), 3);
    }
}
