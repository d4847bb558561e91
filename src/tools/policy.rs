//! Capability policy for tool bodies
//!
//! Every call namespace in the action language maps to exactly one
//! capability. A body may only call namespaces whose capability is granted.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A host facility a tool body can be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Clipboard,
    Keyboard,
    Notify,
    /// Time and platform information
    Clock,
    Log,
    Network,
    FileRead,
    Process,
}

impl Capability {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clipboard => "clipboard",
            Self::Keyboard => "keyboard",
            Self::Notify => "notify",
            Self::Clock => "clock",
            Self::Log => "log",
            Self::Network => "network",
            Self::FileRead => "file_read",
            Self::Process => "process",
        }
    }

    /// Capability required by a call namespace
    #[must_use]
    pub fn for_namespace(namespace: &str) -> Option<Self> {
        match namespace {
            "clipboard" => Some(Self::Clipboard),
            "keyboard" => Some(Self::Keyboard),
            "notify" => Some(Self::Notify),
            "clock" | "system" => Some(Self::Clock),
            "log" => Some(Self::Log),
            "net" => Some(Self::Network),
            "fs" => Some(Self::FileRead),
            "process" => Some(Self::Process),
            _ => None,
        }
    }

    /// Functions available in a namespace
    #[must_use]
    pub const fn functions(namespace: &str) -> &'static [&'static str] {
        match namespace.as_bytes() {
            b"clipboard" => &["get", "set"],
            b"keyboard" => &["paste", "type"],
            b"notify" => &["show"],
            b"clock" => &["now", "sleep"],
            b"system" => &["info"],
            b"log" => &["info"],
            b"net" => &["get"],
            b"fs" => &["read"],
            b"process" => &["run"],
            _ => &[],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "clipboard" => Ok(Self::Clipboard),
            "keyboard" => Ok(Self::Keyboard),
            "notify" => Ok(Self::Notify),
            "clock" => Ok(Self::Clock),
            "log" => Ok(Self::Log),
            "network" | "net" => Ok(Self::Network),
            "file_read" | "fs" => Ok(Self::FileRead),
            "process" => Ok(Self::Process),
            other => Err(Error::Config(format!("unknown capability: {other}"))),
        }
    }
}

/// Granted capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Desktop automation without network, file or process access
    #[must_use]
    pub fn desktop_default() -> Self {
        [
            Capability::Clipboard,
            Capability::Keyboard,
            Capability::Notify,
            Capability::Clock,
            Capability::Log,
        ]
        .into_iter()
        .collect()
    }

    #[must_use]
    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn insert(&mut self, capability: Capability) {
        self.0.insert(capability);
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Where tool bodies run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxTier {
    /// Interpreter on a blocking worker thread
    #[default]
    InProcess,
    /// Interpreter in a child process with no shared memory
    Process,
}

impl FromStr for SandboxTier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "in_process" | "inprocess" => Ok(Self::InProcess),
            "process" => Ok(Self::Process),
            other => Err(Error::Config(format!("unknown sandbox tier: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desktop_default_excludes_dangerous() {
        let caps = CapabilitySet::desktop_default();
        assert!(caps.contains(Capability::Clipboard));
        assert!(caps.contains(Capability::Log));
        assert!(!caps.contains(Capability::Network));
        assert!(!caps.contains(Capability::FileRead));
        assert!(!caps.contains(Capability::Process));
    }

    #[test]
    fn test_namespace_mapping() {
        assert_eq!(Capability::for_namespace("system"), Some(Capability::Clock));
        assert_eq!(Capability::for_namespace("fs"), Some(Capability::FileRead));
        assert_eq!(Capability::for_namespace("os"), None);
        assert!(Capability::functions("keyboard").contains(&"paste"));
        assert!(Capability::functions("os").is_empty());
    }

    #[test]
    fn test_json_round_trip() {
        let caps: CapabilitySet = serde_json::from_str(r#"["file_read","log"]"#).unwrap();
        assert!(caps.contains(Capability::FileRead));
        assert_eq!(serde_json::to_string(&caps).unwrap(), r#"["log","file_read"]"#);
    }

    #[test]
    fn test_tier_parse() {
        assert_eq!("process".parse::<SandboxTier>().unwrap(), SandboxTier::Process);
        assert_eq!("in-process".parse::<SandboxTier>().unwrap(), SandboxTier::InProcess);
        assert!("vm".parse::<SandboxTier>().is_err());
    }
}
