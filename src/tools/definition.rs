//! User-defined tool definitions

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{Error, Result};

/// A function the model may call, with its action body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments object
    #[serde(default = "empty_parameters")]
    pub parameters: Value,
    /// Body in the action language
    pub action: String,
}

fn empty_parameters() -> Value {
    json!({"type": "object", "properties": {}, "required": []})
}

impl ToolDefinition {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Option<Value>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: parameters.unwrap_or_else(empty_parameters),
            action: action.into(),
        }
    }

    /// Parse a JSON array of definitions
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the JSON is malformed, a name is invalid or
    /// duplicated, or a parameter schema is not an object
    pub fn parse_list(json: &str) -> Result<Vec<Self>> {
        let tools: Vec<Self> = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid functions JSON: {e}")))?;

        let mut names = HashSet::new();
        for tool in &tools {
            if !is_valid_name(&tool.name) {
                return Err(Error::Config(format!("invalid function name: {:?}", tool.name)));
            }
            if !names.insert(tool.name.as_str()) {
                return Err(Error::Config(format!("duplicate function name: {}", tool.name)));
            }
            if !tool.parameters.is_object() {
                return Err(Error::Config(format!(
                    "parameters of {} must be a JSON schema object",
                    tool.name
                )));
            }
        }

        tracing::debug!(count = tools.len(), "loaded function definitions");
        Ok(tools)
    }

    /// Tool entry for chat completions requests
    #[must_use]
    pub fn chat_tool_json(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }

    /// Tool entry for realtime `session.update`
    #[must_use]
    pub fn realtime_tool_json(&self) -> Value {
        json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_parameters_default() {
        let tools = ToolDefinition::parse_list(
            r#"[{"name": "now", "description": "Current time", "action": "return clock.now()"}]"#,
        )
        .unwrap();
        assert_eq!(tools[0].parameters["type"], "object");
        assert_eq!(tools[0].parameters["required"], json!([]));
    }

    #[test]
    fn test_duplicate_and_invalid_names_rejected() {
        let dup = r#"[{"name": "a", "action": "1"}, {"name": "a", "action": "2"}]"#;
        assert!(ToolDefinition::parse_list(dup).is_err());

        let bad = r#"[{"name": "rm -rf", "action": "1"}]"#;
        assert!(ToolDefinition::parse_list(bad).is_err());
    }

    #[test]
    fn test_wire_shapes() {
        let tool = ToolDefinition::new("save_note", "Save a note", None, "return args.text");
        let chat = tool.chat_tool_json();
        assert_eq!(chat["function"]["name"], "save_note");
        let realtime = tool.realtime_tool_json();
        assert_eq!(realtime["name"], "save_note");
        assert_eq!(realtime["type"], "function");
    }
}
