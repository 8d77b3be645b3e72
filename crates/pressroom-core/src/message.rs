use crate::types::AgentRole;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Envelope for a message sent from one agent to another.
///
/// A plain value object: two messages with the same fields are the same
/// message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    /// Sending role.
    pub source: AgentRole,
    /// Receiving role.
    pub target: AgentRole,
    /// What the target is asked to do, e.g. `rewrite`.
    pub action: String,
    /// Action arguments.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Where the target should deliver its reply, if anywhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

impl AgentMessage {
    /// A message with empty data and no callback.
    pub fn new(source: AgentRole, target: AgentRole, action: impl Into<String>) -> Self {
        Self {
            source,
            target,
            action: action.into(),
            data: Map::new(),
            callback: None,
        }
    }

    /// Replace the action arguments.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Ask for the reply to go to `callback`.
    pub fn with_callback(mut self, callback: impl Into<String>) -> Self {
        self.callback = Some(callback.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_builder() {
        let mut data = Map::new();
        data.insert("keyword".into(), json!("elden ring dlc"));
        let msg = AgentMessage::new(AgentRole::ContentRouter, AgentRole::Rewriter, "rewrite")
            .with_data(data)
            .with_callback("communication");

        assert_eq!(msg.action, "rewrite");
        assert_eq!(msg.data["keyword"], json!("elden ring dlc"));
        assert_eq!(msg.callback.as_deref(), Some("communication"));
    }

    #[test]
    fn test_message_omits_empty_callback() {
        let msg = AgentMessage::new(AgentRole::Copywriter, AgentRole::MetadataGenerator, "tag");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("callback").is_none());
        assert_eq!(json["source"], "copywriter");
        assert_eq!(json["target"], "metadata_generator");
    }
}
