use crate::{PressroomError, PressroomResult};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Role of each agent in the content pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// Long-form article writer.
    Copywriter,
    /// Short news writer fed by the collectors.
    CopywriterNews,
    /// Produces titles, slugs and SEO metadata.
    MetadataGenerator,
    /// Rewrites existing articles.
    Rewriter,
    /// Decides where incoming content ideas go.
    ContentRouter,
}

impl AgentRole {
    /// Every role, in declaration order.
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Copywriter,
        AgentRole::CopywriterNews,
        AgentRole::MetadataGenerator,
        AgentRole::Rewriter,
        AgentRole::ContentRouter,
    ];

    /// Wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Copywriter => "copywriter",
            AgentRole::CopywriterNews => "copywriter_news",
            AgentRole::MetadataGenerator => "metadata_generator",
            AgentRole::Rewriter => "rewriter",
            AgentRole::ContentRouter => "content_router",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = PressroomError;

    fn from_str(s: &str) -> PressroomResult<Self> {
        AgentRole::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| PressroomError::Validation(format!("Unknown agent role '{s}'")))
    }
}

/// Kind of work a task carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// A content request handed to an agent.
    RequestHandoff,
    /// A message from one agent to another.
    AgentMessage,
    /// Publish a finished article.
    Publish,
    /// A periodic per-source collection job.
    Collection,
}

impl TaskKind {
    /// Every kind, in declaration order.
    pub const ALL: [TaskKind; 4] = [
        TaskKind::RequestHandoff,
        TaskKind::AgentMessage,
        TaskKind::Publish,
        TaskKind::Collection,
    ];

    /// Wire name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::RequestHandoff => "request_handoff",
            TaskKind::AgentMessage => "agent_message",
            TaskKind::Publish => "publish",
            TaskKind::Collection => "collection",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = PressroomError;

    fn from_str(s: &str) -> PressroomResult<Self> {
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| PressroomError::Validation(format!("Unknown task kind '{s}'")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_role_display_matches_serde() {
        for role in AgentRole::ALL {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{role}\""));
        }
    }

    #[test]
    fn test_role_parse_roundtrip() {
        assert_eq!(
            "metadata_generator".parse::<AgentRole>().unwrap(),
            AgentRole::MetadataGenerator
        );
        assert_eq!(AgentRole::CopywriterNews.to_string(), "copywriter_news");
    }

    #[test]
    fn test_unknown_role_is_validation_error() {
        let err = "editor-in-chief".parse::<AgentRole>().unwrap_err();
        assert!(matches!(err, PressroomError::Validation(_)));
    }

    #[test]
    fn test_task_kind_parse() {
        assert_eq!("publish".parse::<TaskKind>().unwrap(), TaskKind::Publish);
        assert_eq!(
            "agent_message".parse::<TaskKind>().unwrap(),
            TaskKind::AgentMessage
        );
        assert!("wordpress".parse::<TaskKind>().is_err());
    }
}
