//! Built-in human-in-the-loop content workflows.
//!
//! `journalist_team` assembles a team of journalists for a topic and loops on
//! editor feedback. `content_routing` analyzes found content, waits for a
//! reviewer to approve it, then for an action choice, and executes it.
//! Generation goes through [`ContentGenerator`]; [`TemplateGenerator`] is a
//! deterministic offline implementation.

use async_trait::async_trait;
use pressroom_core::{PressroomError, PressroomResult};
use pressroom_workflow::{
    GraphBuilder, Node, StateUpdate, Target, WorkflowEngine, WorkflowGraph, WorkflowState,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Name of the team-assembly workflow.
pub const JOURNALIST_TEAM: &str = "journalist_team";
/// Name of the content review and action workflow.
pub const CONTENT_ROUTING: &str = "content_routing";

const DEFAULT_TEAM_SIZE: usize = 3;
/// Largest team `journalist_team` will assemble.
pub const MAX_TEAM_SIZE: usize = 20;

/// One generated team member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journalist {
    pub full_name: String,
    pub nickname: String,
    pub organization: String,
    pub job_title: String,
    /// The single theme this journalist covers.
    pub focus: String,
}

/// Input for assembling a team.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamBrief {
    pub topic: String,
    /// Number of journalists, at most [`MAX_TEAM_SIZE`].
    pub size: usize,
    /// Editor notes from the previous round, if revising.
    pub editor_feedback: Option<String>,
}

/// What the analyzer reports about a piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentAnalysis {
    pub summary: String,
    pub suggested_actions: Vec<String>,
}

/// Narrow contract for the external generation services.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Assemble `brief.size` journalists for the topic.
    async fn build_team(&self, brief: &TeamBrief) -> PressroomResult<Vec<Journalist>>;
    /// Summarize content and suggest actions.
    async fn analyze(&self, content: &Value) -> PressroomResult<ContentAnalysis>;
    /// Carry out the chosen action.
    async fn execute_action(&self, action: &str, content: &Value) -> PressroomResult<Value>;
}

/// Deterministic generator built from string templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateGenerator;

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn build_team(&self, brief: &TeamBrief) -> PressroomResult<Vec<Journalist>> {
        let angle = brief.editor_feedback.as_deref().unwrap_or("general coverage");
        Ok((1..=brief.size)
            .map(|i| Journalist {
                full_name: format!("Journalist {i}"),
                nickname: format!("j{i}"),
                organization: "Pressroom".to_string(),
                job_title: format!("{} reporter", brief.topic),
                focus: format!("{} angle {i}: {angle}", brief.topic),
            })
            .collect())
    }

    async fn analyze(&self, content: &Value) -> PressroomResult<ContentAnalysis> {
        let title = content
            .get("title")
            .and_then(Value::as_str)
            .ok_or_else(|| PressroomError::Validation("content needs a title".into()))?;
        Ok(ContentAnalysis {
            summary: format!("Candidate article: {title}"),
            suggested_actions: vec!["rewrite".into(), "publish".into()],
        })
    }

    async fn execute_action(&self, action: &str, content: &Value) -> PressroomResult<Value> {
        Ok(json!({
            "action": action,
            "title": content.get("title").cloned().unwrap_or(Value::Null),
            "status": "done",
        }))
    }
}

fn update(entries: impl IntoIterator<Item = (&'static str, Value)>) -> StateUpdate {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// `number_of_journalists` from the state, defaulting when absent.
fn team_size(state: &WorkflowState) -> PressroomResult<usize> {
    let Some(raw) = state.get("number_of_journalists") else {
        return Ok(DEFAULT_TEAM_SIZE);
    };
    match raw.as_u64() {
        Some(n) if (1..=MAX_TEAM_SIZE as u64).contains(&n) => Ok(n as usize),
        _ => Err(PressroomError::Validation(format!(
            "number_of_journalists must be an integer from 1 to {MAX_TEAM_SIZE}, got {raw}"
        ))),
    }
}

fn required_str<'a>(state: &'a WorkflowState, key: &str) -> PressroomResult<&'a str> {
    state
        .get_str(key)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| PressroomError::Validation(format!("state is missing '{key}'")))
}

struct BuildTeam {
    generator: Arc<dyn ContentGenerator>,
}

#[async_trait]
impl Node for BuildTeam {
    async fn run(&self, state: &WorkflowState) -> PressroomResult<StateUpdate> {
        let brief = TeamBrief {
            topic: required_str(state, "topic")?.to_string(),
            size: team_size(state)?,
            editor_feedback: state
                .get_str("editor_feedback")
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        };
        let journalists = self.generator.build_team(&brief).await?;
        let revision = state.get("team_revision").and_then(Value::as_u64).unwrap_or(0) + 1;
        Ok(update([
            ("journalists", serde_json::to_value(journalists)?),
            ("team_revision", json!(revision)),
            ("feedback_status", json!("pending")),
        ]))
    }
}

/// Runs once the editor has answered. Any status other than `revise` ends
/// the run with the current team.
struct EditorFeedback;

#[async_trait]
impl Node for EditorFeedback {
    async fn run(&self, state: &WorkflowState) -> PressroomResult<StateUpdate> {
        let status = state.get_str("feedback_status").unwrap_or("pending");
        let accepted = status != "revise";
        Ok(update([
            ("last_feedback_status", json!(status)),
            ("team_accepted", json!(accepted)),
        ]))
    }
}

/// Assemble a journalist team, pause for the editor, rebuild while the editor
/// asks for a revision.
pub fn journalist_team(generator: Arc<dyn ContentGenerator>) -> PressroomResult<WorkflowGraph> {
    GraphBuilder::new(JOURNALIST_TEAM)
        .add_node("build_team", Arc::new(BuildTeam { generator }))
        .add_interrupt_node("editor_feedback", Arc::new(EditorFeedback))
        .add_edge("build_team", Target::node("editor_feedback"))
        .add_branch(
            "editor_feedback",
            "feedback_status",
            [("revise", Target::node("build_team"))],
            Some(Target::End),
        )
        .set_entry("build_team")
        .build()
}

struct Analyze {
    generator: Arc<dyn ContentGenerator>,
}

#[async_trait]
impl Node for Analyze {
    async fn run(&self, state: &WorkflowState) -> PressroomResult<StateUpdate> {
        let content = state
            .get("content")
            .ok_or_else(|| PressroomError::Validation("state is missing 'content'".into()))?;
        let analysis = self.generator.analyze(content).await?;
        Ok(update([("analysis", serde_json::to_value(analysis)?)]))
    }
}

struct HumanValidation;

#[async_trait]
impl Node for HumanValidation {
    async fn run(&self, state: &WorkflowState) -> PressroomResult<StateUpdate> {
        let approval = required_str(state, "approval")?;
        Ok(update([("validated", json!(approval == "approved"))]))
    }
}

struct ActionChoice;

#[async_trait]
impl Node for ActionChoice {
    async fn run(&self, state: &WorkflowState) -> PressroomResult<StateUpdate> {
        let action = required_str(state, "action")?;
        let offered = state
            .get("analysis")
            .and_then(|a| a.get("suggested_actions"))
            .and_then(Value::as_array);
        if let Some(offered) = offered {
            if !offered.iter().any(|a| a.as_str() == Some(action)) {
                return Err(PressroomError::Validation(format!(
                    "action '{action}' was not offered"
                )));
            }
        }
        Ok(update([("chosen_action", json!(action))]))
    }
}

struct ExecuteAction {
    generator: Arc<dyn ContentGenerator>,
}

#[async_trait]
impl Node for ExecuteAction {
    async fn run(&self, state: &WorkflowState) -> PressroomResult<StateUpdate> {
        let action = required_str(state, "chosen_action")?;
        let content = state.get("content").cloned().unwrap_or(Value::Null);
        let result = self.generator.execute_action(action, &content).await?;
        Ok(update([("action_result", result)]))
    }
}

struct Stop;

#[async_trait]
impl Node for Stop {
    async fn run(&self, state: &WorkflowState) -> PressroomResult<StateUpdate> {
        let reason = state
            .get_str("rejection_reason")
            .unwrap_or("rejected by reviewer");
        Ok(update([
            ("stopped", json!(true)),
            ("stop_reason", json!(reason)),
        ]))
    }
}

/// Analyze content, pause for approval, then for an action choice.
/// Anything but `approved` stops the run.
pub fn content_routing(generator: Arc<dyn ContentGenerator>) -> PressroomResult<WorkflowGraph> {
    GraphBuilder::new(CONTENT_ROUTING)
        .add_node(
            "analyze",
            Arc::new(Analyze {
                generator: generator.clone(),
            }),
        )
        .add_interrupt_node("human_validation", Arc::new(HumanValidation))
        .add_interrupt_node("action_choice", Arc::new(ActionChoice))
        .add_node("execute_action", Arc::new(ExecuteAction { generator }))
        .add_node("stop", Arc::new(Stop))
        .add_edge("analyze", Target::node("human_validation"))
        .add_branch(
            "human_validation",
            "approval",
            [
                ("approved", Target::node("action_choice")),
                ("rejected", Target::node("stop")),
            ],
            Some(Target::node("stop")),
        )
        .add_edge("action_choice", Target::node("execute_action"))
        .add_edge("execute_action", Target::End)
        .add_edge("stop", Target::End)
        .set_entry("analyze")
        .build()
}

/// Register both built-in workflows on `engine`.
pub fn register_builtin(
    engine: &mut WorkflowEngine,
    generator: Arc<dyn ContentGenerator>,
) -> PressroomResult<()> {
    engine.register(journalist_team(generator.clone())?)?;
    engine.register(content_routing(generator)?)?;
    Ok(())
}
