use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::responder::Responder;

pub const SLAVES_MARKER: &str = "{{slaves}}";
pub const GOAL_MARKER: &str = "{{goal}}";
pub const RESPONSES_MARKER: &str = "{{responses}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Planning,
    Executing,
    Synthesizing,
}

impl Phase {
    /// Position in the flow, 0 for Idle.
    pub fn number(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Planning => 1,
            Phase::Executing => 2,
            Phase::Synthesizing => 3,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Planning => write!(f, "Planning"),
            Phase::Executing => write!(f, "Executing"),
            Phase::Synthesizing => write!(f, "Synthesizing"),
        }
    }
}

const DEFAULT_PLANNING_TEMPLATE: &str = r#"You are the main brain of a team of AI assistants. Break the goal below into sub-tasks and assign exactly one sub-task to each assistant in the roster.

## Team

{{slaves}}

## Goal

{{goal}}

## Output format

For every assistant, write one block using its identifier exactly as listed:

[SLAVE:identifier]
Detailed instructions for that assistant.
[/SLAVE]

Do not add any other blocks."#;

const DEFAULT_SYNTHESIS_TEMPLATE: &str = r#"You previously split the goal below into sub-tasks for your team. Their responses follow.

## Goal

{{goal}}

## Team responses

{{responses}}

Combine these responses into one complete, consistent answer to the goal. Point out and resolve any contradictions, and note which assistants failed to answer."#;

/// Planning and synthesis prompt templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowPrompts {
    pub planning: String,
    pub synthesis: String,
}

impl Default for FlowPrompts {
    fn default() -> Self {
        Self {
            planning: DEFAULT_PLANNING_TEMPLATE.into(),
            synthesis: DEFAULT_SYNTHESIS_TEMPLATE.into(),
        }
    }
}

impl FlowPrompts {
    pub fn validate(&self) -> AppResult<()> {
        for (template, marker, name) in [
            (&self.planning, SLAVES_MARKER, "planning"),
            (&self.planning, GOAL_MARKER, "planning"),
            (&self.synthesis, GOAL_MARKER, "synthesis"),
            (&self.synthesis, RESPONSES_MARKER, "synthesis"),
        ] {
            if !template.contains(marker) {
                return Err(AppError::InvalidRequest(format!(
                    "{name} template is missing the {marker} marker"
                )));
            }
        }
        Ok(())
    }

    pub fn render_planning(&self, roster: &str, goal: &str) -> String {
        fill_template(&self.planning, &[(SLAVES_MARKER, roster), (GOAL_MARKER, goal)])
    }

    pub fn render_synthesis(&self, goal: &str, responses: &str) -> String {
        fill_template(&self.synthesis, &[(GOAL_MARKER, goal), (RESPONSES_MARKER, responses)])
    }
}

/// Replace markers in one left-to-right pass. Inserted values are never
/// scanned again, so marker text inside a goal or a response stays literal.
fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let next = values
            .iter()
            .filter_map(|(marker, value)| rest.find(marker).map(|at| (at, marker.len(), *value)))
            .min_by_key(|(at, _, _)| *at);
        let Some((at, marker_len, value)) = next else {
            rendered.push_str(rest);
            return rendered;
        };
        rendered.push_str(&rest[..at]);
        rendered.push_str(value);
        rest = &rest[at + marker_len..];
    }
}

/// One `[SLAVE:<id>]` block extracted from planner output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedTask {
    pub id: String,
    pub instructions: String,
}

/// A slave responder together with its per-run display alias.
#[derive(Debug, Clone)]
pub struct FlowMember {
    pub responder: Responder,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveStatus {
    Completed,
    Failed,
    Skipped,
    Unassigned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlaveOutcome {
    pub instance_id: String,
    pub kind: String,
    pub alias: String,
    pub status: SlaveStatus,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowReport {
    pub goal: String,
    pub plan: String,
    pub outcomes: Vec<SlaveOutcome>,
    pub synthesis: String,
}

/// How a run ended once it returned to Idle.
#[derive(Debug, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum FlowOutcome {
    Completed(FlowReport),
    Cancelled,
    Failed(AppError),
}

impl FlowOutcome {
    pub fn report(&self) -> Option<&FlowReport> {
        match self {
            FlowOutcome::Completed(report) => Some(report),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FlowOutcome::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_prompts_carry_all_markers() {
        FlowPrompts::default().validate().expect("defaults are valid");
    }

    #[test]
    fn test_validate_reports_missing_marker() {
        let prompts = FlowPrompts {
            planning: "Plan {{goal}}".into(),
            synthesis: "{{goal}} {{responses}}".into(),
        };
        let err = prompts.validate().unwrap_err();
        assert!(err.to_string().contains("{{slaves}}"));
    }

    #[test]
    fn test_render_substitutes_every_marker() {
        let prompts = FlowPrompts {
            planning: "Team:\n{{slaves}}\nGoal: {{goal}} ({{goal}})".into(),
            synthesis: "Goal: {{goal}}\n{{responses}}".into(),
        };
        assert_eq!(
            prompts.render_planning("- gpt-1", "ship it"),
            "Team:\n- gpt-1\nGoal: ship it (ship it)"
        );
        assert_eq!(
            prompts.render_synthesis("ship it", "[gpt-1 Response]\nok\n"),
            "Goal: ship it\n[gpt-1 Response]\nok\n"
        );
    }

    #[test]
    fn test_render_keeps_marker_text_inside_values() {
        let prompts = FlowPrompts::default();
        let synthesis = prompts.render_synthesis("SECRET GOAL", "[gpt-1 Response]\nliteral {{goal}} token\n");
        assert!(synthesis.contains("literal {{goal}} token"));
        assert!(synthesis.contains("SECRET GOAL"));

        let planning = prompts.render_planning("- {{goal}} (gpt-1)", "a goal naming {{slaves}}");
        assert!(planning.contains("- {{goal}} (gpt-1)"));
        assert!(planning.contains("a goal naming {{slaves}}"));
        assert_eq!(planning.matches("{{goal}}").count(), 1);
    }

    #[test]
    fn test_failed_outcome_serializes_error_text() {
        let outcome = FlowOutcome::Failed(AppError::PlanTooShort { length: 3, minimum: 50 });
        let value = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(value["status"], "failed");
        assert!(value["detail"].as_str().unwrap_or_default().contains("too short"));
    }
}
