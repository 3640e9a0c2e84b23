//! Turns planner output into per-slave instructions.

use std::collections::HashMap;

use crate::models::flow::{FlowMember, ParsedTask};
use crate::models::responder::Responder;

pub const OPEN_MARKER: &str = "[slave:";
pub const CLOSE_MARKER: &str = "[/slave]";

/// Task id -> instructions.
pub type TaskMap = HashMap<String, String>;

/// Which slave identifier a planner used for a task block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKey {
    Alias,
    InstanceId,
    Kind,
}

impl TaskKey {
    pub const RESOLUTION_ORDER: [TaskKey; 3] = [TaskKey::Alias, TaskKey::InstanceId, TaskKey::Kind];

    pub fn key_for(self, member: &FlowMember) -> &str {
        match self {
            TaskKey::Alias => &member.alias,
            TaskKey::InstanceId => &member.responder.instance_id,
            TaskKey::Kind => &member.responder.kind,
        }
    }
}

/// Give every responder a `<kind>-<n>` alias, numbering from 1 per kind in
/// roster order.
pub fn assign_aliases(responders: Vec<Responder>) -> Vec<FlowMember> {
    let mut counters: HashMap<String, usize> = HashMap::new();
    responders
        .into_iter()
        .map(|responder| {
            let n = counters.entry(responder.kind.clone()).or_insert(0);
            *n += 1;
            let alias = format!("{}-{}", responder.kind, n);
            FlowMember { responder, alias }
        })
        .collect()
}

/// One roster line per member, used for the `{{slaves}}` marker.
pub fn render_roster(members: &[FlowMember]) -> String {
    members
        .iter()
        .map(|m| format!("- {}: {}", m.alias, m.responder.display_name()))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn contains_task_marker(plan_text: &str) -> bool {
    plan_text.to_ascii_lowercase().contains(OPEN_MARKER)
}

/// Extract every well-formed task block, in order of appearance.
///
/// Markers match case-insensitively. Lowercasing is ASCII-only so byte
/// offsets in the lowered copy stay valid for the original text.
pub fn extract_task_blocks(plan_text: &str) -> Vec<ParsedTask> {
    let lowered = plan_text.to_ascii_lowercase();
    let starts: Vec<usize> = lowered.match_indices(OPEN_MARKER).map(|(i, _)| i).collect();

    let mut tasks = Vec::new();
    for (idx, &start) in starts.iter().enumerate() {
        let seg_start = start + OPEN_MARKER.len();
        let seg_end = starts.get(idx + 1).copied().unwrap_or(plan_text.len());
        let segment = &plan_text[seg_start..seg_end];
        let lowered_segment = &lowered[seg_start..seg_end];

        let Some(bracket) = segment.find(']') else {
            continue;
        };
        let id = segment[..bracket].trim();
        let body_start = bracket + 1;
        let body_end = lowered_segment[body_start..]
            .find(CLOSE_MARKER)
            .map(|i| body_start + i)
            .unwrap_or(segment.len());
        let instructions = segment[body_start..body_end].trim();

        if id.is_empty() || instructions.is_empty() {
            continue;
        }
        tasks.push(ParsedTask {
            id: id.to_string(),
            instructions: instructions.to_string(),
        });
    }
    tasks
}

/// Parse planner output into a task map. Blocks addressed by a member's
/// instance id are also registered under its kind.
pub fn parse_plan(plan_text: &str, members: &[FlowMember]) -> TaskMap {
    let mut tasks = TaskMap::new();
    for task in extract_task_blocks(plan_text) {
        let by_instance = members
            .iter()
            .find(|m| m.responder.instance_id == task.id && m.alias != task.id);
        if let Some(member) = by_instance {
            tasks.insert(member.responder.kind.clone(), task.instructions.clone());
        }
        tasks.insert(task.id, task.instructions);
    }
    tasks
}

/// Look up a member's instructions, trying each key in resolution order.
pub fn resolve_instructions<'a>(tasks: &'a TaskMap, member: &FlowMember) -> Option<(TaskKey, &'a str)> {
    TaskKey::RESOLUTION_ORDER.iter().find_map(|key| {
        tasks
            .get(key.key_for(member))
            .map(|instructions| (*key, instructions.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn members(roster: &[(&str, &str)]) -> Vec<FlowMember> {
        assign_aliases(
            roster
                .iter()
                .map(|(id, kind)| Responder::new(*id, *kind))
                .collect(),
        )
    }

    #[test]
    fn test_aliases_number_per_kind() {
        let members = members(&[("a", "gpt"), ("b", "claude"), ("c", "gemini"), ("d", "gemini")]);
        let aliases: Vec<&str> = members.iter().map(|m| m.alias.as_str()).collect();
        assert_eq!(aliases, vec!["gpt-1", "claude-1", "gemini-1", "gemini-2"]);
    }

    #[test]
    fn test_extracts_every_closed_block() {
        let plan = "Intro text\n\
            [SLAVE:gpt-1]\n  Research the market.  \n[/SLAVE]\n\
            chatter\n\
            [SLAVE:claude-1]Draft the copy.[/SLAVE]\n\
            [SLAVE:gemini-1]\nReview both.\n[/SLAVE]";
        let tasks = extract_task_blocks(plan);
        assert_eq!(
            tasks,
            vec![
                ParsedTask { id: "gpt-1".into(), instructions: "Research the market.".into() },
                ParsedTask { id: "claude-1".into(), instructions: "Draft the copy.".into() },
                ParsedTask { id: "gemini-1".into(), instructions: "Review both.".into() },
            ]
        );
    }

    #[test]
    fn test_markers_are_case_insensitive_and_close_is_optional() {
        let plan = "[slave: gpt-1 ] first task\n[Slave:claude-1] second task [/slave] trailing";
        let tasks = extract_task_blocks(plan);
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "gpt-1");
        assert_eq!(tasks[0].instructions, "first task");
        assert_eq!(tasks[1].instructions, "second task");
    }

    #[test]
    fn test_empty_id_or_body_is_discarded() {
        let plan = "[SLAVE:]orphan[/SLAVE][SLAVE:gpt-1]   [/SLAVE][SLAVE:no-bracket";
        assert!(extract_task_blocks(plan).is_empty());
    }

    #[test]
    fn test_non_ascii_text_keeps_boundaries() {
        let plan = "Plan für das Team: [SLAVE:gpt-1] Übersetze den Text ins Deutsche. [/SLAVE]";
        let tasks = extract_task_blocks(plan);
        assert_eq!(tasks[0].instructions, "Übersetze den Text ins Deutsche.");
    }

    #[test]
    fn test_no_markers_yields_empty_map() {
        let members = members(&[("a", "gpt")]);
        assert!(parse_plan("I think everyone should just do their best.", &members).is_empty());
        assert!(!contains_task_marker("nothing here"));
    }

    #[test]
    fn test_instance_id_blocks_are_duplicated_under_kind() {
        let members = members(&[("slot-7", "claude")]);
        let tasks = parse_plan("[SLAVE:slot-7] Summarize.", &members);
        assert_eq!(tasks.get("slot-7").map(String::as_str), Some("Summarize."));
        assert_eq!(tasks.get("claude").map(String::as_str), Some("Summarize."));
    }

    #[test]
    fn test_resolution_prefers_alias_then_instance_then_kind() {
        let members = members(&[("slot-1", "gpt")]);
        let member = &members[0];

        let mut tasks = TaskMap::new();
        tasks.insert("gpt".into(), "by kind".into());
        assert_eq!(resolve_instructions(&tasks, member), Some((TaskKey::Kind, "by kind")));

        tasks.insert("slot-1".into(), "by instance".into());
        assert_eq!(resolve_instructions(&tasks, member), Some((TaskKey::InstanceId, "by instance")));

        tasks.insert("gpt-1".into(), "by alias".into());
        assert_eq!(resolve_instructions(&tasks, member), Some((TaskKey::Alias, "by alias")));
    }

    #[test]
    fn test_roster_lists_alias_and_name() {
        let members = assign_aliases(vec![
            Responder::new("a", "gpt").with_display_name("ChatGPT"),
            Responder::new("b", "gpt"),
        ]);
        assert_eq!(render_roster(&members), "- gpt-1: ChatGPT\n- gpt-2: gpt");
    }
}
