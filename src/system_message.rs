//! Per-turn system message assembly from reusable sections.
//!
//! Grounded on `test_system_message_builder.py`: the same builder produces coordination,
//! vote-only, and presentation variants by toggling which sections are included, with exact
//! literal substrings the donor's own tests pattern-match on (`<system_prompt>`,
//! `<agent_identity>`, `"MUST vote for the best existing answer"`, `"selected as the winning
//! presenter"`, the unconditional `requirements.txt` mention).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{CoordinationConfig, Sensitivity};
use crate::types::AgentAnswer;

/// Parsed YAML-frontmatter memory file (`--- ... ---` header followed by body text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub name: String,
    pub description: String,
    pub tier: String,
    pub agent_id: String,
    pub created: String,
    pub updated: String,
    pub body: String,
}

/// Tolerant parse: a file without a `---`-delimited frontmatter block is not a memory, so this
/// returns `None` rather than erroring (matches `_parse_memory_file`'s parse-or-none contract).
pub fn parse_memory_file(raw: &str) -> Option<MemoryRecord> {
    let raw = raw.trim_start();
    let rest = raw.strip_prefix("---")?;
    let end = rest.find("---")?;
    let frontmatter = &rest[..end];
    let body = rest[end + 3..].trim_start().to_string();

    let mut fields: HashMap<String, String> = HashMap::new();
    for line in frontmatter.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            fields.insert(key.trim().to_string(), value.trim().trim_matches('"').to_string());
        }
    }

    Some(MemoryRecord {
        name: fields.remove("name")?,
        description: fields.remove("description").unwrap_or_default(),
        tier: fields.remove("tier").unwrap_or_default(),
        agent_id: fields.remove("agent_id").unwrap_or_default(),
        created: fields.remove("created").unwrap_or_default(),
        updated: fields.remove("updated").unwrap_or_default(),
        body,
    })
}

/// Deduplicates a set of candidate memory files by name, most-recent `updated` wins.
pub fn dedupe_memories(records: Vec<MemoryRecord>) -> Vec<MemoryRecord> {
    let mut by_name: HashMap<String, MemoryRecord> = HashMap::new();
    for record in records {
        match by_name.get(&record.name) {
            Some(existing) if existing.updated >= record.updated => {}
            _ => {
                by_name.insert(record.name.clone(), record);
            }
        }
    }
    let mut out: Vec<MemoryRecord> = by_name.into_values().collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

/// Peer answer visible to the agent being prompted, already resolved to its anon label.
pub struct VisibleAnswer<'a> {
    pub anon_label: &'a str,
    pub content: &'a str,
    pub changedoc: Option<&'a str>,
}

/// Which variant of the evaluation-protocol section to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolMode {
    Coordination,
    VoteOnly,
    Presentation,
}

/// All the optional inputs a single system-message build might draw on. Absent fields simply
/// omit their section (SPEC_FULL.md §4.5).
#[derive(Default)]
pub struct SystemMessageInputs<'a> {
    pub persona: Option<&'a str>,
    pub persona_easing_enabled: bool,
    pub has_peer_answers: bool,
    pub protocol_mode: Option<ProtocolMode>,
    pub planning_mode_instruction: Option<&'a str>,
    pub workspace_path: Option<&'a str>,
    pub peer_snapshot_root: Option<&'a str>,
    pub skills: &'a [String],
    pub memories: &'a [MemoryRecord],
    pub visible_answers: &'a [VisibleAnswer<'a>],
    pub human_qa_history: &'a [(String, String)],
    pub enable_command_execution: bool,
    pub voting_sensitivity: Option<Sensitivity>,
    pub broadcast_sensitivity: Option<Sensitivity>,
}

pub struct SystemMessageBuilder;

impl SystemMessageBuilder {
    /// Assembles the full `<system_prompt>...</system_prompt>` envelope for one turn.
    pub fn build(inputs: &SystemMessageInputs) -> String {
        let mut sections = Vec::new();

        if let Some(persona) = inputs.persona {
            sections.push(Self::agent_identity_section(persona, inputs));
        }

        if let Some(mode) = inputs.protocol_mode {
            sections.push(Self::protocol_section(mode, inputs));
        }

        if let Some(instruction) = inputs.planning_mode_instruction {
            sections.push(format!("<planning_mode>\n{instruction}\n</planning_mode>"));
        }

        if let Some(path) = inputs.workspace_path {
            sections.push(Self::filesystem_section(path, inputs.peer_snapshot_root));
        }

        if !inputs.skills.is_empty() {
            sections.push(Self::skills_section(inputs.skills));
        }

        if !inputs.memories.is_empty() {
            sections.push(Self::memory_section(inputs.memories));
        }

        if !inputs.visible_answers.is_empty() {
            sections.push(Self::current_answers_section(inputs.visible_answers));
        }

        if !inputs.human_qa_history.is_empty() {
            sections.push(Self::human_qa_section(inputs.human_qa_history));
        }

        format!("<system_prompt>\n{}\n</system_prompt>", sections.join("\n\n"))
    }

    fn agent_identity_section(persona: &str, inputs: &SystemMessageInputs) -> String {
        if inputs.persona_easing_enabled && inputs.has_peer_answers {
            format!(
                "<agent_identity>\n{persona}\n\nTreat this persona as a preference, not a position: synthesize \
                 the strongest ideas from any peer answers rather than defending your own framing.\n</agent_identity>"
            )
        } else {
            format!("<agent_identity>\n{persona}\n</agent_identity>")
        }
    }

    fn protocol_section(mode: ProtocolMode, inputs: &SystemMessageInputs) -> String {
        match mode {
            ProtocolMode::Coordination => format!(
                "<evaluation_protocol>\nCall `new_answer` to submit or revise your answer, or `vote` to \
                 endorse the strongest existing answer by its anon id. Reference peers only by their \
                 anon id (agent1, agent2, ...).{}\n</evaluation_protocol>",
                Self::sensitivity_suffix(inputs.voting_sensitivity, inputs.broadcast_sensitivity)
            ),
            ProtocolMode::VoteOnly => format!(
                "<evaluation_protocol>\nYou MUST vote for the best existing answer. Calling `new_answer` is \
                 not available in this turn.{}\n</evaluation_protocol>",
                Self::sensitivity_suffix(inputs.voting_sensitivity, inputs.broadcast_sensitivity)
            ),
            ProtocolMode::Presentation => {
                let mut s = String::from(
                    "<evaluation_protocol>\nYou were selected as the winning presenter. Produce the final \
                     deliverable via `new_answer`.",
                );
                if inputs.enable_command_execution {
                    s.push_str(
                        " If your deliverable includes runnable code, include a requirements.txt listing \
                         its dependencies.",
                    );
                }
                s.push_str("\n</evaluation_protocol>");
                s
            }
        }
    }

    fn sensitivity_suffix(voting: Option<Sensitivity>, broadcast: Option<Sensitivity>) -> String {
        let mut out = String::new();
        if let Some(s) = voting {
            out.push_str(&format!(" Voting strictness: {}.", Self::sensitivity_word(s)));
        }
        if let Some(s) = broadcast {
            out.push_str(&format!(" Ask-others encouragement: {}.", Self::sensitivity_word(s)));
        }
        out
    }

    fn sensitivity_word(s: Sensitivity) -> &'static str {
        match s {
            Sensitivity::Low => "low",
            Sensitivity::Medium => "medium",
            Sensitivity::High => "high",
        }
    }

    fn filesystem_section(workspace_path: &str, peer_snapshot_root: Option<&str>) -> String {
        let mut s = format!("<filesystem>\nYour workspace: {workspace_path}\n");
        if let Some(root) = peer_snapshot_root {
            s.push_str(&format!("Peer snapshots are available under {root}/{{anon_id}}/...\n"));
        }
        s.push_str("</filesystem>");
        s
    }

    fn skills_section(skills: &[String]) -> String {
        format!("<skills>\nAvailable skills: {}\n</skills>", skills.join(", "))
    }

    fn memory_section(memories: &[MemoryRecord]) -> String {
        let mut s = String::from("<memory>\n");
        for record in memories {
            s.push_str(&format!("[{}] {}\n{}\n\n", record.tier, record.description, record.body));
        }
        s.push_str("</memory>");
        s
    }

    fn current_answers_section(answers: &[VisibleAnswer]) -> String {
        let mut s = String::from("<current_answers>\n");
        for a in answers {
            s.push_str(&format!("<{tag}>\n{content}\n", tag = a.anon_label, content = a.content));
            if let Some(changedoc) = a.changedoc {
                s.push_str(&format!("<changedoc>\n{changedoc}\n</changedoc>\n"));
            }
            s.push_str(&format!("</{}>\n", a.anon_label));
        }
        s.push_str("</current_answers>");
        s
    }

    fn human_qa_section(history: &[(String, String)]) -> String {
        let mut s = String::from("<human_qa_history>\n");
        for (q, a) in history {
            s.push_str(&format!("Q: {q}\nA: {a}\n"));
        }
        s.push_str("</human_qa_history>");
        s
    }
}

/// Helper to build `VisibleAnswer` inputs from an anon mapping and the latest answer per peer.
pub fn visible_answers_from<'a>(
    anon_forward: &'a HashMap<String, String>,
    latest_by_agent: &'a HashMap<String, AgentAnswer>,
    exclude: &str,
) -> Vec<VisibleAnswer<'a>> {
    let mut out = Vec::new();
    for (agent_id, answer) in latest_by_agent {
        if agent_id == exclude {
            continue;
        }
        let Some(anon) = anon_forward.get(agent_id) else { continue };
        out.push(VisibleAnswer {
            anon_label: anon.as_str(),
            content: answer.content.as_str(),
            changedoc: answer.changedoc.as_deref(),
        });
    }
    out.sort_by(|a, b| a.anon_label.cmp(b.anon_label));
    out
}

impl CoordinationConfig {
    pub fn protocol_mode(&self, is_vote_only: bool, is_presentation: bool) -> ProtocolMode {
        if is_presentation {
            ProtocolMode::Presentation
        } else if is_vote_only {
            ProtocolMode::VoteOnly
        } else {
            ProtocolMode::Coordination
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_wraps_sections_in_system_prompt_envelope() {
        let inputs = SystemMessageInputs {
            persona: Some("You are a careful analyst."),
            protocol_mode: Some(ProtocolMode::Coordination),
            ..Default::default()
        };
        let message = SystemMessageBuilder::build(&inputs);
        assert!(message.starts_with("<system_prompt>"));
        assert!(message.ends_with("</system_prompt>"));
        assert!(message.contains("<agent_identity>"));
    }

    #[test]
    fn vote_only_mode_states_must_vote() {
        let inputs = SystemMessageInputs { protocol_mode: Some(ProtocolMode::VoteOnly), ..Default::default() };
        let message = SystemMessageBuilder::build(&inputs);
        assert!(message.contains("MUST vote for the best existing answer"));
    }

    #[test]
    fn presentation_mode_mentions_requirements_txt_when_command_execution_enabled() {
        let inputs = SystemMessageInputs {
            protocol_mode: Some(ProtocolMode::Presentation),
            enable_command_execution: true,
            ..Default::default()
        };
        let message = SystemMessageBuilder::build(&inputs);
        assert!(message.contains("selected as the winning presenter"));
        assert!(message.contains("requirements.txt"));
    }

    #[test]
    fn presentation_mode_omits_requirements_txt_when_command_execution_disabled() {
        let inputs = SystemMessageInputs {
            protocol_mode: Some(ProtocolMode::Presentation),
            enable_command_execution: false,
            ..Default::default()
        };
        let message = SystemMessageBuilder::build(&inputs);
        assert!(!message.contains("requirements.txt"));
    }

    #[test]
    fn parse_memory_file_returns_none_without_frontmatter() {
        assert!(parse_memory_file("just some plain text").is_none());
    }

    #[test]
    fn parse_memory_file_extracts_fields_and_body() {
        let raw = "---\nname: lessons\ndescription: what we learned\ntier: long_term\nagent_id: agent_a\n\
                    created: 2026-01-01\nupdated: 2026-01-02\n---\nBody text here.";
        let record = parse_memory_file(raw).expect("should parse");
        assert_eq!(record.name, "lessons");
        assert_eq!(record.body, "Body text here.");
    }

    #[test]
    fn dedupe_memories_keeps_most_recently_updated() {
        let older = parse_memory_file(
            "---\nname: a\ndescription: d\ntier: t\nagent_id: x\ncreated: c\nupdated: 2026-01-01\n---\nold",
        )
        .unwrap();
        let newer = parse_memory_file(
            "---\nname: a\ndescription: d\ntier: t\nagent_id: x\ncreated: c\nupdated: 2026-01-02\n---\nnew",
        )
        .unwrap();
        let deduped = dedupe_memories(vec![older, newer]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].body, "new");
    }
}
