//! Slash commands: `/quest #lotka ton: mroczny, coś o przemycie`.
//!
//! A command skips discovery and goes straight to the queue. `#reference`
//! picks the target profile; without it the session's selected profile is used.
//! `@field` references stay in the text for the assembler to resolve.

use serde::{Deserialize, Serialize};

use crate::context_store::ContextName;
use crate::error::{AssistantError, Result};
use crate::prompts::ResponseSchema;
use crate::recipe::{Constraints, GoalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Quest,
    SideQuest,
    Hook,
    Secret,
    Nickname,
    Npc,
    Faction,
    Advice,
    Traits,
    Relations,
    Summary,
    Diagnosis,
}

/// Command word (and aliases) → kind.
const COMMAND_WORDS: &[(&str, CommandKind)] = &[
    ("quest", CommandKind::Quest),
    ("poboczny", CommandKind::SideQuest),
    ("side-quest", CommandKind::SideQuest),
    ("hook", CommandKind::Hook),
    ("sekret", CommandKind::Secret),
    ("przydomek", CommandKind::Nickname),
    ("npc", CommandKind::Npc),
    ("frakcja", CommandKind::Faction),
    ("porada", CommandKind::Advice),
    ("cechy", CommandKind::Traits),
    ("relacje", CommandKind::Relations),
    ("analiza", CommandKind::Relations),
    ("streszczenie", CommandKind::Summary),
    ("diagnoza", CommandKind::Diagnosis),
];

impl CommandKind {
    pub fn from_str(word: &str) -> Option<CommandKind> {
        let word = word.to_lowercase();
        COMMAND_WORDS
            .iter()
            .find(|(w, _)| *w == word)
            .map(|(_, kind)| *kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Quest => "quest",
            CommandKind::SideQuest => "poboczny",
            CommandKind::Hook => "hook",
            CommandKind::Secret => "sekret",
            CommandKind::Nickname => "przydomek",
            CommandKind::Npc => "npc",
            CommandKind::Faction => "frakcja",
            CommandKind::Advice => "porada",
            CommandKind::Traits => "cechy",
            CommandKind::Relations => "relacje",
            CommandKind::Summary => "streszczenie",
            CommandKind::Diagnosis => "diagnoza",
        }
    }

    pub fn schema(&self) -> ResponseSchema {
        match self {
            CommandKind::Quest | CommandKind::SideQuest => ResponseSchema::Quest,
            CommandKind::Hook => ResponseSchema::Hook,
            CommandKind::Secret | CommandKind::Nickname | CommandKind::Npc => {
                ResponseSchema::NpcEnrichment
            }
            CommandKind::Faction | CommandKind::Advice => ResponseSchema::Advisory,
            CommandKind::Traits => ResponseSchema::TraitAnalysis,
            CommandKind::Relations => ResponseSchema::RelationAnalysis,
            CommandKind::Summary => ResponseSchema::Summarization,
            CommandKind::Diagnosis => ResponseSchema::Diagnosis,
        }
    }

    pub fn goal_type(&self) -> GoalType {
        match self {
            CommandKind::Quest => GoalType::Quest,
            CommandKind::SideQuest => GoalType::SideQuest,
            CommandKind::Hook => GoalType::Hook,
            CommandKind::Secret => GoalType::Secret,
            CommandKind::Nickname => GoalType::Nickname,
            CommandKind::Faction => GoalType::Faction,
            CommandKind::Traits => GoalType::Traits,
            CommandKind::Relations => GoalType::Analysis,
            CommandKind::Npc | CommandKind::Advice | CommandKind::Summary | CommandKind::Diagnosis => {
                GoalType::Unknown
            }
        }
    }

    /// Context blocks a command pulls in without asking.
    pub fn default_contexts(&self) -> &'static [ContextName] {
        match self {
            CommandKind::Quest | CommandKind::SideQuest => &[
                ContextName::Geography,
                ContextName::System,
                ContextName::Aspirations,
                ContextName::Quests,
            ],
            CommandKind::Hook => &[ContextName::Geography, ContextName::Aspirations, ContextName::Weaknesses],
            CommandKind::Secret | CommandKind::Nickname | CommandKind::Npc => {
                &[ContextName::Geography, ContextName::Weaknesses]
            }
            CommandKind::Faction | CommandKind::Advice => &[ContextName::Geography, ContextName::System],
            CommandKind::Traits => &[ContextName::Aspirations, ContextName::Weaknesses],
            CommandKind::Relations | CommandKind::Summary => &[ContextName::Geography],
            CommandKind::Diagnosis => &[ContextName::System],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlashCommand {
    pub kind: CommandKind,
    /// Profile reference given with `#reference`.
    pub target: Option<String>,
    /// Remaining free text, `@field` references untouched.
    pub text: String,
    pub constraints: Constraints,
}

pub fn is_command(input: &str) -> bool {
    input.trim_start().starts_with('/')
}

/// Parse `/word [#reference] text`. An unrecognised word is an error; the
/// caller decides whether to fall back to discovery.
pub fn parse(input: &str) -> Result<SlashCommand> {
    let trimmed = input.trim();
    let Some(body) = trimmed.strip_prefix('/') else {
        return Err(AssistantError::UnknownCommand(trimmed.to_string()));
    };

    let (word, rest) = match body.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (body, ""),
    };
    let kind = CommandKind::from_str(word)
        .ok_or_else(|| AssistantError::UnknownCommand(word.to_string()))?;

    let (target, text) = match rest.strip_prefix('#') {
        Some(tagged) => match tagged.split_once(char::is_whitespace) {
            Some((reference, text)) => (Some(reference.to_string()), text.trim().to_string()),
            None => (Some(tagged.to_string()), String::new()),
        },
        None => (None, rest.to_string()),
    };
    let target = target.filter(|r| !r.is_empty());

    Ok(SlashCommand {
        kind,
        target,
        constraints: Constraints::extract(&text),
        text,
    })
}

impl SlashCommand {
    /// Text handed to the assembler; a bare command gets a default request.
    pub fn request_text(&self) -> String {
        if self.text.is_empty() {
            format!("Przygotuj: {} dla @imie.", self.kind.goal_type().display_name())
        } else {
            self.text.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_target_and_constraints() {
        let cmd = parse("/quest #lotka coś o przemycie, ton: mroczny").unwrap();
        assert_eq!(cmd.kind, CommandKind::Quest);
        assert_eq!(cmd.target.as_deref(), Some("lotka"));
        assert_eq!(cmd.text, "coś o przemycie, ton: mroczny");
        assert_eq!(cmd.constraints.tone.as_deref(), Some("mroczny"));
        assert_eq!(cmd.kind.schema(), ResponseSchema::Quest);
    }

    #[test]
    fn test_parse_keeps_field_references() {
        let cmd = parse("/HOOK dla @imie").unwrap();
        assert_eq!(cmd.kind, CommandKind::Hook);
        assert!(cmd.target.is_none());
        assert_eq!(cmd.request_text(), "dla @imie");
    }

    #[test]
    fn test_bare_command_gets_default_request() {
        let cmd = parse("/przydomek #row-7").unwrap();
        assert_eq!(cmd.target.as_deref(), Some("row-7"));
        assert!(cmd.request_text().contains("przydomek"));
    }

    #[test]
    fn test_unknown_command() {
        assert!(matches!(
            parse("/taniec @imie"),
            Err(AssistantError::UnknownCommand(ref w)) if w == "taniec"
        ));
        assert!(is_command("  /quest"));
        assert!(!is_command("quest"));
    }
}
