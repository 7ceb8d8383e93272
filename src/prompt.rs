//! Prompt assembly: persona preamble, model preamble, resolved `@references`,
//! budgeted context blocks, the character card and the response schema.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::PromptBudgets;
use crate::context_store::{truncate_chars, ContextName, ContextStore};
use crate::error::{AssistantError, Result};
use crate::profile::{field_for_reference, Profile};
use crate::prompts::{self, ResponseSchema};
use crate::recipe::{Constraints, GoalType, Recipe};

static FIELD_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@([\p{L}_][\p{L}\p{N}_]*)").expect("field reference pattern is valid")
});

impl ResponseSchema {
    pub fn for_goal(goal: GoalType) -> ResponseSchema {
        match goal {
            GoalType::Quest | GoalType::SideQuest => ResponseSchema::Quest,
            GoalType::Hook => ResponseSchema::Hook,
            GoalType::Analysis => ResponseSchema::RelationAnalysis,
            GoalType::Secret | GoalType::Nickname => ResponseSchema::NpcEnrichment,
            GoalType::Traits => ResponseSchema::TraitAnalysis,
            GoalType::Faction | GoalType::Unknown => ResponseSchema::Advisory,
        }
    }
}

/// Everything the assembler needs besides the source text and the profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub model: String,
    pub schema: ResponseSchema,
    /// Context blocks to include; order here is irrelevant.
    pub contexts: Vec<ContextName>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub budgets: PromptBudgets,
}

impl PromptConfig {
    pub fn new(model: impl Into<String>, schema: ResponseSchema) -> Self {
        Self {
            model: model.into(),
            schema,
            contexts: Vec::new(),
            constraints: Constraints::default(),
            budgets: PromptBudgets::default(),
        }
    }

    pub fn with_contexts(mut self, contexts: impl IntoIterator<Item = ContextName>) -> Self {
        self.contexts = contexts.into_iter().collect();
        self
    }

    pub fn with_budgets(mut self, budgets: PromptBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Config for a recipe finished by discovery.
    pub fn from_recipe(recipe: &Recipe, model: impl Into<String>, budgets: PromptBudgets) -> Self {
        let schema = ResponseSchema::for_goal(recipe.goal_type().unwrap_or(GoalType::Unknown));
        Self {
            model: model.into(),
            schema,
            contexts: recipe.included_contexts(),
            constraints: recipe.constraints.clone(),
            budgets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
}

impl fmt::Display for AssembledPrompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\n\n{}", self.system_prompt, self.user_prompt)
    }
}

/// Build the final prompt. Pure: same inputs, same output.
pub fn assemble(
    source: &str,
    profile: Option<&Profile>,
    config: &PromptConfig,
    contexts: &ContextStore,
) -> Result<AssembledPrompt> {
    if config.schema.requires_profile() && profile.is_none() {
        return Err(AssistantError::MissingProfile(config.schema.as_str().to_string()));
    }

    let system_prompt = format!(
        "{persona}\n\n{model}",
        persona = prompts::PERSONA_PREAMBLE,
        model = prompts::model_preamble(&config.model),
    );

    let mut sections = Vec::new();

    for name in ContextName::ALL {
        if !config.contexts.contains(&name) {
            continue;
        }
        let block = contexts.get_context(name, config.budgets.budget_for(name));
        if block.trim().is_empty() {
            continue;
        }
        sections.push(format!("=== {} ===\n{}", name.heading(), block.trim_end()));
    }

    if let Some(profile) = profile {
        let card = character_card(profile, config.budgets.profile_chars);
        if !card.is_empty() {
            sections.push(card);
        }
    }

    if let Some(constraints) = constraints_block(&config.constraints) {
        sections.push(constraints);
    }

    let request = match profile {
        Some(profile) => resolve_references(source, profile),
        None => source.to_string(),
    };
    sections.push(format!("=== ZADANIE ===\n{}", request.trim()));
    sections.push(config.schema.block());

    Ok(AssembledPrompt {
        system_prompt,
        user_prompt: sections.join("\n\n"),
    })
}

/// Replace `@token` with `[Field: value]` for known, non-empty profile fields.
/// Anything else stays exactly as written.
pub fn resolve_references(text: &str, profile: &Profile) -> String {
    FIELD_REFERENCE
        .replace_all(text, |caps: &Captures| {
            let whole = caps[0].to_string();
            let Some(field) = field_for_reference(&caps[1]) else {
                return whole;
            };
            match profile.get_field(field).map(str::trim) {
                Some(value) if !value.is_empty() => format!("[{}: {}]", field, value),
                _ => whole,
            }
        })
        .into_owned()
}

fn character_card(profile: &Profile, max_chars: usize) -> String {
    let lines: Vec<String> = profile
        .filled_fields()
        .map(|(name, value)| format!("{}: {}", name, value.trim()))
        .collect();
    if lines.is_empty() {
        return String::new();
    }
    let body = truncate_chars(&lines.join("\n"), max_chars);
    format!("=== KARTA POSTACI: {} ===\n{}", profile.display_name(), body)
}

fn constraints_block(constraints: &Constraints) -> Option<String> {
    if constraints.is_empty() {
        return None;
    }
    let mut lines = Vec::new();
    if let Some(tone) = &constraints.tone {
        lines.push(format!("- Ton: {}", tone));
    }
    if let Some(theme) = &constraints.theme {
        lines.push(format!("- Motyw przewodni: {}", theme));
    }
    if !constraints.exclude_tones.is_empty() {
        let tones: Vec<&str> = constraints.exclude_tones.iter().map(String::as_str).collect();
        lines.push(format!("- Unikaj tonów: {}", tones.join(", ")));
    }
    if !constraints.exclude_themes.is_empty() {
        let themes: Vec<&str> = constraints.exclude_themes.iter().map(String::as_str).collect();
        lines.push(format!("- Unikaj motywów: {}", themes.join(", ")));
    }
    Some(format!("=== OGRANICZENIA ===\n{}", lines.join("\n")))
}

/// Pull the `_thought_process` field out of a structured reply. Best effort:
/// code fences are stripped and any parse failure yields `None`.
pub fn extract_thought_process(answer: &str) -> Option<String> {
    let cleaned = answer
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    if end < start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&cleaned[start..=end]).ok()?;
    value
        .get("_thought_process")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{FIELD_GUILD, FIELD_HISTORY, FIELD_NAME};

    fn lotka() -> Profile {
        Profile::new("lotka")
            .with_field(FIELD_NAME, "Lotka")
            .with_field(FIELD_GUILD, "Przewoźnicy")
            .with_field(FIELD_HISTORY, "")
    }

    fn store() -> ContextStore {
        ContextStore::with_blocks([
            (ContextName::Quests, "Przykładowy quest o moście"),
            (ContextName::Geography, "Dolina Mgieł leży na północy"),
            (ContextName::System, "Zasady walki"),
        ])
    }

    #[test]
    fn test_assemble_is_idempotent() {
        let config = PromptConfig::new("qwen3:8b", ResponseSchema::Quest)
            .with_contexts([ContextName::Quests, ContextName::Geography]);
        let profile = lotka();
        let first = assemble("quest dla @imie", Some(&profile), &config, &store()).unwrap();
        let second = assemble("quest dla @imie", Some(&profile), &config, &store()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn test_references_resolve_or_stay_verbatim() {
        let profile = lotka();
        let text = resolve_references("Dla @imie z @gildia, @historia i @unknown_xyz", &profile);
        assert!(text.contains("Lotka"));
        assert!(text.contains("[Gildia: Przewoźnicy]"));
        assert!(text.contains("@historia"));
        assert!(text.contains("@unknown_xyz"));
        assert!(!text.contains("@imie"));
    }

    #[test]
    fn test_context_blocks_follow_fixed_order_and_budget() {
        let mut budgets = PromptBudgets::default();
        budgets.context_chars.geography = 10;
        let config = PromptConfig::new("llama3", ResponseSchema::Hook)
            .with_contexts([ContextName::Quests, ContextName::Geography, ContextName::Weaknesses])
            .with_budgets(budgets);

        let prompt = assemble("hook", Some(&lotka()), &config, &store()).unwrap();
        let user = &prompt.user_prompt;
        let geo = user.find("GEOGRAFIA ŚWIATA").unwrap();
        let quests = user.find("PRZYKŁADOWE QUESTY").unwrap();
        assert!(geo < quests);
        assert!(user.contains("Dolina Mgi\n"));
        assert!(!user.contains("ZASADY SYSTEMU"));
        assert!(!user.contains("SŁABOŚCI POSTACI"));
        assert!(prompt.system_prompt.contains(prompts::LLAMA_PREAMBLE));
    }

    #[test]
    fn test_schema_block_and_persona_always_present() {
        let config = PromptConfig::new("unknown-model", ResponseSchema::Advisory);
        let prompt = assemble("Jak prowadzić frakcję?", None, &config, &store()).unwrap();
        assert!(prompt.system_prompt.starts_with(prompts::PERSONA_PREAMBLE));
        assert!(prompt.system_prompt.contains(prompts::BASE_LANGUAGE_PREAMBLE));
        assert!(prompt.user_prompt.contains("_thought_process"));
        assert!(prompt.user_prompt.contains("FORMAT ODPOWIEDZI (ADVISORY)"));
    }

    #[test]
    fn test_missing_profile_is_an_error() {
        let config = PromptConfig::new("qwen3:8b", ResponseSchema::Quest);
        let err = assemble("quest", None, &config, &store()).unwrap_err();
        assert!(matches!(err, AssistantError::MissingProfile(ref s) if s == "QUEST"));
    }

    #[test]
    fn test_character_card_skips_empty_fields() {
        let config = PromptConfig::new("qwen3:8b", ResponseSchema::TraitAnalysis);
        let prompt = assemble("analiza", Some(&lotka()), &config, &store()).unwrap();
        assert!(prompt.user_prompt.contains("KARTA POSTACI: Lotka"));
        assert!(prompt.user_prompt.contains("Gildia: Przewoźnicy"));
        assert!(!prompt.user_prompt.contains("Historia postaci:"));
    }

    #[test]
    fn test_from_recipe_maps_goal_and_constraints() {
        let mut recipe = Recipe::new();
        recipe.set_goal(GoalType::Secret, "sekret dla @imie");
        recipe.set_context(ContextName::System, true);
        recipe.constraints.exclude_themes.insert("romans".into());

        let config = PromptConfig::from_recipe(&recipe, "qwen3:8b", PromptBudgets::default());
        assert_eq!(config.schema, ResponseSchema::NpcEnrichment);
        assert_eq!(config.contexts, vec![ContextName::System]);

        let prompt = assemble("sekret dla @imie", Some(&lotka()), &config, &store()).unwrap();
        assert!(prompt.user_prompt.contains("Unikaj motywów: romans"));
        assert!(prompt.user_prompt.contains("[Imie postaci: Lotka]"));
    }

    #[test]
    fn test_extract_thought_process() {
        let fenced = "```json\n{\"_thought_process\": \"za drogo\", \"tytul\": \"Most\"}\n```";
        assert_eq!(extract_thought_process(fenced).as_deref(), Some("za drogo"));
        assert_eq!(extract_thought_process("zwykły tekst"), None);
        assert_eq!(extract_thought_process("{\"tytul\": \"x\"}"), None);
    }
}
