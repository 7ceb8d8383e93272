//! The recipe: what the game master wants generated, built up during discovery,
//! and the validator that decides whether it is ready.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::context_store::ContextName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GoalType {
    Quest,
    SideQuest,
    Hook,
    Analysis,
    Secret,
    Nickname,
    Faction,
    Traits,
    Unknown,
}

/// Keyword stems checked in order; the first hit decides the goal type.
const GOAL_KEYWORDS: &[(GoalType, &[&str])] = &[
    (GoalType::SideQuest, &["side quest", "side-quest", "poboczn"]),
    (GoalType::Hook, &["hook", "zaczep", "haczyk"]),
    (GoalType::Secret, &["sekret", "tajemnic", "secret"]),
    (GoalType::Nickname, &["przydomek", "przydomk", "pseudonim", "ksyw", "nickname"]),
    (GoalType::Faction, &["frakcj", "faction"]),
    (GoalType::Traits, &["cech", "trait"]),
    (GoalType::Analysis, &["analiz", "relacj", "analysis"]),
    (GoalType::Quest, &["quest", "zadani", "misj"]),
];

impl GoalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GoalType::Quest => "QUEST",
            GoalType::SideQuest => "SIDE_QUEST",
            GoalType::Hook => "HOOK",
            GoalType::Analysis => "ANALYSIS",
            GoalType::Secret => "SECRET",
            GoalType::Nickname => "NICKNAME",
            GoalType::Faction => "FACTION",
            GoalType::Traits => "TRAITS",
            GoalType::Unknown => "UNKNOWN",
        }
    }

    /// Polish noun used in assistant replies.
    pub fn display_name(&self) -> &'static str {
        match self {
            GoalType::Quest => "quest",
            GoalType::SideQuest => "quest poboczny",
            GoalType::Hook => "hook fabularny",
            GoalType::Analysis => "analizę relacji",
            GoalType::Secret => "sekret postaci",
            GoalType::Nickname => "przydomek",
            GoalType::Faction => "frakcję",
            GoalType::Traits => "analizę cech",
            GoalType::Unknown => "coś jeszcze nieokreślonego",
        }
    }

    /// Guess the goal type from free text.
    pub fn infer(text: &str) -> GoalType {
        let lower = text.to_lowercase();
        GOAL_KEYWORDS
            .iter()
            .find(|(_, stems)| stems.iter().any(|stem| lower.contains(stem)))
            .map(|(goal, _)| *goal)
            .unwrap_or(GoalType::Unknown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    #[serde(rename = "type")]
    pub goal_type: GoalType,
    /// The user's own words describing the goal; may contain `@references`.
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub tone: Option<String>,
    pub theme: Option<String>,
    #[serde(default)]
    pub exclude_tones: BTreeSet<String>,
    #[serde(default)]
    pub exclude_themes: BTreeSet<String>,
}

static CONSTRAINT_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(bez-motywu|bez-tonu|exclude-theme|exclude-tone|motyw|theme|ton|tone)\s*:\s*([^,;.\n]+)")
        .expect("constraint marker pattern is valid")
});

impl Constraints {
    /// Pull `ton: ...`, `motyw: ...`, `bez-tonu: ...`, `bez-motywu: ...` markers
    /// out of free text. Values are lowercased and trimmed.
    pub fn extract(text: &str) -> Constraints {
        let mut constraints = Constraints::default();
        for caps in CONSTRAINT_MARKER.captures_iter(text) {
            let value = caps[2].trim().to_lowercase();
            if value.is_empty() {
                continue;
            }
            match caps[1].to_lowercase().as_str() {
                "ton" | "tone" => constraints.tone = Some(value),
                "motyw" | "theme" => constraints.theme = Some(value),
                "bez-tonu" | "exclude-tone" => {
                    constraints.exclude_tones.insert(value);
                }
                _ => {
                    constraints.exclude_themes.insert(value);
                }
            }
        }
        constraints
    }

    /// Later values win for tone/theme; exclusions accumulate.
    pub fn merge(&mut self, other: Constraints) {
        if other.tone.is_some() {
            self.tone = other.tone;
        }
        if other.theme.is_some() {
            self.theme = other.theme;
        }
        self.exclude_tones.extend(other.exclude_tones);
        self.exclude_themes.extend(other.exclude_themes);
    }

    pub fn is_empty(&self) -> bool {
        self.tone.is_none()
            && self.theme.is_none()
            && self.exclude_tones.is_empty()
            && self.exclude_themes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub goal: Option<Goal>,
    #[serde(default)]
    pub context_slots: BTreeMap<ContextName, bool>,
    #[serde(default)]
    pub constraints: Constraints,
    #[serde(default)]
    pub questions_asked: u32,
}

impl Recipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// A goal of type UNKNOWN does not count as set.
    pub fn goal_type(&self) -> Option<GoalType> {
        self.goal
            .as_ref()
            .map(|g| g.goal_type)
            .filter(|t| *t != GoalType::Unknown)
    }

    pub fn set_goal(&mut self, goal_type: GoalType, text: impl Into<String>) {
        self.goal = Some(Goal {
            goal_type,
            text: text.into(),
        });
    }

    pub fn set_context(&mut self, name: ContextName, include: bool) {
        self.context_slots.insert(name, include);
    }

    /// Included blocks in prompt order.
    pub fn included_contexts(&self) -> Vec<ContextName> {
        ContextName::ALL
            .into_iter()
            .filter(|name| self.context_slots.get(name).copied().unwrap_or(false))
            .collect()
    }

    pub fn has_context(&self) -> bool {
        self.context_slots.values().any(|included| *included)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationIssue {
    MissingGoal,
    NoContext,
    ThemeExcluded(String),
    /// Advisory only; never blocks generation.
    ToneExcluded(String),
}

impl ValidationIssue {
    pub fn is_blocking(&self) -> bool {
        !matches!(self, ValidationIssue::ToneExcluded(_))
    }

    /// Next-question hint shown to the user.
    pub fn hint(&self) -> String {
        match self {
            ValidationIssue::MissingGoal => {
                "Powiedz, co mam przygotować: quest, hook, sekret, przydomek, frakcję lub analizę.".to_string()
            }
            ValidationIssue::NoContext => {
                "Wybierz przynajmniej jeden kontekst: geografię, zasady, aspiracje, słabości lub questy.".to_string()
            }
            ValidationIssue::ThemeExcluded(theme) => {
                format!("Motyw \"{}\" jest jednocześnie wykluczony. Zostawić go czy usunąć?", theme)
            }
            ValidationIssue::ToneExcluded(tone) => {
                format!("Ton \"{}\" jest na liście wykluczonych. Czy na pewno go użyć?", tone)
            }
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::MissingGoal => write!(f, "goal type is missing"),
            ValidationIssue::NoContext => write!(f, "insufficient context: no context block selected"),
            ValidationIssue::ThemeExcluded(theme) => {
                write!(f, "theme '{}' is also listed in exclude_themes", theme)
            }
            ValidationIssue::ToneExcluded(tone) => {
                write!(f, "tone '{}' is also listed in exclude_tones (advisory)", tone)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

/// Check every rule and collect every issue. Never fails.
pub fn validate(recipe: &Recipe) -> ValidationReport {
    let mut issues = Vec::new();

    if recipe.goal_type().is_none() {
        issues.push(ValidationIssue::MissingGoal);
    }

    if !recipe.has_context() {
        issues.push(ValidationIssue::NoContext);
    }

    let constraints = &recipe.constraints;
    if let Some(theme) = &constraints.theme {
        if constraints.exclude_themes.contains(theme) {
            issues.push(ValidationIssue::ThemeExcluded(theme.clone()));
        }
    }
    if let Some(tone) = &constraints.tone {
        if constraints.exclude_tones.contains(tone) {
            issues.push(ValidationIssue::ToneExcluded(tone.clone()));
        }
    }

    ValidationReport {
        valid: issues.iter().all(|issue| !issue.is_blocking()),
        issues,
    }
}

/// Goal plus one context block: enough for an early forced generation.
pub fn is_minimally_complete(recipe: &Recipe) -> bool {
    recipe.goal_type().is_some() && recipe.has_context()
}

/// One hint per failing check, in rule order.
pub fn suggest_missing(recipe: &Recipe) -> Vec<String> {
    validate(recipe).issues.iter().map(ValidationIssue::hint).collect()
}
