//! Reference-text blocks (lore, rules, quest examples) injected into prompts.
//!
//! Blocks are read from `<context_dir>/<name>.txt` (or `.md`) the first time any
//! block is requested, then cached for the life of the store. A missing file
//! yields an empty block: absence degrades prompt quality, never availability.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextName {
    Geography,
    System,
    Aspirations,
    Weaknesses,
    Quests,
}

impl ContextName {
    /// Prompt order: geography, system, aspirations, weaknesses, quests.
    pub const ALL: [ContextName; 5] = [
        ContextName::Geography,
        ContextName::System,
        ContextName::Aspirations,
        ContextName::Weaknesses,
        ContextName::Quests,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextName::Geography => "geography",
            ContextName::System => "system",
            ContextName::Aspirations => "aspirations",
            ContextName::Weaknesses => "weaknesses",
            ContextName::Quests => "quests",
        }
    }

    /// Accepts the English block names and the Polish words used in the UI.
    pub fn from_str(s: &str) -> Option<ContextName> {
        match s.trim().to_lowercase().as_str() {
            "geography" | "geografia" => Some(ContextName::Geography),
            "system" | "zasady" => Some(ContextName::System),
            "aspirations" | "aspiracje" => Some(ContextName::Aspirations),
            "weaknesses" | "slabosci" | "słabości" => Some(ContextName::Weaknesses),
            "quests" | "questy" | "zadania" => Some(ContextName::Quests),
            _ => None,
        }
    }

    /// Section heading used inside prompts.
    pub fn heading(&self) -> &'static str {
        match self {
            ContextName::Geography => "GEOGRAFIA ŚWIATA",
            ContextName::System => "ZASADY SYSTEMU",
            ContextName::Aspirations => "ASPIRACJE POSTACI",
            ContextName::Weaknesses => "SŁABOŚCI POSTACI",
            ContextName::Quests => "PRZYKŁADOWE QUESTY",
        }
    }

    /// Polish name used in clarifying questions.
    pub fn display_name(&self) -> &'static str {
        match self {
            ContextName::Geography => "geografię świata",
            ContextName::System => "zasady systemu",
            ContextName::Aspirations => "aspiracje postaci",
            ContextName::Weaknesses => "słabości postaci",
            ContextName::Quests => "przykładowe questy",
        }
    }

    pub fn default_budget(&self) -> usize {
        match self {
            ContextName::Geography => 3000,
            ContextName::System => 4000,
            ContextName::Aspirations => 2500,
            ContextName::Weaknesses => 2500,
            ContextName::Quests => 4000,
        }
    }
}

/// Lazily populated, then read-only store of context blocks.
#[derive(Debug, Default)]
pub struct ContextStore {
    dir: Option<PathBuf>,
    blocks: OnceCell<HashMap<ContextName, String>>,
}

impl ContextStore {
    /// Store backed by a directory of `<name>.txt` / `<name>.md` files.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            blocks: OnceCell::new(),
        }
    }

    /// Store with blocks supplied up front (embedded lore, tests).
    pub fn with_blocks<I, S>(blocks: I) -> Self
    where
        I: IntoIterator<Item = (ContextName, S)>,
        S: Into<String>,
    {
        let cell = OnceCell::new();
        let _ = cell.set(blocks.into_iter().map(|(k, v)| (k, v.into())).collect());
        Self { dir: None, blocks: cell }
    }

    /// Return up to `max_chars` characters of the named block; empty when the
    /// source is unavailable.
    pub fn get_context(&self, name: ContextName, max_chars: usize) -> String {
        self.blocks()
            .get(&name)
            .map(|text| truncate_chars(text, max_chars))
            .unwrap_or_default()
    }

    pub fn is_available(&self, name: ContextName) -> bool {
        self.blocks().get(&name).is_some_and(|t| !t.trim().is_empty())
    }

    fn blocks(&self) -> &HashMap<ContextName, String> {
        self.blocks.get_or_init(|| self.load_all())
    }

    fn load_all(&self) -> HashMap<ContextName, String> {
        let mut blocks = HashMap::new();
        let Some(dir) = &self.dir else {
            return blocks;
        };

        for name in ContextName::ALL {
            let candidates = [
                dir.join(format!("{}.txt", name.as_str())),
                dir.join(format!("{}.md", name.as_str())),
            ];
            let loaded = candidates.iter().find_map(|path| fs::read_to_string(path).ok());
            match loaded {
                Some(text) => {
                    logging::log_prompt(None, &format!(
                        "Loaded context block '{}' ({} chars)",
                        name.as_str(),
                        text.chars().count()
                    ));
                    blocks.insert(name, text);
                }
                None => {
                    logging::log_prompt(None, &format!(
                        "Context block '{}' unavailable in {}",
                        name.as_str(),
                        dir.display()
                    ));
                }
            }
        }

        blocks
    }
}

/// Cut `text` to at most `max_chars` characters, never splitting a character.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
