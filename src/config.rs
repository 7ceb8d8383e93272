//! Assistant configuration.
//!
//! Read from `<config_dir>/loremaster/config.toml`. Every field has a default,
//! so a missing file or a partial file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::context_store::ContextName;
use crate::error::{AssistantError, Result};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "qwen3:8b";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    pub ollama_url: String,
    pub default_model: String,
    /// Model used for the single-label intent and yes/no classification calls.
    /// Falls back to `default_model` when unset.
    pub classifier_model: Option<String>,
    pub generation_temperature: f32,
    pub request_timeout_secs: u64,
    pub discovery: DiscoveryConfig,
    pub prompt: PromptBudgets,
    pub context_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: String,
    pub stream_channel_capacity: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            classifier_model: None,
            generation_temperature: 0.7,
            request_timeout_secs: 300,
            discovery: DiscoveryConfig::default(),
            prompt: PromptBudgets::default(),
            context_dir: None,
            database_path: None,
            log_dir: None,
            log_level: "info".to_string(),
            stream_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Questions the assistant may ask before generation is forced.
    pub max_questions: u32,
    /// Conversation turns kept for prompt context.
    pub history_window: usize,
    /// Word-overlap ratio below which a new turn counts as a topic change.
    pub topic_shift_threshold: f32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_questions: 5,
            history_window: 10,
            topic_shift_threshold: 0.1,
        }
    }
}

/// Character budgets for the blocks injected into generation prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptBudgets {
    pub context_chars: ContextBudgets,
    pub profile_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextBudgets {
    pub geography: usize,
    pub system: usize,
    pub aspirations: usize,
    pub weaknesses: usize,
    pub quests: usize,
}

impl Default for ContextBudgets {
    fn default() -> Self {
        Self {
            geography: ContextName::Geography.default_budget(),
            system: ContextName::System.default_budget(),
            aspirations: ContextName::Aspirations.default_budget(),
            weaknesses: ContextName::Weaknesses.default_budget(),
            quests: ContextName::Quests.default_budget(),
        }
    }
}

impl PromptBudgets {
    pub fn budget_for(&self, name: ContextName) -> usize {
        let budgets = &self.context_chars;
        match name {
            ContextName::Geography => budgets.geography,
            ContextName::System => budgets.system,
            ContextName::Aspirations => budgets.aspirations,
            ContextName::Weaknesses => budgets.weaknesses,
            ContextName::Quests => budgets.quests,
        }
    }
}

impl Default for PromptBudgets {
    fn default() -> Self {
        Self {
            context_chars: ContextBudgets::default(),
            profile_chars: 6000,
        }
    }
}

impl AssistantConfig {
    /// `<config_dir>/loremaster/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("loremaster").join("config.toml"))
    }

    /// Load from the default location, falling back to defaults when absent.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| AssistantError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.generation_temperature) {
            return Err(AssistantError::Config(format!(
                "generation_temperature must be within [0, 1], got {}",
                self.generation_temperature
            )));
        }
        if self.discovery.history_window == 0 {
            return Err(AssistantError::Config(
                "discovery.history_window must be at least 1".to_string(),
            ));
        }
        if self.stream_channel_capacity == 0 {
            return Err(AssistantError::Config(
                "stream_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn classifier_model(&self) -> &str {
        self.classifier_model
            .as_deref()
            .unwrap_or(&self.default_model)
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("loremaster")
                .join("jobs.db")
        })
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(crate::logging::default_log_dir)
    }
}
