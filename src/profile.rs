//! Character profiles as the core sees them: an ordered, read-only map of
//! spreadsheet columns. Parsing the spreadsheet itself happens elsewhere.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const FIELD_NAME: &str = "Imie postaci";
pub const FIELD_GUILD: &str = "Gildia";
pub const FIELD_HISTORY: &str = "Historia postaci";
pub const FIELD_WEAKNESSES: &str = "Słabości";
pub const FIELD_ASPIRATIONS: &str = "Aspiracje";
pub const FIELD_FACTION: &str = "Frakcja";
pub const FIELD_RACE: &str = "Rasa";
pub const FIELD_PROFESSION: &str = "Profesja";
pub const FIELD_TRAITS: &str = "Cechy";
pub const FIELD_RELATIONS: &str = "Relacje";
pub const FIELD_SECRETS: &str = "Sekrety";
pub const FIELD_PLAYER: &str = "Gracz";

/// `@reference` token → profile field it resolves to.
pub const FIELD_REFERENCES: &[(&str, &str)] = &[
    ("imie", FIELD_NAME),
    ("postac", FIELD_NAME),
    ("gildia", FIELD_GUILD),
    ("historia", FIELD_HISTORY),
    ("slabosci", FIELD_WEAKNESSES),
    ("aspiracje", FIELD_ASPIRATIONS),
    ("frakcja", FIELD_FACTION),
    ("rasa", FIELD_RACE),
    ("profesja", FIELD_PROFESSION),
    ("cechy", FIELD_TRAITS),
    ("relacje", FIELD_RELATIONS),
    ("sekrety", FIELD_SECRETS),
    ("gracz", FIELD_PLAYER),
];

pub fn field_for_reference(token: &str) -> Option<&'static str> {
    let token = token.to_lowercase();
    FIELD_REFERENCES
        .iter()
        .find(|(reference, _)| *reference == token)
        .map(|(_, field)| *field)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Reference key the profile store knows this record by (row id, file name).
    pub reference: String,
    /// Column name → value, in spreadsheet column order.
    fields: Vec<(String, String)>,
    /// Survey-style answers ("ans1".."ans9") when the sheet has them.
    #[serde(default)]
    pub raw_answers: BTreeMap<String, String>,
}

impl Profile {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            ..Default::default()
        }
    }

    /// Builder-style field insertion; a repeated name replaces the earlier value
    /// while keeping its column position.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    pub fn with_answer(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.raw_answers.insert(key.into(), value.into());
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .or_else(|| self.raw_answers.get(name).map(String::as_str))
    }

    pub fn get_all_field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Non-empty fields in column order.
    pub fn filled_fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .filter(|(_, v)| !v.trim().is_empty())
            .map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Character name, falling back to the reference key.
    pub fn display_name(&self) -> &str {
        self.get_field(FIELD_NAME)
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(&self.reference)
    }
}

/// Source of profile records. Implemented by the ingestion layer.
pub trait ProfileStore: Send + Sync {
    fn profile(&self, reference: &str) -> Option<Profile>;

    fn get_field(&self, profile: &Profile, field_name: &str) -> Option<String> {
        profile.get_field(field_name).map(str::to_string)
    }

    fn get_all_field_names(&self, profile: &Profile) -> Vec<String> {
        profile
            .get_all_field_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

/// In-memory store keyed by reference.
#[derive(Debug, Default, Clone)]
pub struct MemoryProfileStore {
    profiles: BTreeMap<String, Profile>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, profile: Profile) {
        self.profiles.insert(profile.reference.clone(), profile);
    }

    pub fn references(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn profile(&self, reference: &str) -> Option<Profile> {
        self.profiles.get(reference).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_keep_column_order() {
        let profile = Profile::new("row-2")
            .with_field(FIELD_NAME, "Lotka")
            .with_field(FIELD_GUILD, "Kupcy")
            .with_field(FIELD_NAME, "Lotka z Brzegu");

        assert_eq!(profile.get_all_field_names(), vec![FIELD_NAME, FIELD_GUILD]);
        assert_eq!(profile.get_field(FIELD_NAME), Some("Lotka z Brzegu"));
        assert_eq!(profile.display_name(), "Lotka z Brzegu");
    }

    #[test]
    fn test_raw_answers_are_reachable() {
        let profile = Profile::new("row-3").with_answer("ans4", "Boi się wody");
        assert_eq!(profile.get_field("ans4"), Some("Boi się wody"));
        assert_eq!(profile.display_name(), "row-3");
    }

    #[test]
    fn test_reference_table_is_case_insensitive() {
        assert_eq!(field_for_reference("IMIE"), Some(FIELD_NAME));
        assert_eq!(field_for_reference("unknown_xyz"), None);
    }

    #[test]
    fn test_memory_store_lookup() {
        let mut store = MemoryProfileStore::new();
        store.insert(Profile::new("lotka").with_field(FIELD_NAME, "Lotka"));
        let profile = store.profile("lotka").unwrap();
        assert_eq!(store.get_field(&profile, FIELD_NAME).as_deref(), Some("Lotka"));
        assert!(store.profile("missing").is_none());
    }
}
