use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Ai,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Ai => "AI",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Most recent turns of a conversation; the oldest turn is dropped first once
/// the window is full.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationWindow {
    capacity: usize,
    turns: VecDeque<Turn>,
}

impl ConversationWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            turns: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, role: Role, text: impl Into<String>) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(Turn {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    /// Text of the latest user turn before the most recent one.
    pub fn previous_user_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .filter(|t| t.role == Role::User)
            .nth(1)
            .map(|t| t.text.as_str())
    }

    /// Text of the most recent assistant turn.
    pub fn last_ai_text(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::Ai)
            .map(|t| t.text.as_str())
    }

    /// `ROLE: text` lines, oldest first.
    pub fn format_for_prompt(&self) -> String {
        self.turns
            .iter()
            .map(|t| format!("{}: {}", t.role.as_str(), t.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_turn_evicted_first() {
        let mut window = ConversationWindow::new(3);
        for i in 0..5 {
            window.push(Role::User, format!("turn {}", i));
        }
        let texts: Vec<_> = window.turns().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["turn 2", "turn 3", "turn 4"]);
    }

    #[test]
    fn test_previous_user_text_skips_ai_turns() {
        let mut window = ConversationWindow::default();
        window.push(Role::User, "quest dla Lotki");
        window.push(Role::Ai, "Jaki ton?");
        window.push(Role::User, "mroczny");
        assert_eq!(window.previous_user_text(), Some("quest dla Lotki"));
        assert_eq!(window.last_ai_text(), Some("Jaki ton?"));
        assert_eq!(
            window.format_for_prompt(),
            "USER: quest dla Lotki\nAI: Jaki ton?\nUSER: mroczny"
        );
    }
}
