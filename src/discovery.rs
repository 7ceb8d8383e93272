//! Discovery: a short clarifying dialogue that turns free text into a recipe.
//!
//! The machine keeps no state of its own. Each turn takes the previous
//! `DiscoveryState` and the user's text and returns the next state plus the
//! assistant's reply, so the session can store, inspect or roll back state.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::config::DiscoveryConfig;
use crate::context_store::ContextName;
use crate::conversation::{ConversationWindow, Role};
use crate::knowledge;
use crate::logging;
use crate::model::{ModelInvoker, ModelRequest};
use crate::prompts::{self, StageTemplate};
use crate::recipe::{self, Constraints, GoalType, Recipe, ValidationIssue};
use crate::stream;

const GENERIC_HINT: &str = "Napisz, co mam przygotować i dla której postaci.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Greeting,
    GoalProvided,
    NeedsGoal,
    AskCapabilities,
    Problem,
    Discovery,
    Confirm,
    ForceGenerate,
    TopicChange,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Greeting => "GREETING",
            Stage::GoalProvided => "GOAL_PROVIDED",
            Stage::NeedsGoal => "NEEDS_GOAL",
            Stage::AskCapabilities => "ASK_CAPABILITIES",
            Stage::Problem => "PROBLEM",
            Stage::Discovery => "DISCOVERY",
            Stage::Confirm => "CONFIRM",
            Stage::ForceGenerate => "FORCE_GENERATE",
            Stage::TopicChange => "TOPIC_CHANGE",
        }
    }

    /// The recipe is handed to generation after these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Confirm | Stage::ForceGenerate)
    }
}

/// Label returned by the single-label intent classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    GoalProvided,
    NeedsGoal,
    AskCapabilities,
    Problem,
    Unknown,
}

impl Intent {
    pub fn from_label(label: &str) -> Option<Intent> {
        match label {
            "GREETING" => Some(Intent::Greeting),
            "GOAL_PROVIDED" => Some(Intent::GoalProvided),
            "NEEDS_GOAL" => Some(Intent::NeedsGoal),
            "ASK_CAPABILITIES" => Some(Intent::AskCapabilities),
            "PROBLEM" => Some(Intent::Problem),
            "UNKNOWN" => Some(Intent::Unknown),
            _ => None,
        }
    }
}

/// Reply to a closed question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Tak,
    Nie,
    Gotowy,
}

impl Answer {
    pub fn from_label(label: &str) -> Option<Answer> {
        match label {
            "TAK" | "YES" => Some(Answer::Tak),
            "NIE" | "NO" => Some(Answer::Nie),
            "GOTOWY" | "GOTOWE" | "READY" => Some(Answer::Gotowy),
            _ => None,
        }
    }
}

/// First known label among the words of a classifier reply. Thinking spans
/// are dropped before looking.
fn first_label<T>(reply: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let (_, answer) = stream::parse_all([reply]);
    answer
        .to_uppercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .find_map(parse)
}

/// Closed question waiting for TAK / NIE / GOTOWY.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingQuestion {
    IncludeContext(ContextName),
    /// TAK keeps the theme and drops it from the exclusions; NIE drops the theme.
    ThemeConflict(String),
    /// TAK discards the recipe and restarts from `new_text`; NIE keeps it.
    TopicChange { new_text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryState {
    pub stage: Stage,
    pub recipe: Recipe,
    pub pending: Option<PendingQuestion>,
    pub history: ConversationWindow,
    /// Context blocks already offered, so each is asked about once.
    #[serde(default)]
    pub asked_contexts: BTreeSet<ContextName>,
}

impl DiscoveryState {
    pub fn new(history_window: usize) -> Self {
        Self {
            stage: Stage::Greeting,
            recipe: Recipe::new(),
            pending: None,
            history: ConversationWindow::new(history_window),
            asked_contexts: BTreeSet::new(),
        }
    }

    /// Ready for generation.
    pub fn is_ready(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Step back from a terminal stage without losing the recipe, for when the
    /// hand-off to the queue failed.
    pub fn reopen(&mut self) {
        if self.stage.is_terminal() {
            self.stage = Stage::Discovery;
        }
        self.pending = None;
    }

    /// Forget the recipe; the conversation window is kept.
    pub fn reset(&mut self) {
        self.stage = Stage::Greeting;
        self.recipe = Recipe::new();
        self.pending = None;
        self.asked_contexts.clear();
    }
}

/// Decides whether a new free-text turn abandons the current recipe.
pub trait TopicShiftDetector: Send + Sync {
    fn is_topic_shift(&self, recipe: &Recipe, previous_user_text: Option<&str>, text: &str) -> bool;
}

/// A turn that names a different goal type and shares too few words with
/// the goal text and the previous user turn.
#[derive(Debug, Clone, Copy)]
pub struct LexicalOverlapDetector {
    pub threshold: f32,
}

impl LexicalOverlapDetector {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

fn content_words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_string)
        .collect()
}

/// Jaccard similarity of the two texts' content words.
pub fn word_overlap(a: &str, b: &str) -> f32 {
    let a = content_words(a);
    let b = content_words(b);
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f32 / union as f32
}

impl TopicShiftDetector for LexicalOverlapDetector {
    fn is_topic_shift(&self, recipe: &Recipe, previous_user_text: Option<&str>, text: &str) -> bool {
        let (Some(current), Some(goal)) = (recipe.goal_type(), recipe.goal.as_ref()) else {
            return false;
        };
        let named = GoalType::infer(text);
        if named == GoalType::Unknown || named == current {
            return false;
        }
        let reference = match previous_user_text {
            Some(previous) => format!("{} {}", goal.text, previous),
            None => goal.text.clone(),
        };
        word_overlap(&reference, text) < self.threshold
    }
}

pub struct DiscoveryMachine {
    invoker: Arc<dyn ModelInvoker>,
    classifier_model: String,
    config: DiscoveryConfig,
    detector: Box<dyn TopicShiftDetector>,
}

impl DiscoveryMachine {
    pub fn new(invoker: Arc<dyn ModelInvoker>, classifier_model: impl Into<String>, config: DiscoveryConfig) -> Self {
        let detector = Box::new(LexicalOverlapDetector::new(config.topic_shift_threshold));
        Self {
            invoker,
            classifier_model: classifier_model.into(),
            config,
            detector,
        }
    }

    pub fn with_detector(mut self, detector: Box<dyn TopicShiftDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn initial_state(&self) -> DiscoveryState {
        DiscoveryState::new(self.config.history_window)
    }

    /// Process one user turn.
    pub async fn step(&self, mut state: DiscoveryState, text: &str) -> (DiscoveryState, String) {
        if state.stage.is_terminal() {
            // The previous recipe was handed off; this turn starts a new one.
            state.reset();
        }

        let prior = state.history.format_for_prompt();
        let question = state.history.last_ai_text().unwrap_or_default().to_string();
        state.history.push(Role::User, text);

        let reply = if state.recipe.questions_asked >= self.config.max_questions {
            // The cap wins over everything else, but a bare TAK/NIE to the last
            // question still counts.
            if let Some(pending) = state.pending.take() {
                if let Some(answer @ (Answer::Tak | Answer::Nie)) = first_word_answer(text) {
                    self.record_answer(&mut state, &pending, answer);
                }
            }
            self.force(&mut state)
        } else if let Some(reply) = self.detect_topic_shift(&mut state, text) {
            reply
        } else {
            match state.pending.take() {
                Some(pending) => match self.classify_answer(&question, text).await {
                    Some(Answer::Gotowy) => self.force(&mut state),
                    Some(answer) => self.apply_answer(&mut state, pending, answer, &prior).await,
                    None => {
                        logging::log_discovery("Answer not understood; treating it as a new message");
                        self.classify_and_route(&mut state, text, &prior).await
                    }
                },
                None => self.classify_and_route(&mut state, text, &prior).await,
            }
        };

        logging::log_discovery(&format!(
            "Stage {} after {} questions",
            state.stage.as_str(),
            state.recipe.questions_asked
        ));
        state.history.push(Role::Ai, reply.clone());
        (state, reply)
    }

    async fn apply_answer(
        &self,
        state: &mut DiscoveryState,
        pending: PendingQuestion,
        answer: Answer,
        prior: &str,
    ) -> String {
        if let PendingQuestion::TopicChange { new_text } = &pending {
            if answer == Answer::Tak {
                logging::log_discovery("Topic change confirmed; starting a new recipe");
                state.recipe = Recipe::new();
                state.asked_contexts.clear();
                return self.classify_and_route(state, new_text, prior).await;
            }
            logging::log_discovery("Topic change declined; keeping the recipe");
        }
        self.record_answer(state, &pending, answer);
        self.advance(state)
    }

    /// Apply a TAK/NIE to the recipe. Topic changes are handled by the caller.
    fn record_answer(&self, state: &mut DiscoveryState, pending: &PendingQuestion, answer: Answer) {
        let yes = answer == Answer::Tak;
        match pending {
            PendingQuestion::IncludeContext(name) => {
                state.asked_contexts.insert(*name);
                state.recipe.set_context(*name, yes);
            }
            PendingQuestion::ThemeConflict(theme) => {
                if yes {
                    state.recipe.constraints.exclude_themes.remove(theme);
                } else {
                    state.recipe.constraints.theme = None;
                }
            }
            PendingQuestion::TopicChange { .. } => {}
        }
    }

    /// Ask before a new request replaces the current recipe. Any open question
    /// is dropped in favour of the confirmation.
    fn detect_topic_shift(&self, state: &mut DiscoveryState, text: &str) -> Option<String> {
        let goal = state.recipe.goal_type()?;
        let previous = state.history.previous_user_text();
        if !self.detector.is_topic_shift(&state.recipe, previous, text) {
            return None;
        }
        logging::log_discovery("Possible topic change; asking for confirmation");
        state.stage = Stage::TopicChange;
        state.pending = Some(PendingQuestion::TopicChange {
            new_text: text.to_string(),
        });
        Some(
            StageTemplate::TopicChange {
                previous_goal: goal.display_name(),
            }
            .render(),
        )
    }

    async fn classify_and_route(&self, state: &mut DiscoveryState, text: &str, prior: &str) -> String {
        if state.recipe.questions_asked >= self.config.max_questions {
            return self.force(state);
        }

        state.recipe.constraints.merge(Constraints::extract(text));

        let intent = if knowledge::is_capabilities_query(text) {
            Intent::AskCapabilities
        } else {
            self.classify_intent(text, prior).await
        };

        match intent {
            Intent::Greeting => {
                state.stage = Stage::Greeting;
                StageTemplate::Greeting.render()
            }
            Intent::AskCapabilities => {
                state.stage = Stage::AskCapabilities;
                StageTemplate::AskCapabilities.render()
            }
            Intent::GoalProvided => {
                let goal_type = GoalType::infer(text);
                state.recipe.set_goal(goal_type, text);
                state.stage = Stage::GoalProvided;
                let ack = StageTemplate::GoalProvided { recipe: &state.recipe }.render();
                let next = self.advance(state);
                format!("{} {}", ack, next)
            }
            Intent::NeedsGoal => self.ask(state, Stage::NeedsGoal, StageTemplate::NeedsGoal.render()),
            Intent::Problem => self.ask(state, Stage::Problem, StageTemplate::Problem.render()),
            Intent::Unknown => {
                let hints = recipe::suggest_missing(&state.recipe);
                let hint = hints.first().map(String::as_str).unwrap_or(GENERIC_HINT);
                let reply = StageTemplate::Discovery { hint }.render();
                self.ask(state, Stage::Discovery, reply)
            }
        }
    }

    /// Next step once the recipe changed: generate, confirm, or ask about the
    /// first thing still missing.
    fn advance(&self, state: &mut DiscoveryState) -> String {
        if state.recipe.questions_asked >= self.config.max_questions {
            return self.force(state);
        }

        let report = recipe::validate(&state.recipe);
        if report.valid {
            state.stage = Stage::Confirm;
            state.pending = None;
            return StageTemplate::Confirm { recipe: &state.recipe }.render();
        }

        let Some(issue) = report.issues.iter().find(|issue| issue.is_blocking()) else {
            return self.force(state);
        };

        // With one question left, a minimally complete recipe is generated
        // rather than spending the last question on a soft conflict.
        if recipe::is_minimally_complete(&state.recipe)
            && state.recipe.questions_asked + 1 >= self.config.max_questions
        {
            logging::log_discovery("Recipe minimally complete at the last question; forcing generation");
            return self.force(state);
        }

        match issue {
            ValidationIssue::MissingGoal => self.ask(state, Stage::NeedsGoal, StageTemplate::NeedsGoal.render()),
            ValidationIssue::NoContext => match self.next_context(state) {
                Some(name) => {
                    state.pending = Some(PendingQuestion::IncludeContext(name));
                    let reply = StageTemplate::AskContext {
                        context: name.display_name(),
                    }
                    .render();
                    self.ask(state, Stage::Discovery, reply)
                }
                None => {
                    let reply = StageTemplate::Discovery { hint: &issue.hint() }.render();
                    self.ask(state, Stage::Discovery, reply)
                }
            },
            ValidationIssue::ThemeExcluded(theme) => {
                let theme = theme.clone();
                state.pending = Some(PendingQuestion::ThemeConflict(theme.clone()));
                let reply = StageTemplate::ResolveThemeConflict { theme: &theme }.render();
                self.ask(state, Stage::Discovery, reply)
            }
            ValidationIssue::ToneExcluded(_) => self.force(state),
        }
    }

    /// Counted question.
    fn ask(&self, state: &mut DiscoveryState, stage: Stage, reply: String) -> String {
        state.stage = stage;
        state.recipe.questions_asked += 1;
        reply
    }

    fn force(&self, state: &mut DiscoveryState) -> String {
        state.stage = Stage::ForceGenerate;
        state.pending = None;
        let missing = if recipe::is_minimally_complete(&state.recipe) {
            Vec::new()
        } else {
            recipe::suggest_missing(&state.recipe)
        };
        StageTemplate::ForceGenerate {
            recipe: &state.recipe,
            missing: &missing,
        }
        .render()
    }

    /// The first block not yet offered, favouring blocks that matter for the goal.
    fn next_context(&self, state: &DiscoveryState) -> Option<ContextName> {
        let preferred: &[ContextName] = match state.recipe.goal_type() {
            Some(GoalType::Quest | GoalType::SideQuest) => &[ContextName::Geography, ContextName::Quests],
            Some(GoalType::Hook | GoalType::Secret | GoalType::Nickname) => {
                &[ContextName::Weaknesses, ContextName::Aspirations]
            }
            Some(GoalType::Traits) => &[ContextName::Aspirations, ContextName::Weaknesses],
            Some(GoalType::Faction) => &[ContextName::System, ContextName::Geography],
            _ => &[],
        };
        preferred
            .iter()
            .chain(ContextName::ALL.iter())
            .copied()
            .find(|name| !state.asked_contexts.contains(name))
    }

    async fn classify_intent(&self, text: &str, prior: &str) -> Intent {
        let request = ModelRequest::new(
            self.classifier_model.clone(),
            prompts::INTENT_CLASSIFIER_PROMPT,
            prompts::intent_classifier_user_prompt(prior, text),
        )
        .with_temperature(0.0);

        match self.classify(&request).await {
            Some(reply) => first_label(&reply, Intent::from_label).unwrap_or_else(|| {
                logging::log_discovery(&format!("Unparseable intent label: {}", reply.trim()));
                Intent::Unknown
            }),
            None => Intent::Unknown,
        }
    }

    async fn classify_answer(&self, question: &str, text: &str) -> Option<Answer> {
        if let Some(answer) = first_word_answer(text) {
            return Some(answer);
        }

        let request = ModelRequest::new(
            self.classifier_model.clone(),
            prompts::ANSWER_CLASSIFIER_PROMPT,
            prompts::answer_classifier_user_prompt(question, text),
        )
        .with_temperature(0.0);

        let reply = self.classify(&request).await?;
        let answer = first_label(&reply, Answer::from_label);
        if answer.is_none() {
            logging::log_discovery(&format!("Unparseable answer label: {}", reply.trim()));
        }
        answer
    }

    /// One classification call, retried once on failure.
    async fn classify(&self, request: &ModelRequest) -> Option<String> {
        for attempt in 1..=2 {
            match self.invoker.complete(request).await {
                Ok(reply) => return Some(reply),
                Err(e) => logging::log_error(
                    None,
                    &format!("Classification attempt {} failed: {}", attempt, e),
                ),
            }
        }
        None
    }
}

/// A bare "tak" / "nie" / "gotowy" needs no model call.
fn first_word_answer(text: &str) -> Option<Answer> {
    let word = text
        .trim()
        .trim_end_matches(|c: char| !c.is_alphanumeric())
        .to_uppercase();
    Answer::from_label(&word)
}
