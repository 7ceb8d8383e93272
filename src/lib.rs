pub mod commands;
pub mod config;
pub mod context_store;
pub mod conversation;
pub mod db;
pub mod discovery;
pub mod error;
pub mod events;
pub mod knowledge;
pub mod logging;
pub mod model;
pub mod ollama;
pub mod profile;
pub mod prompt;
pub mod prompts;
pub mod queue;
pub mod recipe;
pub mod stream;

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use config::AssistantConfig;
use context_store::ContextStore;
use db::JobStore;
use discovery::{DiscoveryMachine, DiscoveryState, Stage};
use error::{AssistantError, Result};
use events::EventSink;
use model::ModelInvoker;
use ollama::OllamaClient;
use profile::{Profile, ProfileStore};
use prompt::{assemble, PromptConfig};
use queue::{ExecutionQueue, PromptJob, QueueStatus};
use recipe::Recipe;

#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResult {
    pub reply: String,
    pub stage: Stage,
    /// Set when this turn handed a recipe to the queue.
    pub job_id: Option<String>,
}

// ============ Session Initialization ============

#[derive(Debug, Serialize, Deserialize)]
pub struct InitResult {
    pub status: String,       // "ready" | "resumed"
    pub resumed_jobs: usize,  // Jobs picked up from the previous session
    pub model_available: bool,
}

/// One game master's working session: discovery, prompt assembly and the
/// generation queue behind a single handle.
pub struct GameMasterSession {
    config: AssistantConfig,
    discovery: DiscoveryMachine,
    state: tokio::sync::Mutex<DiscoveryState>,
    contexts: ContextStore,
    profiles: Arc<dyn ProfileStore>,
    selected_profile: Mutex<Option<String>>,
    queue: ExecutionQueue,
    sink: Arc<dyn EventSink>,
}

impl GameMasterSession {
    /// Assemble a session from its parts. The queue worker is not started.
    pub fn new(
        config: AssistantConfig,
        invoker: Arc<dyn ModelInvoker>,
        profiles: Arc<dyn ProfileStore>,
        sink: Arc<dyn EventSink>,
        store: Option<JobStore>,
    ) -> Result<Self> {
        let discovery = DiscoveryMachine::new(
            Arc::clone(&invoker),
            config.classifier_model(),
            config.discovery.clone(),
        );
        let queue = match store {
            Some(store) => ExecutionQueue::with_store(Arc::clone(&invoker), Arc::clone(&sink), store)?,
            None => ExecutionQueue::new(Arc::clone(&invoker), Arc::clone(&sink)),
        };
        let contexts = match &config.context_dir {
            Some(dir) => ContextStore::from_dir(dir.clone()),
            None => ContextStore::default(),
        };
        let state = tokio::sync::Mutex::new(discovery.initial_state());

        Ok(Self {
            config,
            discovery,
            state,
            contexts,
            profiles,
            selected_profile: Mutex::new(None),
            queue,
            sink,
        })
    }

    /// Full startup: logging, the Ollama client, the job database and the
    /// queue worker. Jobs interrupted by a crash are resumed.
    pub async fn init(
        config: AssistantConfig,
        profiles: Arc<dyn ProfileStore>,
        sink: Arc<dyn EventSink>,
    ) -> Result<(Self, InitResult)> {
        let log_dir = config.log_dir();
        if let Err(e) = logging::init_logging(&log_dir, &config.log_level) {
            eprintln!("Failed to initialize logging: {}", e);
        }
        // Clean up old log files (keep last 7 days)
        let _ = logging::cleanup_old_logs(&log_dir);

        let client = OllamaClient::new(
            &config.ollama_url,
            Duration::from_secs(config.request_timeout_secs),
        )?
        .with_channel_capacity(config.stream_channel_capacity);

        let model_available = match client.check_model(&config.default_model).await {
            Ok(available) => available,
            Err(e) => {
                logging::log_error(None, &format!("Model backend unreachable: {}", e));
                false
            }
        };
        if !model_available {
            logging::log_model(None, &format!("Model {} not available yet", config.default_model));
        }

        let store = JobStore::open(&config.database_path())?;
        let session = Self::new(config, Arc::new(client), profiles, sink, Some(store))?;
        session.start();

        let resumed_jobs = session.queue.snapshot().len();
        let status = if resumed_jobs > 0 {
            logging::log_queue(None, &format!("Resuming {} jobs from previous session", resumed_jobs));
            "resumed"
        } else {
            logging::log_queue(None, "Session initialized, nothing to resume");
            "ready"
        };

        Ok((
            session,
            InitResult {
                status: status.to_string(),
                resumed_jobs,
                model_available,
            },
        ))
    }

    pub fn start(&self) -> JoinHandle<()> {
        self.queue.start()
    }

    // ============ Profiles ============

    /// Choose the character that `@field` references and generations target.
    pub fn select_profile(&self, reference: Option<&str>) -> Result<()> {
        if let Some(reference) = reference {
            if self.profiles.profile(reference).is_none() {
                return Err(AssistantError::MissingProfile(reference.to_string()));
            }
        }
        let mut selected = self
            .selected_profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *selected = reference.map(str::to_string);
        Ok(())
    }

    pub fn selected_profile(&self) -> Option<String> {
        self.selected_profile
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn resolve_profile(&self, reference: Option<&str>) -> Result<Option<Profile>> {
        let reference = match reference {
            Some(reference) => Some(reference.to_string()),
            None => self.selected_profile(),
        };
        match reference {
            Some(reference) => self
                .profiles
                .profile(&reference)
                .map(Some)
                .ok_or(AssistantError::MissingProfile(reference)),
            None => Ok(None),
        }
    }

    // ============ Conversation ============

    /// Handle one user message: slash commands go straight to the queue,
    /// everything else through discovery.
    pub async fn send_message(&self, text: &str) -> Result<SendMessageResult> {
        if commands::is_command(text) {
            let job_id = self.submit_command(text)?;
            return Ok(SendMessageResult {
                reply: format!("Dodano do kolejki ({}).", job_id),
                stage: Stage::Confirm,
                job_id: Some(job_id),
            });
        }

        let mut guard = self.state.lock().await;
        let current = std::mem::replace(&mut *guard, self.discovery.initial_state());
        let (mut next, reply) = self.discovery.step(current, text).await;

        let enqueued = if next.is_ready() {
            Some(self.enqueue_recipe(&next.recipe, text))
        } else {
            None
        };
        let job_id = match enqueued {
            Some(Err(e)) => {
                // Keep the recipe so the user can fix the cause and retry.
                logging::log_error(None, &format!("Recipe not enqueued: {}", e));
                next.reopen();
                self.sink.on_stage_changed(next.stage);
                *guard = next;
                return Err(e);
            }
            Some(Ok(id)) => Some(id),
            None => None,
        };

        self.sink.on_stage_changed(next.stage);
        self.sink.on_recipe_updated(&next.recipe);
        let stage = next.stage;
        *guard = next;
        Ok(SendMessageResult { reply, stage, job_id })
    }

    /// Enqueue the recipe kept after a failed hand-off, e.g. once a profile
    /// has been selected.
    pub async fn retry_generation(&self) -> Result<String> {
        let mut guard = self.state.lock().await;
        // Matches what a forced hand-off accepts: the goal is the only hard requirement.
        if guard.recipe.goal_type().is_none() {
            let missing = recipe::suggest_missing(&guard.recipe).join(" ");
            return Err(AssistantError::RecipeIncomplete(missing));
        }
        let job_id = self.enqueue_recipe(&guard.recipe, "")?;
        guard.stage = Stage::Confirm;
        guard.pending = None;
        self.sink.on_stage_changed(guard.stage);
        Ok(job_id)
    }

    fn enqueue_recipe(&self, recipe: &Recipe, fallback_text: &str) -> Result<String> {
        let source = recipe
            .goal
            .as_ref()
            .map(|g| g.text.clone())
            .unwrap_or_else(|| fallback_text.to_string());
        let config = PromptConfig::from_recipe(recipe, self.config.default_model.clone(), self.config.prompt.clone());
        let command = recipe
            .goal_type()
            .map(|g| g.as_str().to_lowercase())
            .unwrap_or_else(|| config.schema.as_str().to_lowercase());
        self.enqueue_generation(&command, None, &source, &config)
    }

    /// Parse and enqueue a slash command; returns the job id.
    pub fn submit_command(&self, input: &str) -> Result<String> {
        let command = commands::parse(input)?;
        let mut config = PromptConfig::new(self.config.default_model.clone(), command.kind.schema())
            .with_contexts(command.kind.default_contexts().iter().copied())
            .with_budgets(self.config.prompt.clone());
        config.constraints = command.constraints.clone();

        self.enqueue_generation(
            command.kind.as_str(),
            command.target.as_deref(),
            &command.request_text(),
            &config,
        )
    }

    fn enqueue_generation(
        &self,
        command: &str,
        target: Option<&str>,
        source: &str,
        config: &PromptConfig,
    ) -> Result<String> {
        let profile = self.resolve_profile(target)?;
        let prompt = assemble(source, profile.as_ref(), config, &self.contexts)?;
        logging::log_prompt(
            None,
            &format!(
                "Assembled {} prompt ({} chars) for {}",
                config.schema.as_str(),
                prompt.user_prompt.chars().count(),
                profile.as_ref().map(|p| p.display_name()).unwrap_or("-")
            ),
        );

        let job = PromptJob::new(
            command,
            profile.map(|p| p.reference),
            prompt,
            config.model.clone(),
        )
        .with_temperature(self.config.generation_temperature);
        self.queue.enqueue(job)
    }

    /// Current discovery state, for display.
    pub async fn discovery_state(&self) -> DiscoveryState {
        self.state.lock().await.clone()
    }

    /// Drop the recipe and start discovery over.
    pub async fn reset_discovery(&self) {
        let mut state = self.state.lock().await;
        state.reset();
        self.sink.on_stage_changed(state.stage);
        self.sink.on_recipe_updated(&state.recipe);
    }

    // ============ Queue ============

    pub fn pause(&self) {
        self.queue.pause();
    }

    pub fn resume(&self) {
        self.queue.resume();
    }

    pub fn cancel(&self, job_id: &str) -> Result<()> {
        self.queue.cancel(job_id)
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn job(&self, job_id: &str) -> Option<PromptJob> {
        self.queue.job(job_id)
    }

    pub fn jobs(&self) -> Vec<PromptJob> {
        self.queue.snapshot()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_store::ContextName;
    use crate::events::{ChannelSink, NullSink, UiEvent};
    use crate::model::mock::{Scripted, ScriptedInvoker};
    use crate::profile::{MemoryProfileStore, FIELD_GUILD, FIELD_NAME};
    use crate::queue::JobState;
    use crate::stream::SegmentKind;

    fn profiles() -> Arc<MemoryProfileStore> {
        let mut store = MemoryProfileStore::new();
        store.insert(
            Profile::new("lotka")
                .with_field(FIELD_NAME, "Lotka")
                .with_field(FIELD_GUILD, "Przewoźnicy"),
        );
        Arc::new(store)
    }

    fn session(invoker: Arc<ScriptedInvoker>, sink: Arc<dyn EventSink>) -> GameMasterSession {
        GameMasterSession::new(AssistantConfig::default(), invoker, profiles(), sink, None).unwrap()
    }

    #[tokio::test]
    async fn test_discovery_hands_recipe_to_queue() {
        let invoker = Arc::new(ScriptedInvoker::new([
            Scripted::Text("GOAL_PROVIDED".into()),
            Scripted::Chunks(vec!["<think>plan</think>".into(), "{\"tytul\": \"Most\"}".into()]),
        ]));
        let (sink, mut events) = ChannelSink::new();
        let session = session(invoker.clone(), Arc::new(sink));
        session.start();
        session.select_profile(Some("lotka")).unwrap();

        let first = session.send_message("Zrób quest dla @imie").await.unwrap();
        assert_eq!(first.stage, Stage::Discovery);
        assert!(first.job_id.is_none());

        let second = session.send_message("tak").await.unwrap();
        assert_eq!(second.stage, Stage::Confirm);
        let job_id = second.job_id.unwrap();

        session.wait_idle().await;
        let job = session.job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.result.as_deref(), Some("{\"tytul\": \"Most\"}"));
        assert_eq!(job.profile_ref.as_deref(), Some("lotka"));
        assert_eq!(job.command, "quest");
        assert!(job.prompt.user_prompt.contains("[Imie postaci: Lotka]"));

        let requests = invoker.requests.lock().unwrap();
        assert!(!requests[0].stream);
        assert!(requests[1].stream);
        drop(requests);

        let mut saw_stage = false;
        let mut saw_thinking = false;
        while let Ok(event) = events.try_recv() {
            match event {
                UiEvent::StageChanged { stage: Stage::Confirm } => saw_stage = true,
                UiEvent::Segment { segment, .. } if segment.kind == SegmentKind::Thinking => saw_thinking = true,
                _ => {}
            }
        }
        assert!(saw_stage);
        assert!(saw_thinking);
    }

    #[tokio::test]
    async fn test_failed_hand_off_keeps_recipe() {
        let invoker = Arc::new(ScriptedInvoker::new([
            Scripted::Text("GOAL_PROVIDED".into()),
            Scripted::Text("{\"tytul\": \"Sól\"}".into()),
        ]));
        let (sink, mut events) = ChannelSink::new();
        let session = session(invoker, Arc::new(sink));
        session.start();

        session.send_message("Zrób quest o soli").await.unwrap();
        let err = session.send_message("tak").await.unwrap_err();
        assert!(matches!(err, AssistantError::MissingProfile(_)));
        assert!(session.jobs().is_empty());

        let state = session.discovery_state().await;
        assert_eq!(state.stage, Stage::Discovery);
        assert_eq!(state.recipe.included_contexts(), vec![ContextName::Geography]);
        let mut stages = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let UiEvent::StageChanged { stage } = event {
                stages.push(stage);
            }
        }
        assert!(!stages.contains(&Stage::Confirm));

        session.select_profile(Some("lotka")).unwrap();
        let job_id = session.retry_generation().await.unwrap();
        session.wait_idle().await;
        assert_eq!(session.job(&job_id).unwrap().state, JobState::Done);
        assert_eq!(session.discovery_state().await.stage, Stage::Confirm);
    }

    #[tokio::test]
    async fn test_retry_without_recipe_is_rejected() {
        let session = session(Arc::new(ScriptedInvoker::default()), Arc::new(NullSink));
        assert!(matches!(
            session.retry_generation().await,
            Err(AssistantError::RecipeIncomplete(_))
        ));
    }

    #[tokio::test]
    async fn test_command_bypasses_discovery() {
        let invoker = Arc::new(ScriptedInvoker::texts(["{\"hook\": \"Mgła\"}"]));
        let session = session(invoker.clone(), Arc::new(NullSink));
        session.start();

        let result = session.send_message("/hook #lotka dla @imie, ton: ponury").await.unwrap();
        let job_id = result.job_id.unwrap();
        session.wait_idle().await;

        let job = session.job(&job_id).unwrap();
        assert_eq!(job.state, JobState::Done);
        assert_eq!(job.command, "hook");
        assert!(job.prompt.user_prompt.contains("Ton: ponury"));
        assert_eq!(invoker.call_count(), 1);
        assert_eq!(session.discovery_state().await.stage, Stage::Greeting);
    }

    #[tokio::test]
    async fn test_command_without_profile_is_rejected() {
        let session = session(Arc::new(ScriptedInvoker::default()), Arc::new(NullSink));
        assert!(matches!(
            session.submit_command("/quest coś"),
            Err(AssistantError::MissingProfile(_))
        ));
        assert!(matches!(
            session.submit_command("/taniec"),
            Err(AssistantError::UnknownCommand(_))
        ));
        assert!(matches!(
            session.select_profile(Some("nikt")),
            Err(AssistantError::MissingProfile(_))
        ));
        assert!(session.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_advisory_command_needs_no_profile() {
        let invoker = Arc::new(ScriptedInvoker::texts(["{\"porada\": \"ok\"}"]));
        let session = session(invoker, Arc::new(NullSink));
        session.pause();
        let id = session.submit_command("/porada jak rozegrać bunt").unwrap();
        assert_eq!(session.status(), QueueStatus::Paused);
        assert_eq!(session.job(&id).unwrap().state, JobState::Paused);
        session.cancel(&id).unwrap();
        assert_eq!(session.job(&id).unwrap().state, JobState::Error);
    }
}
