//! Sequential execution of prompt jobs.
//!
//! One worker task takes jobs in FIFO order and streams each through a fresh
//! `StreamParser`. Pausing stops the worker from taking the next job; the job
//! already in flight runs to completion. A failed job is marked ERROR and the
//! worker moves on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::JobStore;
use crate::error::{AssistantError, Result};
use crate::events::EventSink;
use crate::logging;
use crate::model::{ModelInvoker, ModelRequest, StreamEvent};
use crate::prompt::{extract_thought_process, AssembledPrompt};
use crate::stream::StreamParser;

pub const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Done,
    Error,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Paused => "PAUSED",
            JobState::Done => "DONE",
            JobState::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<JobState> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "RUNNING" => Some(JobState::Running),
            "PAUSED" => Some(JobState::Paused),
            "DONE" => Some(JobState::Done),
            "ERROR" => Some(JobState::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptJob {
    pub id: String,
    /// Command word or goal type that produced the job.
    pub command: String,
    pub profile_ref: Option<String>,
    pub prompt: AssembledPrompt,
    pub model: String,
    pub temperature: f32,
    pub state: JobState,
    pub result: Option<String>,
    pub error: Option<String>,
    pub thinking: Option<String>,
    pub thinking_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PromptJob {
    pub fn new(
        command: impl Into<String>,
        profile_ref: Option<String>,
        prompt: AssembledPrompt,
        model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            profile_ref,
            prompt,
            model: model.into(),
            temperature: 0.7,
            state: JobState::Pending,
            result: None,
            error: None,
            thinking: None,
            thinking_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    fn set_state(&mut self, state: JobState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.result = None;
        self.set_state(JobState::Error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueueStatus {
    Idle,
    Running,
    Paused,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<String>,
    jobs: HashMap<String, PromptJob>,
    /// Insertion order, for snapshots.
    order: Vec<String>,
    running: Option<String>,
    paused: bool,
    cancel_running: bool,
}

impl QueueState {
    fn status(&self) -> QueueStatus {
        if self.paused {
            QueueStatus::Paused
        } else if self.running.is_some() || !self.pending.is_empty() {
            QueueStatus::Running
        } else {
            QueueStatus::Idle
        }
    }

    /// Nothing in flight and nothing the worker will pick up.
    fn is_settled(&self) -> bool {
        self.running.is_none() && (self.paused || self.pending.is_empty())
    }
}

struct Inner {
    state: Mutex<QueueState>,
    wake: Notify,
    status_tx: watch::Sender<QueueStatus>,
    shutdown: CancellationToken,
    invoker: Arc<dyn ModelInvoker>,
    sink: Arc<dyn EventSink>,
    store: Option<JobStore>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, job: &PromptJob) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_job(job) {
                logging::log_error(Some(&job.id), &format!("Failed to persist job: {}", e));
            }
        }
    }

    /// Persist, notify the UI and republish the queue status.
    fn announce(&self, jobs: &[PromptJob]) {
        for job in jobs {
            self.persist(job);
            self.sink.on_job_state_change(job);
        }
        let status = self.lock().status();
        self.status_tx.send_replace(status);
    }

    fn take_next(&self) -> Option<PromptJob> {
        let job = {
            let mut state = self.lock();
            if state.paused || state.running.is_some() {
                return None;
            }
            let id = state.pending.pop_front()?;
            state.running = Some(id.clone());
            state.cancel_running = false;
            let job = state.jobs.get_mut(&id)?;
            job.set_state(JobState::Running);
            job.clone()
        };
        self.announce(std::slice::from_ref(&job));
        Some(job)
    }

    fn cancel_requested(&self) -> bool {
        self.lock().cancel_running
    }

    async fn execute(&self, job: PromptJob) {
        logging::log_queue(Some(&job.id), &format!("Running {} on {}", job.command, job.model));

        let request = ModelRequest::new(
            job.model.clone(),
            job.prompt.system_prompt.clone(),
            job.prompt.user_prompt.clone(),
        )
        .streaming()
        .with_temperature(job.temperature);

        let outcome = match self.invoker.stream(&request).await {
            Ok(rx) => self.consume(&job.id, rx).await,
            Err(e) => Err(e.to_string()),
        };

        let finished = {
            let mut state = self.lock();
            let cancelled = std::mem::take(&mut state.cancel_running);
            state.running = None;
            let Some(entry) = state.jobs.get_mut(&job.id) else {
                return;
            };
            match outcome {
                _ if cancelled => entry.fail(CANCELLED),
                Ok(output) => {
                    entry.result = Some(output.answer);
                    entry.thinking = Some(output.thinking).filter(|t| !t.is_empty());
                    entry.thinking_ms = Some(output.thinking_ms);
                    entry.set_state(JobState::Done);
                }
                Err(message) => entry.fail(message),
            }
            entry.clone()
        };

        match finished.state {
            JobState::Done => {
                logging::log_queue(Some(&finished.id), "Job done");
                if let Some(thought) = finished.result.as_deref().and_then(extract_thought_process) {
                    logging::log_stream(Some(&finished.id), &format!("Self-critique: {}", thought));
                }
            }
            _ => logging::log_error(
                Some(&finished.id),
                &format!("Job failed: {}", finished.error.as_deref().unwrap_or_default()),
            ),
        }
        self.announce(std::slice::from_ref(&finished));
    }

    async fn consume(
        &self,
        job_id: &str,
        mut rx: mpsc::Receiver<StreamEvent>,
    ) -> std::result::Result<JobOutput, String> {
        let mut parser = StreamParser::new();

        while let Some(event) = rx.recv().await {
            if self.cancel_requested() {
                logging::log_queue(Some(job_id), "Cancelled while streaming; dropping the rest");
                return Err(CANCELLED.to_string());
            }
            match event {
                StreamEvent::Chunk(chunk) => {
                    for segment in parser.feed(&chunk) {
                        self.sink.on_segment(job_id, &segment);
                    }
                }
                StreamEvent::Done { .. } => {
                    for segment in parser.finish() {
                        self.sink.on_segment(job_id, &segment);
                    }
                    let thinking_ms = parser.thinking_duration().as_millis() as u64;
                    let thinking = parser.thinking().to_string();
                    return Ok(JobOutput {
                        answer: parser.into_answer(),
                        thinking,
                        thinking_ms,
                    });
                }
                StreamEvent::Failed(message) => return Err(message),
            }
        }

        Err("model stream closed without a result".to_string())
    }
}

struct JobOutput {
    answer: String,
    thinking: String,
    thinking_ms: u64,
}

/// Handle to the queue; cheap to clone.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<Inner>,
}

impl ExecutionQueue {
    pub fn new(invoker: Arc<dyn ModelInvoker>, sink: Arc<dyn EventSink>) -> Self {
        Self::build(invoker, sink, None)
    }

    /// Queue backed by `store`. Jobs left RUNNING by a previous process are
    /// re-queued, followed by everything still PENDING or PAUSED.
    pub fn with_store(
        invoker: Arc<dyn ModelInvoker>,
        sink: Arc<dyn EventSink>,
        store: JobStore,
    ) -> Result<Self> {
        let recovered = store.recover_interrupted()?;
        let unfinished = store.load_unfinished()?;
        if recovered > 0 || !unfinished.is_empty() {
            logging::log_queue(
                None,
                &format!(
                    "Resuming {} unfinished jobs ({} interrupted mid-run)",
                    unfinished.len(),
                    recovered
                ),
            );
        }

        let queue = Self::build(invoker, sink, Some(store));
        {
            let mut state = queue.inner.lock();
            for mut job in unfinished {
                job.set_state(JobState::Pending);
                state.pending.push_back(job.id.clone());
                state.order.push(job.id.clone());
                state.jobs.insert(job.id.clone(), job);
            }
        }
        let status = queue.inner.lock().status();
        queue.inner.status_tx.send_replace(status);
        Ok(queue)
    }

    fn build(invoker: Arc<dyn ModelInvoker>, sink: Arc<dyn EventSink>, store: Option<JobStore>) -> Self {
        let (status_tx, _) = watch::channel(QueueStatus::Idle);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                status_tx,
                shutdown: CancellationToken::new(),
                invoker,
                sink,
                store,
            }),
        }
    }

    /// Spawn the worker. Call once.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            logging::log_queue(None, "Worker started");
            loop {
                if inner.shutdown.is_cancelled() {
                    break;
                }
                match inner.take_next() {
                    Some(job) => inner.execute(job).await,
                    None => {
                        tokio::select! {
                            _ = inner.wake.notified() => {}
                            _ = inner.shutdown.cancelled() => break,
                        }
                    }
                }
            }
            logging::log_queue(None, "Worker stopped");
        })
    }

    pub fn enqueue(&self, mut job: PromptJob) -> Result<String> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AssistantError::QueueClosed);
        }
        let id = job.id.clone();
        {
            let mut state = self.inner.lock();
            let initial = if state.paused { JobState::Paused } else { JobState::Pending };
            job.set_state(initial);
            state.pending.push_back(id.clone());
            state.order.push(id.clone());
            state.jobs.insert(id.clone(), job.clone());
        }
        logging::log_queue(Some(&id), &format!("Enqueued {} ({})", job.command, job.state.as_str()));
        self.inner.announce(std::slice::from_ref(&job));
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Stop taking new jobs. A job already running finishes normally.
    pub fn pause(&self) {
        let changed = self.set_paused(true, JobState::Pending, JobState::Paused);
        logging::log_queue(None, &format!("Paused ({} jobs held)", changed.len()));
        self.inner.announce(&changed);
    }

    pub fn resume(&self) {
        let changed = self.set_paused(false, JobState::Paused, JobState::Pending);
        logging::log_queue(None, &format!("Resumed ({} jobs released)", changed.len()));
        self.inner.announce(&changed);
        self.inner.wake.notify_one();
    }

    fn set_paused(&self, paused: bool, from: JobState, to: JobState) -> Vec<PromptJob> {
        let mut state = self.inner.lock();
        state.paused = paused;
        let ids: Vec<String> = state.pending.iter().cloned().collect();
        let mut changed = Vec::new();
        for id in ids {
            if let Some(job) = state.jobs.get_mut(&id) {
                if job.state == from {
                    job.set_state(to);
                    changed.push(job.clone());
                }
            }
        }
        changed
    }

    /// Cancel a job. A waiting job is removed and marked ERROR at once; a
    /// running job finishes its call but its result is discarded. Finished
    /// jobs are left alone.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let cancelled = {
            let mut state = self.inner.lock();
            let current = state
                .jobs
                .get(job_id)
                .map(|job| job.state)
                .ok_or_else(|| AssistantError::JobNotFound(job_id.to_string()))?;

            match current {
                JobState::Pending | JobState::Paused => {
                    state.pending.retain(|id| id != job_id);
                    state.jobs.get_mut(job_id).map(|job| {
                        job.fail(CANCELLED);
                        job.clone()
                    })
                }
                JobState::Running => {
                    state.cancel_running = true;
                    None
                }
                JobState::Done | JobState::Error => None,
            }
        };

        logging::log_queue(Some(job_id), "Cancel requested");
        if let Some(job) = cancelled {
            self.inner.announce(std::slice::from_ref(&job));
        }
        Ok(())
    }

    pub fn status(&self) -> QueueStatus {
        self.inner.lock().status()
    }

    pub fn job(&self, job_id: &str) -> Option<PromptJob> {
        self.inner.lock().jobs.get(job_id).cloned()
    }

    /// Every job this queue has seen, in submission order.
    pub fn snapshot(&self) -> Vec<PromptJob> {
        let state = self.inner.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect()
    }

    /// Resolve once nothing is running and nothing is waiting to run (a paused
    /// queue with held jobs counts as settled).
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.status_tx.subscribe();
        loop {
            if self.inner.lock().is_settled() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop dequeuing and reject new jobs. The job in flight completes.
    pub fn shutdown(&self) {
        logging::log_queue(None, "Shutdown requested");
        self.inner.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelSink, NullSink, UiEvent};
    use crate::model::mock::{Scripted, ScriptedInvoker};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn job(command: &str) -> PromptJob {
        PromptJob::new(
            command,
            Some("lotka".into()),
            AssembledPrompt {
                system_prompt: "sys".into(),
                user_prompt: format!("zrób {}", command),
            },
            "qwen3:8b",
        )
    }

    async fn settle(queue: &ExecutionQueue) {
        tokio::time::timeout(Duration::from_secs(5), queue.wait_idle())
            .await
            .expect("queue did not settle");
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_the_queue() {
        let invoker = Arc::new(ScriptedInvoker::new([
            Scripted::Chunks(vec!["<think>hm</think>".into(), "Pierwszy".into()]),
            Scripted::Fail("connection refused".into()),
            Scripted::Text("Trzeci".into()),
        ]));
        let queue = ExecutionQueue::new(invoker.clone(), Arc::new(NullSink));
        let ids: Vec<String> = ["quest", "hook", "sekret"]
            .into_iter()
            .map(|c| queue.enqueue(job(c)).unwrap())
            .collect();

        queue.start();
        settle(&queue).await;

        let states: Vec<JobState> = ids.iter().map(|id| queue.job(id).unwrap().state).collect();
        assert_eq!(states, vec![JobState::Done, JobState::Error, JobState::Done]);

        let first = queue.job(&ids[0]).unwrap();
        assert_eq!(first.result.as_deref(), Some("Pierwszy"));
        assert_eq!(first.thinking.as_deref(), Some("hm"));
        let second = queue.job(&ids[1]).unwrap();
        assert!(second.error.unwrap().contains("connection refused"));
        assert_eq!(queue.job(&ids[2]).unwrap().result.as_deref(), Some("Trzeci"));

        assert_eq!(invoker.call_count(), 3);
        assert!(invoker.requests.lock().unwrap().iter().all(|r| r.stream));
        assert_eq!(queue.status(), QueueStatus::Idle);
    }

    #[tokio::test]
    async fn test_pause_holds_jobs_until_resume() {
        let invoker = Arc::new(ScriptedInvoker::texts(["a", "b"]));
        let queue = ExecutionQueue::new(invoker.clone(), Arc::new(NullSink));
        queue.start();

        queue.pause();
        let first = queue.enqueue(job("quest")).unwrap();
        let second = queue.enqueue(job("hook")).unwrap();
        settle(&queue).await;

        assert_eq!(queue.status(), QueueStatus::Paused);
        assert_eq!(queue.job(&first).unwrap().state, JobState::Paused);
        assert_eq!(invoker.call_count(), 0);

        queue.resume();
        settle(&queue).await;
        assert_eq!(queue.job(&first).unwrap().state, JobState::Done);
        assert_eq!(queue.job(&second).unwrap().result.as_deref(), Some("b"));
        assert_eq!(queue.status(), QueueStatus::Idle);
    }

    #[tokio::test]
    async fn test_cancel_waiting_job() {
        let invoker = Arc::new(ScriptedInvoker::texts(["only"]));
        let queue = ExecutionQueue::new(invoker.clone(), Arc::new(NullSink));
        queue.pause();
        let doomed = queue.enqueue(job("quest")).unwrap();
        let kept = queue.enqueue(job("hook")).unwrap();

        queue.cancel(&doomed).unwrap();
        let cancelled = queue.job(&doomed).unwrap();
        assert_eq!(cancelled.state, JobState::Error);
        assert_eq!(cancelled.error.as_deref(), Some(CANCELLED));

        queue.start();
        queue.resume();
        settle(&queue).await;
        assert_eq!(queue.job(&kept).unwrap().result.as_deref(), Some("only"));
        assert_eq!(invoker.call_count(), 1);

        assert!(matches!(
            queue.cancel("nope"),
            Err(AssistantError::JobNotFound(_))
        ));
        // Finished jobs are unaffected.
        queue.cancel(&kept).unwrap();
        assert_eq!(queue.job(&kept).unwrap().state, JobState::Done);
    }

    /// Streams one chunk, then waits for the test to release it.
    struct GatedInvoker {
        gate: Arc<Notify>,
        calls: AtomicUsize,
    }

    impl GatedInvoker {
        fn new(gate: &Arc<Notify>) -> Self {
            Self {
                gate: Arc::clone(gate),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelInvoker for GatedInvoker {
        fn name(&self) -> &str {
            "gated"
        }

        async fn complete(&self, _request: &ModelRequest) -> Result<String> {
            Ok(String::new())
        }

        async fn stream(&self, _request: &ModelRequest) -> Result<mpsc::Receiver<StreamEvent>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(4);
            let gate = Arc::clone(&self.gate);
            tokio::spawn(async move {
                let _ = tx.send(StreamEvent::Chunk("początek ".into())).await;
                gate.notified().await;
                let _ = tx.send(StreamEvent::Chunk("koniec".into())).await;
                let _ = tx.send(StreamEvent::Done { text: "początek koniec".into() }).await;
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_cancel_running_job_discards_result() {
        let gate = Arc::new(Notify::new());
        let (sink, mut events) = ChannelSink::new();
        let queue = ExecutionQueue::new(
            Arc::new(GatedInvoker::new(&gate)),
            Arc::new(sink),
        );
        let id = queue.enqueue(job("quest")).unwrap();
        queue.start();

        // Wait for the first live segment, which means the job is running.
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(UiEvent::Segment { .. })) => break,
                Ok(Some(_)) => continue,
                _ => panic!("no segment streamed"),
            }
        }
        assert_eq!(queue.job(&id).unwrap().state, JobState::Running);
        assert_eq!(queue.status(), QueueStatus::Running);

        queue.cancel(&id).unwrap();
        gate.notify_one();
        settle(&queue).await;

        let job = queue.job(&id).unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(job.error.as_deref(), Some(CANCELLED));
        assert!(job.result.is_none());
    }

    async fn wait_for_segment(events: &mut mpsc::UnboundedReceiver<UiEvent>) {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(UiEvent::Segment { .. })) => break,
                Ok(Some(_)) => continue,
                _ => panic!("no segment streamed"),
            }
        }
    }

    #[tokio::test]
    async fn test_pause_lets_running_job_finish() {
        let gate = Arc::new(Notify::new());
        let invoker = Arc::new(GatedInvoker::new(&gate));
        let (sink, mut events) = ChannelSink::new();
        let queue = ExecutionQueue::new(invoker.clone(), Arc::new(sink));
        let first = queue.enqueue(job("quest")).unwrap();
        let second = queue.enqueue(job("hook")).unwrap();
        queue.start();

        wait_for_segment(&mut events).await;
        queue.pause();
        assert_eq!(queue.job(&first).unwrap().state, JobState::Running);
        assert_eq!(queue.job(&second).unwrap().state, JobState::Paused);

        gate.notify_one();
        settle(&queue).await;

        let done = queue.job(&first).unwrap();
        assert_eq!(done.state, JobState::Done);
        assert_eq!(done.result.as_deref(), Some("początek koniec"));
        assert_eq!(queue.job(&second).unwrap().state, JobState::Paused);
        assert_eq!(queue.status(), QueueStatus::Paused);
        assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resume_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let interrupted_id = {
            let store = JobStore::open(&path).unwrap();
            let mut interrupted = job("quest");
            interrupted.state = JobState::Running;
            store.save_job(&interrupted).unwrap();
            interrupted.id
        };

        let invoker = Arc::new(ScriptedInvoker::texts(["wznowiony"]));
        let queue = ExecutionQueue::with_store(
            invoker,
            Arc::new(NullSink),
            JobStore::open(&path).unwrap(),
        )
        .unwrap();
        assert_eq!(queue.status(), QueueStatus::Running);
        assert_eq!(queue.job(&interrupted_id).unwrap().state, JobState::Pending);

        queue.start();
        settle(&queue).await;
        assert_eq!(queue.job(&interrupted_id).unwrap().result.as_deref(), Some("wznowiony"));

        let reopened = JobStore::open(&path).unwrap();
        assert_eq!(reopened.get_job(&interrupted_id).unwrap().unwrap().state, JobState::Done);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_jobs() {
        let queue = ExecutionQueue::new(Arc::new(ScriptedInvoker::default()), Arc::new(NullSink));
        let worker = queue.start();
        queue.shutdown();
        tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(queue.enqueue(job("quest")), Err(AssistantError::QueueClosed)));
    }
}
