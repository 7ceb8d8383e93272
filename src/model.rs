//! Boundary to the model-serving backend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub stream: bool,
    /// Clamped to [0, 1] by the constructors.
    pub temperature: f32,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            stream: false,
            temperature: 0.7,
            options: BTreeMap::new(),
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// One event of a streamed invocation. A stream ends with exactly one
/// `Done` or `Failed`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(String),
    Done { text: String },
    Failed(String),
}

#[async_trait]
pub trait ModelInvoker: Send + Sync {
    fn name(&self) -> &str;

    /// Single, non-streamed completion.
    async fn complete(&self, request: &ModelRequest) -> Result<String>;

    /// Streamed completion. Errors before the first byte are returned directly;
    /// errors after that arrive as `StreamEvent::Failed`.
    async fn stream(&self, request: &ModelRequest) -> Result<mpsc::Receiver<StreamEvent>>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted invoker for tests.

    use super::*;
    use crate::error::AssistantError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Scripted {
        Text(String),
        Chunks(Vec<String>),
        Fail(String),
    }

    #[derive(Default)]
    pub struct ScriptedInvoker {
        replies: Mutex<VecDeque<Scripted>>,
        pub requests: Mutex<Vec<ModelRequest>>,
    }

    impl ScriptedInvoker {
        pub fn new(replies: impl IntoIterator<Item = Scripted>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn texts<'a>(replies: impl IntoIterator<Item = &'a str>) -> Self {
            Self::new(replies.into_iter().map(|r| Scripted::Text(r.to_string())))
        }

        pub fn call_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn next(&self, request: &ModelRequest) -> Scripted {
            self.requests.lock().unwrap().push(request.clone());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Scripted::Fail("script exhausted".into()))
        }
    }

    #[async_trait]
    impl ModelInvoker for ScriptedInvoker {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, request: &ModelRequest) -> Result<String> {
            match self.next(request) {
                Scripted::Text(text) => Ok(text),
                Scripted::Chunks(chunks) => Ok(chunks.concat()),
                Scripted::Fail(message) => Err(AssistantError::Invocation(message)),
            }
        }

        async fn stream(&self, request: &ModelRequest) -> Result<mpsc::Receiver<StreamEvent>> {
            let chunks = match self.next(request) {
                Scripted::Text(text) => vec![text],
                Scripted::Chunks(chunks) => chunks,
                Scripted::Fail(message) => return Err(AssistantError::Invocation(message)),
            };
            let (tx, rx) = mpsc::channel(chunks.len() + 1);
            let text = chunks.concat();
            for chunk in chunks {
                let _ = tx.send(StreamEvent::Chunk(chunk)).await;
            }
            let _ = tx.send(StreamEvent::Done { text }).await;
            Ok(rx)
        }
    }
}
