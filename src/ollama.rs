use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{AssistantError, Result};
use crate::logging;
use crate::model::{ModelInvoker, ModelRequest, StreamEvent};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const STREAM_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseLine {
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

/// One decoded line of an `/api/chat` NDJSON stream.
#[derive(Debug, PartialEq)]
enum StreamLine {
    Content(String),
    Done(String),
    Error(String),
}

/// Client for a local Ollama server.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    channel_capacity: usize,
}

impl OllamaClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            channel_capacity: STREAM_CHANNEL_CAPACITY,
        })
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Names of the models the server has pulled.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AssistantError::Invocation(format!(
                "Ollama error ({}): {}",
                status, error_text
            )));
        }

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Check that the server answers and has `model` available.
    pub async fn check_model(&self, model: &str) -> Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m == model || m.split(':').next() == Some(model)))
    }

    fn build_request(request: &ModelRequest, stream: bool) -> ChatRequest {
        let mut messages = Vec::new();
        if !request.system_prompt.is_empty() {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: request.system_prompt.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.user_prompt.clone(),
        });

        let mut options: serde_json::Map<String, serde_json::Value> = request
            .options
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        options.insert(
            "temperature".to_string(),
            serde_json::json!(request.temperature.clamp(0.0, 1.0)),
        );

        ChatRequest {
            model: request.model.clone(),
            messages,
            stream,
            options,
        }
    }

    async fn post_chat(&self, body: &ChatRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AssistantError::Invocation(format!(
                "Ollama error ({}): {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

fn decode_line(line: &str) -> Result<Option<StreamLine>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let parsed: ChatResponseLine = serde_json::from_str(line)?;
    if let Some(error) = parsed.error {
        return Ok(Some(StreamLine::Error(error)));
    }
    let content = parsed.message.map(|m| m.content).unwrap_or_default();
    if parsed.done {
        Ok(Some(StreamLine::Done(content)))
    } else {
        Ok(Some(StreamLine::Content(content)))
    }
}

/// Forward an NDJSON byte stream as `StreamEvent`s. Returns once a terminal
/// event was sent or the receiver went away.
async fn pump_stream<S, B, E>(bytes: S, tx: mpsc::Sender<StreamEvent>)
where
    S: futures_util::Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    tokio::pin!(bytes);
    let mut buf: Vec<u8> = Vec::new();
    let mut full_text = String::new();

    while let Some(chunk) = bytes.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(StreamEvent::Failed(e.to_string())).await;
                return;
            }
        };
        buf.extend_from_slice(chunk.as_ref());

        while let Some(newline) = buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buf.drain(..=newline).collect();
            if forward_line(&line, &mut full_text, &tx).await {
                return;
            }
        }
    }

    // The last line may arrive without a trailing newline.
    if !buf.is_empty() && forward_line(&buf, &mut full_text, &tx).await {
        return;
    }

    let _ = tx
        .send(StreamEvent::Failed("stream ended without a done marker".to_string()))
        .await;
}

/// Decode one NDJSON line and forward it. Returns true when the stream is over.
async fn forward_line(line: &[u8], full_text: &mut String, tx: &mpsc::Sender<StreamEvent>) -> bool {
    let line = String::from_utf8_lossy(line);
    match decode_line(&line) {
        Ok(Some(StreamLine::Content(text))) => {
            if text.is_empty() {
                return false;
            }
            full_text.push_str(&text);
            tx.send(StreamEvent::Chunk(text)).await.is_err()
        }
        Ok(Some(StreamLine::Done(text))) => {
            if !text.is_empty() {
                full_text.push_str(&text);
                let _ = tx.send(StreamEvent::Chunk(text)).await;
            }
            let _ = tx
                .send(StreamEvent::Done {
                    text: std::mem::take(full_text),
                })
                .await;
            true
        }
        Ok(Some(StreamLine::Error(message))) => {
            let _ = tx.send(StreamEvent::Failed(message)).await;
            true
        }
        Ok(None) => false,
        Err(e) => {
            logging::log_model(None, &format!("Skipping undecodable stream line: {}", e));
            false
        }
    }
}

#[async_trait]
impl ModelInvoker for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let body = Self::build_request(request, false);
        logging::log_model(None, &format!("Completion request to {}", body.model));

        let response = self.post_chat(&body).await?;
        let parsed: ChatResponseLine = response.json().await?;

        if let Some(error) = parsed.error {
            return Err(AssistantError::Invocation(error));
        }
        parsed
            .message
            .map(|m| m.content)
            .ok_or_else(|| AssistantError::Invocation("No message in Ollama response".to_string()))
    }

    async fn stream(&self, request: &ModelRequest) -> Result<mpsc::Receiver<StreamEvent>> {
        let body = Self::build_request(request, true);
        logging::log_model(None, &format!("Streaming request to {}", body.model));

        let response = self.post_chat(&body).await?;
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        tokio::spawn(pump_stream(response.bytes_stream(), tx));
        Ok(rx)
    }
}
