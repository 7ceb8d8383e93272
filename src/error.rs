use thiserror::Error;

/// Errors surfaced by the assistant core.
///
/// Classification and stream problems are recovered inside the discovery
/// machine and the stream parser and never reach a caller.
#[derive(Debug, Error)]
pub enum AssistantError {
    #[error("profile required for {0} but none was selected")]
    MissingProfile(String),

    #[error("model invocation failed: {0}")]
    Invocation(String),

    #[error("recipe not ready for generation: {0}")]
    RecipeIncomplete(String),

    #[error("unknown command: /{0}")]
    UnknownCommand(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("execution queue is closed")]
    QueueClosed,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AssistantError>;
