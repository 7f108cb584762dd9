use std::time::Duration;

/// Core error type for the relay pipeline.
///
/// Adapter crates map their specific errors into this type so the dispatcher
/// can decide what to tell the requester and whether to keep going.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external error: {0}")]
    External(String),

    #[error("queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("provider throttled after {attempts} attempts (last wait {last_wait:?})")]
    Throttled { attempts: u32, last_wait: Duration },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("attachment error: {0}")]
    Attachment(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Short, human-readable text reported back to the requester's chat.
    pub fn user_message(&self) -> String {
        match self {
            Error::QueueFull { .. } => {
                "⏳ I'm busy with other requests right now. Please try again in a moment."
                    .to_string()
            }
            Error::Throttled { last_wait, .. } => format!(
                "⏳ The model provider is rate limiting us. Please try again in about {} seconds.",
                last_wait.as_secs().max(1)
            ),
            Error::Provider(_) => {
                "❌ The model provider returned an unexpected response. Please try again later."
                    .to_string()
            }
            Error::Network(_) => {
                "❌ Could not reach the model provider. Please try again later.".to_string()
            }
            Error::Attachment(_) => {
                "⚠️ I couldn't read that attachment, so I ignored it.".to_string()
            }
            _ => "Sorry, I encountered an error while processing your message. Please try again later."
                .to_string(),
        }
    }
}
