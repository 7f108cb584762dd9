use serde::Serialize;

use crate::{
    config::Config,
    conversation::{Role, Turn},
    domain::ImagePayload,
};

/// Request-independent body fields.
#[derive(Clone, Debug)]
pub struct CompletionSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl CompletionSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        }
    }
}

/// JSON body of a chat-completion call.
#[derive(Clone, Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// Plain string, or text + image parts when an image is attached.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Clone, Debug, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// Prior turns followed by the new user turn.
pub fn build_messages(
    context: &[Turn],
    user_text: &str,
    image: Option<&ImagePayload>,
) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = context
        .iter()
        .map(|t| ChatMessage {
            role: t.role,
            content: MessageContent::Text(t.text.clone()),
        })
        .collect();

    let content = match image {
        Some(img) => MessageContent::Parts(vec![
            ContentPart::Text {
                text: user_text.to_string(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: img.data_url(),
                },
            },
        ]),
        None => MessageContent::Text(user_text.to_string()),
    };
    messages.push(ChatMessage {
        role: Role::User,
        content,
    });
    messages
}

/// Outcome of a single failed HTTP exchange, as classified by the transport.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AttemptError {
    #[error("throttled (HTTP 429)")]
    Throttled,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("network error: {0}")]
    Network(String),
}
