use chrono::{DateTime, Utc};

/// Platform user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UserId(pub i64);

/// Platform chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Platform message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a sent message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Image attached to a request, already base64-encoded for transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub base64: String,
}

impl ImagePayload {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Forward the text (and image) to the model.
    Prompt,
    /// Drop the requester's conversation context.
    Reset,
}

/// One unit of work for the dispatcher. Immutable once built.
#[derive(Clone, Debug)]
pub struct Request {
    pub kind: RequestKind,
    pub requester: UserId,
    pub chat_id: ChatId,
    pub username: String,
    pub text: String,
    pub image: Option<ImagePayload>,
    pub received_at: DateTime<Utc>,
}

impl Request {
    pub fn prompt(
        requester: UserId,
        chat_id: ChatId,
        username: impl Into<String>,
        text: impl Into<String>,
        image: Option<ImagePayload>,
    ) -> Self {
        Self {
            kind: RequestKind::Prompt,
            requester,
            chat_id,
            username: username.into(),
            text: text.into(),
            image,
            received_at: Utc::now(),
        }
    }

    /// Override the arrival time, for producers that do work before enqueueing.
    pub fn with_received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    pub fn reset(requester: UserId, chat_id: ChatId, username: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Reset,
            requester,
            chat_id,
            username: username.into(),
            text: String::new(),
            image: None,
            received_at: Utc::now(),
        }
    }
}
