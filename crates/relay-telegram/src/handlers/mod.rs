//! Telegram update handlers.
//!
//! Handlers only produce: they build a `Request` and enqueue it. All model
//! calls and conversation state live behind the dispatcher.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use teloxide::{prelude::*, types::Message};

use relay_core::{
    domain::{ChatId, ImagePayload, Request, UserId},
    ingress::{classify, Inbound, DEFAULT_IMAGE_PROMPT},
};

use crate::router::AppState;

mod attachment;

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let received_at = Utc::now();
    let Some(user) = msg.from() else {
        return Ok(());
    };
    if user.is_bot {
        return Ok(());
    }

    let text = msg.text().or_else(|| msg.caption()).unwrap_or("");
    let Some(inbound) = classify(text, &state.cfg.trigger_prefix) else {
        return Ok(());
    };

    let user_id = UserId(user.id.0 as i64);
    let chat_id = ChatId(msg.chat.id.0);
    let username = user
        .username
        .clone()
        .unwrap_or_else(|| user.first_name.clone());

    let image = match inbound {
        Inbound::Prompt(_) => {
            match attachment::load_image(&bot, &msg, state.cfg.max_attachment_bytes).await {
                Ok(img) => img,
                Err(e) => {
                    tracing::warn!(user_id = user_id.0, error = %e, "skipping attachment");
                    let _ = bot.send_message(msg.chat.id, e.user_message()).await;
                    None
                }
            }
        }
        Inbound::Reset => None,
    };

    let Some(request) = build_request(inbound, user_id, chat_id, username, image, received_at)
    else {
        return Ok(());
    };

    if let Err(e) = state.queue.enqueue(request) {
        tracing::warn!(user_id = user_id.0, error = %e, "request not admitted");
        let _ = bot.send_message(msg.chat.id, e.user_message()).await;
    } else {
        tracing::info!(
            user_id = user_id.0,
            chat_id = chat_id.0,
            pending = state.queue.len(),
            "request enqueued"
        );
    }

    Ok(())
}

/// `None` when there is nothing to send (bare prefix, no image).
fn build_request(
    inbound: Inbound,
    user_id: UserId,
    chat_id: ChatId,
    username: String,
    image: Option<ImagePayload>,
    received_at: DateTime<Utc>,
) -> Option<Request> {
    let request = match inbound {
        Inbound::Reset => Some(Request::reset(user_id, chat_id, username)),
        Inbound::Prompt(text) if text.trim().is_empty() => {
            let image = image?;
            Some(Request::prompt(
                user_id,
                chat_id,
                username,
                DEFAULT_IMAGE_PROMPT,
                Some(image),
            ))
        }
        Inbound::Prompt(text) => Some(Request::prompt(user_id, chat_id, username, text, image)),
    };
    request.map(|r| r.with_received_at(received_at))
}
