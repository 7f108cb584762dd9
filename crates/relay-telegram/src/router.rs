use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use relay_core::{config::Config, queue::QueueSender};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub queue: QueueSender,
}

/// Long-poll Telegram and feed triggered messages into the work queue.
pub async fn run_polling(bot: Bot, cfg: Arc<Config>, queue: QueueSender) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => tracing::info!(username = %me.username(), "relay bot started"),
        Err(e) => anyhow::bail!("telegram get_me failed: {e}"),
    }
    tracing::info!(
        trigger_prefix = %cfg.trigger_prefix,
        queue_capacity = queue.capacity(),
        model = %cfg.model,
        "listening for messages"
    );

    let state = Arc::new(AppState { cfg, queue });

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}
