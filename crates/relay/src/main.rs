use std::sync::Arc;

use teloxide::Bot;
use tokio_util::sync::CancellationToken;

use relay_core::{
    config::Config,
    dispatcher::Dispatcher,
    model::{client::CompletionClient, retry::RetryPolicy, types::CompletionSettings},
    queue::work_queue,
};
use relay_openai::HttpCompletionTransport;
use relay_telegram::TelegramMessenger;

#[tokio::main]
async fn main() -> Result<(), relay_core::Error> {
    relay_core::logging::init("relay")?;

    let cfg = Arc::new(Config::load()?);

    let transport = Arc::new(HttpCompletionTransport::from_config(&cfg)?);
    let completion = CompletionClient::new(
        transport,
        CompletionSettings::from_config(&cfg),
        RetryPolicy::from_config(&cfg),
    );

    let (sender, receiver) = work_queue(cfg.queue_capacity);
    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let messenger = Arc::new(TelegramMessenger::new(bot.clone()));

    let cancel = CancellationToken::new();
    let dispatcher = Dispatcher::new(cfg.clone(), receiver, completion, messenger);
    let worker = tokio::spawn(dispatcher.run(cancel.clone()));

    let outcome = tokio::select! {
        res = relay_telegram::router::run_polling(bot, cfg, sender) => {
            res.map_err(|e| relay_core::Error::External(format!("telegram bot failed: {e}")))
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
    };

    cancel.cancel();
    if let Err(e) = worker.await {
        tracing::error!(error = %e, "dispatcher task panicked");
    }

    outcome
}
