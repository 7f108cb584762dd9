//! Single-consumer dispatcher loop.
//!
//! Exactly one request is in flight at a time. The conversation store and rate
//! window are owned here, so they never need locks; parallelizing this loop
//! would require per-requester locking for both.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    conversation::{ConversationStore, Turn},
    domain::{ChatId, Request, RequestKind},
    formatting::{chunk, format_response, with_header},
    messaging::{port::MessagingPort, types::ChatAction},
    model::{
        client::CompletionClient,
        retry::{RetryNotice, RetryObserver},
    },
    queue::QueueReceiver,
    rate_limit::RateLimiter,
    utils::truncate_text,
    Result,
};

pub struct Dispatcher {
    cfg: Arc<Config>,
    queue: QueueReceiver,
    completion: CompletionClient,
    messenger: Arc<dyn MessagingPort>,
    conversations: ConversationStore,
    rate_limiter: RateLimiter,
    /// Error reports in a row that could not be delivered to any chat.
    undelivered_reports: u32,
}

impl Dispatcher {
    pub fn new(
        cfg: Arc<Config>,
        queue: QueueReceiver,
        completion: CompletionClient,
        messenger: Arc<dyn MessagingPort>,
    ) -> Self {
        let conversations = ConversationStore::new(cfg.context_max_turns, cfg.context_ttl);
        let rate_limiter = RateLimiter::new(
            cfg.rate_limit_enabled,
            cfg.rate_limit_requests,
            cfg.rate_limit_window,
        );
        Self {
            cfg,
            queue,
            completion,
            messenger,
            conversations,
            rate_limiter,
            undelivered_reports: 0,
        }
    }

    /// Drain the queue until cancelled or every producer is gone.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("dispatcher started");
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                req = self.queue.dequeue() => req,
            };
            let Some(req) = next else {
                break;
            };
            self.dispatch(req).await;
        }
        tracing::info!("dispatcher stopped");
    }

    /// Fully resolve one request. Errors are reported to the chat, never returned.
    pub async fn dispatch(&mut self, req: Request) {
        let queued_ms = (Utc::now() - req.received_at).num_milliseconds().max(0);
        tracing::info!(
            user_id = req.requester.0,
            chat_id = req.chat_id.0,
            username = %req.username,
            queued_ms,
            has_image = req.image.is_some(),
            "dispatching request"
        );

        match self.process(&req).await {
            Ok(()) => {
                self.undelivered_reports = 0;
                tracing::info!(user_id = req.requester.0, "request resolved");
            }
            Err(err) => {
                tracing::error!(
                    user_id = req.requester.0,
                    chat_id = req.chat_id.0,
                    error = %truncate_text(&err.to_string(), 300),
                    "request failed"
                );
                match self
                    .messenger
                    .send_text(req.chat_id, &err.user_message())
                    .await
                {
                    Ok(_) => self.undelivered_reports = 0,
                    Err(send_err) => {
                        self.undelivered_reports += 1;
                        tracing::error!(
                            chat_id = req.chat_id.0,
                            consecutive_failures = self.undelivered_reports,
                            error = %send_err,
                            "failed to report error to chat"
                        );
                    }
                }
            }
        }
    }

    async fn process(&mut self, req: &Request) -> Result<()> {
        if req.kind == RequestKind::Reset {
            self.conversations.clear(req.requester);
            self.messenger
                .send_text(req.chat_id, "🧹 Conversation context cleared.")
                .await?;
            return Ok(());
        }

        self.wait_for_rate_limit().await;

        let caps = self.messenger.capabilities();
        if caps.supports_chat_actions {
            let _ = self
                .messenger
                .send_chat_action(req.chat_id, ChatAction::Typing)
                .await;
        }

        let context = self.conversations.context(req.requester);
        let notifier = ChatRetryNotifier {
            messenger: self.messenger.clone(),
            chat_id: req.chat_id,
        };
        let observer: Option<&dyn RetryObserver> = if self.cfg.notify_on_retry {
            Some(&notifier)
        } else {
            None
        };

        let payload = self
            .completion
            .complete(&context, &req.text, req.image.as_ref(), observer)
            .await?;

        let reply = format_response(&payload);
        let outgoing = with_header(self.cfg.response_header.as_deref(), &reply);
        let max_len = self.cfg.message_chunk_len.min(caps.max_message_len);
        for piece in chunk(&outgoing, max_len) {
            self.messenger.send_text(req.chat_id, &piece).await?;
        }

        self.conversations
            .append_turn(req.requester, Turn::user(req.text.clone()));
        self.conversations
            .append_turn(req.requester, Turn::assistant(reply));
        Ok(())
    }

    async fn wait_for_rate_limit(&mut self) {
        if !self.rate_limiter.is_enabled() {
            return;
        }
        loop {
            let now = Instant::now();
            if self.rate_limiter.allow_at(now) {
                self.rate_limiter.record_at(now);
                return;
            }
            let wait = self.rate_limiter.retry_after_at(now);
            tracing::info!(
                wait_ms = wait.as_millis() as u64,
                "rate limit window full, waiting"
            );
            sleep(wait).await;
        }
    }
}

/// Posts a progress line to the chat before each backoff sleep.
struct ChatRetryNotifier {
    messenger: Arc<dyn MessagingPort>,
    chat_id: ChatId,
}

#[async_trait]
impl RetryObserver for ChatRetryNotifier {
    async fn on_retry(&self, notice: RetryNotice) {
        let text = format!(
            "⏳ Rate limit reached, retrying in {:.1}s (attempt {}/{})...",
            notice.wait.as_secs_f64(),
            notice.attempt + 1,
            notice.max_attempts
        );
        if let Err(e) = self.messenger.send_text(self.chat_id, &text).await {
            tracing::warn!(chat_id = self.chat_id.0, error = %e, "failed to send retry notice");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::{
        domain::{ImagePayload, MessageId, MessageRef, UserId},
        errors::Error,
        messaging::types::MessagingCapabilities,
        model::{
            client::CompletionTransport,
            retry::{FixedJitter, RetryPolicy},
            types::{AttemptError, ChatCompletionRequest, CompletionSettings, MessageContent},
        },
        queue::work_queue,
    };

    #[derive(Default)]
    struct FakeMessenger {
        sends: Mutex<Vec<(i64, String)>>,
        down: AtomicBool,
    }

    impl FakeMessenger {
        fn sent(&self) -> Vec<(i64, String)> {
            self.sends.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessagingPort for FakeMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                supports_chat_actions: true,
                max_message_len: 4096,
            }
        }

        async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef> {
            if self.down.load(Ordering::SeqCst) {
                return Err(Error::External("telegram unreachable".to_string()));
            }
            let mut sends = self.sends.lock().unwrap();
            sends.push((chat_id.0, text.to_string()));
            Ok(MessageRef {
                chat_id,
                message_id: MessageId(sends.len() as i32),
            })
        }

        async fn send_chat_action(&self, _chat_id: ChatId, _action: ChatAction) -> Result<()> {
            Ok(())
        }
    }

    /// Replies with a canned answer per user text, optionally after a delay.
    #[derive(Default)]
    struct FakeTransport {
        replies: HashMap<String, (Duration, std::result::Result<serde_json::Value, AttemptError>)>,
        calls: Mutex<Vec<(Instant, ChatCompletionRequest)>>,
    }

    impl FakeTransport {
        fn reply(mut self, user_text: &str, delay: Duration, answer: &str) -> Self {
            self.replies.insert(
                user_text.to_string(),
                (
                    delay,
                    Ok(json!({"choices":[{"message":{"content": answer}}]})),
                ),
            );
            self
        }

        fn fail(mut self, user_text: &str, err: AttemptError) -> Self {
            self.replies
                .insert(user_text.to_string(), (Duration::ZERO, Err(err)));
            self
        }

        fn calls(&self) -> Vec<(Instant, ChatCompletionRequest)> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn last_user_text(body: &ChatCompletionRequest) -> String {
        match &body.messages.last().map(|m| &m.content) {
            Some(MessageContent::Text(t)) => t.clone(),
            Some(MessageContent::Parts(parts)) => serde_json::to_value(parts)
                .ok()
                .and_then(|v| v[0]["text"].as_str().map(str::to_string))
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    #[async_trait]
    impl CompletionTransport for FakeTransport {
        async fn send(
            &self,
            body: &ChatCompletionRequest,
        ) -> std::result::Result<serde_json::Value, AttemptError> {
            self.calls
                .lock()
                .unwrap()
                .push((Instant::now(), body.clone()));
            let key = last_user_text(body);
            let (delay, outcome) = self
                .replies
                .get(&key)
                .cloned()
                .unwrap_or((Duration::ZERO, Err(AttemptError::Throttled)));
            sleep(delay).await;
            outcome
        }
    }

    fn test_config(extra: &[(&str, &str)]) -> Arc<Config> {
        let mut map: HashMap<String, String> = [
            ("TELEGRAM_BOT_TOKEN", "tg"),
            ("COMPLETION_API_KEY", "sk"),
            ("RATE_LIMIT_ENABLED", "false"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (k, v) in extra {
            map.insert(k.to_string(), v.to_string());
        }
        Arc::new(Config::from_lookup(|k| map.get(k).cloned()).unwrap())
    }

    fn dispatcher(
        cfg: Arc<Config>,
        transport: Arc<FakeTransport>,
        messenger: Arc<FakeMessenger>,
    ) -> (crate::queue::QueueSender, Dispatcher) {
        let (tx, rx) = work_queue(cfg.queue_capacity);
        let completion = CompletionClient::new(
            transport,
            CompletionSettings::from_config(&cfg),
            RetryPolicy::from_config(&cfg),
        )
        .with_jitter(Arc::new(FixedJitter(0.0)));
        (tx, Dispatcher::new(cfg, rx, completion, messenger))
    }

    fn prompt(user: i64, text: &str) -> Request {
        Request::prompt(UserId(user), ChatId(user * 100), "tester", text, None)
    }

    #[tokio::test(start_paused = true)]
    async fn requests_resolve_in_arrival_order_without_interleaving() {
        let cfg = test_config(&[("MESSAGE_CHUNK_LEN", "4")]);
        let transport = Arc::new(
            FakeTransport::default()
                .reply("from A", Duration::from_secs(3), "AAAAaaaaAAAA")
                .reply("from B", Duration::ZERO, "BBBBbbbb"),
        );
        let messenger = Arc::new(FakeMessenger::default());
        let (tx, d) = dispatcher(cfg, transport, messenger.clone());

        tx.enqueue(prompt(1, "from A")).unwrap();
        tx.enqueue(prompt(2, "from B")).unwrap();
        drop(tx);
        d.run(CancellationToken::new()).await;

        assert_eq!(
            messenger.sent(),
            vec![
                (100, "AAAA".to_string()),
                (100, "aaaa".to_string()),
                (100, "AAAA".to_string()),
                (200, "BBBB".to_string()),
                (200, "bbbb".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_reported_and_loop_continues() {
        let cfg = test_config(&[]);
        let transport = Arc::new(
            FakeTransport::default()
                .fail("broken", AttemptError::Provider("500 oops".to_string()))
                .reply("fine", Duration::ZERO, "all good"),
        );
        let messenger = Arc::new(FakeMessenger::default());
        let (tx, d) = dispatcher(cfg, transport, messenger.clone());

        tx.enqueue(prompt(1, "broken")).unwrap();
        tx.enqueue(prompt(2, "fine")).unwrap();
        drop(tx);
        d.run(CancellationToken::new()).await;

        let sent = messenger.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, 100);
        assert_eq!(sent[0].1, Error::Provider(String::new()).user_message());
        assert_eq!(sent[1], (200, "all good".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn context_carries_previous_turns_for_same_requester() {
        let cfg = test_config(&[]);
        let transport = Arc::new(
            FakeTransport::default()
                .reply("first", Duration::ZERO, "one")
                .reply("second", Duration::ZERO, "two"),
        );
        let messenger = Arc::new(FakeMessenger::default());
        let (_tx, mut d) = dispatcher(cfg, transport.clone(), messenger);

        d.dispatch(prompt(1, "first")).await;
        d.dispatch(prompt(1, "second")).await;
        d.dispatch(prompt(2, "first")).await;

        let calls = transport.calls();
        let body = serde_json::to_value(&calls[1].1).unwrap();
        assert_eq!(
            body["messages"],
            json!([
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "one"},
                {"role": "user", "content": "second"}
            ])
        );
        // Another requester starts from an empty context.
        assert_eq!(calls[2].1.messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn context_expires_after_ttl() {
        let cfg = test_config(&[("CONTEXT_TTL_SECS", "60")]);
        let transport = Arc::new(
            FakeTransport::default()
                .reply("first", Duration::ZERO, "one")
                .reply("second", Duration::ZERO, "two"),
        );
        let messenger = Arc::new(FakeMessenger::default());
        let (_tx, mut d) = dispatcher(cfg, transport.clone(), messenger);

        d.dispatch(prompt(1, "first")).await;
        tokio::time::advance(Duration::from_secs(61)).await;
        d.dispatch(prompt(1, "second")).await;

        assert_eq!(transport.calls()[1].1.messages.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn images_are_sent_but_not_kept_in_context() {
        let cfg = test_config(&[]);
        let transport = Arc::new(
            FakeTransport::default()
                .reply("look", Duration::ZERO, "a cat")
                .reply("again", Duration::ZERO, "still a cat"),
        );
        let messenger = Arc::new(FakeMessenger::default());
        let (_tx, mut d) = dispatcher(cfg, transport.clone(), messenger);

        let image = ImagePayload {
            mime_type: "image/jpeg".to_string(),
            base64: "QUJD".to_string(),
        };
        d.dispatch(Request::prompt(
            UserId(1),
            ChatId(1),
            "tester",
            "look",
            Some(image),
        ))
        .await;
        d.dispatch(prompt(1, "again")).await;

        let calls = transport.calls();
        let first = serde_json::to_value(&calls[0].1).unwrap();
        assert_eq!(
            first["messages"][0]["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
        let second = serde_json::to_value(&calls[1].1).unwrap();
        assert_eq!(second["messages"][0]["content"], "look");
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_context() {
        let cfg = test_config(&[]);
        let transport = Arc::new(
            FakeTransport::default()
                .reply("first", Duration::ZERO, "one")
                .reply("second", Duration::ZERO, "two"),
        );
        let messenger = Arc::new(FakeMessenger::default());
        let (_tx, mut d) = dispatcher(cfg, transport.clone(), messenger.clone());

        d.dispatch(prompt(1, "first")).await;
        d.dispatch(Request::reset(UserId(1), ChatId(100), "tester"))
            .await;
        d.dispatch(prompt(1, "second")).await;

        assert_eq!(transport.calls()[1].1.messages.len(), 1);
        assert!(messenger.sent()[1].1.contains("cleared"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_notices_are_opt_in() {
        for (notify, expected_notices) in [("false", 0usize), ("true", 2usize)] {
            let cfg = test_config(&[
                ("NOTIFY_ON_RETRY", notify),
                ("RETRY_MAX_ATTEMPTS", "3"),
                ("RETRY_INITIAL_DELAY_MS", "100"),
                ("RETRY_MAX_DELAY_MS", "1000"),
            ]);
            let transport = Arc::new(FakeTransport::default());
            let messenger = Arc::new(FakeMessenger::default());
            let (_tx, mut d) = dispatcher(cfg, transport.clone(), messenger.clone());

            d.dispatch(prompt(1, "unlucky")).await;

            let sent = messenger.sent();
            let notices = sent
                .iter()
                .filter(|(_, t)| t.starts_with("⏳ Rate limit reached"))
                .count();
            assert_eq!(notices, expected_notices);
            assert_eq!(transport.calls().len(), 3);
            assert!(sent
                .last()
                .is_some_and(|(_, t)| t.contains("rate limiting")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_delays_calls_beyond_window() {
        let cfg = test_config(&[
            ("RATE_LIMIT_ENABLED", "true"),
            ("RATE_LIMIT_REQUESTS", "1"),
            ("RATE_LIMIT_WINDOW", "60"),
        ]);
        let transport = Arc::new(
            FakeTransport::default()
                .reply("a", Duration::ZERO, "A")
                .reply("b", Duration::ZERO, "B"),
        );
        let messenger = Arc::new(FakeMessenger::default());
        let (_tx, mut d) = dispatcher(cfg, transport.clone(), messenger);

        d.dispatch(prompt(1, "a")).await;
        d.dispatch(prompt(2, "b")).await;

        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].0 - calls[0].0 >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn response_header_is_prepended() {
        let cfg = test_config(&[("RESPONSE_HEADER", "Claude:")]);
        let transport =
            Arc::new(FakeTransport::default().reply("hi", Duration::ZERO, "  hello\\nthere "));
        let messenger = Arc::new(FakeMessenger::default());
        let (_tx, mut d) = dispatcher(cfg, transport, messenger.clone());

        d.dispatch(prompt(1, "hi")).await;

        assert_eq!(
            messenger.sent(),
            vec![(100, "Claude:\n\nhello\nthere".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_idle_loop() {
        let cfg = test_config(&[]);
        let transport = Arc::new(FakeTransport::default());
        let messenger = Arc::new(FakeMessenger::default());
        let (_tx, d) = dispatcher(cfg, transport, messenger);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(d.run(cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn undeliverable_error_reports_are_counted_until_a_send_succeeds() {
        let cfg = test_config(&[]);
        let transport = Arc::new(
            FakeTransport::default()
                .fail("broken", AttemptError::Network("connection refused".to_string()))
                .reply("fine", Duration::ZERO, "ok"),
        );
        let messenger = Arc::new(FakeMessenger::default());
        messenger.down.store(true, Ordering::SeqCst);
        let (_tx, mut d) = dispatcher(cfg, transport, messenger.clone());

        d.dispatch(prompt(1, "broken")).await;
        d.dispatch(prompt(2, "broken")).await;
        assert_eq!(d.undelivered_reports, 2);
        assert!(d.conversations.is_empty());

        messenger.down.store(false, Ordering::SeqCst);
        d.dispatch(prompt(1, "fine")).await;
        assert_eq!(d.undelivered_reports, 0);
        assert_eq!(messenger.sent(), vec![(100, "ok".to_string())]);
    }
}
