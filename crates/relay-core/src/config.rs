use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Typed configuration, sourced from the environment (and an optional `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Platform
    pub telegram_bot_token: String,
    pub trigger_prefix: String,
    pub message_chunk_len: usize,
    pub max_attachment_bytes: usize,
    pub response_header: Option<String>,

    // Completion provider
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
    pub ca_cert_path: Option<PathBuf>,

    // Retry / backoff
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub notify_on_retry: bool,

    // Queue + conversation context
    pub queue_capacity: usize,
    pub context_max_turns: usize,
    pub context_ttl: Duration,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the process env in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        // Required
        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").ok_or_else(|| {
            Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
        })?;
        let api_key = get("COMPLETION_API_KEY")
            .or_else(|| get("OPENAI_API_KEY"))
            .ok_or_else(|| {
                Error::Config(
                    "COMPLETION_API_KEY (or OPENAI_API_KEY) environment variable is required"
                        .to_string(),
                )
            })?;

        let trigger_prefix = get("TRIGGER_PREFIX").unwrap_or_else(|| "!ask".to_string());
        let message_chunk_len = parse(&get, "MESSAGE_CHUNK_LEN")?.unwrap_or(2000usize);
        let max_attachment_bytes =
            parse(&get, "MAX_ATTACHMENT_BYTES")?.unwrap_or(10 * 1024 * 1024usize);
        let response_header = get("RESPONSE_HEADER");

        let api_url = get("COMPLETION_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let model = get("COMPLETION_MODEL").unwrap_or_else(|| "gpt-4o".to_string());
        let max_tokens = parse(&get, "COMPLETION_MAX_TOKENS")?.unwrap_or(400u32);
        let temperature = parse(&get, "COMPLETION_TEMPERATURE")?.unwrap_or(0.0f32);
        let request_timeout =
            Duration::from_secs(parse(&get, "COMPLETION_TIMEOUT_SECS")?.unwrap_or(60u64));
        let ca_cert_path = get("COMPLETION_CA_CERT").map(PathBuf::from);

        let retry_max_attempts = parse(&get, "RETRY_MAX_ATTEMPTS")?.unwrap_or(5u32).max(1);
        let retry_initial_delay =
            Duration::from_millis(parse(&get, "RETRY_INITIAL_DELAY_MS")?.unwrap_or(1_000u64));
        let retry_max_delay =
            Duration::from_millis(parse(&get, "RETRY_MAX_DELAY_MS")?.unwrap_or(30_000u64));
        if retry_max_delay < retry_initial_delay {
            return Err(Error::Config(
                "RETRY_MAX_DELAY_MS must be >= RETRY_INITIAL_DELAY_MS".to_string(),
            ));
        }
        let notify_on_retry = get("NOTIFY_ON_RETRY")
            .map(|s| parse_bool(&s))
            .unwrap_or(false);

        let queue_capacity = parse(&get, "QUEUE_CAPACITY")?.unwrap_or(50usize);
        if queue_capacity == 0 {
            return Err(Error::Config("QUEUE_CAPACITY must be at least 1".to_string()));
        }
        let context_max_turns = parse(&get, "CONTEXT_MAX_TURNS")?.unwrap_or(10usize);
        let context_ttl = Duration::from_secs(parse(&get, "CONTEXT_TTL_SECS")?.unwrap_or(1800u64));

        let rate_limit_enabled = get("RATE_LIMIT_ENABLED")
            .map(|s| parse_bool(&s))
            .unwrap_or(true);
        let rate_limit_requests = parse(&get, "RATE_LIMIT_REQUESTS")?.unwrap_or(20u32).max(1);
        let rate_limit_window =
            Duration::from_secs(parse(&get, "RATE_LIMIT_WINDOW")?.unwrap_or(60u64));

        Ok(Self {
            telegram_bot_token,
            trigger_prefix,
            message_chunk_len,
            max_attachment_bytes,
            response_header,
            api_key,
            api_url,
            model,
            max_tokens,
            temperature,
            request_timeout,
            ca_cert_path,
            retry_max_attempts,
            retry_initial_delay,
            retry_max_delay,
            notify_on_retry,
            queue_capacity,
            context_max_turns,
            context_ttl,
            rate_limit_enabled,
            rate_limit_requests,
            rate_limit_window,
        })
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw:?}"))),
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() || env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, unquote(v.trim()));
    }
}

fn unquote(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        &val[1..val.len() - 1]
    } else {
        val
    }
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
