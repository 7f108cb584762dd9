//! Per-requester conversation context with a turn bound and idle expiry.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use serde::Serialize;
use tokio::time::Instant;

use crate::domain::UserId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Conversation {
    turns: VecDeque<Turn>,
    last_update: Instant,
}

impl Conversation {
    fn new(now: Instant) -> Self {
        Self {
            turns: VecDeque::new(),
            last_update: now,
        }
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Bounded, expiring conversation history keyed by requester.
///
/// Owned by the dispatcher; there is no interior locking.
#[derive(Debug)]
pub struct ConversationStore {
    max_turns: usize,
    ttl: Duration,
    conversations: HashMap<UserId, Conversation>,
}

impl ConversationStore {
    pub fn new(max_turns: usize, ttl: Duration) -> Self {
        Self {
            max_turns,
            ttl,
            conversations: HashMap::new(),
        }
    }

    /// Fetch the requester's entry, creating an empty one when absent.
    pub fn get_or_create(&mut self, requester: UserId, now: Instant) -> &mut Conversation {
        self.conversations
            .entry(requester)
            .or_insert_with(|| Conversation::new(now))
    }

    pub fn context(&mut self, requester: UserId) -> Vec<Turn> {
        self.context_at(requester, Instant::now())
    }

    /// Turns oldest first. A stale conversation is dropped before reading.
    pub fn context_at(&mut self, requester: UserId, now: Instant) -> Vec<Turn> {
        let Some(conv) = self.conversations.get(&requester) else {
            return Vec::new();
        };
        if self.is_expired(conv, now) {
            tracing::debug!(user_id = requester.0, "conversation context expired");
            self.conversations.remove(&requester);
            return Vec::new();
        }
        conv.turns.iter().cloned().collect()
    }

    pub fn append_turn(&mut self, requester: UserId, turn: Turn) {
        self.append_turn_at(requester, turn, Instant::now());
    }

    pub fn append_turn_at(&mut self, requester: UserId, turn: Turn, now: Instant) {
        self.evict_expired(now);
        let max_turns = self.max_turns;
        let conv = self.get_or_create(requester, now);
        conv.turns.push_back(turn);
        while conv.turns.len() > max_turns {
            conv.turns.pop_front();
        }
        conv.last_update = now;
    }

    /// Drop every conversation idle for longer than the TTL.
    pub fn evict_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        let before = self.conversations.len();
        self.conversations
            .retain(|_, c| now.saturating_duration_since(c.last_update) <= ttl);
        let evicted = before - self.conversations.len();
        if evicted > 0 {
            tracing::debug!(evicted, "expired conversations dropped");
        }
    }

    fn is_expired(&self, conv: &Conversation, now: Instant) -> bool {
        now.saturating_duration_since(conv.last_update) > self.ttl
    }

    pub fn clear(&mut self, requester: UserId) {
        self.conversations.remove(&requester);
    }

    /// Number of requesters with tracked state.
    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}
