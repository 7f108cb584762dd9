//! Chat-completion model: payload types, retry policy and the retrying client.

pub mod client;
pub mod retry;
pub mod types;
