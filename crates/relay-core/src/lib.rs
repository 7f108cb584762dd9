//! Core request-processing pipeline for the chat relay bot.
//!
//! This crate is intentionally framework-agnostic. Telegram and the HTTP
//! completion provider live behind ports (traits) implemented in adapter crates.

pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod ingress;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod queue;
pub mod rate_limit;
pub mod utils;

pub use errors::{Error, Result};
