//! Chanrelay - a chat-channel relay daemon
//!
//! Ingests messages from source channels per account session, screens
//! them against trap blocklists, sanitizes attribution markers while
//! preserving markup, and delivers them to destination channels with
//! rate limiting and retry. A durable message-identity map keeps edits
//! and deletions synchronized, and pause gates with auto-pause cooldowns
//! control the flow per user and per pair.

pub mod cli;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod mapping;
pub mod ratelimit;
pub mod retry;
pub mod router;
pub mod sanitize;
pub mod session;
#[cfg(feature = "telegram")]
pub mod telegram;
pub mod trap;

#[cfg(test)]
mod test_utils;

pub use error::{RelayError, RelayResult};
