//! Relays motion-triggered Surveillance Station recordings to a Telegram
//! chat as short video fragments.
//!
//! The scheduling engine lives in `fragment-ingest`; this crate provides the
//! concrete collaborators (Surveillance Station client, Telegram sink,
//! ffprobe-based probe) and the process around them.

pub mod announce;
pub mod app;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod probe;
pub mod retry;
pub mod surveillance;
pub mod telegram;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
