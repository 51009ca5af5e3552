//! postwatch: watch content-provider accounts and forward each new post
//! exactly once to a notification sink.
//!
//! The pieces, leaves first:
//!
//! - [`storage`] - SQLite-backed account registry and dedup store
//! - [`feed`] - the [`ContentSource`](feed::ContentSource) trait and an HTTP feed source
//! - [`notify`] - the [`NotificationSink`](notify::NotificationSink) trait, webhook and log sinks
//! - [`engine`] - poll cycles, registry operations and the scheduler
//! - [`commands`] - add/remove/list with status reporting
//! - [`config`] - TOML configuration

pub mod commands;
pub mod config;
pub mod engine;
pub mod feed;
pub mod notify;
pub mod storage;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod util;
