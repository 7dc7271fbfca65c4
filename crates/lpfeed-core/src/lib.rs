//! lpfeed-core: Core library for lpfeed
//!
//! This crate provides webhook ingestion for liquidity position feeds and the
//! crash-safe, in-memory stores that the ingested events update.
//!
//! # Architecture
//!
//! ```text
//! Webhook payloads → Dedup → Intake queue → Workers → TransactionHandler
//!                                                          ↓
//!                                  Domain stores (derived indices, in memory)
//!                                                          ↓
//!                                  StorageEngine → MessagePack file (atomic replace)
//! ```
//!
//! # Modules
//!
//! - `pipeline`: bounded intake, relay, worker pool and status
//! - `dedup`: best-effort duplicate-delivery filter
//! - `failure_log`: bounded record of recent pipeline failures
//! - `events`: position event handler wired to the stores
//! - `storage`: generic persistence engine, codec and composite keys
//! - `stores`: positions, position indices, sessions, wallets, token pairs,
//!   performance and votes
//! - `retry`: retry with backoff and an injectable sleeper
//! - `config`: `lpfeed.toml` loading and validation
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod failure_log;
pub mod logging;
pub mod pipeline;
pub mod retry;
pub mod storage;
pub mod stores;

pub use error::{ConfigError, Error, Result, StorageError, ValidationError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
