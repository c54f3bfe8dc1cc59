//! ASV Daemon - Transcript tailer, session store and live query server
//!
//! This crate provides the core infrastructure for the ASV daemon:
//! - `tailer` - Incremental reader turning transcript appends into store writes
//! - `store` - SQLite session store with optional full-text search
//! - `bus` - Per-session change notification fan-out
//! - `server` - HTTP query API and SSE watch streams
//! - `deadline` - Timeout and cancellation carried through every request
//! - `config` - Layered daemon configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        asvd daemon                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐ ingest  ┌─────────────────────────┐    │
//! │  │     Tailer      │────────▶│      SessionStore       │    │
//! │  │ (notify + poll) │         │    (SQLite + FTS5)      │    │
//! │  └────────┬────────┘         └────────────▲────────────┘    │
//! │           │ publish                       │ query           │
//! │           ▼                               │                 │
//! │  ┌─────────────────┐  watch  ┌────────────┴────────────┐    │
//! │  │ NotificationBus │────────▶│        ApiServer        │    │
//! │  │ (per session)   │         │   (axum, deadlines)     │    │
//! │  └─────────────────┘         └─────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod bus;
pub mod config;
pub mod deadline;
pub mod server;
pub mod store;
pub mod tailer;
