//! # Keel: Client-Side Resilience and Synchronization Core
//!
//! Keel keeps an application responsive while the remote backend it
//! depends on is slow, flaky or briefly gone. It layers caching,
//! deduplication, rate limiting and retry underneath a plain
//! call-a-named-function interface, and reports everything it does on
//! an in-process event bus.
//!
//! ## Technical Foundations
//!
//! ### 1. Decoupled Eventing
//! Components never hold references to each other; they communicate
//! through a priority event bus:
//! - Publish/subscribe with priorities and one-shot listeners ([`event`])
//! - Bounded history with replay ([`event::EventBus::replay`])
//! - Well-known system events ([`event::SYSTEM_ERROR`] and friends)
//!
//! ### 2. Freshness-Aware Caching
//! Reads are served at memory speed while staleness is repaired in the
//! background:
//! - Stale-while-revalidate lifecycle ([`cache`])
//! - Optional persistence behind a storage trait ([`cache::CacheStore`])
//! - Hit/miss/revalidation accounting ([`cache::CacheStats`])
//!
//! ### 3. Resilient RPC
//! Every remote call runs one hardened pipeline:
//! - Retry with exponential backoff and per-attempt timeouts ([`client`])
//! - Fixed-window rate limiting with a priority overflow queue
//! - Deduplication of identical concurrent calls ([`client::request_key`])
//! - Pluggable transport seam ([`client::Transport`])
//!
//! ### 4. One-Config Wiring
//! A single serde document configures the whole stack:
//! - Typed sections with full defaults ([`config`])
//! - Top-level wiring ([`system`]) and error taxonomy ([`error`])
//!
//! ## Call Pipeline
//!
//! ```text
//! call ──▶ response cache ──▶ dedup ──▶ rate limit ──▶ retry ──▶ transport
//! ```
//!
//! A call first consults the per-call response cache, then joins an
//! identical in-flight call if one exists, then takes a rate limit
//! slot or parks in the overflow queue, and finally runs the retry
//! loop against the [`client::Transport`]. The outcome settles into a
//! [`client::CallResponse`]; failures surface there and on the bus,
//! never as a panic or an `Err` from `call`.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod system;
pub mod timestamp;

// Re-exports
pub use cache::*;
pub use client::*;
pub use config::SystemConfig;
pub use error::{Error, Result};
pub use event::*;
pub use system::System;
pub use timestamp::Timestamp;
