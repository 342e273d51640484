//! # Event System
//!
//! The event system is the coordination backbone of the crate. The client
//! and the cache publish well-known system events through a shared
//! [`EventBus`]; application code subscribes with plain callbacks and can
//! prioritize, observe once, replay history and inspect statistics.
//!
//! ## Architecture Overview
//!
//! - **EventBus**: Priority-ordered listener dispatch with error isolation
//! - **EventHistory**: Bounded archive of recent emits, replayable
//! - **System events**: Names and payload shapes shared by all components
//!
//! ## Event Flow
//!
//! ```text
//! ┌──────────┐     ┌──────────┐     ┌──────────┐
//! │RpcClient │────▶│ EventBus │────▶│Listeners │
//! │ / Cache  │     │          │     │(by prio) │
//! └──────────┘     └────┬─────┘     └──────────┘
//!                       │
//!                  ┌────▼────┐
//!                  │ History │
//!                  └─────────┘
//! ```
//!
//! 1. Components emit named events with JSON payloads
//! 2. The bus dispatches to listeners in descending priority order
//! 3. Each emit is archived in the bounded history for later replay
//!
//! ## System Events
//!
//! | Event | Payload | Emitted when |
//! |-------|---------|--------------|
//! | [`SYSTEM_ERROR`] | `{error, context, severity}` | a listener or call fails |
//! | [`DATA_LOADED`] | `{dataType, recordCount, duration}` | a call succeeds |
//! | [`CACHE_UPDATED`] | `{cacheKey, action}` | the response cache changes |
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use keel::event::{EventBus, DATA_LOADED};
//! use serde_json::json;
//!
//! let bus = EventBus::default();
//! let _sub = bus.on_with_priority(DATA_LOADED, 10, |data| {
//!     println!("{} records from {}", data["recordCount"], data["dataType"]);
//!     Ok(())
//! });
//! bus.emit(DATA_LOADED, json!({
//!     "dataType": "orders",
//!     "recordCount": 3,
//!     "duration": 12,
//! }));
//! ```

mod bus;
mod history;

pub use bus::{BusStats, EmitReport, EventBus, ListenerError, Subscription};
pub use history::EventHistoryEntry;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum_macros::{Display, EnumString};

/// Emitted when a listener or a call fails. Payload:
/// `{error, context, severity}`.
pub const SYSTEM_ERROR: &str = "system:error";

/// Emitted after a successful call. Payload:
/// `{dataType, recordCount, duration}`.
pub const DATA_LOADED: &str = "system:data-loaded";

/// Emitted when the client's response cache changes. Payload:
/// `{cacheKey, action}`.
pub const CACHE_UPDATED: &str = "system:cache-updated";

/// Severity attached to [`SYSTEM_ERROR`] payloads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Mutation kind carried by [`CACHE_UPDATED`] payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CacheAction {
    Add,
    Update,
    Delete,
    Clear,
}

pub fn error_payload(error: &str, context: &str, severity: ErrorSeverity) -> Value {
    json!({
        "error": error,
        "context": context,
        "severity": severity,
    })
}

pub fn data_loaded_payload(data_type: &str, record_count: Option<u64>, duration: Duration) -> Value {
    json!({
        "dataType": data_type,
        "recordCount": record_count,
        "duration": duration.as_millis() as u64,
    })
}

pub fn cache_updated_payload(cache_key: &str, action: CacheAction) -> Value {
    json!({
        "cacheKey": cache_key,
        "action": action,
    })
}
