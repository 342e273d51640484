//! Resilient access to named remote functions.
//!
//! [`RpcClient`] wraps a [`Transport`] with the protections a flaky
//! backend needs:
//!
//! - retry with exponential backoff and a per-attempt timeout
//! - a fixed-window rate limit with a priority overflow queue
//! - deduplication of identical concurrent calls
//! - an optional per-call response cache
//!
//! Calls settle into a [`CallResponse`] instead of an `Err`, and every
//! outcome is published on the [`EventBus`](crate::event::EventBus) so
//! other parts of the system can observe traffic without holding a
//! reference to the client.

mod limiter;
mod queue;
mod rpc;
mod transport;

pub use rpc::{request_key, CallOptions, CallResponse, ClientStats, ErrorObserver, RpcClient};
pub use transport::{ErrorCode, HttpTransport, MockTransport, Transport, TransportError};
