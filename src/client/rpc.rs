//! Resilient RPC client over a pluggable [`Transport`].
//!
//! Every call runs the same pipeline:
//!
//! ```text
//! call ──▶ response cache ──▶ dedup ──▶ rate limit ──▶ retry loop ──▶ transport
//!              (ttl)        (in-flight)  (window or      (backoff,
//!                                         queue)          timeout)
//! ```
//!
//! [`RpcClient::call`] never returns `Err`; failures are folded into the
//! [`CallResponse`] so callers branch on `success` instead of unwinding
//! through `?`. Transport failures are still published on the event bus.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace, warn};

use crate::client::limiter::FixedWindowLimiter;
use crate::client::queue::{PendingQueue, QueuedRequest};
use crate::client::transport::{ErrorCode, Transport, TransportError};
use crate::config::{duration_ms, ClientConfig};
use crate::event::{
    cache_updated_payload, data_loaded_payload, error_payload, CacheAction, ErrorSeverity,
    EventBus, CACHE_UPDATED, DATA_LOADED, SYSTEM_ERROR,
};
use crate::timestamp::Timestamp;

/// Canonical identity of a call, used for deduplication and response
/// caching.
///
/// Argument objects serialize with sorted keys at every nesting level
/// (`serde_json`'s map is a `BTreeMap`), so two argument values that
/// differ only in key order produce the same key.
pub fn request_key(name: &str, args: &Value) -> String {
    format!("{}:{}", name, args)
}

/// Observer invoked after each failed attempt with the attempt number
/// (1-based) and the error.
pub type ErrorObserver = Arc<dyn Fn(u32, &TransportError) + Send + Sync>;

/// Per-call overrides. Unset fields fall back to the
/// [`ClientConfig`] defaults.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub retries: Option<u32>,
    pub cache_ttl: Option<Duration>,
    pub timeout: Option<Duration>,
    pub priority: i32,
    pub skip_rate_limit: bool,
    pub on_error: Option<ErrorObserver>,
}

impl CallOptions {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Enables response caching for this call. A zero TTL disables it.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Queue position when the call overflows the rate limit window.
    /// Higher drains first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Bypasses the rate limit window without consuming a slot.
    pub fn with_skip_rate_limit(mut self, skip: bool) -> Self {
        self.skip_rate_limit = skip;
        self
    }

    pub fn with_on_error<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &TransportError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(observer));
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("retries", &self.retries)
            .field("cache_ttl", &self.cache_ttl)
            .field("timeout", &self.timeout)
            .field("priority", &self.priority)
            .field("skip_rate_limit", &self.skip_rate_limit)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// [`CallOptions`] with every fallback applied.
#[derive(Clone, Default)]
pub(crate) struct ResolvedOptions {
    pub(crate) retries: u32,
    pub(crate) cache_ttl: Duration,
    pub(crate) timeout: Duration,
    pub(crate) priority: i32,
    pub(crate) skip_rate_limit: bool,
    pub(crate) on_error: Option<ErrorObserver>,
}

/// Outcome of a call. Inspect `success` rather than matching on a
/// `Result`; the client absorbs transport errors.
#[derive(Debug, Clone, Serialize)]
pub struct CallResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// Wall time spent inside the client, including queueing and
    /// retries. Serialized as milliseconds.
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    /// Served from the response cache without touching the transport.
    pub cached: bool,
    /// Retries consumed; 0 when the first attempt settled it.
    pub retries: u32,
    /// Joined an identical in-flight call instead of starting one.
    pub deduped: bool,
}

impl CallResponse {
    fn success(data: Value, duration: Duration, retries: u32) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
            duration,
            cached: false,
            retries,
            deduped: false,
        }
    }

    pub(crate) fn failure(error: &TransportError, duration: Duration, retries: u32) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.message.clone()),
            error_code: Some(error.code),
            duration,
            cached: false,
            retries,
            deduped: false,
        }
    }

    fn from_cache(data: Value, duration: Duration) -> Self {
        Self {
            cached: true,
            ..Self::success(data, duration, 0)
        }
    }
}

/// Running totals since construction or the last
/// [`reset_stats`](RpcClient::reset_stats).
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    /// Served from the response cache.
    pub cached_calls: u64,
    /// Joined an in-flight call.
    pub deduped_calls: u64,
    /// Calls that consumed at least one retry, whatever the outcome.
    pub retried_calls: u64,
    pub rate_limit_hits: u64,
    /// Calls ever parked in the overflow queue.
    pub queued_requests: u64,
    /// Mean execution time in milliseconds of calls that reached the
    /// transport. Cache hits, dedup joins and queue wait are excluded.
    pub average_response_time: f64,
}

type SharedCall = Shared<BoxFuture<'static, CallResponse>>;

struct CachedResponse {
    data: Value,
    stored_at: Timestamp,
}

/// Client wrapper adding retry, rate limiting, deduplication, response
/// caching and queueing on top of a [`Transport`].
///
/// Cheap to share via [`Arc`]; all state lives behind one inner
/// allocation. Construction spawns the queue drain task and therefore
/// requires a running tokio runtime.
pub struct RpcClient {
    inner: Arc<ClientInner>,
    drain: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

struct ClientInner {
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus>,
    config: ClientConfig,
    limiter: FixedWindowLimiter,
    queue: PendingQueue,
    in_flight: DashMap<String, SharedCall>,
    response_cache: DashMap<String, CachedResponse>,
    running: AtomicBool,
    stats: Mutex<ClientStats>,
}

impl RpcClient {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>, bus: Arc<EventBus>) -> Self {
        let limiter = FixedWindowLimiter::new(config.max_requests_per_window, config.window);
        let inner = Arc::new(ClientInner {
            transport,
            bus,
            limiter,
            queue: PendingQueue::new(),
            in_flight: DashMap::new(),
            response_cache: DashMap::new(),
            running: AtomicBool::new(true),
            stats: Mutex::new(ClientStats::default()),
            config,
        });
        let drain = tokio::spawn(drain_loop(inner.clone()));
        Self {
            inner,
            drain: tokio::sync::Mutex::new(Some(drain)),
        }
    }

    /// Calls a remote function with the configured defaults.
    pub async fn call(&self, name: &str, args: Value) -> CallResponse {
        self.call_with(name, args, CallOptions::default()).await
    }

    /// Calls a remote function with per-call overrides.
    #[instrument(skip(self, args, options))]
    pub async fn call_with(&self, name: &str, args: Value, options: CallOptions) -> CallResponse {
        let started = Instant::now();
        let options = self.inner.resolve(options);
        let key = request_key(name, &args);
        self.inner.stats_mut().total_calls += 1;

        if !options.cache_ttl.is_zero() {
            if let Some(data) = self.inner.cached_response(&key, options.cache_ttl) {
                trace!(name, "Serving response from cache");
                self.inner.stats_mut().cached_calls += 1;
                return CallResponse::from_cache(data, started.elapsed());
            }
        }

        let (call, leader) = self.inner.join_in_flight(&key, name, &args, &options);
        let mut response = call.await;
        if !leader {
            trace!(name, "Joined in-flight call");
            self.inner.stats_mut().deduped_calls += 1;
            response.deduped = true;
        }
        // Each caller reports its own wall time, queue wait included.
        response.duration = started.elapsed();
        response
    }

    /// Drops every cached response. Returns how many were dropped.
    pub fn clear_response_cache(&self) -> usize {
        let count = self.inner.response_cache.len();
        self.inner.response_cache.clear();
        self.inner
            .bus
            .emit(CACHE_UPDATED, cache_updated_payload("*", CacheAction::Clear));
        count
    }

    /// Drops the cached response for one exact call, if present.
    pub fn clear_response_entry(&self, name: &str, args: &Value) -> bool {
        let key = request_key(name, args);
        let removed = self.inner.response_cache.remove(&key).is_some();
        if removed {
            self.inner
                .bus
                .emit(CACHE_UPDATED, cache_updated_payload(&key, CacheAction::Delete));
        }
        removed
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn response_cache_len(&self) -> usize {
        self.inner.response_cache.len()
    }

    pub fn stats(&self) -> ClientStats {
        self.inner.stats_mut().clone()
    }

    pub fn reset_stats(&self) {
        *self.inner.stats_mut() = ClientStats::default();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stops the drain task and fails everything still queued with
    /// [`ErrorCode::Unavailable`]. A request already being drained and
    /// calls already in flight finish naturally; this waits for the
    /// drained one. Later calls that overflow the window fail the same
    /// way instead of queueing. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            debug!("Shutting down rpc client");
        }
        self.inner.queue.wake();
        if let Some(handle) = self.drain.lock().await.take() {
            let _ = handle.await;
        }
    }
}

impl ClientInner {
    fn resolve(&self, options: CallOptions) -> ResolvedOptions {
        ResolvedOptions {
            retries: options.retries.unwrap_or(self.config.default_retries),
            cache_ttl: options.cache_ttl.unwrap_or(self.config.default_cache_ttl),
            timeout: options.timeout.unwrap_or(self.config.default_timeout),
            priority: options.priority,
            skip_rate_limit: options.skip_rate_limit,
            on_error: options.on_error,
        }
    }

    fn cached_response(&self, key: &str, ttl: Duration) -> Option<Value> {
        let entry = self.response_cache.get(key)?;
        if entry.stored_at.age() < ttl {
            Some(entry.data.clone())
        } else {
            None
        }
    }

    fn store_response(&self, key: &str, data: &Value) {
        let action = if self.response_cache.contains_key(key) {
            CacheAction::Update
        } else {
            CacheAction::Add
        };
        self.response_cache.insert(
            key.to_string(),
            CachedResponse {
                data: data.clone(),
                stored_at: Timestamp::now(),
            },
        );
        self.bus
            .emit(CACHE_UPDATED, cache_updated_payload(key, action));
    }

    /// Joins the in-flight call for `key`, starting one if absent.
    /// Returns the shared call and whether this caller started it.
    fn join_in_flight(
        self: &Arc<Self>,
        key: &str,
        name: &str,
        args: &Value,
        options: &ResolvedOptions,
    ) -> (SharedCall, bool) {
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let call = self.spawn_call(
                    key.to_string(),
                    name.to_string(),
                    args.clone(),
                    options.clone(),
                );
                entry.insert(call.clone());
                (call, true)
            }
        }
    }

    /// Runs the call on its own task so it completes even if every
    /// caller awaiting it is dropped. The task removes the in-flight
    /// entry itself; it cannot race ahead of the insert because the
    /// entry guard holds the shard lock until then.
    fn spawn_call(
        self: &Arc<Self>,
        key: String,
        name: String,
        args: Value,
        options: ResolvedOptions,
    ) -> SharedCall {
        let inner = self.clone();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let response = inner.admit_and_execute(&key, &name, &args, &options).await;
            inner.in_flight.remove(&key);
            let _ = done_tx.send(response);
        });
        let call: BoxFuture<'static, CallResponse> = async move {
            match done_rx.await {
                Ok(response) => response,
                Err(_) => CallResponse::failure(
                    &TransportError::internal("call task dropped before completing"),
                    Duration::ZERO,
                    0,
                ),
            }
        }
        .boxed();
        call.shared()
    }

    /// Passes the rate limit gate, parking the call in the overflow
    /// queue when the window is full.
    async fn admit_and_execute(
        &self,
        key: &str,
        name: &str,
        args: &Value,
        options: &ResolvedOptions,
    ) -> CallResponse {
        if !options.skip_rate_limit && !self.limiter.try_acquire() {
            if !self.running.load(Ordering::SeqCst) {
                return CallResponse::failure(
                    &TransportError::unavailable("client shut down"),
                    Duration::ZERO,
                    0,
                );
            }
            let (reply_tx, reply_rx) = oneshot::channel();
            {
                let mut stats = self.stats_mut();
                stats.rate_limit_hits += 1;
                stats.queued_requests += 1;
            }
            let depth =
                self.queue
                    .push(name.to_string(), args.clone(), options.clone(), reply_tx);
            debug!(name, depth, "Rate limit window full, queued request");
            // Shutdown may have stopped the drain between the check and
            // the push; fail whatever is parked so no caller waits
            // forever.
            if !self.running.load(Ordering::SeqCst) {
                self.reject_queued("client shut down");
            }
            return match reply_rx.await {
                Ok(response) => response,
                Err(_) => CallResponse::failure(
                    &TransportError::unavailable("queue drain stopped"),
                    Duration::ZERO,
                    0,
                ),
            };
        }
        self.execute_with_retry(key, name, args, options).await
    }

    /// Runs attempts until one succeeds, the retry budget is spent or
    /// a non-retryable error comes back. Settles stats, the response
    /// cache and bus events.
    async fn execute_with_retry(
        &self,
        key: &str,
        name: &str,
        args: &Value,
        options: &ResolvedOptions,
    ) -> CallResponse {
        let started = Instant::now();
        let total_attempts = options.retries.saturating_add(1);
        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt += 1;
            trace!(name, attempt, "Invoking transport");
            let result = match tokio::time::timeout(
                options.timeout,
                self.transport.invoke(name, args),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::timeout(options.timeout)),
            };
            match result {
                Ok(data) => break Ok(data),
                Err(transport_error) => {
                    warn!(
                        name,
                        attempt,
                        code = %transport_error.code,
                        "Call attempt failed: {}",
                        transport_error.message
                    );
                    if let Some(on_error) = &options.on_error {
                        on_error(attempt, &transport_error);
                    }
                    if attempt >= total_attempts || !transport_error.is_retryable() {
                        break Err(transport_error);
                    }
                    let delay =
                        backoff_delay(self.config.backoff_base, self.config.backoff_cap, attempt);
                    debug!(
                        name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        let duration = started.elapsed();
        let retries_used = attempt - 1;

        match outcome {
            Ok(data) => {
                if !options.cache_ttl.is_zero() {
                    self.store_response(key, &data);
                }
                let record_count = data.as_array().map(|records| records.len() as u64);
                self.bus.emit(
                    DATA_LOADED,
                    data_loaded_payload(name, record_count, duration),
                );
                self.record_outcome(true, retries_used, duration);
                debug!(
                    name,
                    duration_ms = duration.as_millis() as u64,
                    retries = retries_used,
                    "Call succeeded"
                );
                CallResponse::success(data, duration, retries_used)
            }
            Err(transport_error) => {
                self.bus.emit(
                    SYSTEM_ERROR,
                    error_payload(
                        &transport_error.to_string(),
                        &format!("rpc:{}", name),
                        ErrorSeverity::High,
                    ),
                );
                self.record_outcome(false, retries_used, duration);
                error!(
                    name,
                    code = %transport_error.code,
                    "Call failed after {} attempt(s): {}",
                    attempt,
                    transport_error.message
                );
                CallResponse::failure(&transport_error, duration, retries_used)
            }
        }
    }

    /// Executes one queued request on a window slot the drain already
    /// acquired.
    async fn execute_queued(&self, request: QueuedRequest) {
        debug!(
            name = %request.name,
            waited_ms = request.enqueued_at.elapsed().as_millis() as u64,
            "Draining queued request"
        );
        let key = request_key(&request.name, &request.args);
        let response = self
            .execute_with_retry(&key, &request.name, &request.args, &request.options)
            .await;
        // A caller that gave up still consumed its window slot.
        let _ = request.reply.send(response);
    }

    /// Fails every parked request with [`ErrorCode::Unavailable`].
    /// Returns how many were rejected.
    fn reject_queued(&self, reason: &str) -> usize {
        let mut rejected = 0usize;
        while let Some(request) = self.queue.pop() {
            let _ = request.reply.send(CallResponse::failure(
                &TransportError::unavailable(reason),
                Duration::ZERO,
                0,
            ));
            rejected += 1;
        }
        rejected
    }

    fn record_outcome(&self, success: bool, retries_used: u32, duration: Duration) {
        let mut stats = self.stats_mut();
        if success {
            stats.successful_calls += 1;
        } else {
            stats.failed_calls += 1;
        }
        if retries_used > 0 {
            stats.retried_calls += 1;
        }
        let executed = stats.successful_calls + stats.failed_calls;
        let millis = duration.as_secs_f64() * 1000.0;
        stats.average_response_time += (millis - stats.average_response_time) / executed as f64;
    }

    fn stats_mut(&self) -> MutexGuard<'_, ClientStats> {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Single consumer for the overflow queue. Parks on the queue's notify
/// when idle; a push or a shutdown wake resumes it. On shutdown it
/// fails whatever is left so no caller waits forever.
///
/// Capacity is acquired before a request is taken, so an arrival during
/// the window wait still competes on priority for the next slot.
async fn drain_loop(inner: Arc<ClientInner>) {
    debug!("Queue drain task started");
    loop {
        if !inner.running.load(Ordering::SeqCst) {
            break;
        }
        if inner.queue.is_empty() {
            inner.queue.notified().await;
            continue;
        }
        if !inner.limiter.try_acquire() {
            let reset_at = inner.limiter.window_reset_at();
            tokio::select! {
                _ = tokio::time::sleep_until(reset_at) => {}
                _ = inner.queue.notified() => {}
            }
            continue;
        }
        if let Some(request) = inner.queue.pop() {
            inner.execute_queued(request).await;
        }
    }
    let rejected = inner.reject_queued("client shut down");
    if rejected > 0 {
        warn!(rejected, "Rejected queued requests on shutdown");
    }
    debug!("Queue drain task stopped");
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped.
fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << shift).min(cap)
}
