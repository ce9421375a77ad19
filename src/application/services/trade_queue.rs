//! Trade Execution Queue
//!
//! Single-consumer FIFO in front of the exchange. Producers (HTTP handlers,
//! bot loops) only ever enqueue; one worker task pops requests, applies the
//! sliding-window rate limit, runs the optional risk check and calls the
//! executor. Serializing every executor call through that one worker is what
//! keeps concurrent order placement from racing on the shared account.
//!
//! Lifecycle:
//! - `Pending -> Processing -> {Executed | Failed | RiskRejected}`
//! - `Pending -> RateLimited -> Pending` when the internal limiter says no
//! - `Processing -> Pending` when the exchange reports a rate limit and
//!   retries remain, or when the executor defers the request
//! - `Pending -> Canceled` through `cancel_trade`
//!
//! Re-queued requests go to the back, so ordering is approximately FIFO.
//! There is no timeout on a single executor call: a hung executor stalls the
//! queue.

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::domain::entities::trade_request::{
    is_rate_limit_message, ExecutionOutcome, OrderType, TradeId, TradeRequest, TradeRequestData,
    TradeStatus,
};
use crate::domain::errors::{ExecutionError, ValidationError};
use crate::domain::repositories::trade_services::{RiskChecker, TradeExecutor, TradeLogSink};
use crate::domain::services::duplicate_guard::DuplicateGuard;
use crate::domain::services::rate_limiter::RateLimiter;

const RECENT_TRADES_IN_STATUS: usize = 10;

/// Outcome of `add_trade_safe`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafeAddResult {
    pub success: bool,
    pub trade_id: Option<TradeId>,
    pub duplicate_detected: bool,
    pub concurrent_detected: bool,
    /// Refused by the bot synchronizer as a directional conflict
    pub sync_conflict: bool,
    /// Id of the in-flight request that matched, if any
    pub existing_trade_id: Option<TradeId>,
    pub error: Option<String>,
}

impl SafeAddResult {
    pub(crate) fn accepted(trade_id: TradeId) -> Self {
        Self {
            success: true,
            trade_id: Some(trade_id),
            ..Default::default()
        }
    }

    pub(crate) fn invalid(error: ValidationError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Outcome of `add_trade_with_batching`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchAddResult {
    pub success: bool,
    pub trade_id: Option<TradeId>,
    pub batched: bool,
    pub combined_with: Option<TradeId>,
    pub sync_conflict: bool,
    pub error: Option<String>,
}

/// Outcome of `add_trade_idempotent`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdempotentAddResult {
    pub success: bool,
    pub trade_id: Option<TradeId>,
    pub idempotent_match: bool,
    pub status: Option<TradeStatus>,
    pub sync_conflict: bool,
    pub error: Option<String>,
}

impl IdempotentAddResult {
    pub(crate) fn replay(trade_id: TradeId, status: TradeStatus) -> Self {
        debug!(trade_id = %trade_id, "Idempotent replay, status {}", status);
        Self {
            success: true,
            trade_id: Some(trade_id),
            idempotent_match: true,
            status: Some(status),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub is_processing: bool,
    pub is_running: bool,
    pub active_trades: usize,
    /// Newest first
    pub recent_trades: Vec<TradeRequest>,
    pub history_size: usize,
    /// Executions admitted inside the current rate window
    pub window_load: usize,
    pub window_capacity: usize,
}

/// Running counters since the queue was built
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub executed: u64,
    pub failed: u64,
    pub risk_rejected: u64,
    pub canceled: u64,
    pub retried: u64,
    pub rate_limited: u64,
    pub deferred: u64,
}

enum LogEvent {
    Created(TradeRequest),
    Execution(TradeRequest, ExecutionOutcome),
    Error(TradeRequest, String),
    Status(TradeRequest, TradeStatus),
}

struct LogDrain {
    sink: Arc<dyn TradeLogSink>,
    rx: mpsc::UnboundedReceiver<LogEvent>,
}

impl LogDrain {
    /// Deliver events one at a time, in send order, until the queue is dropped
    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            let result = match &event {
                LogEvent::Created(request) => self.sink.order_created(request).await,
                LogEvent::Execution(request, outcome) => {
                    self.sink.execution(request, outcome).await
                }
                LogEvent::Error(request, message) => self.sink.error(request, message).await,
                LogEvent::Status(request, previous) => {
                    self.sink.status_update(request, *previous).await
                }
            };
            if let Err(e) = result {
                warn!("Trade log sink failed: {}", e);
            }
        }
        debug!("Trade log channel closed");
    }
}

struct QueueInner {
    config: QueueConfig,
    executor: Arc<dyn TradeExecutor>,
    risk_checker: Option<Arc<dyn RiskChecker>>,
    log_tx: Option<mpsc::UnboundedSender<LogEvent>>,
    // Taken by the first emit, which spawns the task that drains it
    log_drain: StdMutex<Option<LogDrain>>,
    guard: DuplicateGuard,
    // Lock order: active before history. fifo, limiter and stats are leaf locks.
    fifo: Mutex<VecDeque<TradeId>>,
    wake: Notify,
    active: RwLock<HashMap<TradeId, TradeRequest>>,
    history: RwLock<VecDeque<TradeRequest>>,
    limiter: Mutex<RateLimiter>,
    stats: Mutex<QueueStats>,
    running: AtomicBool,
    processing: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Wires collaborators into a queue. Everything the worker needs is supplied
/// here, so a built queue can always be started.
pub struct TradeExecutionQueueBuilder {
    config: QueueConfig,
    executor: Arc<dyn TradeExecutor>,
    risk_checker: Option<Arc<dyn RiskChecker>>,
    log_sink: Option<Arc<dyn TradeLogSink>>,
    guard: DuplicateGuard,
}

impl TradeExecutionQueueBuilder {
    pub fn risk_checker(mut self, checker: Arc<dyn RiskChecker>) -> Self {
        self.risk_checker = Some(checker);
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn TradeLogSink>) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn duplicate_guard(mut self, guard: DuplicateGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn build(self) -> TradeExecutionQueue {
        let limiter = RateLimiter::new(self.config.max_requests_per_window, self.config.rate_window);
        let history_capacity = self.config.history_capacity;
        let (log_tx, log_drain) = match self.log_sink {
            Some(sink) => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(LogDrain { sink, rx }))
            }
            None => (None, None),
        };
        TradeExecutionQueue {
            inner: Arc::new(QueueInner {
                config: self.config,
                executor: self.executor,
                risk_checker: self.risk_checker,
                log_tx,
                log_drain: StdMutex::new(log_drain),
                guard: self.guard,
                fifo: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                active: RwLock::new(HashMap::new()),
                history: RwLock::new(VecDeque::with_capacity(history_capacity)),
                limiter: Mutex::new(limiter),
                stats: Mutex::new(QueueStats::default()),
                running: AtomicBool::new(false),
                processing: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }
}

/// Cheap-to-clone handle; all clones drive the same queue and worker
#[derive(Clone)]
pub struct TradeExecutionQueue {
    inner: Arc<QueueInner>,
}

impl TradeExecutionQueue {
    pub fn builder(config: QueueConfig, executor: Arc<dyn TradeExecutor>) -> TradeExecutionQueueBuilder {
        TradeExecutionQueueBuilder {
            config,
            executor,
            risk_checker: None,
            log_sink: None,
            guard: DuplicateGuard::default(),
        }
    }

    pub fn new(config: QueueConfig, executor: Arc<dyn TradeExecutor>) -> Self {
        Self::builder(config, executor).build()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Worker lifecycle
    // ------------------------------------------------------------------

    /// Spawn the worker. A second call warns and does nothing.
    pub async fn start(&self) {
        let mut worker = self.inner.worker.lock().await;
        if worker.is_some() {
            warn!("Trade execution queue already running");
            return;
        }

        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        *worker = Some(tokio::spawn(async move {
            inner.run().await;
        }));
        info!("Trade execution queue started");
    }

    /// Signal the worker and wait up to `stop_timeout` for it to finish
    pub async fn stop(&self) {
        let handle = self.inner.worker.lock().await.take();
        let Some(mut handle) = handle else {
            debug!("Trade execution queue not running");
            return;
        };

        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wake.notify_waiters();

        match tokio::time::timeout(self.inner.config.stop_timeout, &mut handle).await {
            Ok(Ok(())) => info!("Trade execution queue stopped"),
            Ok(Err(e)) => error!("Trade execution worker ended abnormally: {}", e),
            Err(_) => {
                warn!(
                    "Trade execution worker did not stop within {:?}, aborting",
                    self.inner.config.stop_timeout
                );
                handle.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Enqueue without checks and make sure the worker is running
    pub async fn add_trade(&self, request: TradeRequest) -> TradeId {
        let trade_id = request.id.clone();
        info!(
            trade_id = %trade_id,
            "Queued {} {} {} ({})",
            request.side, request.quantity, request.symbol, request.order_type
        );
        self.inner.active.write().await.insert(trade_id.clone(), request.clone());
        // Created must be on the log channel before the worker can see the id
        self.inner.emit(LogEvent::Created(request));
        self.inner.enqueue(trade_id.clone()).await;
        self.inner.stats.lock().await.enqueued += 1;

        if !self.is_running() {
            self.start().await;
        }
        trade_id
    }

    /// Enqueue after duplicate and in-flight checks
    pub async fn add_trade_safe(&self, data: TradeRequestData) -> SafeAddResult {
        let request = match TradeRequest::new(data, self.inner.config.max_retries) {
            Ok(request) => request,
            Err(e) => return SafeAddResult::invalid(e),
        };

        if self.is_duplicate_trade(&request).await {
            warn!(
                "Duplicate trade rejected: {} {} {}",
                request.side, request.quantity, request.symbol
            );
            return SafeAddResult {
                duplicate_detected: true,
                error: Some(format!(
                    "Duplicate trade detected: identical {} {} {} order already seen",
                    request.side, request.quantity, request.symbol
                )),
                ..Default::default()
            };
        }

        if let Some(existing) = self.find_same_order_in_progress(&request).await {
            warn!(
                "Concurrent trade rejected: {} {} already in progress as {}",
                request.side, request.symbol, existing
            );
            return SafeAddResult {
                concurrent_detected: true,
                error: Some(format!(
                    "Same order already in progress for {} ({})",
                    request.symbol, existing
                )),
                existing_trade_id: Some(existing),
                ..Default::default()
            };
        }

        SafeAddResult::accepted(self.add_trade(request).await)
    }

    /// Fold compatible orders together instead of sending them separately.
    ///
    /// A MARKET order joins a PENDING request with the same symbol, side and
    /// type by adding its quantity. LIMIT-family orders, or MARKET orders
    /// whose match is already PROCESSING, are enqueued on their own with the
    /// batching recorded in metadata on both sides.
    pub async fn add_trade_with_batching(&self, data: TradeRequestData) -> BatchAddResult {
        match TradeRequest::new(data, self.inner.config.max_retries) {
            Ok(request) => self.add_request_with_batching(request).await,
            Err(e) => BatchAddResult {
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    /// [`Self::add_trade_with_batching`] for a request that is already validated
    pub async fn add_request_with_batching(&self, mut request: TradeRequest) -> BatchAddResult {
        let combined_with = {
            let mut active = self.inner.active.write().await;

            if request.order_type == OrderType::Market {
                let pending_target = active
                    .values_mut()
                    .filter(|other| {
                        other.status() == TradeStatus::Pending && same_batch_key(other, &request)
                    })
                    .min_by_key(|other| other.created_at);

                if let Some(target) = pending_target {
                    target.meta.original_quantity.get_or_insert(target.quantity);
                    target.quantity += request.quantity;
                    target.meta.batched_trades.push(request.id.clone());
                    info!(
                        trade_id = %target.id,
                        "Batched {} {} into pending order (now {})",
                        request.quantity, request.symbol, target.quantity
                    );
                    let target_id = target.id.clone();
                    return BatchAddResult {
                        success: true,
                        trade_id: Some(target_id.clone()),
                        batched: true,
                        combined_with: Some(target_id),
                        ..Default::default()
                    };
                }
            }

            let in_flight_target = active
                .values_mut()
                .filter(|other| other.status().is_in_flight() && same_batch_key(other, &request))
                .min_by_key(|other| other.created_at);

            match in_flight_target {
                Some(target) => {
                    target.meta.batched_trades.push(request.id.clone());
                    request.meta.combined_with = Some(target.id.clone());
                    Some(target.id.clone())
                }
                None => None,
            }
        };

        let trade_id = self.add_trade(request).await;
        BatchAddResult {
            success: true,
            trade_id: Some(trade_id),
            batched: combined_with.is_some(),
            combined_with,
            ..Default::default()
        }
    }

    /// Admit under a caller-chosen id; a repeat returns the existing status
    pub async fn add_trade_idempotent(&self, data: TradeRequestData) -> IdempotentAddResult {
        let Some(trade_id) = data.trade_id.clone() else {
            return IdempotentAddResult {
                error: Some(ValidationError::MissingTradeId.to_string()),
                ..Default::default()
            };
        };

        // A replay matches even if the resent body no longer validates
        if let Some(status) = self.get_trade_status(&trade_id).await {
            return IdempotentAddResult::replay(trade_id, status);
        }

        match TradeRequest::with_id(trade_id.clone(), data, self.inner.config.max_retries) {
            Ok(request) => self.add_request_idempotent(request).await,
            Err(e) => IdempotentAddResult {
                trade_id: Some(trade_id),
                error: Some(e.to_string()),
                ..Default::default()
            },
        }
    }

    /// [`Self::add_trade_idempotent`] for a request that is already validated,
    /// keyed by its own id
    pub async fn add_request_idempotent(&self, request: TradeRequest) -> IdempotentAddResult {
        let trade_id = request.id.clone();

        // Hold the active map across check and insert so two callers with
        // the same id cannot both get through
        {
            let mut active = self.inner.active.write().await;

            let existing_status = match active.get(&trade_id) {
                Some(existing) => Some(existing.status()),
                None => self
                    .inner
                    .history
                    .read()
                    .await
                    .iter()
                    .rev()
                    .find(|r| r.id == trade_id)
                    .map(|r| r.status()),
            };

            if let Some(status) = existing_status {
                return IdempotentAddResult::replay(trade_id, status);
            }
            active.insert(trade_id.clone(), request.clone());
        }

        self.inner.emit(LogEvent::Created(request));
        self.inner.enqueue(trade_id.clone()).await;
        self.inner.stats.lock().await.enqueued += 1;
        if !self.is_running() {
            self.start().await;
        }

        IdempotentAddResult {
            success: true,
            trade_id: Some(trade_id),
            status: Some(TradeStatus::Pending),
            ..Default::default()
        }
    }

    /// File a request that was refused before admission as CANCELED, so it
    /// stays visible to status polling
    pub async fn record_rejected(&self, mut request: TradeRequest, reason: &str) -> TradeId {
        let previous = request.status();
        if let Err(e) = request.fail_with(TradeStatus::Canceled, reason) {
            error!("Could not mark rejected trade: {}", e);
        }
        let trade_id = request.id.clone();
        warn!(trade_id = %trade_id, "Trade rejected before admission: {}", reason);

        self.inner.push_history(request.clone()).await;
        self.inner.stats.lock().await.canceled += 1;
        self.inner.emit(LogEvent::Status(request.clone(), previous));
        self.inner.emit(LogEvent::Error(request, reason.to_string()));
        trade_id
    }

    // ------------------------------------------------------------------
    // Duplicate checks
    // ------------------------------------------------------------------

    pub async fn is_duplicate_trade(&self, request: &TradeRequest) -> bool {
        let active = self.inner.active.read().await;
        let history = self.inner.history.read().await;
        self.inner
            .guard
            .is_duplicate(request, active.values(), history.iter())
    }

    pub async fn is_same_order_in_progress(&self, request: &TradeRequest) -> bool {
        self.find_same_order_in_progress(request).await.is_some()
    }

    /// Id of a PENDING/PROCESSING request matching `request`
    pub async fn find_same_order_in_progress(&self, request: &TradeRequest) -> Option<TradeId> {
        let active = self.inner.active.read().await;
        self.inner
            .guard
            .find_in_progress(request, active.values())
            .map(|r| r.id.clone())
    }

    // ------------------------------------------------------------------
    // Introspection and control
    // ------------------------------------------------------------------

    pub async fn get_trade_by_id(&self, trade_id: &str) -> Option<TradeRequest> {
        if let Some(request) = self.inner.active.read().await.get(trade_id) {
            return Some(request.clone());
        }
        self.inner
            .history
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.id == trade_id)
            .cloned()
    }

    pub async fn get_trade_status(&self, trade_id: &str) -> Option<TradeStatus> {
        self.get_trade_by_id(trade_id).await.map(|r| r.status())
    }

    /// Cancel a request that has not started executing
    pub async fn cancel_trade(&self, trade_id: &str) -> bool {
        let canceled = {
            let mut active = self.inner.active.write().await;
            let cancellable = active
                .get(trade_id)
                .map(|r| matches!(r.status(), TradeStatus::Pending | TradeStatus::RateLimited))
                .unwrap_or(false);
            if !cancellable {
                return false;
            }
            active.remove(trade_id)
        };

        let Some(mut request) = canceled else {
            return false;
        };

        let previous = request.status();
        if let Err(e) = request.fail_with(TradeStatus::Canceled, "Canceled by user") {
            error!("{}", e);
            return false;
        }

        self.inner.fifo.lock().await.retain(|id| id != trade_id);
        self.inner.push_history(request.clone()).await;
        self.inner.stats.lock().await.canceled += 1;
        info!(trade_id = %trade_id, "Trade canceled");
        self.inner.emit(LogEvent::Status(request, previous));
        true
    }

    pub async fn get_queue_status(&self) -> QueueStatus {
        let queue_size = self.inner.fifo.lock().await.len();
        let (window_load, window_capacity) = {
            let mut limiter = self.inner.limiter.lock().await;
            (limiter.current_load(), limiter.max_per_window())
        };
        let active_trades = self.inner.active.read().await.len();
        let history = self.inner.history.read().await;
        QueueStatus {
            queue_size,
            is_processing: self.inner.processing.load(Ordering::SeqCst),
            is_running: self.is_running(),
            active_trades,
            recent_trades: history
                .iter()
                .rev()
                .take(RECENT_TRADES_IN_STATUS)
                .cloned()
                .collect(),
            history_size: history.len(),
            window_load,
            window_capacity,
        }
    }

    /// Newest first
    pub async fn get_recent_trades(&self, limit: usize) -> Vec<TradeRequest> {
        self.inner
            .history
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        self.inner.stats.lock().await.clone()
    }
}

impl QueueInner {
    async fn enqueue(&self, trade_id: TradeId) {
        self.fifo.lock().await.push_back(trade_id);
        self.wake.notify_one();
    }

    async fn push_history(&self, request: TradeRequest) {
        let mut history = self.history.write().await;
        if history.len() >= self.config.history_capacity {
            history.pop_front();
        }
        history.push_back(request);
    }

    /// Fire-and-forget delivery to the log sink. Events share one channel,
    /// so the sink sees them in emit order.
    fn emit(&self, event: LogEvent) {
        let Some(tx) = &self.log_tx else {
            return;
        };

        let drain = match self.log_drain.lock() {
            Ok(mut drain) => drain.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(drain) = drain {
            tokio::spawn(drain.run());
        }

        if tx.send(event).is_err() {
            warn!("Trade log channel closed, event dropped");
        }
    }

    async fn run(self: Arc<Self>) {
        debug!("Trade execution worker running");
        while self.running.load(Ordering::SeqCst) {
            if let Some(trade_id) = self.next_trade().await {
                self.process(trade_id).await;
            }
        }
        debug!("Trade execution worker exiting");
    }

    /// Pop the next id, waiting at most one poll interval
    async fn next_trade(&self) -> Option<TradeId> {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(trade_id) = self.fifo.lock().await.pop_front() {
            return Some(trade_id);
        }

        let _ = tokio::time::timeout(self.config.poll_interval, notified).await;
        self.fifo.lock().await.pop_front()
    }

    async fn process(&self, trade_id: TradeId) {
        {
            let mut active = self.active.write().await;
            let Some(request) = active.get_mut(&trade_id) else {
                debug!(trade_id = %trade_id, "Skipping trade no longer active");
                return;
            };

            match request.status() {
                TradeStatus::Canceled => {
                    debug!(trade_id = %trade_id, "Skipping canceled trade");
                    return;
                }
                TradeStatus::RateLimited => {
                    if let Err(e) = request.transition_to(TradeStatus::Pending) {
                        error!("{}", e);
                        return;
                    }
                }
                TradeStatus::Pending => {}
                other => {
                    warn!(trade_id = %trade_id, "Dequeued trade in unexpected state {}", other);
                    return;
                }
            }
        }

        let wait = {
            let mut limiter = self.limiter.lock().await;
            if limiter.try_acquire() {
                None
            } else {
                Some(limiter.time_until_available())
            }
        };
        if let Some(wait) = wait {
            self.mark_rate_limited(&trade_id).await;
            // Sleep until a slot frees, capped by the configured backoff
            tokio::time::sleep(wait.min(self.config.rate_limited_backoff)).await;
            return;
        }

        self.processing.store(true, Ordering::SeqCst);
        self.execute(&trade_id).await;
        self.processing.store(false, Ordering::SeqCst);
    }

    async fn mark_rate_limited(&self, trade_id: &TradeId) {
        let snapshot = {
            let mut active = self.active.write().await;
            let Some(request) = active.get_mut(trade_id) else {
                return;
            };
            if let Err(e) = request.transition_to(TradeStatus::RateLimited) {
                error!("{}", e);
                return;
            }
            request.clone()
        };

        debug!(trade_id = %trade_id, "Rate limited, re-queued");
        self.enqueue(trade_id.clone()).await;
        self.stats.lock().await.rate_limited += 1;
        self.emit(LogEvent::Status(snapshot, TradeStatus::Pending));
    }

    async fn execute(&self, trade_id: &TradeId) {
        let (snapshot, previous) = {
            let mut active = self.active.write().await;
            let Some(request) = active.get_mut(trade_id) else {
                // canceled while we waited on the limiter
                return;
            };
            let previous = request.status();
            if let Err(e) = request.transition_to(TradeStatus::Processing) {
                error!("{}", e);
                return;
            }
            (request.clone(), previous)
        };
        self.emit(LogEvent::Status(snapshot.clone(), previous));

        if let Some(checker) = &self.risk_checker {
            match AssertUnwindSafe(checker.approve(&snapshot)).catch_unwind().await {
                Ok(true) => {}
                Ok(false) => {
                    self.finish(trade_id, TradeStatus::RiskRejected, "Rejected by risk check", None)
                        .await;
                    return;
                }
                Err(panic) => {
                    let message = format!("Risk check panicked: {}", panic_message(panic));
                    self.finish(trade_id, TradeStatus::Failed, &message, None).await;
                    return;
                }
            }
        }

        let result = match AssertUnwindSafe(self.executor.execute(&snapshot))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(ExecutionError::Panicked(panic_message(panic))),
        };

        let can_retry = snapshot.retries < snapshot.max_retries;

        match result {
            Ok(outcome) if outcome.success => {
                self.finish(trade_id, TradeStatus::Executed, "", Some(outcome)).await;
            }
            Ok(outcome) if outcome.is_rate_limited() && can_retry => {
                let reason = outcome.message.unwrap_or_default();
                self.requeue(trade_id, &reason, true).await;
            }
            Ok(outcome) => {
                let message = outcome
                    .message
                    .clone()
                    .unwrap_or_else(|| "Execution failed".to_string());
                self.finish(trade_id, TradeStatus::Failed, &message, Some(outcome)).await;
            }
            Err(ExecutionError::Deferred(reason)) => {
                self.requeue(trade_id, &reason, false).await;
            }
            Err(ExecutionError::Exchange(message)) if is_rate_limit_message(&message) && can_retry => {
                self.requeue(trade_id, &message, true).await;
            }
            Err(e) => {
                self.finish(trade_id, TradeStatus::Failed, &e.to_string(), None).await;
            }
        }
    }

    /// Processing -> Pending, back of the queue. `consume_retry` is false for
    /// deferrals, which are not failures.
    async fn requeue(&self, trade_id: &TradeId, reason: &str, consume_retry: bool) {
        let snapshot = {
            let mut active = self.active.write().await;
            let Some(request) = active.get_mut(trade_id) else {
                return;
            };
            if let Err(e) = request.transition_to(TradeStatus::Pending) {
                error!("{}", e);
                return;
            }
            if consume_retry {
                request.retries += 1;
                request.error_message = Some(reason.to_string());
            }
            request.clone()
        };

        if consume_retry {
            warn!(
                trade_id = %trade_id,
                "Exchange rate limit, retry {}/{}: {}",
                snapshot.retries, snapshot.max_retries, reason
            );
            self.stats.lock().await.retried += 1;
        } else {
            debug!(trade_id = %trade_id, "Execution deferred: {}", reason);
            self.stats.lock().await.deferred += 1;
        }

        self.enqueue(trade_id.clone()).await;
        self.emit(LogEvent::Status(snapshot, TradeStatus::Processing));
    }

    /// Terminal transition; the request leaves the active set for history
    async fn finish(
        &self,
        trade_id: &TradeId,
        status: TradeStatus,
        message: &str,
        outcome: Option<ExecutionOutcome>,
    ) {
        let Some(mut request) = self.active.write().await.remove(trade_id) else {
            return;
        };

        let previous = request.status();
        if let Err(e) = request.transition_to(status) {
            error!("{}", e);
        }
        if !message.is_empty() {
            request.error_message = Some(message.to_string());
        }
        request.result = outcome.clone();

        self.push_history(request.clone()).await;

        {
            let mut stats = self.stats.lock().await;
            match status {
                TradeStatus::Executed => stats.executed += 1,
                TradeStatus::RiskRejected => stats.risk_rejected += 1,
                TradeStatus::Canceled => stats.canceled += 1,
                _ => stats.failed += 1,
            }
        }

        match status {
            TradeStatus::Executed => {
                info!(
                    trade_id = %trade_id,
                    "Executed {} {} {}",
                    request.side, request.quantity, request.symbol
                );
                if let Some(outcome) = outcome {
                    self.emit(LogEvent::Execution(request.clone(), outcome));
                }
            }
            _ => {
                warn!(trade_id = %trade_id, "Trade {}: {}", status, message);
                self.emit(LogEvent::Error(request.clone(), message.to_string()));
            }
        }
        self.emit(LogEvent::Status(request, previous));
    }
}

fn same_batch_key(a: &TradeRequest, b: &TradeRequest) -> bool {
    a.symbol == b.symbol && a.side == b.side && a.order_type == b.order_type
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
