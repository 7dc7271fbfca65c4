//! Webhook ingestion pipeline.
//!
//! ```text
//! submit ──► dedup ──► intake (bounded) ──► relay ──► processing ──► workers ──► handler
//!              │            │ timeout                                   │
//!              ▼            ▼                                           ▼
//!          duplicates    failure log ◄───────────── errors / panics ────┘
//! ```
//!
//! `submit` never runs handler code. Backpressure is applied only at the
//! intake queue: when it stays full for the submit timeout the payload is
//! rejected and recorded as a failure. Each payload is processed once with no
//! retry.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};
use crate::dedup::{DeliveryFilter, DeliveryFilterStats};
use crate::failure_log::{FailureContext, FailureLog, FailureRecord};

// =============================================================================
// Configuration & handler contract
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub intake_capacity: usize,
    pub workers: usize,
    pub submit_timeout: Duration,
    pub failure_log_capacity: usize,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 10_000,
            workers: 5,
            submit_timeout: Duration::from_secs(1),
            failure_log_capacity: 100,
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(3_600),
        }
    }
}

/// Processes one item of a webhook payload.
///
/// Errors and panics are caught by the worker and counted against the whole
/// payload.
pub trait TransactionHandler: Send + Sync + 'static {
    fn process(&self, item: Value) -> impl Future<Output = Result<()>> + Send;
}

/// Delivery id of an item: `signature`, else `transaction.signatures[0]`.
#[must_use]
pub fn delivery_id(item: &Value) -> Option<String> {
    item.get("signature")
        .and_then(Value::as_str)
        .or_else(|| {
            item.pointer("/transaction/signatures/0")
                .and_then(Value::as_str)
        })
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    Queued,
    /// Every item was seen recently. Counts as accepted.
    Duplicate,
    QueueFull,
}

impl SubmitOutcome {
    #[must_use]
    pub fn is_accepted(self) -> bool {
        !matches!(self, Self::QueueFull)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub running: bool,
    pub received: u64,
    pub processed: u64,
    pub failed: u64,
    pub duplicates: u64,
    pub intake_depth: usize,
    pub processing_depth: usize,
    /// Admitted payloads not yet marked done.
    pub pending: usize,
    pub recent_failures: Vec<FailureRecord>,
    pub dedup: DeliveryFilterStats,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    duplicates: AtomicU64,
}

// =============================================================================
// Pipeline
// =============================================================================

struct Shared<H> {
    config: PipelineConfig,
    handler: H,
    intake_tx: mpsc::Sender<Value>,
    intake_rx: AsyncMutex<mpsc::Receiver<Value>>,
    work_tx: mpsc::UnboundedSender<Value>,
    work_rx: AsyncMutex<mpsc::UnboundedReceiver<Value>>,
    filter: Mutex<DeliveryFilter>,
    failures: Mutex<FailureLog>,
    counters: Counters,
    running: AtomicBool,
    processing_depth: AtomicUsize,
    pending: AtomicUsize,
    drained: Notify,
}

pub struct Pipeline<H> {
    shared: Arc<Shared<H>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<H: TransactionHandler> Pipeline<H> {
    #[must_use]
    pub fn new(config: PipelineConfig, handler: H) -> Self {
        let (intake_tx, intake_rx) = mpsc::channel(config.intake_capacity.max(1));
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            filter: Mutex::new(DeliveryFilter::new(config.dedup_capacity, config.dedup_ttl)),
            failures: Mutex::new(FailureLog::new(config.failure_log_capacity)),
            config,
            handler,
            intake_tx,
            intake_rx: AsyncMutex::new(intake_rx),
            work_tx,
            work_rx: AsyncMutex::new(work_rx),
            counters: Counters::default(),
            running: AtomicBool::new(false),
            processing_depth: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
        };
        Self {
            shared: Arc::new(shared),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Spawn the relay and workers. Must be called inside a tokio runtime.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared
            .filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let workers = self.shared.config.workers.max(1);
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(tokio::spawn(relay_loop(Arc::clone(&self.shared))));
        for worker in 0..workers {
            tasks.push(tokio::spawn(worker_loop(worker, Arc::clone(&self.shared))));
        }
        info!(workers, intake_capacity = self.shared.config.intake_capacity, "pipeline started");
    }

    /// Drain admitted payloads, then tear down the relay and workers.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.wait_drained().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in &tasks {
            task.abort();
        }
        for result in join_all(tasks).await {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    error!(error = %err, "pipeline task failed");
                }
            }
        }
        info!("pipeline stopped");
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Admit a webhook payload (one item or an array of items).
    pub async fn submit(&self, payload: Value) -> SubmitOutcome {
        let shared = &self.shared;
        shared.counters.received.fetch_add(1, Ordering::Relaxed);

        let Some((payload, ids)) = shared.strip_duplicates(payload) else {
            shared.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!("dropped duplicate delivery");
            return SubmitOutcome::Duplicate;
        };

        shared.pending.fetch_add(1, Ordering::AcqRel);
        match shared
            .intake_tx
            .send_timeout(payload, shared.config.submit_timeout)
            .await
        {
            Ok(()) => {
                let mut filter = shared.filter.lock().unwrap_or_else(PoisonError::into_inner);
                for id in ids {
                    filter.add(id);
                }
                SubmitOutcome::Queued
            }
            Err(_) => {
                shared.finish_one();
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                let intake_depth = shared.intake_depth();
                warn!(queue_depth = intake_depth, "intake queue full, payload rejected");
                shared
                    .failures
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record("queue full", FailureContext::QueueFull { intake_depth });
                SubmitOutcome::QueueFull
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        let shared = &self.shared;
        PipelineStatus {
            running: self.is_running(),
            received: shared.counters.received.load(Ordering::Relaxed),
            processed: shared.counters.processed.load(Ordering::Relaxed),
            failed: shared.counters.failed.load(Ordering::Relaxed),
            duplicates: shared.counters.duplicates.load(Ordering::Relaxed),
            intake_depth: shared.intake_depth(),
            processing_depth: shared.processing_depth.load(Ordering::Relaxed),
            pending: shared.pending.load(Ordering::Acquire),
            recent_failures: shared
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recent(),
            dedup: shared
                .filter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .stats(),
        }
    }
}

impl<H> Drop for Pipeline<H> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

// =============================================================================
// Relay & workers
// =============================================================================

impl<H: TransactionHandler> Shared<H> {
    fn intake_depth(&self) -> usize {
        self.intake_tx.max_capacity() - self.intake_tx.capacity()
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Drop items whose delivery id was seen recently. `None` when nothing is
    /// left to enqueue.
    fn strip_duplicates(&self, payload: Value) -> Option<(Value, Vec<String>)> {
        let mut filter = self.filter.lock().unwrap_or_else(PoisonError::into_inner);
        match payload {
            Value::Array(items) => {
                let total = items.len();
                let mut ids: Vec<String> = Vec::new();
                let mut kept = Vec::with_capacity(total);
                for item in items {
                    match delivery_id(&item) {
                        Some(id) if filter.exists(&id) || ids.contains(&id) => {}
                        Some(id) => {
                            ids.push(id);
                            kept.push(item);
                        }
                        None => kept.push(item),
                    }
                }
                if total > 0 && kept.is_empty() {
                    return None;
                }
                Some((Value::Array(kept), ids))
            }
            item => match delivery_id(&item) {
                Some(id) if filter.exists(&id) => None,
                Some(id) => Some((item, vec![id])),
                None => Some((item, Vec::new())),
            },
        }
    }

    fn record_failure(&self, reason: String, context: FailureContext) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(reason, context);
    }

    async fn process(&self, worker: usize, payload: Value) {
        let items = match payload {
            Value::Array(items) => items,
            item @ Value::Object(_) => vec![item],
            other => {
                let reason = format!("payload must be an object or array, got {}", json_kind(&other));
                warn!(worker, %reason, "rejected payload");
                self.record_failure(reason, FailureContext::Handler { worker });
                return;
            }
        };

        let results = join_all(
            items
                .into_iter()
                .map(|item| AssertUnwindSafe(self.handler.process(item)).catch_unwind()),
        )
        .await;

        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(worker, error = %err, "handler failed");
                    self.record_failure(err.to_string(), FailureContext::Handler { worker });
                    return;
                }
                Err(panic) => {
                    let err = Error::Panicked(panic_message(&*panic));
                    error!(worker, error = %err, "handler panicked");
                    self.record_failure(err.to_string(), FailureContext::Panicked { worker });
                    return;
                }
            }
        }
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }
}

async fn relay_loop<H: TransactionHandler>(shared: Arc<Shared<H>>) {
    let mut intake = shared.intake_rx.lock().await;
    while let Some(payload) = intake.recv().await {
        shared.processing_depth.fetch_add(1, Ordering::Relaxed);
        if shared.work_tx.send(payload).is_err() {
            break;
        }
    }
}

async fn worker_loop<H: TransactionHandler>(worker: usize, shared: Arc<Shared<H>>) {
    loop {
        let next = shared.work_rx.lock().await.recv().await;
        let Some(payload) = next else {
            break;
        };
        shared.processing_depth.fetch_sub(1, Ordering::Relaxed);
        shared.process(worker, payload).await;
        shared.finish_one();
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}
