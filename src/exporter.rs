//! Telemetry item exporter: send, flush and shutdown over the durable pipeline

use crate::config::Config;
use crate::errors::{ExporterError, Result};
use crate::listener::{FailureDecision, ListenerChain, LocalStorageListener, NoopListener, PipelineListener};
use crate::redirect::RedirectPolicy;
use crate::spool::{ClaimedEntry, LocalSpool};
use crate::telemetry::Batch;
use crate::transport::{
    HttpSender, OutboundRequest, ReqwestSender, SendFailure, StatusClass, classify_status,
};
use rand::Rng;
use reqwest::Url;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DropReason {
    /// The endpoint rejected the batch and retrying will not help
    Permanent,
    /// Retryable failure, but no listener asked for the batch to be kept
    Retryable,
    /// Spooling was requested but no spool is configured
    SpoolDisabled,
    /// The batch could not fit in the spool even after eviction
    SpoolFull,
    /// Writing to the spool failed
    DiskFailure,
}

/// Terminal state of one `send`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SendResult {
    Delivered,
    Spooled,
    Dropped(DropReason),
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FlushResult {
    Completed,
    TimedOut,
}

/// What a spool sweep did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub resent: u64,
    pub returned: u64,
    pub discarded: u64,
}

impl SweepReport {
    pub fn attempted(&self) -> u64 {
        self.resent + self.returned + self.discarded
    }
}

/// Tracks operations in flight so `flush` can wait for everything that
/// started before it, without waiting on sends that start afterwards.
///
/// Operations get increasing sequence numbers. The watermark is the lowest
/// sequence number still running, or the next one to hand out when idle.
#[derive(Debug)]
struct InFlightTracker {
    state: Mutex<TrackerState>,
    watermark: watch::Sender<u64>,
}

#[derive(Debug, Default)]
struct TrackerState {
    next: u64,
    active: BTreeSet<u64>,
}

struct InFlightGuard {
    tracker: Arc<InFlightTracker>,
    seq: u64,
}

impl InFlightTracker {
    fn new() -> Self {
        let (watermark, _) = watch::channel(0);
        Self {
            state: Mutex::new(TrackerState::default()),
            watermark,
        }
    }

    fn begin(self: &Arc<Self>) -> InFlightGuard {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = state.next;
        state.next += 1;
        state.active.insert(seq);
        InFlightGuard {
            tracker: self.clone(),
            seq,
        }
    }

    fn finish(&self, seq: u64) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.active.remove(&seq);
        let low = state.active.first().copied().unwrap_or(state.next);
        self.watermark.send_replace(low);
    }

    async fn wait_for_earlier(&self, timeout: Option<Duration>) -> FlushResult {
        let target = self.state.lock().unwrap_or_else(PoisonError::into_inner).next;
        let mut watermark = self.watermark.subscribe();

        let drained = async move {
            // The sender lives as long as the tracker, so this only returns once reached
            let _ = watermark.wait_for(|low| *low >= target).await;
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, drained).await {
                Ok(()) => FlushResult::Completed,
                Err(_) => FlushResult::TimedOut,
            },
            None => {
                drained.await;
                FlushResult::Completed
            }
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.finish(self.seq);
    }
}

struct ExporterInner {
    endpoint: Url,
    sender: Arc<dyn HttpSender>,
    redirects: RedirectPolicy,
    listeners: ListenerChain,
    spool: Option<LocalSpool>,
    stopped: AtomicBool,
    tracker: Arc<InFlightTracker>,
    terminal: OnceCell<FlushResult>,
}

/// Entry point for producers. Clones share one pipeline.
#[derive(Clone)]
pub struct TelemetryItemExporter {
    inner: Arc<ExporterInner>,
}

impl TelemetryItemExporter {
    /// Assemble a pipeline from explicit collaborators
    pub fn new(
        endpoint: Url,
        sender: Arc<dyn HttpSender>,
        redirects: RedirectPolicy,
        spool: Option<LocalSpool>,
        listeners: ListenerChain,
    ) -> Self {
        Self {
            inner: Arc::new(ExporterInner {
                endpoint,
                sender,
                redirects,
                listeners,
                spool,
                stopped: AtomicBool::new(false),
                tracker: Arc::new(InFlightTracker::new()),
                terminal: OnceCell::new(),
            }),
        }
    }

    /// Build the default pipeline described by `config`.
    ///
    /// The spooling listener (or a no-op one when spooling is off) runs first,
    /// followed by `listeners`. With spooling on and a sweep interval set, a
    /// background sweeper runs until `shutdown`.
    pub async fn from_config(config: &Config, listeners: ListenerChain) -> Result<Self> {
        config.validate().map_err(ExporterError::Config)?;

        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| ExporterError::Config(format!("invalid endpoint: {}", e)))?;
        let sender = Arc::new(ReqwestSender::new(config.http_timeout)?);

        let (spool, base): (Option<LocalSpool>, Arc<dyn PipelineListener>) = if config.spool_enabled {
            let spool = LocalSpool::open(&config.spool_dir, config.max_spool_bytes).await?;
            (Some(spool.clone()), Arc::new(LocalStorageListener::new(spool)))
        } else {
            (None, Arc::new(NoopListener))
        };

        info!(
            "Exporting to {} (spooling {})",
            endpoint,
            if spool.is_some() { "enabled" } else { "disabled" }
        );

        let exporter = Self::new(
            endpoint,
            sender,
            RedirectPolicy::new(),
            spool,
            ListenerChain::new().with(base).append(listeners),
        );

        if let (Some(interval), Some(_)) = (config.sweep_interval, exporter.spool()) {
            info!("Sweeping the spool about every {:?}", interval);
            exporter.spawn_sweeper(interval);
        }

        Ok(exporter)
    }

    pub fn spool(&self) -> Option<&LocalSpool> {
        self.inner.spool.as_ref()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Deliver a batch, spooling or dropping it on failure.
    ///
    /// Never fails for expected delivery problems; the outcome is in the result.
    pub async fn send(&self, batch: Batch) -> SendResult {
        match self.admit(&batch) {
            Some(op) => self.run_admitted(batch, op).await,
            None => SendResult::Stopped,
        }
    }

    /// Hand a batch to the runtime and return immediately.
    ///
    /// The batch counts as in flight from this call on, so a later `flush`
    /// or `shutdown` waits for it.
    pub fn send_detached(&self, batch: Batch) -> JoinHandle<SendResult> {
        let admitted = self.admit(&batch);
        let exporter = self.clone();
        tokio::spawn(async move {
            match admitted {
                Some(op) => exporter.run_admitted(batch, op).await,
                None => SendResult::Stopped,
            }
        })
    }

    /// Register a send with the tracker unless the exporter has stopped
    fn admit(&self, batch: &Batch) -> Option<InFlightGuard> {
        let op = self.inner.tracker.begin();

        if self.is_stopped() {
            debug!("Rejecting batch {} after shutdown", batch.id());
            return None;
        }

        Some(op)
    }

    async fn run_admitted(&self, batch: Batch, _op: InFlightGuard) -> SendResult {
        match self.inner.listeners.on_before_send(&batch).await {
            Some(claim) => {
                let (result, _) =
                    futures::join!(self.inner.deliver(batch), self.inner.redeliver(claim));
                result
            }
            None => self.inner.deliver(batch).await,
        }
    }

    /// Wait until every send started before this call has finished
    pub async fn flush(&self, timeout: Option<Duration>) -> FlushResult {
        self.inner.tracker.wait_for_earlier(timeout).await
    }

    /// Stop accepting sends and flush what is in flight.
    ///
    /// Only the first call does the work; every call returns its result.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> FlushResult {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            info!("Shutting down telemetry exporter");
        }

        *self
            .inner
            .terminal
            .get_or_init(|| async {
                let result = self.flush(timeout).await;
                info!("Telemetry exporter shutdown finished: {:?}", result);
                result
            })
            .await
    }

    /// Resend up to `max` spooled batches, oldest first.
    ///
    /// Stops early when the spool is empty or a resend fails in a way that
    /// keeps the batch spooled.
    pub async fn resend_spooled(&self, max: u64) -> SweepReport {
        let _op = self.inner.tracker.begin();
        let mut report = SweepReport::default();

        let Some(spool) = &self.inner.spool else {
            return report;
        };

        while report.attempted() < max && !self.is_stopped() {
            let claim = match spool.take_one().await {
                Ok(Some(claim)) => claim,
                Ok(None) => break,
                Err(e) => {
                    warn!("Could not read from spool: {}", e);
                    break;
                }
            };

            match self.inner.redeliver(claim).await {
                SendResult::Delivered => report.resent += 1,
                SendResult::Dropped(_) => report.discarded += 1,
                SendResult::Spooled | SendResult::Stopped => {
                    report.returned += 1;
                    break;
                }
            }
        }

        report
    }

    /// Periodically resend spooled batches until shutdown
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let exporter = self.clone();
        tokio::spawn(async move { exporter.sweep_loop(interval).await })
    }

    #[instrument(skip(self))]
    async fn sweep_loop(&self, interval: Duration) {
        loop {
            tokio::time::sleep(jittered(interval)).await;

            if self.is_stopped() {
                debug!("Spool sweeper exiting after shutdown");
                break;
            }

            let report = self.resend_spooled(u64::MAX).await;
            if report.attempted() > 0 {
                info!(
                    "Spool sweep resent {}, returned {}, discarded {}",
                    report.resent, report.returned, report.discarded
                );
            }
        }
    }
}

/// `interval` scaled by a random factor in [0.8, 1.2)
fn jittered(interval: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.8..1.2);
    interval.mul_f64(factor)
}

impl ExporterInner {
    async fn attempt(&self, batch: &Batch) -> std::result::Result<(), SendFailure> {
        let request = OutboundRequest::new(self.endpoint.clone(), batch.payload().to_vec());

        match self.redirects.execute(self.sender.as_ref(), request).await {
            Ok(outcome) if classify_status(outcome.response.status) == StatusClass::Success => {
                debug!(
                    "Delivered batch {} ({} items, {} redirects)",
                    batch.id(),
                    batch.item_count(),
                    outcome.redirects
                );
                Ok(())
            }
            Ok(outcome) => Err(SendFailure::from_response(&outcome.response)),
            Err(e) => Err(SendFailure::from_transport(&e)),
        }
    }

    async fn deliver(&self, batch: Batch) -> SendResult {
        let failure = match self.attempt(&batch).await {
            Ok(()) => {
                self.listeners.on_success(&batch).await;
                return SendResult::Delivered;
            }
            Err(failure) => failure,
        };

        match self.listeners.on_failure(&batch, &failure).await {
            FailureDecision::Persist => self.persist(&batch).await,
            FailureDecision::Drop => {
                warn!("Dropping batch {}: {}", batch.id(), failure.message);
                SendResult::Dropped(if failure.is_retryable() {
                    DropReason::Retryable
                } else {
                    DropReason::Permanent
                })
            }
        }
    }

    async fn persist(&self, batch: &Batch) -> SendResult {
        let Some(spool) = &self.spool else {
            warn!("No spool configured, dropping batch {}", batch.id());
            return SendResult::Dropped(DropReason::SpoolDisabled);
        };

        match spool.persist(batch).await {
            Ok(entry) => {
                info!("Spooled batch {} as {} for a later retry", batch.id(), entry.id);
                SendResult::Spooled
            }
            Err(ExporterError::SpoolOverflow { .. }) => SendResult::Dropped(DropReason::SpoolFull),
            Err(e) => {
                error!("Failed to spool batch {}: {}", batch.id(), e);
                SendResult::Dropped(DropReason::DiskFailure)
            }
        }
    }

    /// Resend a claimed spool entry and resolve the claim from the outcome
    async fn redeliver(&self, claim: ClaimedEntry) -> SendResult {
        let failure = match self.attempt(claim.batch()).await {
            Ok(()) => {
                self.listeners.on_success(claim.batch()).await;
                if let Err(e) = claim.confirm().await {
                    error!("Resent batch delivered but its spool entry remains: {}", e);
                }
                return SendResult::Delivered;
            }
            Err(failure) => failure,
        };

        match self.listeners.on_failure(claim.batch(), &failure).await {
            FailureDecision::Persist => {
                debug!("Resend failed, keeping spooled batch: {}", failure.message);
                if let Err(e) = claim.release().await {
                    error!("Could not return batch to the spool: {}", e);
                }
                SendResult::Spooled
            }
            FailureDecision::Drop => {
                if let Err(e) = claim.discard().await {
                    error!("Could not delete discarded spool entry: {}", e);
                }
                SendResult::Dropped(if failure.is_retryable() {
                    DropReason::Retryable
                } else {
                    DropReason::Permanent
                })
            }
        }
    }
}
