//! Observers invoked around every send attempt

use crate::spool::{ClaimedEntry, LocalSpool};
use crate::telemetry::Batch;
use crate::transport::SendFailure;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, warn};

/// What to do with a batch whose delivery failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureDecision {
    Persist,
    Drop,
}

#[async_trait]
pub trait PipelineListener: Send + Sync {
    /// Offer a previously spooled batch to send alongside `batch`
    async fn on_before_send(&self, _batch: &Batch) -> Option<ClaimedEntry> {
        None
    }

    async fn on_success(&self, _batch: &Batch) {}

    async fn on_failure(&self, _batch: &Batch, _failure: &SendFailure) -> FailureDecision {
        FailureDecision::Drop
    }
}

/// Listeners invoked in registration order
#[derive(Clone, Default)]
pub struct ListenerChain {
    listeners: Vec<Arc<dyn PipelineListener>>,
}

impl ListenerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, listener: Arc<dyn PipelineListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Append every listener of `other` after this chain's listeners
    pub fn append(mut self, other: ListenerChain) -> Self {
        self.listeners.extend(other.listeners);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// First listener to offer a spooled batch wins; at most one is claimed
    pub async fn on_before_send(&self, batch: &Batch) -> Option<ClaimedEntry> {
        for listener in &self.listeners {
            if let Some(claim) = listener.on_before_send(batch).await {
                return Some(claim);
            }
        }
        None
    }

    pub async fn on_success(&self, batch: &Batch) {
        for listener in &self.listeners {
            listener.on_success(batch).await;
        }
    }

    /// Every listener sees the failure; any `Persist` vote wins
    pub async fn on_failure(&self, batch: &Batch, failure: &SendFailure) -> FailureDecision {
        let mut decision = FailureDecision::Drop;
        for listener in &self.listeners {
            if listener.on_failure(batch, failure).await == FailureDecision::Persist {
                decision = FailureDecision::Persist;
            }
        }
        decision
    }
}

/// Base case used when durable spooling is off
#[derive(Debug, Default)]
pub struct NoopListener;

#[async_trait]
impl PipelineListener for NoopListener {}

/// Spools retryable failures and piggy-backs spooled batches on later sends.
///
/// Spooled batches are only offered while the last send went through, so a
/// backend that is down is not hit with resends too.
#[derive(Debug)]
pub struct LocalStorageListener {
    spool: LocalSpool,
    healthy: AtomicBool,
}

impl LocalStorageListener {
    pub fn new(spool: LocalSpool) -> Self {
        Self {
            spool,
            healthy: AtomicBool::new(true),
        }
    }

    pub fn spool(&self) -> &LocalSpool {
        &self.spool
    }
}

#[async_trait]
impl PipelineListener for LocalStorageListener {
    async fn on_before_send(&self, _batch: &Batch) -> Option<ClaimedEntry> {
        if !self.healthy.load(Ordering::Acquire) || !self.spool.may_have_entries() {
            return None;
        }

        match self.spool.take_one().await {
            Ok(claim) => claim,
            Err(e) => {
                warn!("Could not read from spool: {}", e);
                None
            }
        }
    }

    async fn on_success(&self, _batch: &Batch) {
        self.healthy.store(true, Ordering::Release);
    }

    async fn on_failure(&self, batch: &Batch, failure: &SendFailure) -> FailureDecision {
        if failure.is_retryable() {
            self.healthy.store(false, Ordering::Release);
            debug!("Batch {} failed with a retryable error: {}", batch.id(), failure.message);
            FailureDecision::Persist
        } else {
            FailureDecision::Drop
        }
    }
}

/// Plain delivery counters for a statistics collector
#[derive(Debug, Default)]
pub struct StatsListener {
    delivered: AtomicU64,
    delivered_items: AtomicU64,
    retryable_failures: AtomicU64,
    permanent_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub delivered_items: u64,
    pub retryable_failures: u64,
    pub permanent_failures: u64,
}

impl StatsListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            delivered_items: self.delivered_items.load(Ordering::Relaxed),
            retryable_failures: self.retryable_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl PipelineListener for StatsListener {
    async fn on_success(&self, batch: &Batch) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.delivered_items
            .fetch_add(batch.item_count() as u64, Ordering::Relaxed);
    }

    async fn on_failure(&self, _batch: &Batch, failure: &SendFailure) -> FailureDecision {
        if failure.is_retryable() {
            self.retryable_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.permanent_failures.fetch_add(1, Ordering::Relaxed);
        }
        FailureDecision::Drop
    }
}
