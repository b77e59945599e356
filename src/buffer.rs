//! In-memory buffering of telemetry items ahead of batching

use crate::errors::Result;
use crate::telemetry::{Batch, BatchLimits, TelemetryItem};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Thread-safe buffer that cuts items into [`Batch`]es
#[derive(Debug)]
pub struct ItemBuffer {
    items: Arc<RwLock<VecDeque<TelemetryItem>>>,
    max_size: usize,
    limits: BatchLimits,
    dropped: AtomicU64,
}

impl ItemBuffer {
    /// Create a new item buffer
    pub fn new(max_size: usize, limits: BatchLimits) -> Self {
        Self {
            items: Arc::new(RwLock::new(VecDeque::new())),
            max_size,
            limits,
            dropped: AtomicU64::new(0),
        }
    }

    /// Add an item to the buffer, dropping the oldest one when full
    pub async fn add_item(&self, item: TelemetryItem) {
        let mut items = self.items.write().await;

        if items.len() >= self.max_size {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Item buffer overflow, dropping oldest entry");
        }

        items.push_back(item);
        debug!("Added item to buffer, current size: {}", items.len());
    }

    /// Drain the next batch that fits within the batch limits
    pub async fn drain_batch(&self) -> Result<Option<Batch>> {
        let taken = {
            let mut items = self.items.write().await;
            let mut taken = Vec::new();
            let mut bytes = 0usize;

            while let Some(next) = items.front() {
                let framed = next.framed_len();

                if framed - 1 > self.limits.max_bytes {
                    items.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Dropping item of {} bytes, larger than the batch limit of {}",
                        framed - 1,
                        self.limits.max_bytes
                    );
                    continue;
                }

                if taken.len() >= self.limits.max_items
                    || bytes + framed - 1 > self.limits.max_bytes
                {
                    break;
                }

                bytes += framed;
                if let Some(item) = items.pop_front() {
                    taken.push(item);
                }
            }

            taken
        };

        if taken.is_empty() {
            return Ok(None);
        }

        debug!("Drained batch of {} items", taken.len());
        Batch::with_limits(taken, self.limits).map(Some)
    }

    /// Current number of buffered items
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    /// Check if the buffer has a full batch or is getting close to capacity
    pub async fn should_flush(&self) -> bool {
        let count = self.len().await;
        count >= self.limits.max_items || count >= (self.max_size * 3 / 4)
    }

    /// Drain every buffered item into batches
    pub async fn flush_all(&self) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();

        while let Some(batch) = self.drain_batch().await? {
            batches.push(batch);
        }

        debug!("Flushed {} batches from buffer", batches.len());
        Ok(batches)
    }

    /// Items dropped because of overflow or oversize
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Get buffer utilization as a percentage
    pub async fn utilization(&self) -> f64 {
        (self.len().await as f64 / self.max_size as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::EnvelopeKind;

    fn item(payload: &str) -> TelemetryItem {
        TelemetryItem::new(EnvelopeKind::Log, "key", payload.as_bytes().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_basic_buffer_operations() {
        let buffer = ItemBuffer::new(100, BatchLimits::default());

        buffer.add_item(item("{\"msg\":\"hello\"}")).await;
        assert_eq!(buffer.len().await, 1);

        let batch = buffer.drain_batch().await.unwrap().unwrap();
        assert_eq!(batch.item_count(), 1);
        assert!(buffer.is_empty().await);
        assert!(buffer.drain_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_buffer_overflow() {
        let buffer = ItemBuffer::new(2, BatchLimits::default());

        for i in 0..5 {
            buffer.add_item(item(&format!("message {}", i))).await;
        }

        assert_eq!(buffer.len().await, 2);
        assert_eq!(buffer.dropped(), 3);
    }

    #[tokio::test]
    async fn test_drain_respects_item_limit() {
        let limits = BatchLimits {
            max_items: 3,
            max_bytes: 1024,
        };
        let buffer = ItemBuffer::new(100, limits);

        for i in 0..7 {
            buffer.add_item(item(&i.to_string())).await;
        }

        let batches = buffer.flush_all().await.unwrap();
        let counts: Vec<usize> = batches.iter().map(Batch::item_count).collect();
        assert_eq!(counts, vec![3, 3, 1]);
    }

    #[tokio::test]
    async fn test_drain_respects_byte_limit() {
        let limits = BatchLimits {
            max_items: 100,
            max_bytes: 9,
        };
        let buffer = ItemBuffer::new(100, limits);

        // "aaaa\nbbbb" is exactly 9 bytes, the third item starts a new batch
        buffer.add_item(item("aaaa")).await;
        buffer.add_item(item("bbbb")).await;
        buffer.add_item(item("cccc")).await;

        let first = buffer.drain_batch().await.unwrap().unwrap();
        assert_eq!(first.payload(), b"aaaa\nbbbb");
        let second = buffer.drain_batch().await.unwrap().unwrap();
        assert_eq!(second.payload(), b"cccc");
    }

    #[tokio::test]
    async fn test_oversize_item_is_dropped() {
        let limits = BatchLimits {
            max_items: 10,
            max_bytes: 4,
        };
        let buffer = ItemBuffer::new(10, limits);

        buffer.add_item(item("too-large")).await;
        buffer.add_item(item("ok")).await;

        let batch = buffer.drain_batch().await.unwrap().unwrap();
        assert_eq!(batch.payload(), b"ok");
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn test_should_flush_and_utilization() {
        tokio_test::block_on(async {
            let limits = BatchLimits {
                max_items: 100,
                max_bytes: 1024,
            };
            let buffer = ItemBuffer::new(4, limits);

            buffer.add_item(item("a")).await;
            buffer.add_item(item("b")).await;
            assert!(!buffer.should_flush().await);
            assert_eq!(buffer.utilization().await, 50.0);

            buffer.add_item(item("c")).await;
            assert!(buffer.should_flush().await);
        });
    }
}
