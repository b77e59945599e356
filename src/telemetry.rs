//! Telemetry items and the batches the pipeline moves around

use crate::errors::{ExporterError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Trace,
    Log,
    Metric,
    Event,
    Request,
    Dependency,
    Exception,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::Trace => write!(f, "Trace"),
            EnvelopeKind::Log => write!(f, "Log"),
            EnvelopeKind::Metric => write!(f, "Metric"),
            EnvelopeKind::Event => write!(f, "Event"),
            EnvelopeKind::Request => write!(f, "Request"),
            EnvelopeKind::Dependency => write!(f, "Dependency"),
            EnvelopeKind::Exception => write!(f, "Exception"),
        }
    }
}

impl From<&str> for EnvelopeKind {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "TRACE" | "SPAN" => EnvelopeKind::Trace,
            "METRIC" | "METRICS" => EnvelopeKind::Metric,
            "EVENT" => EnvelopeKind::Event,
            "REQUEST" => EnvelopeKind::Request,
            "DEPENDENCY" | "REMOTEDEPENDENCY" => EnvelopeKind::Dependency,
            "EXCEPTION" => EnvelopeKind::Exception,
            _ => EnvelopeKind::Log, // Default fallback
        }
    }
}

/// One serialized telemetry record.
///
/// The payload is an opaque, already-serialized envelope line. Items are
/// newline-framed inside a [`Batch`], so a payload may not contain `\n`.
#[derive(Clone, Debug, PartialEq)]
pub struct TelemetryItem {
    timestamp: DateTime<Utc>,
    kind: EnvelopeKind,
    routing_key: String,
    tags: BTreeMap<String, String>,
    payload: Vec<u8>,
}

/// Envelope shape produced by [`TelemetryItem::from_json`]
#[derive(Serialize)]
struct JsonEnvelope<'a, T: Serialize> {
    time: DateTime<Utc>,
    name: EnvelopeKind,
    #[serde(rename = "iKey")]
    routing_key: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    tags: &'a BTreeMap<String, String>,
    data: &'a T,
}

impl TelemetryItem {
    pub fn new(kind: EnvelopeKind, routing_key: impl Into<String>, payload: Vec<u8>) -> Result<Self> {
        if payload.is_empty() {
            return Err(ExporterError::InvalidBatch("item payload is empty".to_string()));
        }

        if payload.contains(&b'\n') {
            return Err(ExporterError::InvalidBatch(
                "item payload contains a newline".to_string(),
            ));
        }

        Ok(Self {
            timestamp: Utc::now(),
            kind,
            routing_key: routing_key.into(),
            tags: BTreeMap::new(),
            payload,
        })
    }

    /// Build an item whose payload is a compact JSON envelope around `data`
    pub fn from_json<T: Serialize>(
        kind: EnvelopeKind,
        routing_key: impl Into<String>,
        data: &T,
    ) -> Result<Self> {
        Self::from_json_with_tags(kind, routing_key, BTreeMap::new(), data)
    }

    pub fn from_json_with_tags<T: Serialize>(
        kind: EnvelopeKind,
        routing_key: impl Into<String>,
        tags: BTreeMap<String, String>,
        data: &T,
    ) -> Result<Self> {
        Self::from_json_at(kind, routing_key, Utc::now(), tags, data)
    }

    /// Like [`from_json_with_tags`](Self::from_json_with_tags) with an explicit
    /// event time. Tags and time are written into the envelope here, since the
    /// payload is fixed from construction on.
    pub fn from_json_at<T: Serialize>(
        kind: EnvelopeKind,
        routing_key: impl Into<String>,
        timestamp: DateTime<Utc>,
        tags: BTreeMap<String, String>,
        data: &T,
    ) -> Result<Self> {
        let routing_key = routing_key.into();
        let payload = serde_json::to_vec(&JsonEnvelope {
            time: timestamp,
            name: kind,
            routing_key: &routing_key,
            tags: &tags,
            data,
        })?;

        Ok(Self {
            timestamp,
            kind,
            routing_key,
            tags,
            payload,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Bytes this item adds to a batch, including its line separator
    pub(crate) fn framed_len(&self) -> usize {
        self.payload.len() + 1
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items: 512,
            max_bytes: 4 * 1024 * 1024,
        }
    }
}

/// A non-empty, size-bounded group of items submitted as one unit.
///
/// Once built the batch only exposes its serialized payload.
#[derive(Clone, Debug)]
pub struct Batch {
    id: Uuid,
    item_count: usize,
    payload: Vec<u8>,
}

impl Batch {
    pub fn new(items: Vec<TelemetryItem>) -> Result<Self> {
        Self::with_limits(items, BatchLimits::default())
    }

    pub fn with_limits(items: Vec<TelemetryItem>, limits: BatchLimits) -> Result<Self> {
        if items.is_empty() {
            return Err(ExporterError::InvalidBatch("batch is empty".to_string()));
        }

        if items.len() > limits.max_items {
            return Err(ExporterError::InvalidBatch(format!(
                "batch has {} items, limit is {}",
                items.len(),
                limits.max_items
            )));
        }

        // Trailing separator is not sent
        let byte_len: usize = items.iter().map(TelemetryItem::framed_len).sum::<usize>() - 1;
        if byte_len > limits.max_bytes {
            return Err(ExporterError::InvalidBatch(format!(
                "batch is {} bytes, limit is {}",
                byte_len, limits.max_bytes
            )));
        }

        let mut payload = Vec::with_capacity(byte_len);
        for (index, item) in items.iter().enumerate() {
            if index > 0 {
                payload.push(b'\n');
            }
            payload.extend_from_slice(item.payload());
        }

        Ok(Self {
            id: Uuid::new_v4(),
            item_count: items.len(),
            payload,
        })
    }

    /// Rebuild a batch from bytes read back out of the spool
    pub(crate) fn from_payload(payload: Vec<u8>) -> Result<Self> {
        if payload.is_empty() {
            return Err(ExporterError::InvalidBatch("spooled payload is empty".to_string()));
        }

        let item_count = payload.iter().filter(|b| **b == b'\n').count() + 1;

        Ok(Self {
            id: Uuid::new_v4(),
            item_count,
            payload,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn item_count(&self) -> usize {
        self.item_count
    }

    pub fn byte_len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}
