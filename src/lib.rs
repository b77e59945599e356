//! Durable Telemetry Exporter Library
//!
//! This library batches serialized telemetry items, POSTs them to an ingestion
//! endpoint, and keeps batches that failed with a retryable error in a bounded
//! on-disk spool until a later send can deliver them.

pub mod buffer;
pub mod config;
pub mod errors;
pub mod exporter;
pub mod listener;
pub mod redirect;
pub mod spool;
pub mod telemetry;
pub mod transport;

pub use buffer::ItemBuffer;
pub use config::Config;
pub use errors::{ExporterError, Result};
pub use exporter::{DropReason, FlushResult, SendResult, SweepReport, TelemetryItemExporter};
pub use listener::{
    DeliveryStats, FailureDecision, ListenerChain, LocalStorageListener, NoopListener,
    PipelineListener, StatsListener,
};
pub use redirect::{MAX_REDIRECTS, RedirectPolicy};
pub use spool::{ClaimedEntry, LocalSpool, SpoolEntry, SpoolStatsSnapshot};
pub use telemetry::{Batch, BatchLimits, EnvelopeKind, TelemetryItem};
pub use transport::{HttpResponse, HttpSender, OutboundRequest, ReqwestSender, TransportError};
