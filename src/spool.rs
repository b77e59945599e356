//! Disk-backed overflow store for batches that failed with a retryable error.
//!
//! Every entry is one immutable file in the spool directory:
//!
//! - `<id>.tmp` is a write in progress and is never read.
//! - `<id>.trn` is a committed entry waiting for resend.
//! - `<id>.inflight` is an entry claimed by a resend that has not finished yet.
//!
//! Entries become visible only through an atomic rename from `.tmp`, and a
//! claim is an atomic rename from `.trn`. Several spools, in this process or
//! another, can therefore share one directory without reading a partial
//! entry or resending the same entry twice at once. Ids start with the write
//! time in nanoseconds so a lexical sort is oldest-first.

use crate::errors::{ExporterError, Result};
use crate::telemetry::Batch;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const COMMITTED_EXT: &str = "trn";
const INFLIGHT_EXT: &str = "inflight";
const TEMP_EXT: &str = "tmp";

/// A batch persisted in the spool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpoolEntry {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    pub written_at: SystemTime,
}

/// Counters reported to whoever collects exporter statistics
#[derive(Debug, Default)]
struct SpoolStats {
    persisted: AtomicU64,
    resent: AtomicU64,
    evicted_entries: AtomicU64,
    evicted_bytes: AtomicU64,
    dropped_entries: AtomicU64,
    dropped_bytes: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SpoolStatsSnapshot {
    pub persisted: u64,
    pub resent: u64,
    pub evicted_entries: u64,
    pub evicted_bytes: u64,
    pub dropped_entries: u64,
    pub dropped_bytes: u64,
}

#[derive(Debug)]
struct SpoolInner {
    dir: PathBuf,
    capacity: u64,
    // Serializes this instance's capacity accounting
    write_lock: Mutex<()>,
    sequence: AtomicU64,
    // Cleared by a scan that found nothing, set whenever this instance commits an entry
    may_have_entries: AtomicBool,
    stats: SpoolStats,
}

/// Handle to a spool directory. Clones share state.
#[derive(Clone, Debug)]
pub struct LocalSpool {
    inner: Arc<SpoolInner>,
}

struct DirScan {
    committed: Vec<SpoolEntry>,
    resident_bytes: u64,
}

impl LocalSpool {
    /// Open (or create) a spool directory and recover leftovers from a crash
    pub async fn open(dir: impl Into<PathBuf>, capacity: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let spool = Self {
            inner: Arc::new(SpoolInner {
                dir,
                capacity,
                write_lock: Mutex::new(()),
                sequence: AtomicU64::new(0),
                may_have_entries: AtomicBool::new(true),
                stats: SpoolStats::default(),
            }),
        };

        spool.recover().await?;
        info!(
            "Opened spool at {} with capacity {} bytes",
            spool.inner.dir.display(),
            capacity
        );

        Ok(spool)
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity
    }

    /// Restore claims abandoned by a crash and delete half-written entries
    async fn recover(&self) -> Result<()> {
        let mut dir = fs::read_dir(&self.inner.dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            match extension(&path) {
                Some(INFLIGHT_EXT) => {
                    let committed = path.with_extension(COMMITTED_EXT);
                    match fs::rename(&path, &committed).await {
                        Ok(()) => info!("Recovered in-flight spool entry {}", committed.display()),
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                Some(TEMP_EXT) => match fs::remove_file(&path).await {
                    Ok(()) => debug!("Removed partial spool write {}", path.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                },
                _ => {}
            }
        }

        Ok(())
    }

    /// Write a batch to the spool, evicting the oldest entries to make room.
    ///
    /// Any failure counts the batch as dropped.
    pub async fn persist(&self, batch: &Batch) -> Result<SpoolEntry> {
        let size = batch.byte_len();

        let result = if size > self.inner.capacity {
            Err(ExporterError::SpoolOverflow {
                size,
                capacity: self.inner.capacity,
            })
        } else {
            let _guard = self.inner.write_lock.lock().await;
            self.persist_locked(batch, size).await
        };

        if let Err(e) = &result {
            self.record_drop(size);
            warn!("Dropping batch {} instead of spooling it: {}", batch.id(), e);
        }

        result
    }

    async fn persist_locked(&self, batch: &Batch, size: u64) -> Result<SpoolEntry> {
        self.make_room(size).await?;

        let (id, written_at) = self.next_id();
        let temp = self.inner.dir.join(format!("{}.{}", id, TEMP_EXT));
        let path = self.inner.dir.join(format!("{}.{}", id, COMMITTED_EXT));

        if let Err(e) = write_new_file(&temp, batch.payload()).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        self.inner.stats.persisted.fetch_add(1, Ordering::Relaxed);
        self.mark_non_empty();
        debug!("Spooled batch {} as {} ({} bytes)", batch.id(), id, size);

        Ok(SpoolEntry {
            id,
            path,
            size,
            written_at,
        })
    }

    /// Evict oldest committed entries until `incoming` more bytes fit
    async fn make_room(&self, incoming: u64) -> Result<()> {
        let scan = self.scan().await?;
        let mut resident = scan.resident_bytes;
        let mut oldest_first = scan.committed.into_iter();

        while resident + incoming > self.inner.capacity {
            let Some(entry) = oldest_first.next() else {
                return Err(ExporterError::SpoolOverflow {
                    size: incoming,
                    capacity: self.inner.capacity,
                });
            };

            if self.evict(&entry).await? {
                resident = resident.saturating_sub(entry.size);
            }
        }

        Ok(())
    }

    /// Evict oldest committed entries until resident bytes fit the capacity.
    ///
    /// Returns the number of entries evicted.
    pub async fn evict_if_over_capacity(&self) -> Result<u64> {
        let _guard = self.inner.write_lock.lock().await;
        let scan = self.scan().await?;
        let mut resident = scan.resident_bytes;
        let mut evicted = 0;

        for entry in scan.committed {
            if resident <= self.inner.capacity {
                break;
            }
            if self.evict(&entry).await? {
                resident = resident.saturating_sub(entry.size);
                evicted += 1;
            }
        }

        Ok(evicted)
    }

    /// Returns false when someone else already removed or claimed the entry
    async fn evict(&self, entry: &SpoolEntry) -> Result<bool> {
        match fs::remove_file(&entry.path).await {
            Ok(()) => {
                // An eviction is also a drop
                self.inner.stats.evicted_entries.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .stats
                    .evicted_bytes
                    .fetch_add(entry.size, Ordering::Relaxed);
                self.record_drop(entry.size);
                warn!(
                    "Evicted spooled batch {} ({} bytes) to stay within capacity",
                    entry.id, entry.size
                );
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim the oldest committed entry for resend.
    ///
    /// The entry leaves the committed listing but stays on disk until the
    /// claim is confirmed or discarded.
    pub async fn take_one(&self) -> Result<Option<ClaimedEntry>> {
        let _guard = self.inner.write_lock.lock().await;
        // Cleared before scanning so a concurrent release is not missed
        self.inner.may_have_entries.store(false, Ordering::SeqCst);
        let scan = self.scan().await?;

        for entry in scan.committed {
            let inflight = entry.path.with_extension(INFLIGHT_EXT);
            match fs::rename(&entry.path, &inflight).await {
                Ok(()) => {}
                // Claimed or evicted by another spool sharing the directory
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }

            let loaded = match fs::read(&inflight).await {
                Ok(bytes) => Batch::from_payload(bytes),
                Err(e) => Err(e.into()),
            };

            match loaded {
                Ok(batch) => {
                    self.mark_non_empty();
                    debug!("Claimed spooled batch {} for resend", entry.id);
                    return Ok(Some(ClaimedEntry {
                        spool: self.clone(),
                        entry: SpoolEntry {
                            path: inflight,
                            ..entry
                        },
                        batch,
                        resolved: false,
                    }));
                }
                Err(e) => {
                    error!("Discarding unreadable spool entry {}: {}", entry.id, e);
                    let _ = fs::remove_file(&inflight).await;
                    self.record_drop(entry.size);
                }
            }
        }

        Ok(None)
    }

    /// Cheap check used before [`take_one`](Self::take_one) on the send path.
    ///
    /// False only after this instance scanned an empty spool and committed
    /// nothing since. Entries written by another process sharing the
    /// directory show up on the next `take_one`.
    pub fn may_have_entries(&self) -> bool {
        self.inner.may_have_entries.load(Ordering::SeqCst)
    }

    fn mark_non_empty(&self) {
        self.inner.may_have_entries.store(true, Ordering::SeqCst);
    }

    /// Committed entries, oldest first
    pub async fn entries(&self) -> Result<Vec<SpoolEntry>> {
        Ok(self.scan().await?.committed)
    }

    /// Bytes currently on disk, including claimed and partially written entries
    pub async fn resident_bytes(&self) -> Result<u64> {
        Ok(self.scan().await?.resident_bytes)
    }

    pub fn stats(&self) -> SpoolStatsSnapshot {
        let stats = &self.inner.stats;
        SpoolStatsSnapshot {
            persisted: stats.persisted.load(Ordering::Relaxed),
            resent: stats.resent.load(Ordering::Relaxed),
            evicted_entries: stats.evicted_entries.load(Ordering::Relaxed),
            evicted_bytes: stats.evicted_bytes.load(Ordering::Relaxed),
            dropped_entries: stats.dropped_entries.load(Ordering::Relaxed),
            dropped_bytes: stats.dropped_bytes.load(Ordering::Relaxed),
        }
    }

    fn record_drop(&self, size: u64) {
        self.inner.stats.dropped_entries.fetch_add(1, Ordering::Relaxed);
        self.inner.stats.dropped_bytes.fetch_add(size, Ordering::Relaxed);
    }

    fn next_id(&self) -> (String, SystemTime) {
        let now = SystemTime::now();
        let nanos = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let id = format!("{:020}-{:010}-{}", nanos, sequence, Uuid::new_v4().simple());
        (id, now)
    }

    async fn scan(&self) -> Result<DirScan> {
        let mut dir = fs::read_dir(&self.inner.dir).await?;
        let mut committed = Vec::new();
        let mut resident_bytes = 0;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(ext) = extension(&path) else {
                continue;
            };
            if ext != COMMITTED_EXT && ext != INFLIGHT_EXT && ext != TEMP_EXT {
                continue;
            }

            // Entries can vanish between listing and stat under concurrent use
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            resident_bytes += metadata.len();

            if ext == COMMITTED_EXT {
                let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                    continue;
                };
                let written_at = written_at_from_id(&id)
                    .or_else(|| metadata.modified().ok())
                    .unwrap_or(UNIX_EPOCH);

                committed.push(SpoolEntry {
                    id,
                    path,
                    size: metadata.len(),
                    written_at,
                });
            }
        }

        committed.sort_by(|a, b| a.written_at.cmp(&b.written_at).then_with(|| a.id.cmp(&b.id)));

        Ok(DirScan {
            committed,
            resident_bytes,
        })
    }
}

/// A spooled batch claimed for resend.
///
/// Resolve it with [`confirm`](Self::confirm), [`release`](Self::release) or
/// [`discard`](Self::discard). Dropping it unresolved puts it back in the spool.
#[derive(Debug)]
pub struct ClaimedEntry {
    spool: LocalSpool,
    entry: SpoolEntry,
    batch: Batch,
    resolved: bool,
}

impl ClaimedEntry {
    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    pub fn entry(&self) -> &SpoolEntry {
        &self.entry
    }

    /// The resend was delivered, delete the entry
    pub async fn confirm(mut self) -> Result<()> {
        self.resolved = true;
        remove_if_present(&self.entry.path).await?;
        self.spool.inner.stats.resent.fetch_add(1, Ordering::Relaxed);
        debug!("Resent spooled batch {}", self.entry.id);
        Ok(())
    }

    /// The resend failed but may succeed later, put the entry back in place
    pub async fn release(mut self) -> Result<()> {
        self.resolved = true;
        fs::rename(&self.entry.path, self.entry.path.with_extension(COMMITTED_EXT)).await?;
        self.spool.mark_non_empty();
        debug!("Returned spooled batch {} to the spool", self.entry.id);
        Ok(())
    }

    /// The resend failed permanently, delete the entry and count it as dropped
    pub async fn discard(mut self) -> Result<()> {
        self.resolved = true;
        remove_if_present(&self.entry.path).await?;
        self.spool.record_drop(self.entry.size);
        warn!("Discarded spooled batch {} after a permanent failure", self.entry.id);
        Ok(())
    }
}

impl Drop for ClaimedEntry {
    fn drop(&mut self) {
        if !self.resolved {
            if std::fs::rename(&self.entry.path, self.entry.path.with_extension(COMMITTED_EXT)).is_ok() {
                self.spool.mark_non_empty();
            }
        }
    }
}

async fn write_new_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|ext| ext.to_str())
}

fn written_at_from_id(id: &str) -> Option<SystemTime> {
    let nanos: u64 = id.split('-').next()?.parse().ok()?;
    Some(UNIX_EPOCH + Duration::from_nanos(nanos))
}
