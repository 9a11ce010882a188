//! Two-tier cache of first-page previews.
//!
//! Memory: an LRU bounded by bitmap bytes. Disk: one PNG per `(document, width bucket)` named
//! by a hash of the key, bounded by entry count with the oldest generated files pruned first.

use std::collections::HashMap;
use std::io::Write as _;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::ImageEncoder as _;
use image::codecs::png::PngEncoder;
use lru::LruCache;
use parking_lot::Mutex;
use pdfshelf_core::{Bitmap, Config, DocumentId, THUMBNAIL_MAX_WIDTH, width_bucket};
use sha2::{Digest as _, Sha256};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::coordinator::rasterize_page;
use crate::handle::RenderHandle;
use crate::native::{DocumentResolver, RasterBackend, RenderMode};
use crate::{EngineError, Result};

const DEFAULT_MEMORY_BYTES: usize = 12 * 1024 * 1024;
const DEFAULT_PERMITS: usize = 2;
const DEFAULT_DISK_ENTRIES: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThumbnailKey {
    pub document: DocumentId,
    pub width_bucket: u32,
}

impl ThumbnailKey {
    pub fn new(document: DocumentId, target_width_px: i32) -> Self {
        Self {
            document,
            width_bucket: width_bucket(target_width_px),
        }
    }

    /// Stable across runs: first 8 bytes of `sha256("<document>@<bucket>")`, then the bucket.
    pub fn file_name(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.document.as_str().as_bytes());
        hasher.update(b"@");
        hasher.update(self.width_bucket.to_string().as_bytes());
        let digest = hasher.finalize();
        format!("{}_{}.png", hex::encode(&digest[..8]), self.width_bucket)
    }
}

/// Produces the preview bitmap for a document at an exact pixel width. Runs on the blocking
/// pool.
pub trait ThumbnailSource: Send + Sync {
    fn generate(&self, document: &DocumentId, width: u32) -> Result<Bitmap>;
}

/// Renders page 0 through a short-lived [`RenderHandle`].
pub struct RenderingSource {
    resolver: Arc<dyn DocumentResolver>,
    backend: Arc<dyn RasterBackend>,
    mode: RenderMode,
}

impl RenderingSource {
    pub fn new(resolver: Arc<dyn DocumentResolver>, backend: Arc<dyn RasterBackend>) -> Self {
        Self {
            resolver,
            backend,
            mode: RenderMode::Display,
        }
    }
}

impl ThumbnailSource for RenderingSource {
    fn generate(&self, document: &DocumentId, width: u32) -> Result<Bitmap> {
        let handle = RenderHandle::open(self.resolver.as_ref(), self.backend.as_ref(), document)?;
        let rendered = {
            let mut guard = handle.blocking_lock();
            match guard.as_mut().and_then(|doc| doc.renderer()) {
                Some(renderer) => rasterize_page(renderer, 0, width, self.mode),
                None => Err(EngineError::native("document could not be opened")),
            }
        };
        handle.close_blocking();
        rendered
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThumbnailStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub generated: u64,
    pub corrupt_removed: u64,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    generated: AtomicU64,
    corrupt_removed: AtomicU64,
}

struct MemoryTier {
    entries: LruCache<ThumbnailKey, Arc<Bitmap>>,
    bytes: usize,
    capacity: usize,
}

impl MemoryTier {
    fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            bytes: 0,
            capacity,
        }
    }

    fn get(&mut self, key: &ThumbnailKey) -> Option<Arc<Bitmap>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: ThumbnailKey, bitmap: Arc<Bitmap>) {
        self.bytes += bitmap.byte_len();
        if let Some(old) = self.entries.put(key, bitmap) {
            self.bytes -= old.byte_len();
        }
        while self.bytes > self.capacity {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.bytes -= evicted.byte_len(),
                None => break,
            }
        }
    }

    fn remove_document(&mut self, document: &DocumentId) {
        let keys: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, _)| &key.document == document)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(bitmap) = self.entries.pop(&key) {
                self.bytes -= bitmap.byte_len();
            }
        }
    }
}

enum DiskRead {
    Missing,
    Hit(Bitmap),
    Corrupt,
}

/// Shared by every shelf entry; construct once and inject.
pub struct ThumbnailCache {
    dir: PathBuf,
    source: Arc<dyn ThumbnailSource>,
    memory: Mutex<MemoryTier>,
    permits: Semaphore,
    in_flight: Mutex<HashMap<ThumbnailKey, Arc<tokio::sync::Mutex<()>>>>,
    disk_entries: NonZeroUsize,
    counters: Counters,
}

impl ThumbnailCache {
    pub fn new(dir: impl Into<PathBuf>, source: Arc<dyn ThumbnailSource>) -> Self {
        Self {
            dir: dir.into(),
            source,
            memory: Mutex::new(MemoryTier::new(DEFAULT_MEMORY_BYTES)),
            permits: Semaphore::new(DEFAULT_PERMITS),
            in_flight: Mutex::new(HashMap::new()),
            disk_entries: NonZeroUsize::new(DEFAULT_DISK_ENTRIES).unwrap_or(NonZeroUsize::MIN),
            counters: Counters::default(),
        }
    }

    pub fn from_config(
        dir: impl Into<PathBuf>,
        source: Arc<dyn ThumbnailSource>,
        config: &Config,
    ) -> Self {
        Self::new(dir, source)
            .with_memory_bytes(config.thumbnail_memory_bytes)
            .with_permits(config.thumbnail_permits)
            .with_disk_entries(config.thumbnail_disk_entries)
    }

    pub fn with_memory_bytes(mut self, bytes: usize) -> Self {
        self.memory = Mutex::new(MemoryTier::new(bytes));
        self
    }

    pub fn with_permits(mut self, permits: usize) -> Self {
        self.permits = Semaphore::new(permits.max(1));
        self
    }

    pub fn with_disk_entries(mut self, entries: usize) -> Self {
        self.disk_entries = NonZeroUsize::new(entries).unwrap_or(NonZeroUsize::MIN);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &ThumbnailKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn stats(&self) -> ThumbnailStats {
        ThumbnailStats {
            memory_hits: self.counters.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            generated: self.counters.generated.load(Ordering::Relaxed),
            corrupt_removed: self.counters.corrupt_removed.load(Ordering::Relaxed),
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.memory.lock().bytes
    }

    pub async fn get_thumbnail(
        &self,
        document: &DocumentId,
        target_width_px: i32,
    ) -> Option<Arc<Bitmap>> {
        let key = ThumbnailKey::new(document.clone(), target_width_px);
        if let Some(hit) = self.memory_hit(&key) {
            return Some(hit);
        }
        if let Some(hit) = self.disk_hit(&key).await {
            return Some(hit);
        }

        let gate = self.in_flight_gate(&key);
        let result = {
            let _same_key = gate.lock().await;
            self.generate_with_permit(&key).await
        };
        self.release_gate(&key, &gate);
        result
    }

    /// Drops every cached size of `document`, in memory and on disk.
    pub async fn forget(&self, document: &DocumentId) {
        self.memory.lock().remove_document(document);
        let paths: Vec<PathBuf> = all_buckets()
            .map(|bucket| {
                self.path_for(&ThumbnailKey {
                    document: document.clone(),
                    width_bucket: bucket,
                })
            })
            .collect();
        let removed = tokio::task::spawn_blocking(move || {
            paths
                .iter()
                .filter(|path| std::fs::remove_file(path).is_ok())
                .count()
        })
        .await
        .unwrap_or(0);
        debug!(document = %document, removed, "thumbnails forgotten");
    }

    fn memory_hit(&self, key: &ThumbnailKey) -> Option<Arc<Bitmap>> {
        let hit = self.memory.lock().get(key)?;
        self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
        Some(hit)
    }

    async fn disk_hit(&self, key: &ThumbnailKey) -> Option<Arc<Bitmap>> {
        let path = self.path_for(key);
        let read = tokio::task::spawn_blocking(move || read_cached(&path)).await;
        match read {
            Ok(DiskRead::Hit(bitmap)) => {
                let bitmap = Arc::new(bitmap);
                self.memory.lock().insert(key.clone(), bitmap.clone());
                self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                debug!(document = %key.document, bucket = key.width_bucket, "thumbnail from disk");
                Some(bitmap)
            }
            Ok(DiskRead::Corrupt) => {
                self.counters.corrupt_removed.fetch_add(1, Ordering::Relaxed);
                warn!(document = %key.document, bucket = key.width_bucket, "removed unreadable thumbnail");
                None
            }
            Ok(DiskRead::Missing) => None,
            Err(err) => {
                warn!(error = %err, "thumbnail read task failed");
                None
            }
        }
    }

    async fn generate_with_permit(&self, key: &ThumbnailKey) -> Option<Arc<Bitmap>> {
        let _permit = self.permits.acquire().await.ok()?;

        // Someone holding the permit before us may have produced it already.
        if let Some(hit) = self.memory_hit(key) {
            return Some(hit);
        }
        if let Some(hit) = self.disk_hit(key).await {
            return Some(hit);
        }

        let source = self.source.clone();
        let document = key.document.clone();
        let width = key.width_bucket;
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let keep = self.disk_entries.get();
        let generated = tokio::task::spawn_blocking(move || -> Result<Bitmap> {
            let bitmap = source.generate(&document, width)?;
            if let Err(err) = write_png(&dir, &path, &bitmap) {
                warn!(document = %document, error = %err, "cannot persist thumbnail");
            } else {
                prune_disk(&dir, keep);
            }
            Ok(bitmap)
        })
        .await;

        match generated {
            Ok(Ok(bitmap)) => {
                let bitmap = Arc::new(bitmap);
                self.memory.lock().insert(key.clone(), bitmap.clone());
                self.counters.generated.fetch_add(1, Ordering::Relaxed);
                debug!(document = %key.document, bucket = key.width_bucket, "thumbnail generated");
                Some(bitmap)
            }
            Ok(Err(err)) => {
                warn!(document = %key.document, error = %err, "thumbnail generation failed");
                None
            }
            Err(err) => {
                warn!(document = %key.document, error = %err, "thumbnail task failed");
                None
            }
        }
    }

    fn in_flight_gate(&self, key: &ThumbnailKey) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn release_gate(&self, key: &ThumbnailKey, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut in_flight = self.in_flight.lock();
        // One reference in the map, one held by us.
        if Arc::strong_count(gate) <= 2 {
            in_flight.remove(key);
        }
    }
}

fn all_buckets() -> impl Iterator<Item = u32> {
    let mut buckets: Vec<u32> = (0..=THUMBNAIL_MAX_WIDTH as i32).map(width_bucket).collect();
    buckets.dedup();
    buckets.into_iter()
}

fn read_cached(path: &Path) -> DiskRead {
    if !path.is_file() {
        return DiskRead::Missing;
    }
    let decoded = image::open(path)
        .map_err(EngineError::from)
        .and_then(|image| {
            let rgba = image.into_rgba8();
            let (width, height) = rgba.dimensions();
            Bitmap::from_rgba(width, height, rgba.into_raw())
                .ok_or_else(|| EngineError::native("decoded thumbnail has the wrong size"))
        });
    match decoded {
        Ok(bitmap) => DiskRead::Hit(bitmap),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "thumbnail decode failed");
            if let Err(err) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %err, "cannot remove unreadable thumbnail");
            }
            DiskRead::Corrupt
        }
    }
}

fn write_png(dir: &Path, path: &Path, bitmap: &Bitmap) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = std::io::BufWriter::new(tmp.as_file_mut());
        PngEncoder::new(&mut writer).write_image(
            &bitmap.pixels,
            bitmap.width,
            bitmap.height,
            image::ExtendedColorType::Rgba8,
        )?;
        writer.flush()?;
    }
    tmp.persist(path).map_err(|err| EngineError::Io(err.error))?;
    Ok(())
}

/// Keeps the `keep` most recently generated thumbnails in `dir`.
fn prune_disk(dir: &Path, keep: usize) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let mut files: Vec<(std::time::SystemTime, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "png"))
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .collect();
    if files.len() <= keep {
        return;
    }
    files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    let excess = files.len() - keep;
    for (_, path) in files.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "pruned thumbnail"),
            Err(err) => warn!(path = %path.display(), error = %err, "cannot prune thumbnail"),
        }
    }
}
