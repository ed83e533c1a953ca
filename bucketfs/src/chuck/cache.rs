//! Chunk cache: per-object cached ranges on local disk under one global budget.
//!
//! The index keeps every [`CacheEntry`] in an LRU list keyed by
//! `(name, generation)`. Chunk insertion, eviction and recency bumps each run
//! inside one short critical section on the index. An entry's own ranges sit
//! behind a per-entry lock so downloads of unrelated objects never contend.
//! Lock order is index, then entry; the in-flight table of the singleflight is
//! only ever held together with an entry lock.
//!
//! Eviction runs after a chunk lands, never before: the insertion that pushes
//! the total over budget is admitted first, then whole entries are dropped in
//! LRU order. The entry that triggered it is never its own victim, so a single
//! object larger than the budget stays cached until something else is read.

use super::chunk::{ChunkLayout, ObjectKey};
use super::disk_storage::{ChunkStorage, DiskStorage};
use super::download::{DownloadJob, PlannedChunk};
use super::observer::{FetchRecord, ReadObserver};
use super::ranges::RangeSet;
use super::singleflight::{Claim, SingleFlight};
use super::util::contiguous_runs;
use crate::cadapter::client::ObjectClient;
use crate::limiter::Limiter;
use crate::vfs::config::ReadConfig;
use crate::vfs::error::{VfsError, VfsResult};
use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) type ChunkId = (ObjectKey, u64);

// a hit can race with eviction of its entry; retry the leftovers this often
const MAX_READ_ROUNDS: usize = 3;

#[derive(Debug, Default)]
struct EntryState {
    ranges: RangeSet,
    size_on_disk: u64,
    evicted: bool,
}

/// Cached state of one object generation.
#[derive(Debug)]
pub struct CacheEntry {
    key: ObjectKey,
    storage_key: String,
    object_size: u64,
    state: Mutex<EntryState>,
    cancel: CancellationToken,
}

impl CacheEntry {
    fn new(key: ObjectKey, incarnation: u64, object_size: u64) -> Self {
        let storage_key = format!("{}#{}#{incarnation}", key.name, key.generation);
        Self {
            key,
            storage_key,
            object_size,
            state: Mutex::new(EntryState::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Key of this entry's chunks in local storage. Unique per incarnation,
    /// so a re-created entry never sees files of an evicted one.
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    pub fn object_size(&self) -> u64 {
        self.object_size
    }

    pub fn size_on_disk(&self) -> u64 {
        self.state.lock().unwrap().size_on_disk
    }

    pub fn cached_ranges(&self) -> Vec<Range<u64>> {
        self.state.lock().unwrap().ranges.iter().collect()
    }

    pub fn contains(&self, range: &Range<u64>) -> bool {
        let st = self.state.lock().unwrap();
        !st.evicted && st.ranges.contains(range)
    }

    pub fn is_evicted(&self) -> bool {
        self.state.lock().unwrap().evicted
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Record `chunk` as cached and return the bytes newly accounted.
    fn add_range(&self, chunk: Range<u64>) -> u64 {
        let mut st = self.state.lock().unwrap();
        let added: u64 = st.ranges.missing(&chunk).iter().map(|r| r.end - r.start).sum();
        st.ranges.insert(chunk);
        st.size_on_disk += added;
        added
    }

    /// Terminal transition. Returns the bytes the entry was holding.
    fn mark_evicted(&self) -> u64 {
        let mut st = self.state.lock().unwrap();
        st.evicted = true;
        st.ranges = RangeSet::new();
        self.cancel.cancel();
        std::mem::take(&mut st.size_on_disk)
    }
}

/// Outcome of admitting a chunk into the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Within,
    OverCapacity,
}

enum Insertion {
    /// The entry was evicted or replaced while the chunk was downloading.
    Stale,
    Admitted {
        admission: Admission,
        victims: Vec<Arc<CacheEntry>>,
    },
}

struct CacheIndex {
    // iteration order is most to least recently used
    lru: LruCache<ObjectKey, Arc<CacheEntry>>,
    total_size: u64,
    capacity: u64,
}

impl CacheIndex {
    fn is_current(&self, entry: &Arc<CacheEntry>) -> bool {
        self.lru
            .peek(&entry.key)
            .is_some_and(|e| Arc::ptr_eq(e, entry))
    }

    fn remove_where(&mut self, pred: impl Fn(&ObjectKey) -> bool) -> Vec<Arc<CacheEntry>> {
        let keys: Vec<ObjectKey> = self
            .lru
            .iter()
            .filter(|(k, _)| pred(k))
            .map(|(k, _)| k.clone())
            .collect();
        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.lru.pop(&key) {
                self.total_size -= entry.mark_evicted();
                removed.push(entry);
            }
        }
        removed
    }

    /// Drop least recently used entries until the budget holds, sparing `keep`.
    fn evict_for(&mut self, keep: &ObjectKey) -> Vec<Arc<CacheEntry>> {
        let mut victims = Vec::new();
        while self.total_size > self.capacity {
            match self.lru.peek_lru() {
                Some((k, _)) if k != keep => {}
                _ => break,
            }
            if let Some((_, victim)) = self.lru.pop_lru() {
                self.total_size -= victim.mark_evicted();
                victims.push(victim);
            }
        }
        victims
    }
}

pub struct ChunkCache {
    layout: ChunkLayout,
    index: Mutex<CacheIndex>,
    storage: Arc<dyn ChunkStorage>,
    client: ObjectClient,
    limiter: Limiter,
    observer: Arc<dyn ReadObserver>,
    in_flight: SingleFlight<ChunkId, Bytes>,
    next_job: AtomicU64,
    next_incarnation: AtomicU64,
}

impl ChunkCache {
    pub fn new(
        layout: ChunkLayout,
        capacity: u64,
        storage: Arc<dyn ChunkStorage>,
        client: ObjectClient,
        limiter: Limiter,
        observer: Arc<dyn ReadObserver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            layout,
            index: Mutex::new(CacheIndex {
                lru: LruCache::unbounded(),
                total_size: 0,
                capacity,
            }),
            storage,
            client,
            limiter,
            observer,
            in_flight: SingleFlight::new(),
            next_job: AtomicU64::new(1),
            next_incarnation: AtomicU64::new(0),
        })
    }

    /// Cache persisted under `cfg`'s cache directory. Chunks left by an
    /// earlier process are discarded: the index is not persisted.
    pub async fn open(
        cfg: &ReadConfig,
        client: ObjectClient,
        limiter: Limiter,
        observer: Arc<dyn ReadObserver>,
    ) -> anyhow::Result<Arc<Self>> {
        let dir = cfg.resolved_cache_dir().join("chunks");
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => info!("discarded stale chunk cache at {:?}", dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let storage = DiskStorage::new(&dir).await?;
        Ok(Self::new(
            ChunkLayout::new(cfg.chunk_size),
            cfg.cache_capacity_bytes,
            Arc::new(storage),
            client,
            limiter,
            observer,
        ))
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    pub fn capacity(&self) -> u64 {
        self.index.lock().unwrap().capacity
    }

    pub fn total_size(&self) -> u64 {
        self.index.lock().unwrap().total_size
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached keys, most recently used first.
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.index
            .lock()
            .unwrap()
            .lru
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Look up an entry without touching its recency.
    pub fn entry(&self, key: &ObjectKey) -> Option<Arc<CacheEntry>> {
        self.index.lock().unwrap().lru.peek(key).cloned()
    }

    pub fn cached_ranges(&self, key: &ObjectKey) -> Vec<Range<u64>> {
        self.entry(key).map(|e| e.cached_ranges()).unwrap_or_default()
    }

    pub(crate) fn client(&self) -> &ObjectClient {
        &self.client
    }

    pub(crate) fn download_limiter(&self) -> &Limiter {
        &self.limiter
    }

    pub(crate) fn observer(&self) -> &Arc<dyn ReadObserver> {
        &self.observer
    }

    /// Fetch or create the entry for `key` and make it most recently used.
    /// Creating an entry drops cached entries of other generations of the name.
    pub async fn touch(&self, key: &ObjectKey, object_size: u64) -> Arc<CacheEntry> {
        let (entry, victims) = {
            let mut idx = self.index.lock().unwrap();
            let existing = idx.lru.get(key).cloned();
            match existing {
                Some(entry) => (entry, Vec::new()),
                None => {
                    let victims = idx.remove_where(|k| k.name == key.name);
                    let incarnation = self.next_incarnation.fetch_add(1, Ordering::Relaxed);
                    let entry = Arc::new(CacheEntry::new(key.clone(), incarnation, object_size));
                    idx.lru.put(key.clone(), entry.clone());
                    (entry, victims)
                }
            }
        };
        for v in &victims {
            debug!(dropped = %v.key(), newer = %key, "dropping older generation");
        }
        self.delete_victims(victims).await;
        entry
    }

    /// Drop every cached generation of `name`.
    pub async fn invalidate(&self, name: &str) {
        let victims = self.index.lock().unwrap().remove_where(|k| k.name == name);
        if !victims.is_empty() {
            info!(name, entries = victims.len(), "invalidated cached object");
        }
        self.delete_victims(victims).await;
    }

    fn insert_chunk(&self, entry: &Arc<CacheEntry>, chunk: Range<u64>) -> Insertion {
        let mut idx = self.index.lock().unwrap();
        if !idx.is_current(entry) || entry.is_evicted() {
            return Insertion::Stale;
        }
        idx.total_size += entry.add_range(chunk);
        idx.lru.promote(&entry.key);
        let admission = if idx.total_size > idx.capacity {
            Admission::OverCapacity
        } else {
            Admission::Within
        };
        let victims = match admission {
            Admission::OverCapacity => idx.evict_for(&entry.key),
            Admission::Within => Vec::new(),
        };
        Insertion::Admitted { admission, victims }
    }

    /// Persist a downloaded chunk and account it. Failures leave the entry
    /// without the chunk and are only logged.
    pub(crate) async fn store_chunk(
        &self,
        entry: &Arc<CacheEntry>,
        chunk: Range<u64>,
        data: Bytes,
    ) {
        if let Err(e) = self.storage.write_chunk(entry.storage_key(), chunk.clone(), data).await {
            warn!(object = %entry.key(), ?chunk, "failed to persist chunk: {e:#}");
            return;
        }
        match self.insert_chunk(entry, chunk.clone()) {
            Insertion::Stale => {
                debug!(object = %entry.key(), ?chunk, "chunk landed on a dropped entry");
                if let Err(e) = self.storage.delete_all(entry.storage_key()).await {
                    warn!(object = %entry.key(), "failed to clean up dropped entry: {e:#}");
                }
            }
            Insertion::Admitted { admission, victims } => {
                if admission == Admission::OverCapacity {
                    debug!(
                        object = %entry.key(),
                        evicted = victims.len(),
                        "over budget after insert"
                    );
                }
                self.delete_victims(victims).await;
            }
        }
    }

    /// Drop `entry` once its local chunks turned out unreadable, so the
    /// next claim downloads them again.
    async fn discard_entry(&self, entry: &Arc<CacheEntry>) {
        let dropped = {
            let mut idx = self.index.lock().unwrap();
            if idx.is_current(entry) {
                idx.lru.pop(entry.key());
                idx.total_size -= entry.mark_evicted();
                true
            } else {
                false
            }
        };
        if dropped {
            warn!(object = %entry.key(), "dropping cache entry with unreadable chunks");
            self.delete_victims(vec![entry.clone()]).await;
        }
    }

    async fn delete_victims(&self, victims: Vec<Arc<CacheEntry>>) {
        for victim in victims {
            info!(object = %victim.key(), "evicted cache entry");
            if let Err(e) = self.storage.delete_all(victim.storage_key()).await {
                warn!(object = %victim.key(), "failed to delete evicted chunks: {e:#}");
            }
        }
    }

    /// Read `range` of `key`, downloading missing chunks.
    ///
    /// Contiguous missing chunks are fetched by one job each; chunks already
    /// being fetched by someone else are waited for instead. `cancel` only
    /// stops this caller from waiting, scheduled jobs still finish.
    #[tracing::instrument(level = "debug", skip(self, cancel), fields(object = %key))]
    pub async fn read(
        self: &Arc<Self>,
        key: &ObjectKey,
        object_size: u64,
        range: Range<u64>,
        cancel: &CancellationToken,
    ) -> VfsResult<Bytes> {
        let start = range.start.min(object_size);
        let range = start..range.end.min(object_size).max(start);
        let wanted: Vec<u64> = self.layout.chunks_covering(&range).collect();
        let mut parts: BTreeMap<u64, Bytes> = BTreeMap::new();
        let mut record = FetchRecord {
            object: key.clone(),
            requested: range.clone(),
            hit: true,
            bytes_downloaded: 0,
            job_ids: Vec::new(),
        };
        let mut last_err: Option<anyhow::Error> = None;
        let mut entry = self.touch(key, object_size).await;

        for _ in 0..MAX_READ_ROUNDS {
            if parts.len() == wanted.len() {
                break;
            }
            if entry.is_evicted() {
                entry = self.touch(key, object_size).await;
            }

            let mut hits = Vec::new();
            let mut leaders: Vec<PlannedChunk> = Vec::new();
            let mut followers = Vec::new();
            for &index in wanted.iter().filter(|i| !parts.contains_key(i)) {
                let chunk = self.layout.chunk_byte_range(index, object_size);
                match self
                    .in_flight
                    .claim_unless((key.clone(), index), || entry.contains(&chunk))
                {
                    None => hits.push((index, chunk)),
                    Some(Claim::Leader(leader)) => leaders.push(PlannedChunk {
                        index,
                        range: chunk,
                        leader,
                    }),
                    Some(Claim::Follower(f)) => followers.push((index, chunk, f)),
                }
            }
            if !leaders.is_empty() || !followers.is_empty() {
                record.hit = false;
            }

            let mut jobs = Vec::new();
            for run in split_runs(leaders) {
                let id = self.next_job.fetch_add(1, Ordering::Relaxed);
                let job = DownloadJob::new(id, entry.clone(), run);
                record.job_ids.push(job.id());
                debug!(job = job.id(), span = ?job.span(), "scheduling download");
                jobs.push((job.span(), tokio::spawn(job.run(self.clone()))));
            }

            let mut unreadable = false;
            for (index, chunk) in hits {
                let want = clip(&chunk, &range);
                match self.storage.read_chunk(entry.storage_key(), &chunk, want).await {
                    Ok(bytes) => {
                        parts.insert(index, bytes);
                    }
                    Err(e) => {
                        debug!(chunk = index, "cached read failed, will retry: {e:#}");
                        unreadable = true;
                        last_err = Some(e);
                    }
                }
            }
            if unreadable {
                self.discard_entry(&entry).await;
            }

            for (index, chunk, follower) in followers {
                let bytes = until_cancelled(cancel, follower.wait())
                    .await?
                    .map_err(|e| VfsError::download(key.clone(), chunk.clone(), e))?;
                parts.insert(index, slice_chunk(&bytes, &chunk, &range));
            }

            for (span, job) in jobs {
                let output = until_cancelled(cancel, job)
                    .await?
                    .map_err(|e| VfsError::Anyhow(anyhow!("download job panicked: {e}")))?
                    .map_err(|e| VfsError::download(key.clone(), span, e))?;
                record.bytes_downloaded += output.bytes;
                for (index, bytes) in output.chunks {
                    let chunk = self.layout.chunk_byte_range(index, object_size);
                    parts.insert(index, slice_chunk(&bytes, &chunk, &range));
                }
            }
        }

        if parts.len() != wanted.len() {
            let cause =
                last_err.unwrap_or_else(|| anyhow!("chunks kept disappearing from the cache"));
            return Err(VfsError::download(key.clone(), range, Arc::new(cause)));
        }
        self.observer.on_fetch(&record);

        if parts.len() == 1 {
            if let Some((_, only)) = parts.pop_first() {
                return Ok(only);
            }
        }
        let mut out = BytesMut::with_capacity((range.end - range.start) as usize);
        for bytes in parts.values() {
            out.extend_from_slice(bytes);
        }
        Ok(out.freeze())
    }
}

fn clip(chunk: &Range<u64>, range: &Range<u64>) -> Range<u64> {
    chunk.start.max(range.start)..chunk.end.min(range.end)
}

fn slice_chunk(bytes: &Bytes, chunk: &Range<u64>, range: &Range<u64>) -> Bytes {
    let want = clip(chunk, range);
    bytes.slice((want.start - chunk.start) as usize..(want.end - chunk.start) as usize)
}

fn split_runs(chunks: Vec<PlannedChunk>) -> Vec<Vec<PlannedChunk>> {
    let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
    let mut chunks = chunks.into_iter();
    contiguous_runs(&indices)
        .into_iter()
        .map(|run| chunks.by_ref().take((run.end - run.start) as usize).collect())
        .collect()
}

pub(crate) async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> VfsResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(VfsError::Cancelled),
        v = fut => Ok(v),
    }
}
