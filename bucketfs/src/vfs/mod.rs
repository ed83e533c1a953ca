//! VFS layer: handle table over the buffered write path and the read cache.
//!
//! Responsibilities:
//! - Hand out `u64` handles for files open for create, append or read.
//! - Route writes to a [`BufferedWriteHandler`] and reads to an
//!   [`ObjectReader`] (cached or direct, per config).
//! - Own the two transfer limiters: one for block uploads, one for chunk
//!   downloads.
//!
//! Submodules:
//! - `config`: YAML configuration
//! - `error`: error type surfaced to callers
pub mod config;
pub mod error;

use crate::bufwrite::{BufferedWriteHandler, WriteFileInfo};
use crate::cadapter::client::{ObjectAttr, ObjectClient};
use crate::chuck::cache::ChunkCache;
use crate::chuck::observer::{ReadObserver, TracingObserver};
use crate::chuck::reader::{ObjectReader, ReadPath};
use crate::limiter::Limiter;
use bytes::Bytes;
use config::Config;
use error::{VfsError, VfsResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone)]
enum Handle {
    Read(Arc<ObjectReader>),
    Write(Arc<BufferedWriteHandler>),
}

pub struct Vfs {
    config: Config,
    client: ObjectClient,
    upload_limiter: Limiter,
    read_path: ReadPath,
    cache: Option<Arc<ChunkCache>>,
    handles: Mutex<HashMap<u64, Handle>>,
    next_fh: AtomicU64,
}

impl Vfs {
    pub async fn new(config: Config, client: ObjectClient) -> VfsResult<Self> {
        Self::with_observer(config, client, Arc::new(TracingObserver)).await
    }

    pub async fn with_observer(
        config: Config,
        client: ObjectClient,
        observer: Arc<dyn ReadObserver>,
    ) -> VfsResult<Self> {
        config.validate()?;
        let upload_limiter = Limiter::new(config.max_concurrent_transfers);
        let download_limiter = Limiter::new(config.max_concurrent_transfers);

        let (read_path, cache) = if config.read.chunk_cache_enabled {
            let cache =
                ChunkCache::open(&config.read, client.clone(), download_limiter, observer).await?;
            info!(
                chunk_size = config.read.chunk_size,
                capacity = config.read.cache_capacity_bytes,
                "chunk cache enabled"
            );
            (ReadPath::Cached(cache.clone()), Some(cache))
        } else {
            info!("chunk cache disabled, reads go straight to the backing store");
            (
                ReadPath::Direct {
                    client: client.clone(),
                    limiter: download_limiter,
                    observer,
                },
                None,
            )
        };

        Ok(Self {
            config,
            client,
            upload_limiter,
            read_path,
            cache,
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> Option<&Arc<ChunkCache>> {
        self.cache.as_ref()
    }

    fn insert(&self, handle: Handle) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(fh, handle);
        fh
    }

    fn get(&self, fh: u64) -> VfsResult<Handle> {
        self.handles
            .lock()
            .unwrap()
            .get(&fh)
            .cloned()
            .ok_or(VfsError::BadHandle(fh))
    }

    fn writer(&self, fh: u64) -> VfsResult<Arc<BufferedWriteHandler>> {
        match self.get(fh)? {
            Handle::Write(w) => Ok(w),
            Handle::Read(_) => Err(VfsError::BadHandle(fh)),
        }
    }

    fn reader(&self, fh: u64) -> VfsResult<Arc<ObjectReader>> {
        match self.get(fh)? {
            Handle::Read(r) => Ok(r),
            Handle::Write(_) => Err(VfsError::BadHandle(fh)),
        }
    }

    pub async fn stat(&self, name: &str) -> VfsResult<ObjectAttr> {
        self.client
            .stat(name)
            .await?
            .ok_or_else(|| VfsError::NotFound(name.to_string()))
    }

    /// Open `name` for writing from scratch. Nothing is published until flush.
    pub async fn create(&self, name: &str) -> VfsResult<u64> {
        let handler = BufferedWriteHandler::create(
            name,
            &self.config.write,
            self.client.clone(),
            self.upload_limiter.clone(),
        );
        let fh = self.insert(Handle::Write(Arc::new(handler)));
        debug!(name, fh, "opened for create");
        Ok(fh)
    }

    /// Open the current generation of `name` for appending.
    pub async fn open_append(&self, name: &str) -> VfsResult<u64> {
        let attr = self.stat(name).await?;
        let handler = BufferedWriteHandler::append(
            name,
            attr.generation,
            attr.size,
            &self.config.write,
            self.client.clone(),
            self.upload_limiter.clone(),
        );
        let fh = self.insert(Handle::Write(Arc::new(handler)));
        debug!(name, fh, generation = attr.generation, size = attr.size, "opened for append");
        Ok(fh)
    }

    /// Open the current generation of `name` for reading.
    pub async fn open_read(&self, name: &str) -> VfsResult<u64> {
        let attr = self.stat(name).await?;
        let reader = ObjectReader::new(&attr, self.read_path.clone());
        let fh = self.insert(Handle::Read(Arc::new(reader)));
        debug!(name, fh, generation = attr.generation, "opened for read");
        Ok(fh)
    }

    pub async fn write(
        &self,
        fh: u64,
        data: &[u8],
        offset: u64,
        cancel: &CancellationToken,
    ) -> VfsResult<()> {
        self.writer(fh)?.write(data, offset, cancel).await
    }

    /// Publish everything written through `fh`. Returns the new generation.
    /// Flushing an already published handle changes nothing.
    pub async fn flush(&self, fh: u64) -> VfsResult<i64> {
        let writer = self.writer(fh)?;
        let (generation, published) = writer.finalize().await?;
        if let Some(cache) = self.cache.as_ref().filter(|_| published) {
            cache.invalidate(writer.name()).await;
        }
        Ok(generation)
    }

    pub async fn read(
        &self,
        fh: u64,
        offset: u64,
        len: usize,
        cancel: &CancellationToken,
    ) -> VfsResult<Bytes> {
        self.reader(fh)?.read(offset, len, cancel).await
    }

    pub fn set_mtime(&self, fh: u64, mtime: SystemTime) -> VfsResult<()> {
        self.writer(fh)?.set_mtime(mtime);
        Ok(())
    }

    pub fn write_file_info(&self, fh: u64) -> VfsResult<WriteFileInfo> {
        Ok(self.writer(fh)?.write_file_info())
    }

    /// Drop `fh`. A write handle that was never flushed is abandoned.
    pub async fn release(&self, fh: u64) -> VfsResult<()> {
        let handle = self
            .handles
            .lock()
            .unwrap()
            .remove(&fh)
            .ok_or(VfsError::BadHandle(fh))?;
        if let Handle::Write(w) = handle {
            w.abandon().await;
        }
        Ok(())
    }

    /// Remove `name`: open writers become stale, cached chunks are dropped
    /// and the backing object is deleted if it exists.
    pub async fn unlink(&self, name: &str) -> VfsResult<()> {
        let writers: Vec<Arc<BufferedWriteHandler>> = self
            .handles
            .lock()
            .unwrap()
            .values()
            .filter_map(|h| match h {
                Handle::Write(w) if w.name() == name => Some(w.clone()),
                _ => None,
            })
            .collect();
        for w in &writers {
            w.mark_stale();
        }
        if let Some(cache) = &self.cache {
            cache.invalidate(name).await;
        }
        self.client.delete(name).await?;
        info!(name, stale_writers = writers.len(), "unlinked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::InMemoryBackend;

    async fn setup(cache_enabled: bool) -> (Arc<InMemoryBackend>, Vfs, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let config = Config::default()
            .block_size(64)
            .max_blocks(2)
            .chunk_size(32)
            .cache_capacity(1024)
            .max_concurrent_transfers(4)
            .cache_dir(tmp.path())
            .chunk_cache_enabled(cache_enabled);
        let vfs = Vfs::new(config, ObjectClient::from_arc(backend.clone()))
            .await
            .unwrap();
        (backend, vfs, tmp)
    }

    #[tokio::test]
    async fn test_write_flush_read() {
        let (backend, vfs, _tmp) = setup(true).await;
        let never = CancellationToken::new();
        let fh = vfs.create("f").await.unwrap();
        let data: Vec<u8> = (0..200u8).collect();
        vfs.write(fh, &data[..100], 0, &never).await.unwrap();
        vfs.write(fh, &data[100..], 100, &never).await.unwrap();
        assert_eq!(vfs.write_file_info(fh).unwrap().total_size, 200);
        vfs.flush(fh).await.unwrap();
        vfs.release(fh).await.unwrap();
        assert_eq!(&backend.contents("f").unwrap()[..], &data[..]);

        let rh = vfs.open_read("f").await.unwrap();
        let out = vfs.read(rh, 50, 100, &never).await.unwrap();
        assert_eq!(&out[..], &data[50..150]);
        assert!(vfs.cache().unwrap().total_size() > 0);
    }

    #[tokio::test]
    async fn test_handle_kinds_are_checked() {
        let (backend, vfs, _tmp) = setup(false).await;
        backend.insert("r", &b"abc"[..]);
        let rh = vfs.open_read("r").await.unwrap();
        let never = CancellationToken::new();
        assert!(matches!(
            vfs.write(rh, b"x", 0, &never).await,
            Err(VfsError::BadHandle(_))
        ));
        assert!(matches!(vfs.flush(999).await, Err(VfsError::BadHandle(999))));
        assert!(matches!(
            vfs.open_read("missing").await,
            Err(VfsError::NotFound(_))
        ));
        assert_eq!(&vfs.read(rh, 0, 10, &never).await.unwrap()[..], b"abc");
        assert!(vfs.cache().is_none());
    }

    #[tokio::test]
    async fn test_unlink_makes_writer_stale() {
        let (backend, vfs, _tmp) = setup(true).await;
        let never = CancellationToken::new();
        let fh = vfs.create("doomed").await.unwrap();
        vfs.write(fh, &[1u8; 150], 0, &never).await.unwrap();
        vfs.unlink("doomed").await.unwrap();
        vfs.write(fh, &[2u8; 10], 150, &never).await.unwrap();
        assert!(matches!(vfs.flush(fh).await, Err(VfsError::StaleHandle)));
        assert!(backend.contents("doomed").is_none());
    }

    #[tokio::test]
    async fn test_append_and_reread_new_generation() {
        let (backend, vfs, _tmp) = setup(true).await;
        let never = CancellationToken::new();
        backend.insert("log", &b"first;"[..]);
        let rh = vfs.open_read("log").await.unwrap();
        assert_eq!(&vfs.read(rh, 0, 64, &never).await.unwrap()[..], b"first;");

        let wh = vfs.open_append("log").await.unwrap();
        assert_eq!(vfs.write_file_info(wh).unwrap().total_size, 6);
        vfs.write(wh, b"second;", 6, &never).await.unwrap();
        vfs.flush(wh).await.unwrap();

        let rh2 = vfs.open_read("log").await.unwrap();
        assert_eq!(&vfs.read(rh2, 0, 64, &never).await.unwrap()[..], b"first;second;");
    }

    #[tokio::test]
    async fn test_second_flush_keeps_cached_chunks() {
        let (_, vfs, _tmp) = setup(true).await;
        let never = CancellationToken::new();
        let fh = vfs.create("once").await.unwrap();
        vfs.write(fh, &[5u8; 100], 0, &never).await.unwrap();
        let generation = vfs.flush(fh).await.unwrap();

        let rh = vfs.open_read("once").await.unwrap();
        vfs.read(rh, 0, 100, &never).await.unwrap();
        let cache = vfs.cache().unwrap();
        assert_eq!(cache.total_size(), 100);

        assert_eq!(vfs.flush(fh).await.unwrap(), generation);
        assert_eq!(cache.total_size(), 100);
        assert_eq!(cache.keys().len(), 1);
    }

    #[tokio::test]
    async fn test_set_mtime_through_handle() {
        let (_, vfs, _tmp) = setup(false).await;
        let fh = vfs.create("m").await.unwrap();
        let t = SystemTime::UNIX_EPOCH;
        vfs.set_mtime(fh, t).unwrap();
        assert_eq!(vfs.write_file_info(fh).unwrap().mtime, t);
        vfs.release(fh).await.unwrap();
        assert!(matches!(vfs.write_file_info(fh), Err(VfsError::BadHandle(_))));
    }
}
