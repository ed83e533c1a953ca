//! ObjectReader: read handle over one object generation.
//!
//! With the chunk cache enabled reads go through [`ChunkCache::read`]. With it
//! disabled every read is a single ranged read against the backing store,
//! gated by the download limiter, and nothing is written locally.

use super::cache::{ChunkCache, until_cancelled};
use super::chunk::ObjectKey;
use super::observer::{FetchRecord, ReadObserver};
use crate::cadapter::client::{ObjectAttr, ObjectClient};
use crate::limiter::Limiter;
use crate::vfs::error::{VfsError, VfsResult};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub enum ReadPath {
    Cached(Arc<ChunkCache>),
    Direct {
        client: ObjectClient,
        limiter: Limiter,
        observer: Arc<dyn ReadObserver>,
    },
}

pub struct ObjectReader {
    key: ObjectKey,
    size: u64,
    path: ReadPath,
}

impl ObjectReader {
    pub fn new(attr: &ObjectAttr, path: ReadPath) -> Self {
        Self {
            key: ObjectKey::new(attr.name.clone(), attr.generation),
            size: attr.size,
            path,
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read up to `len` bytes at `offset`. Short only at end of object.
    pub async fn read(
        &self,
        offset: u64,
        len: usize,
        cancel: &CancellationToken,
    ) -> VfsResult<Bytes> {
        let end = offset.saturating_add(len as u64);
        match &self.path {
            ReadPath::Cached(cache) => cache.read(&self.key, self.size, offset..end, cancel).await,
            ReadPath::Direct {
                client,
                limiter,
                observer,
            } => {
                let start = offset.min(self.size);
                let range = start..end.min(self.size).max(start);
                if range.is_empty() {
                    return Ok(Bytes::new());
                }
                let _permit = limiter.acquire(1, cancel).await?;
                let data = until_cancelled(
                    cancel,
                    client.read_range(&self.key.name, self.key.generation, range.clone()),
                )
                .await?
                .map_err(|e| {
                    VfsError::download(self.key.clone(), range.clone(), Arc::new(e))
                })?;
                observer.on_fetch(&FetchRecord {
                    object: self.key.clone(),
                    requested: range,
                    hit: false,
                    bytes_downloaded: data.len() as u64,
                    job_ids: Vec::new(),
                });
                Ok(data)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::InMemoryBackend;
    use crate::chuck::chunk::ChunkLayout;
    use crate::chuck::disk_storage::DiskStorage;
    use crate::chuck::observer::RecordingObserver;

    #[tokio::test]
    async fn test_direct_reads_bypass_cache() {
        let backend = Arc::new(InMemoryBackend::new());
        let attr = backend.insert("obj", &b"0123456789abcdef"[..]);
        let observer = Arc::new(RecordingObserver::default());
        let reader = ObjectReader::new(
            &attr,
            ReadPath::Direct {
                client: ObjectClient::from_arc(backend.clone()),
                limiter: Limiter::new(2),
                observer: observer.clone(),
            },
        );
        let never = CancellationToken::new();
        assert_eq!(&reader.read(4, 4, &never).await.unwrap()[..], b"4567");
        assert_eq!(&reader.read(4, 4, &never).await.unwrap()[..], b"4567");
        assert_eq!(&reader.read(14, 10, &never).await.unwrap()[..], b"ef");
        assert!(reader.read(99, 1, &never).await.unwrap().is_empty());
        assert_eq!(backend.read_count(), 3);
        assert!(observer.fetches().iter().all(|f| !f.hit && f.job_ids.is_empty()));
    }

    #[tokio::test]
    async fn test_cached_reader() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let attr = backend.insert("obj", vec![9u8; 64]);
        let cache = ChunkCache::new(
            ChunkLayout::new(16),
            1024,
            Arc::new(DiskStorage::new(tmp.path()).await.unwrap()),
            ObjectClient::from_arc(backend.clone()),
            Limiter::new(2),
            Arc::new(RecordingObserver::default()),
        );
        let reader = ObjectReader::new(&attr, ReadPath::Cached(cache.clone()));
        let never = CancellationToken::new();
        assert_eq!(reader.read(10, 30, &never).await.unwrap().len(), 30);
        assert_eq!(reader.read(12, 20, &never).await.unwrap().len(), 20);
        assert_eq!(backend.read_count(), 1);
        assert_eq!(cache.total_size(), 48);
    }
}
