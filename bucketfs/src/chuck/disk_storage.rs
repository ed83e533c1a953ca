use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, trace};

/// Local persistence for cached chunks, keyed by cache entry.
#[async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Persist the chunk covering `chunk` of entry `key`.
    async fn write_chunk(&self, key: &str, chunk: Range<u64>, data: Bytes) -> anyhow::Result<()>;

    /// Read `want` (inside `chunk`) back from a persisted chunk.
    async fn read_chunk(
        &self,
        key: &str,
        chunk: &Range<u64>,
        want: Range<u64>,
    ) -> anyhow::Result<Bytes>;

    /// Remove every chunk of `key`.
    async fn delete_all(&self, key: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct DiskStorage {
    pub base_dir: PathBuf,
}

impl DiskStorage {
    pub async fn new<P: AsRef<Path>>(base_dir: P) -> anyhow::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.exists() {
            info!("Creating cache directory: {:?}", base_dir);
            fs::create_dir_all(&base_dir).await?;
        } else {
            debug!("Cache directory already exists: {:?}", base_dir);
        }
        Ok(Self { base_dir })
    }

    pub fn key_to_dirname(key: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.base_dir.join(Self::key_to_dirname(key))
    }

    fn chunk_path(&self, key: &str, chunk_start: u64) -> PathBuf {
        self.entry_dir(key).join(format!("{chunk_start:016x}"))
    }
}

#[async_trait]
impl ChunkStorage for DiskStorage {
    async fn write_chunk(&self, key: &str, chunk: Range<u64>, data: Bytes) -> anyhow::Result<()> {
        let dir = self.entry_dir(key);
        fs::create_dir_all(&dir).await?;
        let path = self.chunk_path(key, chunk.start);
        let tmp = dir.join(format!(".{:016x}.tmp", chunk.start));
        trace!("Storing {} bytes for '{}' {:?} at {:?}", data.len(), key, chunk, path);

        fs::write(&tmp, &data).await?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to publish chunk {path:?}"))?;
        Ok(())
    }

    async fn read_chunk(
        &self,
        key: &str,
        chunk: &Range<u64>,
        want: Range<u64>,
    ) -> anyhow::Result<Bytes> {
        if want.start < chunk.start || want.end > chunk.end {
            return Err(anyhow!("range {want:?} outside chunk {chunk:?}"));
        }
        let path = self.chunk_path(key, chunk.start);
        let mut file = fs::File::open(&path)
            .await
            .with_context(|| format!("cached chunk {path:?} missing"))?;
        let mut buf = vec![0u8; (want.end - want.start) as usize];
        file.seek(SeekFrom::Start(want.start - chunk.start)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn delete_all(&self, key: &str) -> anyhow::Result<()> {
        let dir = self.entry_dir(key);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!("Removed cached chunks of '{}'", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
