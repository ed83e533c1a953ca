//! Local directory backend, used to mock the object store (implements ObjectBackend).
//!
//! Layout under `root`:
//! - `objects/<name>`: published content
//! - `generations/<name>`: generation of the published content
//! - `uploads/<n>`: uploads in progress, renamed into place on success
//!
//! Publication and deletion hold the write side of `publish`, reads and stat
//! the read side, so a reader never pairs one generation with another's bytes.

use crate::cadapter::client::{ByteStream, ObjectAttr, ObjectBackend};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tracing::{debug, warn};

pub struct LocalFsBackend {
    root: PathBuf,
    upload_seq: AtomicU64,
    publish: RwLock<()>,
}

impl LocalFsBackend {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            upload_seq: AtomicU64::new(0),
            publish: RwLock::new(()),
        }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join("objects").join(name)
    }

    fn gen_path_for(&self, name: &str) -> PathBuf {
        self.root.join("generations").join(name)
    }

    fn upload_path(&self) -> PathBuf {
        let seq = self.upload_seq.fetch_add(1, Ordering::SeqCst);
        self.root
            .join("uploads")
            .join(format!("{}-{seq}", std::process::id()))
    }

    async fn current_generation(&self, name: &str) -> Result<Option<i64>> {
        match fs::read_to_string(self.gen_path_for(name)).await {
            Ok(s) => Ok(Some(
                s.trim()
                    .parse()
                    .with_context(|| format!("corrupt generation file for {name}"))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_into(
        &self,
        tmp: &Path,
        base: Option<(&str, i64)>,
        mut body: ByteStream,
    ) -> Result<()> {
        if let Some(dir) = tmp.parent() {
            fs::create_dir_all(dir).await?;
        }
        if let Some((name, _)) = base {
            fs::copy(self.path_for(name), tmp)
                .await
                .with_context(|| format!("append target {name} does not exist"))?;
        }
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(tmp)
            .await?;
        while let Some(item) = body.next().await {
            let data = item?;
            f.write_all(&data).await?;
        }
        f.flush().await?;
        f.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectBackend for LocalFsBackend {
    async fn create_or_append(
        &self,
        name: &str,
        base_generation: Option<i64>,
        body: ByteStream,
    ) -> Result<i64> {
        if let Some(base) = base_generation {
            let current = self.current_generation(name).await?;
            if current != Some(base) {
                bail!("precondition failed for {name}: generation {current:?} != {base}");
            }
        }

        let tmp = self.upload_path();
        let base = base_generation.map(|g| (name, g));
        if let Err(e) = self.stream_into(&tmp, base, body).await {
            if let Err(rm) = fs::remove_file(&tmp).await {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove partial upload {:?}: {rm}", tmp);
                }
            }
            return Err(e);
        }

        let _guard = self.publish.write().await;
        let current = self.current_generation(name).await?;
        if base_generation.is_some() && current != base_generation {
            let _ = fs::remove_file(&tmp).await;
            bail!("precondition failed for {name}: object changed during append");
        }
        // microsecond clock keeps generations increasing across delete/recreate
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        let generation = (current.unwrap_or(0) + 1).max(now);
        let path = self.path_for(name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let gen_path = self.gen_path_for(name);
        if let Some(dir) = gen_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::rename(&tmp, &path).await?;
        fs::write(&gen_path, generation.to_string()).await?;
        debug!("published {name} generation {generation}");
        Ok(generation)
    }

    async fn read_range(&self, name: &str, generation: i64, range: Range<u64>) -> Result<Bytes> {
        let _guard = self.publish.read().await;
        let current = self
            .current_generation(name)
            .await?
            .ok_or_else(|| anyhow!("object {name} not found"))?;
        if current != generation {
            bail!("generation mismatch for {name}: have {current}, want {generation}");
        }
        let mut f = fs::File::open(self.path_for(name)).await?;
        let size = f.metadata().await?.len();
        let start = range.start.min(size);
        let end = range.end.min(size);
        let mut buf = vec![0u8; (end - start) as usize];
        f.seek(SeekFrom::Start(start)).await?;
        f.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn stat(&self, name: &str) -> Result<Option<ObjectAttr>> {
        let _guard = self.publish.read().await;
        let Some(generation) = self.current_generation(name).await? else {
            return Ok(None);
        };
        let size = fs::metadata(self.path_for(name)).await?.len();
        Ok(Some(ObjectAttr {
            name: name.to_string(),
            generation,
            size,
        }))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.publish.write().await;
        for path in [self.path_for(name), self.gen_path_for(name)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(parts: Vec<&'static [u8]>) -> ByteStream {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p)))).boxed()
    }

    #[tokio::test]
    async fn test_localfs_create_append_read() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tmp.path());

        let g1 = backend
            .create_or_append("dir/obj", None, body(vec![&b"abc"[..], &b"def"[..]]))
            .await
            .unwrap();
        let g2 = backend
            .create_or_append("dir/obj", Some(g1), body(vec![&b"ghi"[..]]))
            .await
            .unwrap();
        assert!(g2 > g1);

        let attr = backend.stat("dir/obj").await.unwrap().unwrap();
        assert_eq!(attr.size, 9);
        assert_eq!(attr.generation, g2);

        let out = backend.read_range("dir/obj", g2, 2..7).await.unwrap();
        assert_eq!(&out[..], b"cdefg");
        assert!(backend.read_range("dir/obj", g1, 0..1).await.is_err());
    }

    #[tokio::test]
    async fn test_localfs_abort_leaves_no_object() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tmp.path());
        let parts: Vec<Result<Bytes>> = vec![Ok(Bytes::from_static(b"abc")), Err(anyhow!("abort"))];
        let res = backend
            .create_or_append("obj", None, stream::iter(parts).boxed())
            .await;
        assert!(res.is_err());
        assert!(backend.stat("obj").await.unwrap().is_none());

        let mut uploads = fs::read_dir(tmp.path().join("uploads")).await.unwrap();
        assert!(uploads.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_localfs_sidecar_does_not_shadow_objects() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tmp.path());
        let gx = backend
            .create_or_append("x", None, body(vec![&b"plain"[..]]))
            .await
            .unwrap();
        let gy = backend
            .create_or_append("x.gen", None, body(vec![&b"other"[..]]))
            .await
            .unwrap();
        assert_eq!(&backend.read_range("x", gx, 0..5).await.unwrap()[..], b"plain");
        assert_eq!(&backend.read_range("x.gen", gy, 0..5).await.unwrap()[..], b"other");
        assert_eq!(backend.stat("x").await.unwrap().unwrap().generation, gx);
    }

    #[tokio::test]
    async fn test_localfs_pinned_reader_never_sees_newer_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = std::sync::Arc::new(LocalFsBackend::new(tmp.path()));
        let old = backend
            .create_or_append("obj", None, body(vec![&b"aaaa"[..]]))
            .await
            .unwrap();

        let writer = backend.clone();
        let replace = tokio::spawn(async move {
            for _ in 0..20 {
                writer
                    .create_or_append("obj", None, body(vec![&b"bbbb"[..]]))
                    .await
                    .unwrap();
            }
        });
        for _ in 0..50 {
            if let Ok(out) = backend.read_range("obj", old, 0..4).await {
                assert_eq!(&out[..], b"aaaa");
            }
            tokio::task::yield_now().await;
        }
        replace.await.unwrap();
    }

    #[tokio::test]
    async fn test_localfs_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(tmp.path());
        backend
            .create_or_append("obj", None, body(vec![&b"x"[..]]))
            .await
            .unwrap();
        backend.delete("obj").await.unwrap();
        assert!(backend.stat("obj").await.unwrap().is_none());
        backend.delete("obj").await.unwrap();
    }
}
