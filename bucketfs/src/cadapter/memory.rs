//! In-memory backing store for local development and tests.

use crate::cadapter::client::{ByteStream, ObjectAttr, ObjectBackend};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

struct StoredObject {
    generation: i64,
    data: Bytes,
}

#[derive(Default)]
pub struct InMemoryBackend {
    objects: Mutex<HashMap<String, StoredObject>>,
    next_generation: AtomicI64,
    reads: AtomicUsize,
    fail_uploads: AtomicBool,
    fail_reads: AtomicBool,
    read_delay_ms: AtomicU64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            next_generation: AtomicI64::new(1),
            ..Default::default()
        }
    }

    /// Publish `data` under `name` directly, bypassing the upload path.
    pub fn insert(&self, name: &str, data: impl Into<Bytes>) -> ObjectAttr {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let data = data.into();
        let size = data.len() as u64;
        self.objects
            .lock()
            .unwrap()
            .insert(name.to_string(), StoredObject { generation, data });
        ObjectAttr {
            name: name.to_string(),
            generation,
            size,
        }
    }

    pub fn contents(&self, name: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .map(|o| o.data.clone())
    }

    /// Number of `read_range` calls served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_read_delay(&self, delay: Duration) {
        self.read_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectBackend for InMemoryBackend {
    async fn create_or_append(
        &self,
        name: &str,
        base_generation: Option<i64>,
        mut body: ByteStream,
    ) -> Result<i64> {
        let mut buf = BytesMut::new();
        if let Some(base) = base_generation {
            let objects = self.objects.lock().unwrap();
            match objects.get(name) {
                Some(o) if o.generation == base => buf.extend_from_slice(&o.data),
                Some(o) => bail!(
                    "precondition failed for {name}: generation {} != {base}",
                    o.generation
                ),
                None => bail!("append target {name} does not exist"),
            }
        }
        while let Some(item) = body.next().await {
            buf.extend_from_slice(&item?);
            if self.fail_uploads.load(Ordering::SeqCst) {
                bail!("injected upload failure for {name}");
            }
        }

        let mut objects = self.objects.lock().unwrap();
        if let Some(base) = base_generation {
            if objects.get(name).map(|o| o.generation) != Some(base) {
                bail!("precondition failed for {name}: object changed during append");
            }
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        objects.insert(
            name.to_string(),
            StoredObject {
                generation,
                data: buf.freeze(),
            },
        );
        Ok(generation)
    }

    async fn read_range(&self, name: &str, generation: i64, range: Range<u64>) -> Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let delay = self.read_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            bail!("injected read failure for {name}");
        }
        let objects = self.objects.lock().unwrap();
        let obj = objects
            .get(name)
            .ok_or_else(|| anyhow!("object {name} not found"))?;
        if obj.generation != generation {
            bail!(
                "generation mismatch for {name}: have {}, want {generation}",
                obj.generation
            );
        }
        let len = obj.data.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.min(len) as usize;
        let out = obj.data.slice(start..end);
        Ok(out)
    }

    async fn stat(&self, name: &str) -> Result<Option<ObjectAttr>> {
        Ok(self.objects.lock().unwrap().get(name).map(|o| ObjectAttr {
            name: name.to_string(),
            generation: o.generation,
            size: o.data.len() as u64,
        }))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.objects.lock().unwrap().remove(name);
        Ok(())
    }
}
