//! High-level object client wrapping the backing store operations.
//!
//! Objects are versioned: every successful `create_or_append` publishes a new
//! generation, and ranged reads name the generation they expect.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::ops::Range;
use std::sync::Arc;

/// Ordered body of an upload. An `Err` item aborts the upload: the backend
/// must discard what it received and publish nothing.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Name, generation and size of a published object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectAttr {
    pub name: String,
    pub generation: i64,
    pub size: u64,
}

#[async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Stream `body` into `name`.
    ///
    /// With `base_generation == None` the object is created (or replaced).
    /// With `Some(g)` the body is appended to generation `g`, which must still
    /// be the current one. Returns the generation that was published.
    async fn create_or_append(
        &self,
        name: &str,
        base_generation: Option<i64>,
        body: ByteStream,
    ) -> Result<i64>;

    /// Read `range` of generation `generation`. The range is clamped to the
    /// object size.
    async fn read_range(&self, name: &str, generation: i64, range: Range<u64>) -> Result<Bytes>;

    async fn stat(&self, name: &str) -> Result<Option<ObjectAttr>>;

    async fn delete(&self, name: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct ObjectClient {
    backend: Arc<dyn ObjectBackend>,
}

impl ObjectClient {
    pub fn new<B: ObjectBackend + 'static>(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_arc(backend: Arc<dyn ObjectBackend>) -> Self {
        Self { backend }
    }

    pub async fn create_or_append(
        &self,
        name: &str,
        base_generation: Option<i64>,
        body: ByteStream,
    ) -> Result<i64> {
        self.backend
            .create_or_append(name, base_generation, body)
            .await
    }

    pub async fn read_range(
        &self,
        name: &str,
        generation: i64,
        range: Range<u64>,
    ) -> Result<Bytes> {
        self.backend.read_range(name, generation, range).await
    }

    pub async fn stat(&self, name: &str) -> Result<Option<ObjectAttr>> {
        self.backend.stat(name).await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.backend.delete(name).await
    }
}
