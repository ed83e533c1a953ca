//! Streams completed blocks of one file into a single `create_or_append` call.
//!
//! Blocks travel through an unbounded channel but each carries the permits it
//! was admitted with, so the number of queued blocks stays bounded by the
//! limiters. A permit is released once the backend has pulled its block out of
//! the stream. Offset order is the channel order, which is the only order the
//! backend ever sees.

use crate::cadapter::client::{ByteStream, ObjectClient};
use crate::vfs::error::SharedError;
use anyhow::anyhow;
use bytes::Bytes;
use futures::{StreamExt, stream};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Permits held by one block until the backend consumes it.
#[derive(Debug)]
pub struct BlockPermit {
    pub(crate) transfer: Option<OwnedSemaphorePermit>,
    pub(crate) file_slot: Option<OwnedSemaphorePermit>,
}

enum UploadMsg {
    Block {
        offset: u64,
        data: Bytes,
        permit: BlockPermit,
    },
    Abort,
}

pub struct UploadPipeline {
    name: String,
    tx: Option<mpsc::UnboundedSender<UploadMsg>>,
    task: Option<JoinHandle<anyhow::Result<i64>>>,
    blocks_sent: usize,
}

impl UploadPipeline {
    /// Open the upload. Nothing is published until [`Self::finish`].
    pub fn start(client: ObjectClient, name: &str, base_generation: Option<i64>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<UploadMsg>();
        let body: ByteStream = stream::unfold(rx, |mut rx| async move {
            match rx.recv().await? {
                UploadMsg::Block {
                    offset,
                    data,
                    permit,
                } => {
                    debug!(offset, len = data.len(), "streaming block");
                    drop(permit);
                    Some((Ok(data), rx))
                }
                UploadMsg::Abort => Some((Err(anyhow!("upload aborted by writer")), rx)),
            }
        })
        .boxed();

        let object = name.to_string();
        let task = tokio::spawn(async move {
            let res = client.create_or_append(&object, base_generation, body).await;
            if let Err(e) = &res {
                warn!(object = %object, "upload failed: {e:#}");
            }
            res
        });

        Self {
            name: name.to_string(),
            tx: Some(tx),
            task: Some(task),
            blocks_sent: 0,
        }
    }

    /// Queue a block. Returns `false` when the upload already stopped, in
    /// which case the block and its permits are dropped.
    pub fn push(&mut self, offset: u64, data: Bytes, permit: BlockPermit) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let sent = tx
            .send(UploadMsg::Block {
                offset,
                data,
                permit,
            })
            .is_ok();
        if sent {
            self.blocks_sent += 1;
        }
        sent
    }

    pub fn blocks_sent(&self) -> usize {
        self.blocks_sent
    }

    /// Close the stream and wait for the backend to publish the object.
    pub async fn finish(&mut self) -> Result<i64, SharedError> {
        self.tx.take();
        self.join().await
    }

    /// Poison the stream so the backend publishes nothing, then wait for it.
    pub async fn abort(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(UploadMsg::Abort);
        }
        if self.join().await.is_ok() {
            warn!(object = %self.name, "aborted upload was published anyway");
        }
    }

    async fn join(&mut self) -> Result<i64, SharedError> {
        let Some(task) = self.task.take() else {
            return Err(Arc::new(anyhow!("upload of {} already joined", self.name)));
        };
        match task.await {
            Ok(res) => res.map_err(Arc::new),
            Err(e) => Err(Arc::new(anyhow!("upload task for {} died: {e}", self.name))),
        }
    }
}

impl Drop for UploadPipeline {
    fn drop(&mut self) {
        // a pipeline dropped without finish() must not publish half a file
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(UploadMsg::Abort);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::InMemoryBackend;

    fn no_permit() -> BlockPermit {
        BlockPermit {
            transfer: None,
            file_slot: None,
        }
    }

    #[tokio::test]
    async fn test_blocks_arrive_in_order() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = ObjectClient::from_arc(backend.clone());
        let mut pipeline = UploadPipeline::start(client, "obj", None);
        assert!(pipeline.push(0, Bytes::from_static(b"abc"), no_permit()));
        assert!(pipeline.push(3, Bytes::from_static(b"def"), no_permit()));
        let generation = pipeline.finish().await.unwrap();
        assert!(generation > 0);
        assert_eq!(pipeline.blocks_sent(), 2);
        assert_eq!(&backend.contents("obj").unwrap()[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_abort_publishes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let client = ObjectClient::from_arc(backend.clone());
        let mut pipeline = UploadPipeline::start(client, "obj", None);
        pipeline.push(0, Bytes::from_static(b"abc"), no_permit());
        pipeline.abort().await;
        assert!(backend.contents("obj").is_none());
    }

    #[tokio::test]
    async fn test_failure_releases_queued_permits() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_uploads(true);
        let client = ObjectClient::from_arc(backend.clone());
        let sem = Arc::new(tokio::sync::Semaphore::new(2));

        let mut pipeline = UploadPipeline::start(client, "obj", None);
        for i in 0..2u64 {
            let permit = BlockPermit {
                transfer: Some(sem.clone().acquire_owned().await.unwrap()),
                file_slot: None,
            };
            pipeline.push(i, Bytes::from_static(b"x"), permit);
        }
        let err = pipeline.finish().await.unwrap_err();
        assert!(err.to_string().contains("injected upload failure"));
        assert_eq!(sem.available_permits(), 2);
    }
}
