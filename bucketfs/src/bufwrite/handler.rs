//! Buffered write handler: one per file open for create or append.
//!
//! Writes fill the active block of a [`BlockStore`]. Every block that becomes
//! full is handed to the [`UploadPipeline`] together with one permit from the
//! shared transfer limiter and one from the per-file slot pool, which bounds
//! resident memory to `max_blocks * block_size` per file. `flush` hands off the
//! trailing block and waits for the backend to publish the object.

use super::block::{Block, BlockStore};
use super::upload::{BlockPermit, UploadPipeline};
use crate::cadapter::client::ObjectClient;
use crate::limiter::Limiter;
use crate::vfs::config::WriteConfig;
use crate::vfs::error::{SharedError, VfsError, VfsResult};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consistent snapshot of a file being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteFileInfo {
    pub mtime: SystemTime,
    pub total_size: u64,
}

#[derive(Debug)]
enum Phase {
    Open,
    Finalized(i64),
    Failed(SharedError),
    Abandoned,
}

struct WriteState {
    blocks: BlockStore,
    pipeline: Option<UploadPipeline>,
    phase: Phase,
}

pub struct BufferedWriteHandler {
    name: String,
    base_generation: Option<i64>,
    client: ObjectClient,
    limiter: Limiter,
    file_slots: Arc<Semaphore>,
    max_blocks: u32,
    state: tokio::sync::Mutex<WriteState>,
    info: Mutex<WriteFileInfo>,
    stale: AtomicBool,
}

impl BufferedWriteHandler {
    /// Handler for a new object named `name`.
    pub fn create(name: &str, cfg: &WriteConfig, client: ObjectClient, limiter: Limiter) -> Self {
        Self::with_base(name, None, 0, cfg, client, limiter)
    }

    /// Handler appending to generation `generation` of an object of `size` bytes.
    pub fn append(
        name: &str,
        generation: i64,
        size: u64,
        cfg: &WriteConfig,
        client: ObjectClient,
        limiter: Limiter,
    ) -> Self {
        Self::with_base(name, Some(generation), size, cfg, client, limiter)
    }

    fn with_base(
        name: &str,
        base_generation: Option<i64>,
        size: u64,
        cfg: &WriteConfig,
        client: ObjectClient,
        limiter: Limiter,
    ) -> Self {
        let max_blocks = cfg.max_blocks.max(1);
        Self {
            name: name.to_string(),
            base_generation,
            client,
            limiter,
            file_slots: Arc::new(Semaphore::new(max_blocks as usize)),
            max_blocks,
            state: tokio::sync::Mutex::new(WriteState {
                blocks: BlockStore::new(cfg.block_size.max(1), size),
                pipeline: None,
                phase: Phase::Open,
            }),
            info: Mutex::new(WriteFileInfo {
                mtime: SystemTime::now(),
                total_size: size,
            }),
            stale: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn write_file_info(&self) -> WriteFileInfo {
        *self.info.lock().unwrap()
    }

    pub fn set_mtime(&self, mtime: SystemTime) {
        self.info.lock().unwrap().mtime = mtime;
    }

    /// Mark the local file as removed. The next flush publishes nothing.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    /// Blocks allocated since the handler was opened.
    pub async fn block_count(&self) -> usize {
        self.state.lock().await.blocks.allocated()
    }

    /// Write `data` at `offset`.
    ///
    /// `cancel` is honoured until the first byte is applied; after that the
    /// write runs to completion so `total_size` never reflects half a write.
    #[tracing::instrument(
        level = "trace",
        skip(self, data, cancel),
        fields(name = %self.name, len = data.len())
    )]
    pub async fn write(
        &self,
        data: &[u8],
        offset: u64,
        cancel: &CancellationToken,
    ) -> VfsResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(VfsError::Cancelled);
        }

        let mut st = self.state.lock().await;
        match &st.phase {
            Phase::Open => {}
            Phase::Finalized(_) => return Err(VfsError::Finalized),
            Phase::Failed(e) => return Err(VfsError::UploadFailure(e.clone())),
            Phase::Abandoned => return Err(VfsError::StaleHandle),
        }
        st.blocks.check_offset(offset)?;

        let block_size = st.blocks.block_size();
        let per_round = self.max_blocks.min(self.limiter.capacity()) as u64;
        let never = CancellationToken::new();
        let end = offset + data.len() as u64;
        let mut pos = offset;
        let mut first = true;

        while pos < end {
            let rest = &data[(pos - offset) as usize..];
            let k = st.blocks.completions_until(end).min(per_round);
            if k == 0 {
                let done = st.blocks.write(pos, rest);
                debug_assert!(done.is_empty());
                break;
            }

            let token = if first { cancel } else { &never };
            let permits = self.admit(k as u32, token).await?;
            first = false;

            let limit = st.blocks.flushed_boundary() + k * block_size;
            let done = if pos >= limit {
                st.blocks.pad_to(limit)
            } else {
                let n = (limit - pos) as usize;
                let done = st.blocks.write(pos, &rest[..n]);
                pos = limit;
                done
            };
            self.hand_off(&mut st, done, permits);
        }

        let high = st.blocks.high_water();
        let mut info = self.info.lock().unwrap();
        info.total_size = info.total_size.max(high);
        info.mtime = SystemTime::now();
        Ok(())
    }

    /// Wait for `n` transfer permits and `n` per-file slots.
    async fn admit(
        &self,
        n: u32,
        cancel: &CancellationToken,
    ) -> VfsResult<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let transfer = self.limiter.acquire(n, cancel).await?;
        let slots = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(VfsError::Cancelled),
            p = self.file_slots.clone().acquire_many_owned(n) => {
                p.map_err(|_| VfsError::Anyhow(anyhow::anyhow!("write slots closed")))?
            }
        };
        Ok((transfer, slots))
    }

    fn hand_off(
        &self,
        st: &mut WriteState,
        done: Vec<Block>,
        (transfer, slots): (OwnedSemaphorePermit, OwnedSemaphorePermit),
    ) {
        let (mut transfer, mut slots) = (Some(transfer), Some(slots));
        let count = done.len();
        for (i, block) in done.into_iter().enumerate() {
            let permit = if i + 1 == count {
                BlockPermit {
                    transfer: transfer.take(),
                    file_slot: slots.take(),
                }
            } else {
                BlockPermit {
                    transfer: transfer.as_mut().and_then(|p| p.split(1)),
                    file_slot: slots.as_mut().and_then(|p| p.split(1)),
                }
            };
            self.push_block(st, block, permit);
        }
    }

    fn push_block(&self, st: &mut WriteState, block: Block, permit: BlockPermit) {
        let client = &self.client;
        let pipeline = st.pipeline.get_or_insert_with(|| {
            debug!(name = %self.name, base = ?self.base_generation, "starting upload");
            UploadPipeline::start(client.clone(), &self.name, self.base_generation)
        });
        let offset = block.start();
        if !pipeline.push(offset, block.freeze(), permit) {
            // the upload already failed; the error is reported by flush
            debug!(name = %self.name, offset, "dropping block for dead upload");
        }
    }

    /// Hand off the trailing block and wait until the object is published.
    ///
    /// Returns the published generation. Calling it again after success is a
    /// no-op returning the same generation.
    ///
    /// An upload failure is final for this handler: blocks already streamed
    /// are gone, and later calls keep returning the same `UploadFailure`.
    /// Retrying means writing the file again through a new handler.
    pub async fn flush(&self) -> VfsResult<i64> {
        self.finalize().await.map(|(generation, _)| generation)
    }

    /// Like [`flush`](Self::flush), also telling whether this call is the
    /// one that published the object.
    #[tracing::instrument(level = "debug", skip(self), fields(name = %self.name))]
    pub(crate) async fn finalize(&self) -> VfsResult<(i64, bool)> {
        let mut st = self.state.lock().await;
        match &st.phase {
            Phase::Open => {}
            Phase::Finalized(generation) => return Ok((*generation, false)),
            Phase::Failed(e) => return Err(VfsError::UploadFailure(e.clone())),
            Phase::Abandoned => return Err(VfsError::StaleHandle),
        }

        if self.is_stale() {
            self.abort_locked(&mut st).await;
            info!(name = %self.name, "flush of unlinked file skipped");
            return Err(VfsError::StaleHandle);
        }

        let never = CancellationToken::new();
        if let Some(tail) = st.blocks.take_trailing() {
            let permits = self.admit(1, &never).await?;
            self.hand_off(&mut st, vec![tail], permits);
        }
        let client = &self.client;
        let pipeline = st.pipeline.get_or_insert_with(|| {
            UploadPipeline::start(client.clone(), &self.name, self.base_generation)
        });
        let sent = pipeline.blocks_sent();
        match pipeline.finish().await {
            Ok(generation) => {
                info!(name = %self.name, generation, blocks = sent, "object published");
                st.phase = Phase::Finalized(generation);
                Ok((generation, true))
            }
            Err(e) => {
                warn!(name = %self.name, "flush failed: {e:#}");
                st.phase = Phase::Failed(e.clone());
                Err(VfsError::UploadFailure(e))
            }
        }
    }

    /// Abort pending uploads and release buffered memory without publishing.
    pub async fn abandon(&self) {
        let mut st = self.state.lock().await;
        if matches!(st.phase, Phase::Open) {
            self.abort_locked(&mut st).await;
        }
    }

    async fn abort_locked(&self, st: &mut WriteState) {
        st.blocks.discard();
        if let Some(mut pipeline) = st.pipeline.take() {
            pipeline.abort().await;
        }
        st.phase = Phase::Abandoned;
    }
}
