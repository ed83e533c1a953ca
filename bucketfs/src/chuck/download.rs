//! Download job: one ranged backing-store read covering a run of contiguous
//! missing chunks of one cache entry.
//!
//! The job owns the singleflight leadership of every chunk in its run. Each
//! chunk is persisted and accounted before its leader completes, so a reader
//! that arrives after completion finds it cached instead of starting a second
//! download. Between chunk writes the job checks the entry's cancel token and
//! stops caching (but keeps serving waiters) once the entry is gone.

use super::cache::{CacheEntry, ChunkCache, ChunkId};
use super::observer::JobSummary;
use super::singleflight::Leader;
use crate::vfs::error::SharedError;
use anyhow::bail;
use bytes::Bytes;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct PlannedChunk {
    pub index: u64,
    pub range: Range<u64>,
    pub leader: Leader<ChunkId, Bytes>,
}

pub(crate) struct JobOutput {
    /// Full chunk contents by chunk index.
    pub chunks: Vec<(u64, Bytes)>,
    pub bytes: u64,
}

pub(crate) struct DownloadJob {
    id: u64,
    entry: Arc<CacheEntry>,
    chunks: Vec<PlannedChunk>,
}

impl DownloadJob {
    /// `chunks` must be non-empty and contiguous, in offset order.
    pub fn new(id: u64, entry: Arc<CacheEntry>, chunks: Vec<PlannedChunk>) -> Self {
        debug_assert!(!chunks.is_empty());
        debug_assert!(chunks.windows(2).all(|w| w[0].range.end == w[1].range.start));
        Self { id, entry, chunks }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Byte range covered by the whole run.
    pub fn span(&self) -> Range<u64> {
        let start = self.chunks.first().map_or(0, |c| c.range.start);
        let end = self.chunks.last().map_or(start, |c| c.range.end);
        start..end
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(job = self.id, object = %self.entry.key())
    )]
    pub async fn run(self, cache: Arc<ChunkCache>) -> Result<JobOutput, SharedError> {
        let span = self.span();
        let key = self.entry.key().clone();

        let fetched = async {
            let _permit = cache.download_limiter().acquire_one().await?;
            let data = cache
                .client()
                .read_range(&key.name, key.generation, span.clone())
                .await?;
            if data.len() as u64 != span.end - span.start {
                bail!(
                    "short read of {key} {span:?}: got {} bytes",
                    data.len()
                );
            }
            Ok::<Bytes, anyhow::Error>(data)
        }
        .await;

        let chunk_ranges: Vec<Range<u64>> = self.chunks.iter().map(|c| c.range.clone()).collect();
        let data = match fetched {
            Ok(data) => data,
            Err(e) => {
                let e: SharedError = Arc::new(e);
                cache.observer().on_job(&JobSummary {
                    job_id: self.id,
                    object: key,
                    chunks: chunk_ranges,
                    bytes: 0,
                    ok: false,
                    error: Some(format!("{e:#}")),
                });
                for chunk in self.chunks {
                    chunk.leader.complete(Err(e.clone()));
                }
                return Err(e);
            }
        };

        let mut out = Vec::with_capacity(self.chunks.len());
        for chunk in self.chunks {
            let from = (chunk.range.start - span.start) as usize;
            let to = (chunk.range.end - span.start) as usize;
            let bytes = data.slice(from..to);
            if self.entry.cancel_token().is_cancelled() {
                debug!(chunk = chunk.index, "entry dropped, serving without caching");
            } else {
                cache.store_chunk(&self.entry, chunk.range.clone(), bytes.clone()).await;
            }
            chunk.leader.complete(Ok(bytes.clone()));
            out.push((chunk.index, bytes));
        }

        let bytes = data.len() as u64;
        cache.observer().on_job(&JobSummary {
            job_id: self.id,
            object: key,
            chunks: chunk_ranges,
            bytes,
            ok: true,
            error: None,
        });
        Ok(JobOutput { chunks: out, bytes })
    }
}
