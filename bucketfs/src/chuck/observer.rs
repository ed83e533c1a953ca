//! Structured records about reads and download jobs.

use super::chunk::ObjectKey;
use std::ops::Range;
use std::sync::Mutex;
use tracing::{info, warn};

/// One served read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    pub object: ObjectKey,
    pub requested: Range<u64>,
    /// Every byte came from the local cache.
    pub hit: bool,
    /// Bytes fetched from the backing store by jobs this read started.
    pub bytes_downloaded: u64,
    /// Jobs started or joined by this read.
    pub job_ids: Vec<u64>,
}

/// Outcome of one download job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub job_id: u64,
    pub object: ObjectKey,
    pub chunks: Vec<Range<u64>>,
    pub bytes: u64,
    pub ok: bool,
    pub error: Option<String>,
}

pub trait ReadObserver: Send + Sync {
    fn on_fetch(&self, record: &FetchRecord);
    fn on_job(&self, summary: &JobSummary);
}

/// Emits records as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ReadObserver for TracingObserver {
    fn on_fetch(&self, r: &FetchRecord) {
        info!(
            target: "bucketfs::read",
            object = %r.object,
            start = r.requested.start,
            end = r.requested.end,
            hit = r.hit,
            bytes_downloaded = r.bytes_downloaded,
            jobs = ?r.job_ids,
            "read served"
        );
    }

    fn on_job(&self, s: &JobSummary) {
        if s.ok {
            info!(
                target: "bucketfs::read",
                job = s.job_id,
                object = %s.object,
                chunks = s.chunks.len(),
                bytes = s.bytes,
                "download job finished"
            );
        } else {
            warn!(
                target: "bucketfs::read",
                job = s.job_id,
                object = %s.object,
                error = s.error.as_deref().unwrap_or(""),
                "download job failed"
            );
        }
    }
}

/// Keeps every record in memory; handy for assertions.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    fetches: Mutex<Vec<FetchRecord>>,
    jobs: Mutex<Vec<JobSummary>>,
}

impl RecordingObserver {
    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.fetches.lock().unwrap().clone()
    }

    pub fn jobs(&self) -> Vec<JobSummary> {
        self.jobs.lock().unwrap().clone()
    }
}

impl ReadObserver for RecordingObserver {
    fn on_fetch(&self, record: &FetchRecord) {
        self.fetches.lock().unwrap().push(record.clone());
    }

    fn on_job(&self, summary: &JobSummary) {
        self.jobs.lock().unwrap().push(summary.clone());
    }
}
