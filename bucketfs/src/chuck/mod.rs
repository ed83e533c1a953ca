//! Chunked read cache (chuck)
//!
//! Responsibilities:
//! - Map object ranges onto fixed-size chunks (`chunk`, `util`).
//! - Keep downloaded chunks on local disk under a global budget with
//!   whole-object LRU eviction (`cache`, `disk_storage`, `ranges`).
//! - Fetch contiguous missing chunks with one request per run and coalesce
//!   concurrent fetches of the same chunk (`download`, `singleflight`).
//! - Serve read handles, with or without the cache (`reader`).
pub mod cache;
pub mod chunk;
pub mod disk_storage;
pub mod download;
pub mod observer;
pub mod ranges;
pub mod reader;
pub mod singleflight;
pub mod util;

pub use cache::{CacheEntry, ChunkCache};
pub use chunk::{ChunkLayout, ObjectKey};
pub use observer::{FetchRecord, JobSummary, ReadObserver, RecordingObserver, TracingObserver};
pub use reader::{ObjectReader, ReadPath};
