//! Backing object store adapters (cAdapter)
//!
//! Submodules:
//! - `client`: the `ObjectBackend` trait and the `ObjectClient` wrapper used by
//!   the upload pipeline and download jobs
//! - `localfs`: directory-backed store for single-node use and tests
//! - `memory`: in-memory store with fault injection, for tests
//!
//! Retries and backoff belong to concrete backends, not to the callers.
pub mod client;
pub mod localfs;
pub mod memory;
