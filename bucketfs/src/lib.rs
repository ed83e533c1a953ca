// Library crate for bucketfs: buffered writes and a chunked read cache over a
// versioned object store. Re-exports modules for the CLI and integration tests.

pub mod bufwrite;
pub mod cadapter;
pub mod chuck;
pub mod limiter;
pub mod vfs;

pub use vfs::Vfs;
pub use vfs::config::Config;
pub use vfs::error::{VfsError, VfsResult};
