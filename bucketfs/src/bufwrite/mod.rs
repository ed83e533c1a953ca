//! Buffered write path: block window, write handler and upload pipeline.

pub mod block;
pub mod handler;
pub mod upload;

pub use handler::{BufferedWriteHandler, WriteFileInfo};
