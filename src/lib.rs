//! chunkferry: resumable chunked file transfer.
//!
//! The server side assembles uploads from out-of-order chunk PUTs into
//! sparse blobs with durable per-chunk records and finalizes them with a
//! single-winner hash-and-commit. The client side ([`engine`]) schedules a
//! bounded worker pool over a chunk plan with retry, pause/resume, and
//! progress events.

pub mod api;
pub mod blob;
pub mod config;
pub mod engine;
pub mod finalizer;
pub mod logging;
pub mod store;
pub mod sweep;
