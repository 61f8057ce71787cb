mod db;
mod models;
mod schema;

pub use db::StoreDb;
pub use models::{ChunkRecord, UploadRecord, UploadStatus};
