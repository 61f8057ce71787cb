use serde::{Deserialize, Serialize};

/// Lifecycle of an upload. UPLOADING may move to PROCESSING or FAILED;
/// PROCESSING may move to COMPLETED or FAILED; the last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Uploading => "UPLOADING",
            UploadStatus::Processing => "PROCESSING",
            UploadStatus::Completed => "COMPLETED",
            UploadStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "UPLOADING" => Some(UploadStatus::Uploading),
            "PROCESSING" => Some(UploadStatus::Processing),
            "COMPLETED" => Some(UploadStatus::Completed),
            "FAILED" => Some(UploadStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Failed)
    }
}

/// One transfer attempt for one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: String,
    /// Client-supplied name. Never used to build filesystem paths.
    pub filename: String,
    pub total_size: i64,
    pub total_chunks: i64,
    pub status: UploadStatus,
    /// Lowercase hex SHA-256, present exactly when status is COMPLETED.
    pub final_hash: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Durable receipt for one chunk index. Absence means not yet uploaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub upload_id: String,
    pub chunk_index: i64,
    pub status: String,
    pub received_at: i64,
}

/// The only chunk status the store records; receipt is an upsert.
pub const CHUNK_UPLOADED: &str = "UPLOADED";
