use super::models::{CHUNK_UPLOADED, ChunkRecord, UploadRecord, UploadStatus};
use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use diesel::OptionalExtension;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{EmbeddedMigrations, MigrationHarness, embed_migrations};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use super::schema::chunks::{self, dsl as chunks_dsl};
use super::schema::uploads::{self, dsl as uploads_dsl};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("./migrations/store");

/// SQLite-backed store for upload and chunk records, managed by Diesel.
pub struct StoreDb {
    pool: Arc<Pool<ConnectionManager<SqliteConnection>>>,
}

impl StoreDb {
    /// Create or open the store at a specific path.
    /// The schema is migrated to the latest version on startup.
    pub fn with_path(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create store parent dir {}", parent.display()))?;
        }

        let database_url = path
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("Invalid store database path"))?;

        run_migrations(&database_url)?;

        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .context("Failed to build store connection pool")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn connection(&self) -> Result<PooledConnection<ConnectionManager<SqliteConnection>>> {
        self.pool
            .get()
            .context("Failed to get connection from store pool")
    }

    /// Insert a new upload in UPLOADING state and return its record.
    pub fn insert_upload(
        &self,
        filename: &str,
        total_size: i64,
        total_chunks: i64,
    ) -> Result<UploadRecord> {
        let now = Utc::now().timestamp();
        let record = UploadRecord {
            id: Uuid::new_v4().to_string(),
            filename: filename.to_string(),
            total_size,
            total_chunks,
            status: UploadStatus::Uploading,
            final_hash: None,
            created_at: now,
            updated_at: now,
        };

        let mut conn = self.connection()?;
        diesel::insert_into(uploads::table)
            .values(NewUploadRow::from_record(&record))
            .execute(&mut conn)
            .context("Failed to insert upload record")?;
        Ok(record)
    }

    pub fn get_upload(&self, upload_id: &str) -> Result<Option<UploadRecord>> {
        let mut conn = self.connection()?;
        let row = uploads_dsl::uploads
            .filter(uploads_dsl::id.eq(upload_id))
            .first::<UploadRow>(&mut conn)
            .optional()
            .context("Failed to query upload record")?;

        row.map(UploadRecord::try_from).transpose()
    }

    /// Find an upload a restarted client may reattach to. Resume equivalence
    /// is by `(filename, total_size)`; only UPLOADING records qualify, since a
    /// PROCESSING one is already in the finalizer's hands.
    pub fn find_resumable(&self, filename: &str, total_size: i64) -> Result<Option<UploadRecord>> {
        let mut conn = self.connection()?;
        let row = uploads_dsl::uploads
            .filter(uploads_dsl::filename.eq(filename))
            .filter(uploads_dsl::total_size.eq(total_size))
            .filter(uploads_dsl::status.eq(UploadStatus::Uploading.as_str()))
            .order(uploads_dsl::created_at.desc())
            .first::<UploadRow>(&mut conn)
            .optional()
            .context("Failed to query resumable upload")?;

        row.map(UploadRecord::try_from).transpose()
    }

    /// List the chunk indices already received for an upload, ascending.
    pub fn uploaded_chunks(&self, upload_id: &str) -> Result<Vec<i64>> {
        let mut conn = self.connection()?;
        chunks_dsl::chunks
            .filter(chunks_dsl::upload_id.eq(upload_id))
            .order(chunks_dsl::chunk_index.asc())
            .select(chunks_dsl::chunk_index)
            .load(&mut conn)
            .context("Failed to list uploaded chunk indices")
    }

    pub fn chunk_count(&self, upload_id: &str) -> Result<i64> {
        let mut conn = self.connection()?;
        chunks_dsl::chunks
            .filter(chunks_dsl::upload_id.eq(upload_id))
            .count()
            .get_result(&mut conn)
            .context("Failed to count chunk records")
    }

    /// Record receipt of a chunk. Re-uploading the same index refreshes the
    /// existing row, so the outcome matches a first upload.
    pub fn upsert_chunk(&self, upload_id: &str, chunk_index: i64) -> Result<()> {
        let now = Utc::now().timestamp();
        let row = ChunkRow {
            upload_id: upload_id.to_string(),
            chunk_index,
            status: CHUNK_UPLOADED.to_string(),
            received_at: now,
        };

        let mut conn = self.connection()?;
        diesel::insert_into(chunks::table)
            .values(&row)
            .on_conflict((chunks::upload_id, chunks::chunk_index))
            .do_update()
            .set((
                chunks::status.eq(CHUNK_UPLOADED),
                chunks::received_at.eq(now),
            ))
            .execute(&mut conn)
            .context("Failed to upsert chunk record")?;

        // Keep the upload's freshness current so the stale sweep never
        // touches a transfer that is still receiving chunks.
        diesel::update(uploads_dsl::uploads.filter(uploads_dsl::id.eq(upload_id)))
            .set(uploads_dsl::updated_at.eq(now))
            .execute(&mut conn)
            .context("Failed to touch upload record")?;
        Ok(())
    }

    /// Drop all chunk records for an upload (blob-lost recovery on init).
    pub fn delete_chunks(&self, upload_id: &str) -> Result<usize> {
        let mut conn = self.connection()?;
        diesel::delete(chunks_dsl::chunks.filter(chunks_dsl::upload_id.eq(upload_id)))
            .execute(&mut conn)
            .context("Failed to delete chunk records")
    }

    /// Atomically claim the UPLOADING → PROCESSING transition. The affected
    /// row count decides the single finalize winner; losers see `false` and
    /// must re-load the record to learn whether it is PROCESSING or COMPLETED.
    pub fn claim_processing(&self, upload_id: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected = diesel::update(
            uploads_dsl::uploads
                .filter(uploads_dsl::id.eq(upload_id))
                .filter(uploads_dsl::status.eq(UploadStatus::Uploading.as_str())),
        )
        .set((
            uploads_dsl::status.eq(UploadStatus::Processing.as_str()),
            uploads_dsl::updated_at.eq(Utc::now().timestamp()),
        ))
        .execute(&mut conn)
        .context("Failed to claim upload for processing")?;
        Ok(affected == 1)
    }

    /// PROCESSING → COMPLETED with the verified digest.
    pub fn complete_upload(&self, upload_id: &str, final_hash: &str) -> Result<bool> {
        let mut conn = self.connection()?;
        let affected = diesel::update(
            uploads_dsl::uploads
                .filter(uploads_dsl::id.eq(upload_id))
                .filter(uploads_dsl::status.eq(UploadStatus::Processing.as_str())),
        )
        .set((
            uploads_dsl::status.eq(UploadStatus::Completed.as_str()),
            uploads_dsl::final_hash.eq(final_hash),
            uploads_dsl::updated_at.eq(Utc::now().timestamp()),
        ))
        .execute(&mut conn)
        .context("Failed to complete upload")?;
        Ok(affected == 1)
    }

    /// Move a non-terminal upload to FAILED.
    pub fn fail_upload(&self, upload_id: &str) -> Result<bool> {
        let active = [
            UploadStatus::Uploading.as_str(),
            UploadStatus::Processing.as_str(),
        ];

        let mut conn = self.connection()?;
        let affected = diesel::update(
            uploads_dsl::uploads
                .filter(uploads_dsl::id.eq(upload_id))
                .filter(uploads_dsl::status.eq_any(active)),
        )
        .set((
            uploads_dsl::status.eq(UploadStatus::Failed.as_str()),
            uploads_dsl::updated_at.eq(Utc::now().timestamp()),
        ))
        .execute(&mut conn)
        .context("Failed to fail upload")?;
        Ok(affected == 1)
    }

    /// List UPLOADING uploads not touched since `cutoff` (unix seconds,
    /// inclusive).
    pub fn stale_uploading(&self, cutoff: i64) -> Result<Vec<UploadRecord>> {
        let mut conn = self.connection()?;
        let rows = uploads_dsl::uploads
            .filter(uploads_dsl::status.eq(UploadStatus::Uploading.as_str()))
            .filter(uploads_dsl::updated_at.le(cutoff))
            .order(uploads_dsl::created_at.asc())
            .load::<UploadRow>(&mut conn)
            .context("Failed to query stale uploads")?;

        rows.into_iter()
            .map(UploadRecord::try_from)
            .collect::<Result<Vec<_>>>()
    }

    /// Chunk records for an upload, used by resume diagnostics.
    #[allow(dead_code)]
    pub fn chunk_records(&self, upload_id: &str) -> Result<Vec<ChunkRecord>> {
        let mut conn = self.connection()?;
        let rows = chunks_dsl::chunks
            .filter(chunks_dsl::upload_id.eq(upload_id))
            .order(chunks_dsl::chunk_index.asc())
            .load::<ChunkRow>(&mut conn)
            .context("Failed to query chunk records")?;

        Ok(rows.into_iter().map(ChunkRecord::from).collect())
    }
}

fn run_migrations(database_url: &str) -> Result<()> {
    let mut conn = SqliteConnection::establish(database_url)
        .with_context(|| format!("Failed to open store database at {}", database_url))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|err| anyhow!("Failed to run store database migrations: {err}"))?;
    Ok(())
}

#[derive(Queryable)]
struct UploadRow {
    id: String,
    filename: String,
    total_size: i64,
    total_chunks: i64,
    status: String,
    final_hash: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<UploadRow> for UploadRecord {
    type Error = anyhow::Error;

    fn try_from(row: UploadRow) -> Result<Self> {
        let status = UploadStatus::from_str(&row.status)
            .ok_or_else(|| anyhow!("Unknown upload status value {}", row.status))?;

        Ok(UploadRecord {
            id: row.id,
            filename: row.filename,
            total_size: row.total_size,
            total_chunks: row.total_chunks,
            status,
            final_hash: row.final_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = uploads)]
struct NewUploadRow {
    id: String,
    filename: String,
    total_size: i64,
    total_chunks: i64,
    status: String,
    final_hash: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl NewUploadRow {
    fn from_record(record: &UploadRecord) -> Self {
        Self {
            id: record.id.clone(),
            filename: record.filename.clone(),
            total_size: record.total_size,
            total_chunks: record.total_chunks,
            status: record.status.as_str().to_string(),
            final_hash: record.final_hash.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = chunks)]
struct ChunkRow {
    upload_id: String,
    chunk_index: i64,
    status: String,
    received_at: i64,
}

impl From<ChunkRow> for ChunkRecord {
    fn from(row: ChunkRow) -> Self {
        ChunkRecord {
            upload_id: row.upload_id,
            chunk_index: row.chunk_index,
            status: row.status,
            received_at: row.received_at,
        }
    }
}
