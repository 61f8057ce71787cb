//! Streaming chunk reads and the per-chunk PUT dispatch.

use crate::engine::error::{UploadError, UploadResult};
use crate::engine::plan::ChunkSlot;
use bytes::Bytes;
use futures::Stream;
use reqwest::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt, BufReader, ReadBuf, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Buffer size for streaming reads (64KB)
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// A limited async reader yielding exactly one chunk's byte range. The file
/// is read as a stream; the chunk is never held in memory whole.
pub struct ChunkReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl ChunkReader {
    pub async fn new(path: &Path, offset: u64, size: u64) -> io::Result<Self> {
        let file = File::open(path).await?;
        let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, file);
        reader.seek(SeekFrom::Start(offset)).await?;

        Ok(Self {
            reader,
            remaining: size,
        })
    }
}

impl AsyncRead for ChunkReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.remaining == 0 {
            return Poll::Ready(Ok(()));
        }

        // Never read past the end of this chunk's range.
        let max_read = (self.remaining as usize).min(buf.remaining());
        let mut limited_buf = buf.take(max_read);
        let before = limited_buf.filled().len();

        let reader = Pin::new(&mut self.reader);
        match reader.poll_read(cx, &mut limited_buf) {
            Poll::Ready(Ok(())) => {
                let bytes_read = limited_buf.filled().len() - before;
                if bytes_read == 0 {
                    // EOF reached
                    return Poll::Ready(Ok(()));
                }

                unsafe {
                    buf.assume_init(bytes_read);
                }
                buf.advance(bytes_read);
                self.remaining -= bytes_read as u64;

                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// A stream of the chunk's bytes, backed by [`ChunkReader`].
pub struct ChunkStream {
    inner: ReaderStream<ChunkReader>,
}

impl ChunkStream {
    pub async fn from_slot(path: &Path, slot: &ChunkSlot) -> io::Result<Self> {
        let reader = ChunkReader::new(path, slot.start, slot.len()).await?;
        Ok(Self {
            inner: ReaderStream::with_capacity(reader, STREAM_BUFFER_SIZE),
        })
    }
}

impl Stream for ChunkStream {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Issues the idempotent chunk PUT. The offset header is what the server
/// writes by; the index header identifies the chunk record.
pub struct ChunkDispatcher {
    http: HttpClient,
    base_url: String,
}

impl ChunkDispatcher {
    pub fn new(http: HttpClient, base_url: String) -> Self {
        Self { http, base_url }
    }

    pub async fn put_chunk(
        &self,
        path: &Path,
        upload_id: &str,
        slot: &ChunkSlot,
    ) -> UploadResult<()> {
        let stream = ChunkStream::from_slot(path, slot)
            .await
            .map_err(|err| UploadError::FileRead(err.to_string()))?;

        let url = format!(
            "{}/api/upload/{}/chunk/{}",
            self.base_url, upload_id, slot.index
        );
        let response = self
            .http
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("X-Chunk-Index", slot.index)
            .header("X-Chunk-Offset", slot.start)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(
                target: "engine::chunk",
                chunk = slot.index,
                offset = slot.start,
                len = slot.len(),
                "Chunk accepted"
            );
            return Ok(());
        }

        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(UploadError::Rejected {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(UploadError::Network(format!(
                "server returned {status}: {message}"
            )))
        }
    }
}
