use async_trait::async_trait;
use bytes::Bytes;
use offsite_core::{Error, Result, UploadSession};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

/// Provider calls of a start / append / finish upload session.
#[async_trait]
pub trait SessionTransport: Send {
    /// Sends the first chunk and returns the provider-issued session id.
    async fn start(&mut self, chunk: Bytes) -> Result<String>;

    /// Sends a chunk at `session.offset`.
    async fn append(&mut self, session: &UploadSession, chunk: Bytes) -> Result<()>;

    /// Sends the last chunk at `session.offset` and commits to `session.target`.
    async fn finish(&mut self, session: &UploadSession, chunk: Bytes) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    Start,
    Append,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub step: SessionStep,
    pub offset: u64,
    pub len: u64,
}

/// The ordered calls needed to send `length` bytes in `chunk_size` pieces.
///
/// One start with a full chunk, appends while more than one chunk remains,
/// then a finish carrying exactly the remainder.
pub fn plan_session(length: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    let chunk_size = chunk_size.max(1);
    let first = chunk_size.min(length);
    let mut spans = vec![ChunkSpan {
        step: SessionStep::Start,
        offset: 0,
        len: first,
    }];

    let mut offset = first;
    while length - offset > chunk_size {
        spans.push(ChunkSpan {
            step: SessionStep::Append,
            offset,
            len: chunk_size,
        });
        offset += chunk_size;
    }

    spans.push(ChunkSpan {
        step: SessionStep::Finish,
        offset,
        len: length - offset,
    });
    spans
}

/// Streams `length` bytes from `reader` through `transport` strictly in offset order.
///
/// Any failed step aborts the transfer; the provider discards the orphaned session.
pub async fn upload_in_session<R, T>(
    reader: &mut R,
    length: u64,
    chunk_size: u64,
    target: &str,
    transport: &mut T,
) -> Result<UploadSession>
where
    R: AsyncRead + Unpin + Send,
    T: SessionTransport + ?Sized,
{
    let mut session: Option<UploadSession> = None;

    for span in plan_session(length, chunk_size) {
        let chunk = read_chunk(reader, span.len).await?;

        match span.step {
            SessionStep::Start => {
                let session_id = transport.start(chunk).await?;
                debug!(session_id = %session_id, remote = target, length, "Started upload session");
                session = Some(UploadSession {
                    session_id,
                    offset: 0,
                    target: target.to_string(),
                    chunk_size,
                });
            }
            SessionStep::Append | SessionStep::Finish => {
                let current = session
                    .as_ref()
                    .ok_or_else(|| Error::Protocol("upload session was never started".to_string()))?;
                debug_assert_eq!(current.offset, span.offset);
                if span.step == SessionStep::Append {
                    transport.append(current, chunk).await?;
                } else {
                    transport.finish(current, chunk).await?;
                }
            }
        }

        if let Some(current) = session.as_mut() {
            current.offset += span.len;
            debug_assert!(current.offset <= length);
            debug!(offset = current.offset, length, "Upload session progress");
        }
    }

    session.ok_or_else(|| Error::Protocol("upload session was never started".to_string()))
}

async fn read_chunk<R>(reader: &mut R, len: u64) -> Result<Bytes>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
