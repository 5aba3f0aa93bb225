use crate::retry::{RetryConfig, retry_with_backoff};
use async_trait::async_trait;
use bytes::Bytes;
use offsite_core::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name of the marker that triggers server-side assembly when moved.
pub const ASSEMBLY_MARKER: &str = ".file";

/// Remote operations used to upload a file as byte-range fragments.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    async fn create_collection(&self, url: &str) -> Result<()>;

    async fn put_fragment(&self, url: &str, data: Bytes) -> Result<()>;

    async fn move_resource(&self, from: &str, to: &str) -> Result<()>;

    async fn delete_resource(&self, url: &str) -> Result<()>;
}

/// `start-end` as two 20-digit zero-padded inclusive offsets, so lexicographic
/// order equals byte order.
pub fn fragment_name(start: u64, end: u64) -> String {
    format!("{:020}-{:020}", start, end)
}

/// Uploads files into a staging directory as named fragments, then asks the
/// server to assemble them at the destination.
#[derive(Debug, Clone)]
pub struct FragmentUpload {
    staging_root: String,
    chunk_size: u64,
    retry: RetryConfig,
}

impl FragmentUpload {
    pub fn new(staging_root: impl Into<String>, chunk_size: u64) -> Self {
        Self {
            staging_root: staging_root.into().trim_end_matches('/').to_string(),
            chunk_size: chunk_size.max(1),
            retry: RetryConfig::fragment(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn staging_root(&self) -> &str {
        &self.staging_root
    }

    /// Uploads `length` bytes from `reader` to `target`. The staging directory is
    /// removed again if anything fails.
    pub async fn run<R, S>(&self, reader: &mut R, length: u64, target: &str, store: &S) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        S: FragmentStore + ?Sized,
    {
        let staging = format!("{}/{}", self.staging_root, Uuid::new_v4());
        store.create_collection(&staging).await?;
        debug!(staging = %staging, remote = target, "Created staging directory");

        match self.transfer(reader, length, &staging, target, store).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(cleanup) = store.delete_resource(&staging).await {
                    warn!(staging = %staging, error = %cleanup, "Failed to remove staging directory");
                }
                Err(e)
            }
        }
    }

    async fn transfer<R, S>(
        &self,
        reader: &mut R,
        length: u64,
        staging: &str,
        target: &str,
        store: &S,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
        S: FragmentStore + ?Sized,
    {
        let mut position = 0u64;
        while position < length {
            let size = self.chunk_size.min(length - position);
            let mut buf = vec![0u8; size as usize];
            reader.read_exact(&mut buf).await?;
            let data = Bytes::from(buf);

            let url = format!("{}/{}", staging, fragment_name(position, position + size - 1));
            let url = url.as_str();
            retry_with_backoff(&self.retry, "fragment upload", move || {
                store.put_fragment(url, data.clone())
            })
            .await?;

            position += size;
            debug!(position, length, "Uploaded fragment");
        }

        let marker = format!("{}/{}", staging, ASSEMBLY_MARKER);
        match store.move_resource(&marker, target).await {
            Ok(()) => Ok(()),
            Err(e) if e.status() == Some(504) => {
                info!(target_url = target, "Assembly timed out at the gateway, assuming it completes");
                Ok(())
            }
            Err(e) => Err(Error::Backend(format!("Failed to assemble {}: {}", target, e))),
        }
    }
}
