use core::fmt;

use serde::Serialize;

use crate::config::PartSize;
use crate::error::ServiceError;
use crate::treehash::TreeHash;

/// A contiguous, non-empty byte range `[offset, offset + len)` of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Renders the range as a `Content-Range` header value, `bytes 0-1023/*`.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/*", self.offset, self.end().saturating_sub(1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.offset, self.end())
    }
}

/// What the service hands back once an archive has been assembled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveReceipt {
    pub archive_id: String,
    pub location: String,
    pub checksum: TreeHash,
}

/// The multipart-upload operations of a cold-storage vault service.
///
/// Implementations own transport, authentication and per-call timeouts, and
/// classify their failures as retryable or fatal.
#[async_trait::async_trait]
pub trait VaultBackend: Send + Sync {
    /// Starts a multipart upload and returns its upload id.
    async fn initiate_upload(&self, vault: &str, part_size: PartSize)
        -> Result<String, ServiceError>;

    /// Uploads one part and returns the checksum the service computed for it.
    async fn upload_part(
        &self,
        upload_id: &str,
        vault: &str,
        range: ByteRange,
        tree_hash: TreeHash,
        data: &[u8],
    ) -> Result<TreeHash, ServiceError>;

    async fn complete_upload(
        &self,
        upload_id: &str,
        vault: &str,
        tree_hash: TreeHash,
        archive_len: u64,
    ) -> Result<ArchiveReceipt, ServiceError>;

    async fn abort_upload(&self, upload_id: &str, vault: &str) -> Result<(), ServiceError>;
}
