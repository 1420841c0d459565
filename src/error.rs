use std::fmt;
use std::io;

use crate::backend::ByteRange;
use crate::session::UploadState;
use crate::treehash::TreeHash;

/// The archive could not be read.
#[derive(Debug, thiserror::Error)]
#[error("failed to read archive at byte offset {offset}")]
pub struct ReadError {
    pub offset: u64,
    #[source]
    pub source: io::Error,
}

/// A tree hash was requested over zero digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot compute a tree hash over zero digests")]
pub struct EmptyInputError;

/// An error reported by the storage service.
///
/// The backend decides whether the failure is worth retrying (throttling,
/// transient server errors) or not (authorization, unknown upload, bad
/// request).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ServiceError {
    pub retryable: bool,
    pub message: String,
}

impl ServiceError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// What a mismatching checksum was computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumScope {
    Part(ByteRange),
    Archive,
}

impl fmt::Display for ChecksumScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Part(range) => write!(f, "part {range}"),
            Self::Archive => f.write_str("archive"),
        }
    }
}

/// The service computed a different checksum than the one we sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("checksum mismatch for {scope}: sent {expected}, service computed {actual}")]
pub struct ChecksumMismatchError {
    pub scope: ChecksumScope,
    pub expected: TreeHash,
    pub actual: TreeHash,
}

#[derive(Debug, thiserror::Error)]
pub enum PartFailure {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    ChecksumMismatch(#[from] ChecksumMismatchError),

    #[error(transparent)]
    EmptyInput(#[from] EmptyInputError),
}

/// A single part could not be uploaded.
#[derive(Debug, thiserror::Error)]
#[error("upload of part {range} failed after {attempts} attempt(s)")]
pub struct PartUploadError {
    pub range: ByteRange,
    pub attempts: u32,
    /// The tree hash, if hashing got that far.
    pub tree_hash: Option<TreeHash>,
    #[source]
    pub cause: PartFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("part size {0} is not a power of two")]
    PartSizeNotPowerOfTwo(u64),

    #[error("part size {size} is outside of {min}..={max}")]
    PartSizeOutOfRange { size: u64, min: u64, max: u64 },

    #[error("invalid part size {0:?}")]
    InvalidPartSize(String),

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("retry policy must allow at least one attempt")]
    ZeroAttempts,
}

/// The part list of a session does not describe a complete upload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("part {index} ({range}) has not been uploaded")]
    PartNotUploaded { index: usize, range: ByteRange },

    #[error("part {index} starts at byte {found}, expected {expected}")]
    Discontiguous {
        index: usize,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    EmptyInput(#[from] EmptyInputError),
}

/// The first fatal cause that ended an upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadFailure {
    #[error("invalid configuration")]
    Config(#[from] ConfigError),

    #[error("archive is empty")]
    EmptyArchive,

    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("{operation} failed after {attempts} attempt(s)")]
    Service {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: ServiceError,
    },

    #[error(transparent)]
    Part(#[from] PartUploadError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    ChecksumMismatch(#[from] ChecksumMismatchError),

    #[error("part upload task panicked")]
    Worker(#[from] tokio::task::JoinError),

    #[error("upload was cancelled")]
    Cancelled,
}

/// Error returned to callers of the uploader.
#[derive(Debug, thiserror::Error)]
#[error("upload {} ended in state {state:?}", .upload_id.as_deref().unwrap_or("<not initiated>"))]
pub struct UploadError {
    pub upload_id: Option<String>,
    pub state: UploadState,
    #[source]
    pub cause: UploadFailure,
}

impl UploadError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, UploadFailure::Cancelled)
    }
}
