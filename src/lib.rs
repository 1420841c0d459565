//! Multipart upload of archives into a vault service that identifies
//! content by its SHA-256 tree hash.

pub mod backend;
pub mod chunker;
pub mod config;
pub mod error;
pub mod memory;
pub mod part;
pub mod session;
pub mod treehash;
pub mod uploader;

pub use backend::{ArchiveReceipt, ByteRange, VaultBackend};
pub use config::{PartSize, RetryPolicy, UploadConfig};
pub use error::{ServiceError, UploadError, UploadFailure};
pub use memory::MemoryVault;
pub use session::UploadState;
pub use treehash::TreeHash;
pub use uploader::{upload_archive, Uploader};
