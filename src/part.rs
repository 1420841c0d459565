//! Hashing and uploading of a single part.

use std::future::Future;

use tracing::{debug, warn};

use crate::backend::{ByteRange, VaultBackend};
use crate::chunker::Part;
use crate::config::RetryPolicy;
use crate::error::{
    ChecksumMismatchError, ChecksumScope, PartFailure, PartUploadError, ServiceError,
};
use crate::treehash::{self, TreeHash};

/// A successfully uploaded part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub index: usize,
    pub range: ByteRange,
    /// The tree hash that was sent along with the part bytes.
    pub tree_hash: TreeHash,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts.
///
/// Returns the outcome together with the number of attempts made.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> (Result<T, ServiceError>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return (Ok(value), attempt),
            Err(err) if err.retryable && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(operation, attempt, error = %err, ?delay, "retrying after service error");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return (Err(err), attempt),
        }
    }
}

/// Hashes `part` and uploads it along with its tree hash.
///
/// Retryable service errors are retried according to `policy`. The checksum
/// the service reports back has to match the one we computed.
pub async fn upload_part<B: VaultBackend + ?Sized>(
    backend: &B,
    upload_id: &str,
    vault: &str,
    part: Part,
    policy: &RetryPolicy,
) -> Result<UploadedPart, PartUploadError> {
    let Part { index, range, data } = part;

    let tree_hash = treehash::tree_hash(&data).map_err(|err| PartUploadError {
        range,
        attempts: 0,
        tree_hash: None,
        cause: err.into(),
    })?;
    debug!(upload_id, part = index, %range, %tree_hash, "hashed part");

    let (result, attempts) = with_retry(policy, "upload part", || {
        backend.upload_part(upload_id, vault, range, tree_hash, &data)
    })
    .await;
    let fail = |cause: PartFailure| PartUploadError {
        range,
        attempts,
        tree_hash: Some(tree_hash),
        cause,
    };

    let checksum = result.map_err(|err| fail(err.into()))?;
    if checksum != tree_hash {
        return Err(fail(
            ChecksumMismatchError {
                scope: ChecksumScope::Part(range),
                expected: tree_hash,
                actual: checksum,
            }
            .into(),
        ));
    }
    debug!(upload_id, part = index, content_range = %range.content_range(), attempts, "uploaded part");

    Ok(UploadedPart {
        index,
        range,
        tree_hash,
        attempts,
    })
}
