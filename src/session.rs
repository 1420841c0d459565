use tracing::debug;

use crate::backend::ByteRange;
use crate::config::PartSize;
use crate::error::SessionError;
use crate::treehash::{self, TreeHash};

/// Lifecycle of a multipart upload.
///
/// ```text
/// Initiated -> Uploading -> Combining -> Completing -> Completed
/// ```
///
/// Any non-terminal state may move to `Failed`, either directly or through
/// `Aborting`, which ends in `Failed` or, on cancellation, `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadState {
    Initiated,
    Uploading,
    Combining,
    Completing,
    Completed,
    Aborting,
    Aborted,
    Failed,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use UploadState::*;
        match (self, next) {
            (Initiated, Uploading)
            | (Uploading, Combining)
            | (Combining, Completing)
            | (Completing, Completed)
            | (Aborting, Aborted | Failed) => true,
            (Initiated | Uploading | Combining | Completing, Aborting | Failed) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartStatus {
    Pending,
    Hashed,
    Uploaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub range: ByteRange,
    pub tree_hash: Option<TreeHash>,
    pub status: PartStatus,
}

/// Client-side bookkeeping of one multipart upload.
///
/// Parts are registered in archive order as they are dispatched, and their
/// results are recorded against their index, so the order in which uploads
/// finish does not matter.
#[derive(Debug)]
pub struct UploadSession {
    upload_id: String,
    vault: String,
    part_size: PartSize,
    state: UploadState,
    parts: Vec<PartResult>,
}

impl UploadSession {
    pub fn new(upload_id: String, vault: String, part_size: PartSize) -> Self {
        Self {
            upload_id,
            vault,
            part_size,
            state: UploadState::Initiated,
            parts: vec![],
        }
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn vault(&self) -> &str {
        &self.vault
    }

    pub fn part_size(&self) -> PartSize {
        self.part_size
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn parts(&self) -> &[PartResult] {
        &self.parts
    }

    pub(crate) fn advance(&mut self, next: UploadState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {next:?}",
            self.state
        );
        debug!(upload_id = %self.upload_id, from = ?self.state, to = ?next, "upload state changed");
        self.state = next;
    }

    /// Registers the next part in archive order and returns its index.
    pub(crate) fn push_part(&mut self, range: ByteRange) -> usize {
        self.parts.push(PartResult {
            range,
            tree_hash: None,
            status: PartStatus::Pending,
        });
        self.parts.len() - 1
    }

    pub(crate) fn record_hashed(&mut self, index: usize, tree_hash: TreeHash) {
        let part = &mut self.parts[index];
        part.tree_hash = Some(tree_hash);
        part.status = PartStatus::Hashed;
    }

    pub(crate) fn record_uploaded(&mut self, index: usize) {
        self.parts[index].status = PartStatus::Uploaded;
    }

    pub(crate) fn record_failed(&mut self, index: usize) {
        self.parts[index].status = PartStatus::Failed;
    }

    /// Total length covered by the registered parts.
    pub fn archive_len(&self) -> u64 {
        self.parts.iter().map(|part| part.range.len).sum()
    }

    /// Combines the part tree hashes, in archive order, into the archive
    /// tree hash.
    ///
    /// Every part has to be uploaded, and the parts have to cover the
    /// archive from byte `0` without gaps or overlaps.
    pub fn archive_tree_hash(&self) -> Result<TreeHash, SessionError> {
        let mut expected = 0;
        let mut part_hashes = Vec::with_capacity(self.parts.len());
        for (index, part) in self.parts.iter().enumerate() {
            let tree_hash = match (part.status, part.tree_hash) {
                (PartStatus::Uploaded, Some(tree_hash)) => tree_hash,
                _ => {
                    return Err(SessionError::PartNotUploaded {
                        index,
                        range: part.range,
                    })
                }
            };
            if part.range.offset != expected {
                return Err(SessionError::Discontiguous {
                    index,
                    expected,
                    found: part.range.offset,
                });
            }
            expected = part.range.end();
            part_hashes.push(tree_hash);
        }

        Ok(treehash::combine(&part_hashes)?)
    }
}
