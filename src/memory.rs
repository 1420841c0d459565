//! An in-process vault that behaves like the real service: it checks part
//! alignment and sizes, recomputes every tree hash it is given, and
//! assembles archives on completion.

use core::fmt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{ArchiveReceipt, ByteRange, VaultBackend};
use crate::config::PartSize;
use crate::error::ServiceError;
use crate::treehash::{self, TreeHash};

struct PendingUpload {
    vault: String,
    part_size: PartSize,
    /// Uploaded parts keyed by their offset.
    parts: BTreeMap<u64, Vec<u8>>,
}

impl fmt::Debug for PendingUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingUpload")
            .field("vault", &self.vault)
            .field("part_size", &self.part_size)
            .field("parts", &self.parts.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Default)]
struct VaultState {
    uploads: HashMap<String, PendingUpload>,
    /// Assembled archive bytes keyed by vault and archive id.
    archives: HashMap<(String, String), Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct MemoryVault {
    state: RwLock<VaultState>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, VaultState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, VaultState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Contents of a completed archive.
    pub fn archive(&self, vault: &str, archive_id: &str) -> Option<Vec<u8>> {
        let key = (vault.to_string(), archive_id.to_string());
        let state = self.read();
        state.archives.get(&key).cloned()
    }

    /// Number of uploads that were neither completed nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.read().uploads.len()
    }

    pub fn archive_count(&self) -> usize {
        self.read().archives.len()
    }
}

fn lookup<'s>(
    state: &'s mut VaultState,
    upload_id: &str,
    vault: &str,
) -> Result<&'s mut PendingUpload, ServiceError> {
    match state.uploads.get_mut(upload_id) {
        Some(upload) if upload.vault == vault => Ok(upload),
        _ => Err(ServiceError::fatal(format!(
            "no multipart upload {upload_id} in vault {vault}"
        ))),
    }
}

#[async_trait::async_trait]
impl VaultBackend for MemoryVault {
    async fn initiate_upload(
        &self,
        vault: &str,
        part_size: PartSize,
    ) -> Result<String, ServiceError> {
        let upload_id = uuid::Uuid::new_v4().to_string();
        let upload = PendingUpload {
            vault: vault.into(),
            part_size,
            parts: BTreeMap::new(),
        };
        self.write().uploads.insert(upload_id.clone(), upload);
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        vault: &str,
        range: ByteRange,
        tree_hash: TreeHash,
        data: &[u8],
    ) -> Result<TreeHash, ServiceError> {
        let mut state = self.write();
        let upload = lookup(&mut state, upload_id, vault)?;

        let part_size = upload.part_size.get();
        if range.offset % part_size != 0 {
            return Err(ServiceError::fatal(format!(
                "range {} is not aligned to the part size {part_size}",
                range.content_range()
            )));
        }
        if range.len == 0 || range.len > part_size || range.len != data.len() as u64 {
            return Err(ServiceError::fatal(format!(
                "invalid content range {} for a body of {} bytes",
                range.content_range(),
                data.len()
            )));
        }

        let computed = treehash::tree_hash(data)
            .map_err(|_| ServiceError::fatal("empty part body"))?;
        if computed != tree_hash {
            return Err(ServiceError::fatal(format!(
                "checksum {tree_hash} does not match the computed checksum {computed}"
            )));
        }

        upload.parts.insert(range.offset, data.to_vec());
        Ok(computed)
    }

    async fn complete_upload(
        &self,
        upload_id: &str,
        vault: &str,
        tree_hash: TreeHash,
        archive_len: u64,
    ) -> Result<ArchiveReceipt, ServiceError> {
        let mut state = self.write();
        let upload = lookup(&mut state, upload_id, vault)?;

        let part_size = upload.part_size.get();
        let mut data = Vec::with_capacity(archive_len as usize);
        for (offset, part) in &upload.parts {
            if *offset != data.len() as u64 {
                return Err(ServiceError::fatal(format!(
                    "missing part at offset {}",
                    data.len()
                )));
            }
            let is_last = offset + part.len() as u64 == archive_len;
            if !is_last && part.len() as u64 != part_size {
                return Err(ServiceError::fatal(format!(
                    "part at offset {offset} is shorter than the part size"
                )));
            }
            data.extend_from_slice(part);
        }
        if data.len() as u64 != archive_len {
            return Err(ServiceError::fatal(format!(
                "archive size {archive_len} does not match the {} uploaded bytes",
                data.len()
            )));
        }

        // the service verifies against the tree over all leaves of the
        // assembled archive, not against the part hashes
        let computed =
            treehash::tree_hash(&data).map_err(|_| ServiceError::fatal("no parts uploaded"))?;
        if computed != tree_hash {
            return Err(ServiceError::fatal(format!(
                "checksum {tree_hash} does not match the computed checksum {computed}"
            )));
        }

        let archive_id = uuid::Uuid::new_v4().simple().to_string();
        let location = format!("/-/vaults/{vault}/archives/{archive_id}");

        state.uploads.remove(upload_id);
        state
            .archives
            .insert((vault.to_string(), archive_id.clone()), data);

        Ok(ArchiveReceipt {
            archive_id,
            location,
            checksum: computed,
        })
    }

    async fn abort_upload(&self, upload_id: &str, vault: &str) -> Result<(), ServiceError> {
        let mut state = self.write();
        lookup(&mut state, upload_id, vault)?;
        state.uploads.remove(upload_id);
        Ok(())
    }
}
