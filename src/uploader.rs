use std::path::Path;
use std::pin::pin;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{ArchiveReceipt, VaultBackend};
use crate::chunker::chunk_stream;
use crate::config::{PartSize, UploadConfig};
use crate::error::{
    ChecksumMismatchError, ChecksumScope, PartUploadError, ReadError, UploadError, UploadFailure,
};
use crate::part::{self, with_retry, UploadedPart};
use crate::session::{UploadSession, UploadState};

type PartTaskOutput = (
    usize,
    Result<UploadedPart, PartUploadError>,
    OwnedSemaphorePermit,
);

/// Drives the multipart upload of one archive at a time, from initiation to
/// completion or abort.
///
/// With a concurrency of `1` parts are hashed and uploaded strictly one after
/// the other. Higher values keep up to that many parts in flight, each one
/// holding its own part buffer.
pub struct Uploader<B> {
    backend: Arc<B>,
    config: UploadConfig,
    cancel: CancellationToken,
}

impl<B: VaultBackend + 'static> Uploader<B> {
    pub fn new(backend: Arc<B>, config: UploadConfig) -> Self {
        Self {
            backend,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling the token stops dispatching new parts. Parts already in
    /// flight run to completion, after which the upload is aborted.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads the file at `path` as a single archive into `vault`.
    pub async fn upload_file(
        &self,
        path: &Path,
        vault: &str,
    ) -> Result<ArchiveReceipt, UploadError> {
        let not_initiated = |cause: UploadFailure| UploadError {
            upload_id: None,
            state: UploadState::Failed,
            cause,
        };
        let read_error =
            |source: std::io::Error| not_initiated(ReadError { offset: 0, source }.into());
        let file = tokio::fs::File::open(path).await.map_err(read_error)?;
        let len = file.metadata().await.map_err(read_error)?.len();
        if len == 0 {
            return Err(not_initiated(UploadFailure::EmptyArchive));
        }

        info!(path = %path.display(), len, vault, "uploading archive");
        self.upload_reader(file, vault).await
    }

    /// Uploads everything `reader` yields as a single archive into `vault`.
    pub async fn upload_reader<R>(
        &self,
        reader: R,
        vault: &str,
    ) -> Result<ArchiveReceipt, UploadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.config.validate().map_err(|err| UploadError {
            upload_id: None,
            state: UploadState::Failed,
            cause: err.into(),
        })?;
        if self.cancel.is_cancelled() {
            return Err(UploadError {
                upload_id: None,
                state: UploadState::Aborted,
                cause: UploadFailure::Cancelled,
            });
        }

        let part_size = self.config.part_size;
        let upload_id = self.initiate(vault, part_size).await?;
        info!(%upload_id, vault, %part_size, "initiated multipart upload");

        let mut session = UploadSession::new(upload_id, vault.into(), part_size);
        session.advance(UploadState::Uploading);
        if let Err(cause) = self.upload_parts(&mut session, reader).await {
            return Err(self.abort(session, cause).await);
        }

        session.advance(UploadState::Combining);
        let tree_hash = match session.archive_tree_hash() {
            Ok(tree_hash) => tree_hash,
            Err(err) => return Err(self.abort(session, err.into()).await),
        };
        let archive_len = session.archive_len();

        session.advance(UploadState::Completing);
        let (result, attempts) = with_retry(&self.config.retry, "complete upload", || {
            self.backend
                .complete_upload(session.upload_id(), vault, tree_hash, archive_len)
        })
        .await;
        let receipt = match result {
            Ok(receipt) => receipt,
            Err(source) => {
                let cause = UploadFailure::Service {
                    operation: "complete upload",
                    attempts,
                    source,
                };
                return Err(self.abort(session, cause).await);
            }
        };

        if receipt.checksum != tree_hash {
            // the archive exists on the service side, there is nothing left
            // to abort
            let cause = ChecksumMismatchError {
                scope: ChecksumScope::Archive,
                expected: tree_hash,
                actual: receipt.checksum,
            };
            error!(upload_id = %session.upload_id(), error = %cause, "archive checksum mismatch");
            session.advance(UploadState::Failed);
            return Err(UploadError {
                upload_id: Some(session.upload_id().into()),
                state: UploadState::Failed,
                cause: cause.into(),
            });
        }

        session.advance(UploadState::Completed);
        info!(
            upload_id = %session.upload_id(),
            archive_id = %receipt.archive_id,
            parts = session.parts().len(),
            archive_len,
            %tree_hash,
            "completed multipart upload"
        );
        Ok(receipt)
    }

    async fn initiate(&self, vault: &str, part_size: PartSize) -> Result<String, UploadError> {
        let (result, attempts) = with_retry(&self.config.retry, "initiate upload", || {
            self.backend.initiate_upload(vault, part_size)
        })
        .await;
        result.map_err(|source| {
            error!(vault, error = %source, "failed to initiate multipart upload");
            UploadError {
                upload_id: None,
                state: UploadState::Failed,
                cause: UploadFailure::Service {
                    operation: "initiate upload",
                    attempts,
                    source,
                },
            }
        })
    }

    /// Feeds parts from the archive to upload tasks until the archive is
    /// exhausted or the first fatal error.
    ///
    /// Tasks still in flight when dispatch stops are always awaited, so the
    /// session has a final word on every part that was handed out.
    async fn upload_parts<R>(
        &self,
        session: &mut UploadSession,
        reader: R,
    ) -> Result<(), UploadFailure>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut parts = pin!(chunk_stream(session.part_size(), reader));
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut in_flight = JoinSet::new();
        let mut failure = None;

        loop {
            tokio::select! {
                biased;

                Some(joined) = in_flight.join_next() => {
                    if let Err(cause) = record_part(session, joined) {
                        failure = Some(cause);
                        break;
                    }
                }
                _ = self.cancel.cancelled() => {
                    warn!(upload_id = %session.upload_id(), "upload cancelled");
                    failure = Some(UploadFailure::Cancelled);
                    break;
                }
                permit = semaphore.clone().acquire_owned() => {
                    // the semaphore is never closed
                    let Ok(permit) = permit else { break };
                    let part = match parts.next().await {
                        Some(Ok(part)) => part,
                        Some(Err(err)) => {
                            failure = Some(err.into());
                            break;
                        }
                        None => break,
                    };

                    let index = session.push_part(part.range);
                    debug!(upload_id = %session.upload_id(), part = index, range = %part.range, "dispatching part");

                    let backend = Arc::clone(&self.backend);
                    let upload_id = session.upload_id().to_string();
                    let vault = session.vault().to_string();
                    let retry = self.config.retry.clone();
                    in_flight.spawn(async move {
                        let result = part::upload_part(&*backend, &upload_id, &vault, part, &retry).await;
                        (index, result, permit)
                    });
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(cause) = record_part(session, joined) {
                failure.get_or_insert(cause);
            }
        }

        match failure {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Aborts the upload on the service side, best effort, and ends the
    /// session.
    async fn abort(&self, mut session: UploadSession, cause: UploadFailure) -> UploadError {
        session.advance(UploadState::Aborting);
        if !matches!(cause, UploadFailure::Cancelled) {
            error!(upload_id = %session.upload_id(), error = %cause, "upload failed, aborting");
        }

        match self
            .backend
            .abort_upload(session.upload_id(), session.vault())
            .await
        {
            Ok(()) => info!(upload_id = %session.upload_id(), "aborted multipart upload"),
            Err(err) => {
                warn!(upload_id = %session.upload_id(), error = %err, "failed to abort multipart upload")
            }
        }

        let state = match cause {
            UploadFailure::Cancelled => UploadState::Aborted,
            _ => UploadState::Failed,
        };
        session.advance(state);
        UploadError {
            upload_id: Some(session.upload_id().into()),
            state,
            cause,
        }
    }
}

/// Records the outcome of an upload task. This is the only place that writes
/// part results while parts are in flight.
fn record_part(
    session: &mut UploadSession,
    joined: Result<PartTaskOutput, JoinError>,
) -> Result<(), UploadFailure> {
    let (index, result, permit) = joined?;
    let recorded = match result {
        Ok(uploaded) => {
            session.record_hashed(index, uploaded.tree_hash);
            session.record_uploaded(index);
            Ok(())
        }
        Err(err) => {
            if let Some(tree_hash) = err.tree_hash {
                session.record_hashed(index, tree_hash);
            }
            session.record_failed(index);
            error!(
                upload_id = %session.upload_id(),
                part = index,
                range = %err.range,
                attempts = err.attempts,
                error = %err.cause,
                "part upload failed"
            );
            Err(err.into())
        }
    };
    // only now may the next part be dispatched
    drop(permit);
    recorded
}

/// Uploads the archive at `archive_path` into `vault`.
///
/// A `concurrency` of `1` uploads the parts sequentially.
pub async fn upload_archive<B: VaultBackend + 'static>(
    backend: Arc<B>,
    archive_path: impl AsRef<Path>,
    vault: &str,
    part_size: PartSize,
    concurrency: usize,
) -> Result<ArchiveReceipt, UploadError> {
    let config = UploadConfig::builder()
        .part_size(part_size)
        .concurrency(concurrency)
        .build()
        .map_err(|err| UploadError {
            upload_id: None,
            state: UploadState::Failed,
            cause: err.into(),
        })?;
    Uploader::new(backend, config)
        .upload_file(archive_path.as_ref(), vault)
        .await
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::ReadBuf;

    use super::*;
    use crate::backend::ByteRange;
    use crate::chunker::hash_archive;
    use crate::config::RetryPolicy;
    use crate::error::{PartFailure, ServiceError};
    use crate::memory::MemoryVault;
    use crate::treehash::{self, TreeHash, ONE_MEG};

    const MEG: u64 = ONE_MEG as u64;

    /// Wraps a [`MemoryVault`], counting calls and injecting failures.
    #[derive(Default)]
    struct ScriptedBackend {
        vault: MemoryVault,
        /// Fails the first `n` attempts of the part at the given offset.
        part_failures: Mutex<HashMap<u64, (u32, ServiceError)>>,
        initiate_failures: Mutex<Option<(u32, ServiceError)>>,
        complete_failures: Mutex<Option<(u32, ServiceError)>>,
        abort_error: Option<ServiceError>,
        /// Delays parts so that earlier parts finish later.
        reverse_completion: bool,
        corrupt_receipt: bool,
        cancel_after_first_part: Option<CancellationToken>,

        initiations: AtomicU32,
        completions: AtomicU32,
        aborts: AtomicU32,
        part_attempts: Mutex<HashMap<u64, u32>>,
        sent_hashes: Mutex<HashMap<u64, TreeHash>>,
        parts_in_flight: AtomicU32,
        /// Part uploads still running when the abort arrived.
        in_flight_at_abort: Mutex<Option<u32>>,
    }

    /// Takes one injected failure off `slot`, if any are left.
    fn take_failure(slot: &Mutex<Option<(u32, ServiceError)>>) -> Option<ServiceError> {
        match &mut *slot.lock().unwrap() {
            Some((remaining, err)) if *remaining > 0 => {
                *remaining -= 1;
                Some(err.clone())
            }
            _ => None,
        }
    }

    impl ScriptedBackend {
        fn fail_part(self, offset: u64, times: u32, err: ServiceError) -> Self {
            self.part_failures
                .lock()
                .unwrap()
                .insert(offset, (times, err));
            self
        }

        fn fail_initiate(self, times: u32, err: ServiceError) -> Self {
            *self.initiate_failures.lock().unwrap() = Some((times, err));
            self
        }

        fn fail_complete(self, times: u32, err: ServiceError) -> Self {
            *self.complete_failures.lock().unwrap() = Some((times, err));
            self
        }

        fn attempts_at(&self, offset: u64) -> u32 {
            self.part_attempts
                .lock()
                .unwrap()
                .get(&offset)
                .copied()
                .unwrap_or(0)
        }

        fn sent_hash_at(&self, offset: u64) -> Option<TreeHash> {
            self.sent_hashes.lock().unwrap().get(&offset).copied()
        }
    }

    #[async_trait::async_trait]
    impl VaultBackend for ScriptedBackend {
        async fn initiate_upload(
            &self,
            vault: &str,
            part_size: PartSize,
        ) -> Result<String, ServiceError> {
            self.initiations.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = take_failure(&self.initiate_failures) {
                return Err(err);
            }
            self.vault.initiate_upload(vault, part_size).await
        }

        async fn upload_part(
            &self,
            upload_id: &str,
            vault: &str,
            range: ByteRange,
            tree_hash: TreeHash,
            data: &[u8],
        ) -> Result<TreeHash, ServiceError> {
            *self
                .part_attempts
                .lock()
                .unwrap()
                .entry(range.offset)
                .or_default() += 1;
            self.sent_hashes
                .lock()
                .unwrap()
                .insert(range.offset, tree_hash);

            let injected = {
                let mut failures = self.part_failures.lock().unwrap();
                match failures.get_mut(&range.offset) {
                    Some((remaining, err)) if *remaining > 0 => {
                        *remaining -= 1;
                        Some(err.clone())
                    }
                    _ => None,
                }
            };
            if let Some(err) = injected {
                return Err(err);
            }

            self.parts_in_flight.fetch_add(1, Ordering::SeqCst);
            if self.reverse_completion {
                let delay = 40u64.saturating_sub(range.offset / MEG * 5);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }

            let checksum = self
                .vault
                .upload_part(upload_id, vault, range, tree_hash, data)
                .await;
            self.parts_in_flight.fetch_sub(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_after_first_part {
                cancel.cancel();
            }
            checksum
        }

        async fn complete_upload(
            &self,
            upload_id: &str,
            vault: &str,
            tree_hash: TreeHash,
            archive_len: u64,
        ) -> Result<ArchiveReceipt, ServiceError> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = take_failure(&self.complete_failures) {
                return Err(err);
            }
            let mut receipt = self
                .vault
                .complete_upload(upload_id, vault, tree_hash, archive_len)
                .await?;
            if self.corrupt_receipt {
                receipt.checksum = treehash::leaf_hash(b"corrupted");
            }
            Ok(receipt)
        }

        async fn abort_upload(&self, upload_id: &str, vault: &str) -> Result<(), ServiceError> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            *self.in_flight_at_abort.lock().unwrap() =
                Some(self.parts_in_flight.load(Ordering::SeqCst));
            if let Some(err) = &self.abort_error {
                return Err(err.clone());
            }
            self.vault.abort_upload(upload_id, vault).await
        }
    }

    fn config(concurrency: usize) -> UploadConfig {
        UploadConfig::builder()
            .part_size(PartSize::MIN)
            .concurrency(concurrency)
            .retry(RetryPolicy {
                max_attempts: 4,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(4),
                backoff_factor: 2.0,
            })
            .build()
            .unwrap()
    }

    fn archive(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 257) as u8).collect()
    }

    #[tokio::test]
    async fn single_part_archive() {
        let backend = Arc::new(ScriptedBackend::default());
        let uploader = Uploader::new(Arc::clone(&backend), config(1));
        let data = vec![0u8; ONE_MEG];

        let receipt = uploader.upload_reader(&data[..], "vault").await.unwrap();

        let leaf = treehash::leaf_hash(&data);
        assert_eq!(backend.sent_hash_at(0), Some(leaf));
        assert_eq!(receipt.checksum, leaf);
        assert_eq!(
            backend.vault.archive("vault", &receipt.archive_id).unwrap(),
            data
        );
    }

    #[tokio::test]
    async fn archive_one_byte_over_the_part_size() {
        let backend = Arc::new(ScriptedBackend::default());
        let uploader = Uploader::new(Arc::clone(&backend), config(1));
        let data = archive(ONE_MEG + 1);

        let receipt = uploader.upload_reader(&data[..], "vault").await.unwrap();

        let first = treehash::leaf_hash(&data[..ONE_MEG]);
        let second = treehash::leaf_hash(&data[ONE_MEG..]);
        assert_eq!(backend.sent_hash_at(0), Some(first));
        assert_eq!(backend.sent_hash_at(MEG), Some(second));
        assert_eq!(
            receipt.checksum,
            treehash::combine(&[first, second]).unwrap()
        );
        assert_eq!(backend.completions.load(Ordering::SeqCst), 1);
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_part_error_aborts_the_upload() {
        for concurrency in [1, 3] {
            let backend = Arc::new(ScriptedBackend::default().fail_part(
                MEG,
                u32::MAX,
                ServiceError::fatal("access denied"),
            ));
            let uploader = Uploader::new(Arc::clone(&backend), config(concurrency));
            let data = archive(3 * ONE_MEG + 100);

            let err = uploader.upload_reader(&data[..], "vault").await.unwrap_err();

            assert_eq!(err.state, UploadState::Failed);
            assert!(err.upload_id.is_some());
            let UploadFailure::Part(part_err) = &err.cause else {
                panic!("unexpected cause: {:?}", err.cause);
            };
            assert_eq!(part_err.range, ByteRange::new(MEG, MEG));
            assert_eq!(part_err.attempts, 1);
            assert!(matches!(part_err.cause, PartFailure::Service(_)));

            assert_eq!(backend.attempts_at(MEG), 1);
            assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
            assert_eq!(backend.completions.load(Ordering::SeqCst), 0);
            assert_eq!(backend.vault.pending_uploads(), 0);
            assert_eq!(backend.vault.archive_count(), 0);
        }
    }

    #[tokio::test]
    async fn sequential_mode_stops_dispatch_after_a_failure() {
        let backend = Arc::new(ScriptedBackend::default().fail_part(
            MEG,
            u32::MAX,
            ServiceError::fatal("bad request"),
        ));
        let uploader = Uploader::new(Arc::clone(&backend), config(1));
        let data = archive(4 * ONE_MEG);

        uploader.upload_reader(&data[..], "vault").await.unwrap_err();

        assert_eq!(backend.attempts_at(0), 1);
        assert_eq!(backend.attempts_at(MEG), 1);
        assert_eq!(backend.attempts_at(2 * MEG), 0);
        assert_eq!(backend.attempts_at(3 * MEG), 0);
    }

    #[tokio::test]
    async fn retryable_part_errors_are_retried() {
        let backend = Arc::new(ScriptedBackend::default().fail_part(
            MEG,
            2,
            ServiceError::retryable("throttled"),
        ));
        let uploader = Uploader::new(Arc::clone(&backend), config(1));
        let data = archive(2 * ONE_MEG + 7);

        let receipt = uploader.upload_reader(&data[..], "vault").await.unwrap();

        assert_eq!(backend.attempts_at(MEG), 3);
        assert_eq!(backend.attempts_at(0), 1);
        assert_eq!(receipt.checksum, treehash::tree_hash(&data).unwrap());
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let backend = Arc::new(ScriptedBackend::default().fail_part(
            0,
            u32::MAX,
            ServiceError::retryable("throttled"),
        ));
        let uploader = Uploader::new(Arc::clone(&backend), config(1));
        let data = archive(100);

        let err = uploader.upload_reader(&data[..], "vault").await.unwrap_err();

        assert_eq!(err.state, UploadState::Failed);
        assert_eq!(backend.attempts_at(0), 4);
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_and_sequential_modes_agree() {
        let data = archive(7 * ONE_MEG + 5);
        let (expected, _) = hash_archive(PartSize::MIN, &data[..]).await.unwrap();

        let mut checksums = vec![];
        for concurrency in [1, 2, 4, 8] {
            let backend = Arc::new(ScriptedBackend {
                reverse_completion: true,
                ..Default::default()
            });
            let uploader = Uploader::new(Arc::clone(&backend), config(concurrency));
            let receipt = uploader.upload_reader(&data[..], "vault").await.unwrap();

            assert_eq!(
                backend.vault.archive("vault", &receipt.archive_id).unwrap(),
                data
            );
            checksums.push(receipt.checksum);
        }

        assert!(checksums.iter().all(|checksum| *checksum == expected));
    }

    #[tokio::test]
    async fn cancellation_aborts_the_upload() {
        let cancel = CancellationToken::new();
        let backend = Arc::new(ScriptedBackend {
            cancel_after_first_part: Some(cancel.clone()),
            ..Default::default()
        });
        let mut uploader = Uploader::new(Arc::clone(&backend), config(1));
        uploader.cancel = cancel;
        let data = archive(3 * ONE_MEG);

        let err = uploader.upload_reader(&data[..], "vault").await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.state, UploadState::Aborted);
        assert_eq!(backend.attempts_at(0), 1);
        assert_eq!(backend.attempts_at(MEG), 0);
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_drains_parts_in_flight() {
        let cancel = CancellationToken::new();
        let backend = Arc::new(ScriptedBackend {
            // part 2 finishes first and cancels while parts 0 and 1 still run
            reverse_completion: true,
            cancel_after_first_part: Some(cancel.clone()),
            ..Default::default()
        });
        let mut uploader = Uploader::new(Arc::clone(&backend), config(3));
        uploader.cancel = cancel;
        let data = archive(8 * ONE_MEG);

        let err = uploader.upload_reader(&data[..], "vault").await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.state, UploadState::Aborted);
        let attempted: Vec<_> = (0..8).map(|i| backend.attempts_at(i * MEG)).collect();
        assert_eq!(attempted, [1, 1, 1, 0, 0, 0, 0, 0]);
        assert_eq!(*backend.in_flight_at_abort.lock().unwrap(), Some(0));
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.completions.load(Ordering::SeqCst), 0);
        assert_eq!(backend.vault.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn failed_abort_keeps_the_original_cause() {
        let backend = Arc::new(
            ScriptedBackend {
                abort_error: Some(ServiceError::retryable("service unavailable")),
                ..Default::default()
            }
            .fail_part(MEG, u32::MAX, ServiceError::fatal("access denied")),
        );
        let uploader = Uploader::new(Arc::clone(&backend), config(1));
        let data = archive(3 * ONE_MEG);

        let err = uploader.upload_reader(&data[..], "vault").await.unwrap_err();

        assert_eq!(err.state, UploadState::Failed);
        let UploadFailure::Part(part_err) = &err.cause else {
            panic!("unexpected cause: {:?}", err.cause);
        };
        assert_eq!(part_err.range, ByteRange::new(MEG, MEG));
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn initiate_and_complete_are_retried() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .fail_initiate(1, ServiceError::retryable("throttled"))
                .fail_complete(2, ServiceError::retryable("internal error")),
        );
        let uploader = Uploader::new(Arc::clone(&backend), config(2));
        let data = archive(2 * ONE_MEG + 1);

        let receipt = uploader.upload_reader(&data[..], "vault").await.unwrap();

        assert_eq!(backend.initiations.load(Ordering::SeqCst), 2);
        assert_eq!(backend.completions.load(Ordering::SeqCst), 3);
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(receipt.checksum, treehash::tree_hash(&data).unwrap());
        assert_eq!(backend.vault.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn failed_initiation_sends_nothing_else() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .fail_initiate(u32::MAX, ServiceError::fatal("no such vault")),
        );
        let uploader = Uploader::new(Arc::clone(&backend), config(1));

        let err = uploader
            .upload_reader(&archive(10)[..], "vault")
            .await
            .unwrap_err();

        assert_eq!(err.state, UploadState::Failed);
        assert_eq!(err.upload_id, None);
        assert!(matches!(
            err.cause,
            UploadFailure::Service {
                operation: "initiate upload",
                attempts: 1,
                ..
            }
        ));
        assert_eq!(backend.initiations.load(Ordering::SeqCst), 1);
        assert_eq!(backend.attempts_at(0), 0);
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_completion_error_aborts_the_upload() {
        let backend = Arc::new(
            ScriptedBackend::default()
                .fail_complete(u32::MAX, ServiceError::fatal("bad checksum")),
        );
        let uploader = Uploader::new(Arc::clone(&backend), config(2));
        let data = archive(ONE_MEG + 10);

        let err = uploader.upload_reader(&data[..], "vault").await.unwrap_err();

        assert_eq!(err.state, UploadState::Failed);
        assert!(err.upload_id.is_some());
        assert!(matches!(
            err.cause,
            UploadFailure::Service {
                operation: "complete upload",
                attempts: 1,
                ..
            }
        ));
        assert_eq!(backend.completions.load(Ordering::SeqCst), 1);
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.vault.pending_uploads(), 0);
        assert_eq!(backend.vault.archive_count(), 0);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let backend = Arc::new(ScriptedBackend::default());
        let uploader = Uploader::new(Arc::clone(&backend), config(2));
        uploader.cancel_token().cancel();

        let err = uploader.upload_reader(&b"data"[..], "vault").await.unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.upload_id, None);
        assert_eq!(backend.initiations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn archive_checksum_mismatch_fails() {
        let backend = Arc::new(ScriptedBackend {
            corrupt_receipt: true,
            ..Default::default()
        });
        let uploader = Uploader::new(Arc::clone(&backend), config(2));

        let err = uploader
            .upload_reader(&archive(10)[..], "vault")
            .await
            .unwrap_err();

        assert_eq!(err.state, UploadState::Failed);
        assert!(matches!(
            err.cause,
            UploadFailure::ChecksumMismatch(ChecksumMismatchError {
                scope: ChecksumScope::Archive,
                ..
            })
        ));
    }

    struct BrokenReader {
        remaining: usize,
    }

    impl AsyncRead for BrokenReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.remaining == 0 {
                return Poll::Ready(Err(io::Error::other("unplugged")));
            }
            let n = self.remaining.min(buf.remaining()).min(8192);
            buf.put_slice(&vec![9; n]);
            self.remaining -= n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn read_errors_abort_the_upload() {
        let backend = Arc::new(ScriptedBackend::default());
        let uploader = Uploader::new(Arc::clone(&backend), config(2));
        let reader = BrokenReader {
            remaining: 2 * ONE_MEG + 5,
        };

        let err = uploader.upload_reader(reader, "vault").await.unwrap_err();

        assert_eq!(err.state, UploadState::Failed);
        let UploadFailure::Read(read_err) = &err.cause else {
            panic!("unexpected cause: {:?}", err.cause);
        };
        assert_eq!(read_err.offset, 2 * MEG + 5);
        assert_eq!(backend.aborts.load(Ordering::SeqCst), 1);
        assert_eq!(backend.completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn uploads_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archive.bin");
        let data = archive(3 * ONE_MEG + 1234);
        tokio::fs::write(&path, &data).await.unwrap();

        let vault = Arc::new(MemoryVault::new());
        let part_size = PartSize::from_mib(2).unwrap();
        let receipt = upload_archive(Arc::clone(&vault), &path, "backups", part_size, 2)
            .await
            .unwrap();

        assert_eq!(receipt.checksum, treehash::tree_hash(&data).unwrap());
        assert_eq!(vault.archive("backups", &receipt.archive_id).unwrap(), data);
    }

    #[tokio::test]
    async fn empty_files_are_rejected_before_initiation() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let backend = Arc::new(ScriptedBackend::default());

        let err = upload_archive(Arc::clone(&backend), file.path(), "v", PartSize::MIN, 1)
            .await
            .unwrap_err();

        assert!(matches!(err.cause, UploadFailure::EmptyArchive));
        assert_eq!(backend.initiations.load(Ordering::SeqCst), 0);

        let err = upload_archive(Arc::clone(&backend), file.path(), "v", PartSize::MIN, 0)
            .await
            .unwrap_err();
        assert!(matches!(err.cause, UploadFailure::Config(_)));
    }
}
