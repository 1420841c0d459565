use std::pin::pin;

use futures_util::{Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::backend::ByteRange;
use crate::config::PartSize;
use crate::error::{EmptyInputError, ReadError};
use crate::treehash::{self, TreeHash};

/// One contiguous slice of the archive, read into memory.
#[derive(Debug)]
pub struct Part {
    /// Position of the part within the archive, starting at `0`.
    pub index: usize,
    pub range: ByteRange,
    pub data: Vec<u8>,
}

/// Splits `stream` into parts of exactly `part_size` bytes, except for a
/// shorter trailing part.
///
/// The stream reads forward only and holds a single part buffer at a time.
/// An empty source yields no parts at all.
pub fn chunk_stream(
    part_size: PartSize,
    mut stream: impl AsyncRead + Unpin,
) -> impl Stream<Item = Result<Part, ReadError>> {
    async_stream::try_stream! {
        let part_size = part_size.get();
        let mut offset = 0;
        let mut index = 0;

        loop {
            let mut stream_part = (&mut stream).take(part_size);

            // grows with what is actually read, a short trailing part stays small
            let mut data = Vec::new();
            let read = stream_part.read_to_end(&mut data).await;
            read.map_err(|source| ReadError {
                offset: offset + data.len() as u64,
                source,
            })?;
            let part_len = data.len() as u64;
            if part_len == 0 {
                break;
            }

            let range = ByteRange::new(offset, part_len);
            offset += part_len;
            yield Part { index, range, data };
            index += 1;

            if part_len < part_size {
                break;
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HashArchiveError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    EmptyInput(#[from] EmptyInputError),
}

/// Computes the archive tree hash the way an upload would, without talking
/// to any service: one tree hash per part, then one over the part hashes.
///
/// Returns the hash and the archive length.
pub async fn hash_archive(
    part_size: PartSize,
    stream: impl AsyncRead + Unpin,
) -> Result<(TreeHash, u64), HashArchiveError> {
    let mut parts = pin!(chunk_stream(part_size, stream));

    let mut part_hashes = vec![];
    let mut len = 0;
    while let Some(part) = parts.next().await {
        let part = part?;
        len += part.range.len;
        part_hashes.push(treehash::tree_hash(&part.data)?);
    }

    Ok((treehash::combine(&part_hashes)?, len))
}
