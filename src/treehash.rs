//! SHA-256 tree hashing over 1 MiB leaves.
//!
//! Every 1 MiB window of an archive is hashed on its own, and the resulting
//! digests are folded pairwise, level by level, into a single root. An
//! unpaired trailing digest is carried up to the next level unchanged.

use core::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::error::EmptyInputError;

pub const ONE_MEG: usize = 1024 * 1024;

/// Size of the window covered by one leaf digest.
pub const LEAF_SIZE: usize = ONE_MEG;

/// A 32 byte SHA-256 digest, either of a leaf or of a (sub)tree.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TreeHash([u8; 32]);

impl TreeHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    pub fn from_hex(hex: &str) -> Result<Self, InvalidTreeHash> {
        let mut bytes = [0; 32];
        let decoded = base16ct::mixed::decode(hex, &mut bytes).map_err(|_| InvalidTreeHash)?;
        if decoded.len() != 32 {
            return Err(InvalidTreeHash);
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", base16ct::HexDisplay(&self.0))
    }
}

impl fmt::Debug for TreeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TreeHash({self})")
    }
}

impl FromStr for TreeHash {
    type Err = InvalidTreeHash;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl serde::Serialize for TreeHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("tree hash must be 64 hexadecimal characters")]
pub struct InvalidTreeHash;

/// Hashes a single leaf window.
///
/// The digest covers exactly the given bytes, without padding or length
/// prefix. Callers keep windows at or below [`LEAF_SIZE`].
pub fn leaf_hash(window: &[u8]) -> TreeHash {
    TreeHash(Sha256::digest(window).into())
}

fn combine_pair(left: &TreeHash, right: &TreeHash) -> TreeHash {
    let mut hasher = Sha256::new();
    hasher.update(left.0);
    hasher.update(right.0);
    TreeHash(hasher.finalize().into())
}

/// Folds an ordered sequence of digests into their root.
///
/// The order matters: digests must be given in the byte order of the data
/// they cover.
pub fn combine(digests: &[TreeHash]) -> Result<TreeHash, EmptyInputError> {
    match digests {
        [] => Err(EmptyInputError),
        [root] => Ok(*root),
        _ => {
            let mut level = digests.to_vec();
            while level.len() > 1 {
                level = level
                    .chunks(2)
                    .map(|pair| match pair {
                        [left, right] => combine_pair(left, right),
                        [odd] => *odd,
                        _ => unreachable!("chunks(2) yields one or two digests"),
                    })
                    .collect();
            }
            Ok(level[0])
        }
    }
}

/// Tree hash of a contiguous byte slice, such as one part.
pub fn tree_hash(data: &[u8]) -> Result<TreeHash, EmptyInputError> {
    let mut hasher = TreeHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Incremental tree hasher.
///
/// Bytes may be fed in writes of any size; they are windowed into
/// [`LEAF_SIZE`] leaves exactly as if the concatenation had been hashed at
/// once.
#[derive(Clone, Default)]
pub struct TreeHasher {
    current: Sha256,
    in_window: usize,
    leaves: Vec<TreeHash>,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (LEAF_SIZE - self.in_window).min(data.len());
            let (head, rest) = data.split_at(take);
            self.current.update(head);
            self.in_window += take;
            data = rest;

            if self.in_window == LEAF_SIZE {
                self.finish_window();
            }
        }
    }

    fn finish_window(&mut self) {
        let window = std::mem::take(&mut self.current);
        self.leaves.push(TreeHash(window.finalize().into()));
        self.in_window = 0;
    }

    pub fn finalize(mut self) -> Result<TreeHash, EmptyInputError> {
        if self.in_window > 0 {
            self.finish_window();
        }
        combine(&self.leaves)
    }
}

impl fmt::Debug for TreeHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeHasher")
            .field("in_window", &self.in_window)
            .field("leaves", &self.leaves.len())
            .finish()
    }
}
