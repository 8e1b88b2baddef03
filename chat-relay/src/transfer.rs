//! Chunked file transfer: splitting on the sending side, order-independent
//! reassembly on the receiving side.

use std::{
    collections::{BTreeMap, HashMap, hash_map::Entry},
    path::Path,
};

use anyhow::{Context, Result};
use thiserror::Error;

use crate::envelope::FileChunk;

pub const DEFAULT_CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("cannot transfer an empty file")]
    EmptyFile,

    #[error("chunk size must be at least one byte")]
    ZeroChunkSize,

    #[error("file needs more chunks than a transfer can address")]
    TooManyChunks,

    #[error("transfer declares zero chunks")]
    NoChunks,

    #[error("chunk {chunk_id} is out of range for a {total_chunks}-chunk transfer")]
    OutOfRange { chunk_id: u32, total_chunks: u32 },

    #[error(
        "chunk declares {total_chunks} chunks / {total_size} bytes but the transfer started with {expected_chunks} chunks / {expected_size} bytes"
    )]
    Mismatch {
        total_chunks: u32,
        total_size: u64,
        expected_chunks: u32,
        expected_size: u64,
    },

    #[error("chunk {0} is missing")]
    MissingChunk(u32),

    #[error("assembled {actual} bytes but the transfer declared {expected}")]
    SizeMismatch { actual: u64, expected: u64 },
}

/// Splits `bytes` into `ceil(len / chunk_size)` chunks numbered from zero.
pub fn split(
    filename: &str,
    bytes: &[u8],
    chunk_size: usize,
) -> Result<Vec<FileChunk>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::ZeroChunkSize);
    }
    if bytes.is_empty() {
        return Err(TransferError::EmptyFile);
    }

    let total_chunks =
        u32::try_from(bytes.len().div_ceil(chunk_size)).map_err(|_| TransferError::TooManyChunks)?;
    let total_size = bytes.len() as u64;

    Ok(bytes
        .chunks(chunk_size)
        .zip(0..)
        .map(|(data, chunk_id)| FileChunk {
            filename: filename.to_string(),
            total_size,
            chunk_id,
            total_chunks,
            data: data.to_vec(),
        })
        .collect())
}

/// Reassembles a complete chunk set regardless of the order it arrived in.
pub fn assemble(chunks: impl IntoIterator<Item = FileChunk>) -> Result<Vec<u8>, TransferError> {
    let mut pending = PendingTransfers::default();
    let mut last = None;
    for chunk in chunks {
        if let Progress::Complete(file) = pending.accept("", &chunk)? {
            last = Some(file.bytes);
        }
    }

    match last {
        Some(bytes) => Ok(bytes),
        None => Err(pending
            .first_missing()
            .map(TransferError::MissingChunk)
            .unwrap_or(TransferError::EmptyFile)),
    }
}

/// Reads a file from disk and splits it for sending.
pub async fn read_chunks(path: &Path, chunk_size: usize) -> Result<Vec<FileChunk>> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("'{}' has no usable file name", path.display()))?;
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    Ok(split(filename, &bytes, chunk_size)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransferKey {
    sender: String,
    filename: String,
}

#[derive(Debug)]
struct PartialTransfer {
    total_chunks: u32,
    total_size: u64,
    chunks: BTreeMap<u32, Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledFile {
    pub sender: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Pending { received: u32, total: u32 },
    Complete(AssembledFile),
}

/// In-flight transfers keyed by `(sender, filename)`.
///
/// The chunk count and size a transfer starts with are fixed until it
/// completes. A repeated `chunk_id` replaces the earlier payload.
#[derive(Debug, Default)]
pub struct PendingTransfers {
    inflight: HashMap<TransferKey, PartialTransfer>,
}

impl PendingTransfers {
    pub fn accept(&mut self, sender: &str, chunk: &FileChunk) -> Result<Progress, TransferError> {
        if chunk.total_chunks == 0 {
            return Err(TransferError::NoChunks);
        }
        if chunk.chunk_id >= chunk.total_chunks {
            return Err(TransferError::OutOfRange {
                chunk_id: chunk.chunk_id,
                total_chunks: chunk.total_chunks,
            });
        }

        let key = TransferKey {
            sender: sender.to_string(),
            filename: chunk.filename.clone(),
        };
        let mut entry = match self.inflight.entry(key) {
            Entry::Occupied(entry) => entry,
            Entry::Vacant(entry) => entry.insert_entry(PartialTransfer {
                total_chunks: chunk.total_chunks,
                total_size: chunk.total_size,
                chunks: BTreeMap::new(),
            }),
        };

        let partial = entry.get_mut();
        if partial.total_chunks != chunk.total_chunks || partial.total_size != chunk.total_size {
            return Err(TransferError::Mismatch {
                total_chunks: chunk.total_chunks,
                total_size: chunk.total_size,
                expected_chunks: partial.total_chunks,
                expected_size: partial.total_size,
            });
        }

        let replaced = partial.chunks.insert(chunk.chunk_id, chunk.data.clone());
        let received = partial.chunks.len() as u32;
        if received < partial.total_chunks {
            return Ok(Progress::Pending {
                received,
                total: partial.total_chunks,
            });
        }

        let actual: u64 = partial.chunks.values().map(|data| data.len() as u64).sum();
        if actual != partial.total_size {
            // The offending chunk is not kept; the rest of the transfer is.
            match replaced {
                Some(previous) => {
                    partial.chunks.insert(chunk.chunk_id, previous);
                }
                None => {
                    partial.chunks.remove(&chunk.chunk_id);
                }
            }
            let expected = partial.total_size;
            if partial.chunks.is_empty() {
                entry.remove();
            }
            return Err(TransferError::SizeMismatch { actual, expected });
        }

        let (key, partial) = entry.remove_entry();
        let bytes: Vec<u8> = partial.chunks.into_values().flatten().collect();

        Ok(Progress::Complete(AssembledFile {
            sender: key.sender,
            filename: key.filename,
            bytes,
        }))
    }

    /// Whether `chunk_id` of `sender`'s `filename` is already buffered.
    pub fn has_chunk(&self, sender: &str, filename: &str, chunk_id: u32) -> bool {
        let key = TransferKey {
            sender: sender.to_string(),
            filename: filename.to_string(),
        };
        self.inflight
            .get(&key)
            .is_some_and(|partial| partial.chunks.contains_key(&chunk_id))
    }

    /// Forgets every unfinished transfer from `sender` and returns how many
    /// there were.
    pub fn discard_sender(&mut self, sender: &str) -> usize {
        let before = self.inflight.len();
        self.inflight.retain(|key, _| key.sender != sender);
        before - self.inflight.len()
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    fn first_missing(&self) -> Option<u32> {
        let partial = self.inflight.values().next()?;
        (0..partial.total_chunks).find(|id| !partial.chunks.contains_key(id))
    }
}
