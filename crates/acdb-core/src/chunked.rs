//! Chunked ACDB file reader (C1).
//!
//! An ACDB database file is a flat header followed by a directory of
//! fixed-size chunk descriptors, each pointing at a byte range later in the
//! file. The reader never copies the whole file more than once: on open it
//! loads the bytes into an owned `Arc<[u8]>` (our stand-in for a read-only
//! mapping — see the design notes in SPEC_FULL.md on why this workspace
//! does not reach for `memmap2`'s unsafe mapping API) and every subsequent
//! read borrows from that single allocation.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

/// Errors specific to chunk-directory parsing and chunk access, kept
/// separate from [`crate::AcdbError`] so the resolver can decide how each
/// one maps onto the shared error codes (see `From<ChunkError>` below).
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("truncated or malformed chunk directory")]
    BadDirectory,

    #[error("chunk {0:#x} not present in this database")]
    NotFound(u32),

    #[error("chunk {0:#x} has zero size")]
    Empty(u32),

    #[error("requested range [{offset}, {offset}+{len}) exceeds the {chunk_id:#x} chunk region of size {region_size}")]
    OutOfBounds {
        chunk_id: u32,
        offset: usize,
        len: usize,
        region_size: usize,
    },
}

impl From<ChunkError> for crate::error::AcdbError {
    fn from(e: ChunkError) -> Self {
        use crate::error::AcdbError;
        match e {
            ChunkError::NotFound(_) | ChunkError::Empty(_) => AcdbError::NotExist,
            ChunkError::BadDirectory => AcdbError::IoData,
            ChunkError::OutOfBounds { .. } => AcdbError::BadParam(e.to_string()),
        }
    }
}

const HEADER_MAGIC: u32 = 0x4143_4442; // "ACDB"
const HEADER_LEN: usize = 8; // magic(4) + chunk_count(4)
const DIRECTORY_ENTRY_LEN: usize = 12; // id(4) + offset(4) + size(4)

#[derive(Debug, Clone, Copy)]
struct ChunkDesc {
    id: u32,
    offset: u32,
    size: u32,
}

/// An opened ACDB database. Cheap to clone: the backing bytes are held in
/// an `Arc`, so clones share the same allocation.
#[derive(Debug, Clone)]
pub struct ChunkedFile {
    bytes: Arc<[u8]>,
    directory: Arc<[ChunkDesc]>,
}

impl ChunkedFile {
    /// Reads `path` fully into memory and parses its chunk directory.
    pub fn open(path: impl AsRef<Path>) -> crate::error::Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).inspect_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "failed to read ACDB file");
        })?;
        let file = Self::from_bytes(bytes.into())?;
        tracing::debug!(path = %path.display(), chunks = file.directory.len(), "opened ACDB file");
        Ok(file)
    }

    /// Parses an already-loaded buffer, e.g. a delta file layered in by the
    /// registry.
    pub fn from_bytes(bytes: Arc<[u8]>) -> crate::error::Result<Self> {
        let directory = parse_directory(&bytes)?;
        Ok(Self {
            bytes,
            directory: directory.into(),
        })
    }

    /// Returns `(offset, size)` for `chunk_id`, erroring per the directory
    /// rules: absent entries are `NotFound`, present-but-zero-size entries
    /// are `Empty` (both map to `ENOTEXIST` at the resolver boundary).
    pub fn chunk_region(&self, chunk_id: u32) -> Result<(usize, usize), ChunkError> {
        let desc = self
            .directory
            .iter()
            .find(|d| d.id == chunk_id)
            .ok_or(ChunkError::NotFound(chunk_id))?;
        if desc.size == 0 {
            return Err(ChunkError::Empty(chunk_id));
        }
        Ok((desc.offset as usize, desc.size as usize))
    }

    /// Whether `chunk_id` is present in the directory with nonzero size.
    pub fn has_chunk(&self, chunk_id: u32) -> bool {
        self.chunk_region(chunk_id).is_ok()
    }

    /// Copies `len` bytes starting at `offset` within `chunk_id`'s region
    /// into `out`, advancing nothing (caller tracks its own cursor). Used
    /// for record-oriented scans where the caller wants an owned copy.
    pub fn copy_bytes(
        &self,
        chunk_id: u32,
        offset: usize,
        out: &mut [u8],
    ) -> Result<(), ChunkError> {
        let src = self.borrow_bytes(chunk_id, offset, out.len())?;
        out.copy_from_slice(src);
        Ok(())
    }

    /// Borrows `len` bytes starting at `offset` within `chunk_id`'s region
    /// without copying. Both `copy_bytes` and `borrow_bytes` fail with
    /// `OutOfBounds` if the requested range exceeds the chunk's region.
    pub fn borrow_bytes(
        &self,
        chunk_id: u32,
        offset: usize,
        len: usize,
    ) -> Result<&[u8], ChunkError> {
        let (chunk_off, chunk_size) = self.chunk_region(chunk_id)?;
        if offset.checked_add(len).is_none_or(|end| end > chunk_size) {
            return Err(ChunkError::OutOfBounds {
                chunk_id,
                offset,
                len,
                region_size: chunk_size,
            });
        }
        let start = chunk_off + offset;
        Ok(&self.bytes[start..start + len])
    }

    /// Full bytes of `chunk_id`'s region, for readers that scan a whole
    /// chunk's records rather than random-accessing within it.
    pub fn chunk_bytes(&self, chunk_id: u32) -> Result<&[u8], ChunkError> {
        let (offset, size) = self.chunk_region(chunk_id)?;
        Ok(&self.bytes[offset..offset + size])
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.directory.iter().map(|d| d.id)
    }
}

fn parse_directory(bytes: &[u8]) -> Result<Vec<ChunkDesc>, ChunkError> {
    if bytes.len() < HEADER_LEN {
        return Err(ChunkError::BadDirectory);
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != HEADER_MAGIC {
        return Err(ChunkError::BadDirectory);
    }
    let count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    let dir_len = count
        .checked_mul(DIRECTORY_ENTRY_LEN)
        .ok_or(ChunkError::BadDirectory)?;
    let dir_end = HEADER_LEN
        .checked_add(dir_len)
        .ok_or(ChunkError::BadDirectory)?;
    if bytes.len() < dir_end {
        return Err(ChunkError::BadDirectory);
    }

    let mut directory = Vec::with_capacity(count);
    for i in 0..count {
        let base = HEADER_LEN + i * DIRECTORY_ENTRY_LEN;
        let id = u32::from_le_bytes(bytes[base..base + 4].try_into().unwrap());
        let offset = u32::from_le_bytes(bytes[base + 4..base + 8].try_into().unwrap());
        let size = u32::from_le_bytes(bytes[base + 8..base + 12].try_into().unwrap());
        let end = (offset as usize).checked_add(size as usize).ok_or(ChunkError::BadDirectory)?;
        if end > bytes.len() {
            return Err(ChunkError::BadDirectory);
        }
        directory.push(ChunkDesc { id, offset, size });
    }
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_file(chunks: &[(u32, &[u8])]) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut descs = Vec::new();
        for (id, data) in chunks {
            descs.push((*id, payload.len() as u32, data.len() as u32));
            payload.extend_from_slice(data);
        }
        let mut out = Vec::new();
        out.extend_from_slice(&HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(&(descs.len() as u32).to_le_bytes());
        let header_and_dir_len = HEADER_LEN + descs.len() * DIRECTORY_ENTRY_LEN;
        for (id, offset, size) in &descs {
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&(offset + header_and_dir_len as u32).to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
        }
        out.extend_from_slice(&payload);
        out
    }

    #[test]
    fn reads_a_chunk_back() {
        let file = build_file(&[(1, b"hello"), (2, b"world!")]);
        let cf = ChunkedFile::from_bytes(file.into()).unwrap();
        assert_eq!(cf.chunk_bytes(1).unwrap(), b"hello");
        assert_eq!(cf.chunk_bytes(2).unwrap(), b"world!");
    }

    #[test]
    fn missing_chunk_is_not_found() {
        let file = build_file(&[(1, b"hello")]);
        let cf = ChunkedFile::from_bytes(file.into()).unwrap();
        assert!(matches!(cf.chunk_region(99), Err(ChunkError::NotFound(99))));
    }

    #[test]
    fn zero_size_chunk_is_empty_not_not_found() {
        let file = build_file(&[(1, b"")]);
        let cf = ChunkedFile::from_bytes(file.into()).unwrap();
        assert!(matches!(cf.chunk_region(1), Err(ChunkError::Empty(1))));
    }

    #[test]
    fn out_of_range_read_is_rejected() {
        let file = build_file(&[(1, b"hello")]);
        let cf = ChunkedFile::from_bytes(file.into()).unwrap();
        assert!(matches!(
            cf.borrow_bytes(1, 3, 10),
            Err(ChunkError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn partial_read_within_range_succeeds() {
        let file = build_file(&[(1, b"hello")]);
        let cf = ChunkedFile::from_bytes(file.into()).unwrap();
        assert_eq!(cf.borrow_bytes(1, 1, 3).unwrap(), b"ell");
    }

    #[test]
    fn truncated_header_is_bad_directory() {
        let err = ChunkedFile::from_bytes(vec![0u8; 3].into()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::AcdbError::IoData
        ));
    }
}
