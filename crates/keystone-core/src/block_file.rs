//! Append-only file of checksummed blocks
//!
//! Used for everything this core persists on its own: the commit journal and
//! the ObjectId namespace. Each block is stamped by [`crate::checksum`].
//!
//! Write ordering for one block:
//! 1. stamp: header + payload built in memory with CRC32C
//! 2. power check, then write header
//! 3. power check, then write payload
//! 4. durable_sync (if configured)
//!
//! A simulated power loss between steps 2 and 3 leaves a torn block at the
//! tail. Recovery keeps every complete block whose checksum verifies, drops
//! the torn tail, and truncates the file back to the last good block so new
//! appends never land behind garbage. A `BlockFile` that is still open after
//! a failed append remembers where the torn block starts and cuts it off
//! before the next block is written.

use std::path::Path;

use tracing::{debug, warn};

use crate::checksum::{
    find_next_magic, stamp_block, verify_range, BlockHeader, InvalidChecksumPolicy,
    BLOCK_HEADER_SIZE,
};
use crate::error::{StorageError, StoreResult};
use crate::file_store::{AccessMode, FileStore};
use crate::power_failure::PowerFailureSimulator;

/// What a recovery scan found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recovery {
    /// Payloads of intact blocks, in file order
    pub payloads: Vec<Vec<u8>>,
    /// Blocks whose checksum failed and the policy chose to skip
    pub skipped: usize,
    /// Offset of the torn tail block, if the file ended mid-block
    pub torn_at: Option<u64>,
    /// Length of the file once the torn tail is cut off
    pub valid_len: u64,
}

/// Append-only checksummed block file.
#[derive(Debug)]
pub struct BlockFile {
    store: FileStore,
    max_block_size: usize,
    sync_writes: bool,
    /// Start of a block whose append did not complete
    torn_tail: Option<u64>,
}

impl BlockFile {
    /// Open or create the block file at `path`.
    pub fn open(path: &Path, max_block_size: usize, sync_writes: bool) -> StoreResult<Self> {
        let store = FileStore::open(path, AccessMode::ReadWrite, false)?;
        Ok(Self {
            store,
            max_block_size,
            sync_writes,
            torn_tail: None,
        })
    }

    /// Open an existing block file read-only.
    pub fn open_read_only(path: &Path, max_block_size: usize) -> StoreResult<Self> {
        let store = FileStore::open(path, AccessMode::Read, true)?;
        Ok(Self {
            store,
            max_block_size,
            sync_writes: false,
            torn_tail: None,
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// File length in bytes.
    pub fn len(&self) -> StoreResult<u64> {
        self.store.len()
    }

    /// True if no blocks have been written.
    pub fn is_empty(&self) -> StoreResult<bool> {
        self.store.is_empty()
    }

    /// Append one block. Returns the offset of its header.
    ///
    /// `power` is consulted before the header and before the payload, so a
    /// countdown can interrupt the block half-written. The half-written block
    /// stays on disk until the next append on this handle truncates it.
    pub fn append(&mut self, payload: &[u8], power: &PowerFailureSimulator) -> StoreResult<u64> {
        let block = stamp_block(payload, self.max_block_size)?;
        let path = self.store.path().to_path_buf();
        let with_path = |e: StorageError| match e {
            StorageError::SimulatedPowerLoss { path: None } => {
                StorageError::SimulatedPowerLoss {
                    path: Some(path.clone()),
                }
            }
            other => other,
        };

        power.check().map_err(with_path)?;
        self.discard_torn_tail()?;
        let offset = self.store.len()?;
        self.torn_tail = Some(offset);
        self.store.append(&block[..BLOCK_HEADER_SIZE])?;

        power.check().map_err(with_path)?;
        self.store.append(&block[BLOCK_HEADER_SIZE..])?;
        self.torn_tail = None;

        if self.sync_writes {
            self.store.sync()?;
        }
        Ok(offset)
    }

    /// Scan every block, verifying checksums through `policy`.
    ///
    /// Recovery algorithm:
    /// 1. Read 16-byte header, validate magic
    /// 2. Header runs past EOF or payload runs past EOF: torn tail, stop
    /// 3. Verify CRC32C; on mismatch ask the policy, skip the block if it recovers
    /// 4. Bad magic: resync on the next magic bytes
    pub fn scan(&mut self, policy: &dyn InvalidChecksumPolicy) -> StoreResult<Recovery> {
        let buffer = self.store.read_all()?;
        let path = self.store.path().to_path_buf();
        let mut recovery = Recovery::default();
        let mut offset = 0usize;

        while offset < buffer.len() {
            if offset + BLOCK_HEADER_SIZE > buffer.len() {
                recovery.torn_at = Some(offset as u64);
                break;
            }
            let mut header_bytes = [0u8; BLOCK_HEADER_SIZE];
            header_bytes.copy_from_slice(&buffer[offset..offset + BLOCK_HEADER_SIZE]);
            let header = BlockHeader::from_bytes(&header_bytes);

            if !header.has_magic() || header.length as usize > self.max_block_size {
                warn!(path = %path.display(), offset, "bad block header, scanning for next block");
                recovery.skipped += 1;
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => {
                        offset = next;
                        continue;
                    }
                    None => break,
                }
            }

            let payload_start = offset + BLOCK_HEADER_SIZE;
            let payload_end = payload_start + header.length as usize;
            if payload_end > buffer.len() {
                debug!(
                    path = %path.display(),
                    offset,
                    expected = header.length,
                    available = buffer.len() - payload_start,
                    "torn block at tail"
                );
                recovery.torn_at = Some(offset as u64);
                break;
            }

            let verified = verify_range(
                &buffer,
                payload_start,
                payload_end,
                header.checksum,
                &path,
                0,
                policy,
            )?;
            if verified {
                recovery.payloads.push(buffer[payload_start..payload_end].to_vec());
            } else {
                recovery.skipped += 1;
            }
            offset = payload_end;
        }

        recovery.valid_len = recovery.torn_at.unwrap_or(buffer.len() as u64);
        Ok(recovery)
    }

    /// Scan, then cut a torn tail off the file.
    pub fn recover(&mut self, policy: &dyn InvalidChecksumPolicy) -> StoreResult<Recovery> {
        let recovery = self.scan(policy)?;
        if let Some(torn_at) = recovery.torn_at {
            warn!(path = %self.path().display(), torn_at, "truncating torn block");
            self.store.set_len(torn_at)?;
            self.store.sync()?;
        }
        self.torn_tail = None;
        Ok(recovery)
    }

    /// Torn-tail check without truncation: `Err(TornBlock)` if the file ends mid-block.
    pub fn check_complete(&mut self, policy: &dyn InvalidChecksumPolicy) -> StoreResult<Recovery> {
        let recovery = self.scan(policy)?;
        if let Some(torn_at) = recovery.torn_at {
            let len = self.len()?;
            return Err(StorageError::TornBlock {
                path: self.path().to_path_buf(),
                offset: torn_at,
                expected_len: BLOCK_HEADER_SIZE as u64,
                available: len - torn_at,
            });
        }
        Ok(recovery)
    }

    /// Remove every block.
    pub fn clear(&mut self) -> StoreResult<()> {
        self.store.set_len(0)?;
        self.torn_tail = None;
        Ok(())
    }

    fn discard_torn_tail(&mut self) -> StoreResult<()> {
        if let Some(offset) = self.torn_tail {
            warn!(path = %self.path().display(), offset, "discarding torn block before append");
            self.store.set_len(offset)?;
            self.torn_tail = None;
        }
        Ok(())
    }
}
