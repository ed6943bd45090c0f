//! Checksum guard and the checksummed block format
//!
//! Callers own their byte layouts; this module only stamps a payload with a
//! CRC32C and verifies it again on the way back in. A block on disk is:
//! BlockHeader (16 bytes) + payload bytes
//!
//! When verification fails the mismatch is handed to an
//! [`InvalidChecksumPolicy`]. The default policy turns it into
//! [`StorageError::Corruption`]; a rebuild procedure may install its own
//! policy and recover instead.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{StorageError, StoreResult};

/// Magic bytes identifying a keystone block: "KSTN"
pub const BLOCK_MAGIC: [u8; 4] = [0x4B, 0x53, 0x54, 0x4E];

/// Block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Checksum over `data[start..end]`.
///
/// Deterministic and pure: the same bytes always give the same value, and any
/// single-bit change inside the range changes it. Used both to stamp and to
/// verify.
///
/// # Panics
/// Panics if `start > end` or `end > data.len()`.
pub fn compute_checksum(data: &[u8], start: usize, end: usize) -> u32 {
    crc32c::crc32c(&data[start..end])
}

/// [`compute_checksum`] for caller-supplied ranges: `InvalidRange` instead of
/// a panic when the range does not fit `data`.
pub fn checked_checksum(data: &[u8], start: usize, end: usize) -> StoreResult<u32> {
    data.get(start..end)
        .map(crc32c::crc32c)
        .ok_or(StorageError::InvalidRange {
            start,
            end,
            len: data.len(),
        })
}

/// Everything known about one failed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    /// File the bytes came from
    pub path: PathBuf,
    /// Start of the verified range (file offset)
    pub start: u64,
    /// End of the verified range, exclusive
    pub end: u64,
    /// Stored checksum
    pub expected: u32,
    /// Computed checksum
    pub actual: u32,
}

impl From<&ChecksumMismatch> for StorageError {
    fn from(m: &ChecksumMismatch) -> Self {
        StorageError::Corruption {
            path: m.path.clone(),
            start: m.start,
            end: m.end,
            expected: m.expected,
            actual: m.actual,
        }
    }
}

/// Decides what an invalid checksum means.
///
/// Returning `Ok(())` suppresses the failure: the caller treats the range as
/// recovered and skips it. Returning `Err` aborts the read.
pub trait InvalidChecksumPolicy: Send + Sync {
    /// Called once per mismatching range.
    fn handle_invalid_checksum(&self, mismatch: &ChecksumMismatch) -> StoreResult<()>;
}

/// Default policy: every mismatch is fatal corruption.
#[derive(Debug, Default, Clone, Copy)]
pub struct FailOnCorruption;

impl InvalidChecksumPolicy for FailOnCorruption {
    fn handle_invalid_checksum(&self, mismatch: &ChecksumMismatch) -> StoreResult<()> {
        Err(mismatch.into())
    }
}

/// Recovery policy for rebuild-on-the-fly: log and skip the damaged range.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipCorrupted;

impl InvalidChecksumPolicy for SkipCorrupted {
    fn handle_invalid_checksum(&self, mismatch: &ChecksumMismatch) -> StoreResult<()> {
        warn!(
            path = %mismatch.path.display(),
            start = mismatch.start,
            end = mismatch.end,
            "skipping block with invalid checksum"
        );
        Ok(())
    }
}

/// Verify `data[start..end]` against `expected`.
///
/// Returns `Ok(true)` when the checksum matches, `Ok(false)` when it did not
/// match but the policy recovered, and the policy's error otherwise.
/// `base_offset` is the file offset of `data[0]`, used for diagnostics.
pub fn verify_range(
    data: &[u8],
    start: usize,
    end: usize,
    expected: u32,
    path: &Path,
    base_offset: u64,
    policy: &dyn InvalidChecksumPolicy,
) -> StoreResult<bool> {
    let actual = checked_checksum(data, start, end)?;
    if actual == expected {
        return Ok(true);
    }
    let mismatch = ChecksumMismatch {
        path: path.to_path_buf(),
        start: base_offset + start as u64,
        end: base_offset + end as u64,
        expected,
        actual,
    };
    policy.handle_invalid_checksum(&mismatch)?;
    Ok(false)
}

/// Fixed-size header in front of every block payload.
///
/// Layout:
///   [0..4]   magic:    [u8;4] - "KSTN"
///   [4..8]   length:   u32 LE - payload length in bytes
///   [8..12]  checksum: u32 LE - CRC32C of payload bytes
///   [12..16] reserved: [u8;4] - zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Magic bytes for block identification and resync after damage
    pub magic: [u8; 4],
    /// Payload length (excluding this header)
    pub length: u32,
    /// CRC32C checksum of the payload bytes
    pub checksum: u32,
}

impl BlockHeader {
    /// Header for `payload`.
    pub fn for_payload(payload: &[u8]) -> Self {
        Self {
            magic: BLOCK_MAGIC,
            length: payload.len() as u32,
            checksum: compute_checksum(payload, 0, payload.len()),
        }
    }

    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut buf = [0u8; BLOCK_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 12..16 are reserved, already zero
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; BLOCK_HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);
        Self {
            magic,
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            checksum: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    /// True if the magic bytes are intact.
    pub fn has_magic(&self) -> bool {
        self.magic == BLOCK_MAGIC
    }
}

/// Stamp `payload` into a complete block (header + payload).
pub fn stamp_block(payload: &[u8], max_block_size: usize) -> StoreResult<Vec<u8>> {
    // Validate size BEFORE any allocation
    if payload.len() > max_block_size {
        return Err(StorageError::OversizedBlock {
            len: payload.len() as u64,
            max: max_block_size as u64,
        });
    }

    let header = BlockHeader::for_payload(payload);
    let mut buffer = Vec::with_capacity(BLOCK_HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Scan forward in buffer to find next occurrence of the block magic.
/// Used for resynchronization after encountering damage.
pub fn find_next_magic(buffer: &[u8], start: usize) -> Option<usize> {
    if buffer.len() < BLOCK_MAGIC.len() {
        return None;
    }
    (start..=buffer.len() - BLOCK_MAGIC.len()).find(|&i| buffer[i..i + 4] == BLOCK_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRecovery {
        calls: AtomicUsize,
    }

    impl InvalidChecksumPolicy for CountingRecovery {
        fn handle_invalid_checksum(&self, _mismatch: &ChecksumMismatch) -> StoreResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_header_roundtrip_keeps_fields() {
        let header = BlockHeader::for_payload(b"payload");
        let parsed = BlockHeader::from_bytes(&header.to_bytes());
        assert_eq!(parsed, header);
        assert!(parsed.has_magic());
        assert_eq!(parsed.length, 7);
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let data = b"the same bytes every time".to_vec();
        assert_eq!(
            compute_checksum(&data, 0, data.len()),
            compute_checksum(&data.clone(), 0, data.len())
        );
    }

    #[test]
    fn test_checksum_respects_range() {
        let data = b"xxxxHELLOyyyy";
        assert_eq!(compute_checksum(data, 4, 9), compute_checksum(b"HELLO", 0, 5));
        assert_ne!(compute_checksum(data, 0, 9), compute_checksum(data, 4, 9));
    }

    #[test]
    fn test_empty_range() {
        let data = b"abc";
        assert_eq!(compute_checksum(data, 1, 1), compute_checksum(&[], 0, 0));
    }

    #[test]
    fn test_every_single_bit_flip_detected() {
        let data: Vec<u8> = (0..64u8).collect();
        let original = compute_checksum(&data, 0, data.len());
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut flipped = data.clone();
                flipped[byte] ^= 1 << bit;
                assert_ne!(
                    compute_checksum(&flipped, 0, flipped.len()),
                    original,
                    "flip of byte {} bit {} undetected",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_default_policy_reports_corruption() {
        let data = b"abcdef";
        let err = verify_range(data, 1, 4, 0xDEADBEEF, Path::new("t.data"), 100, &FailOnCorruption)
            .unwrap_err();
        match err {
            StorageError::Corruption { start, end, expected, .. } => {
                assert_eq!(start, 101);
                assert_eq!(end, 104);
                assert_eq!(expected, 0xDEADBEEF);
            }
            other => panic!("Expected Corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_recovery_policy_suppresses() {
        let policy = CountingRecovery {
            calls: AtomicUsize::new(0),
        };
        let data = b"abcdef";
        let ok = verify_range(data, 0, 6, 1, Path::new("t.data"), 0, &policy).unwrap();
        assert!(!ok);
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);

        let good = compute_checksum(data, 0, 6);
        assert!(verify_range(data, 0, 6, good, Path::new("t.data"), 0, &policy).unwrap());
        assert_eq!(policy.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_oversized_block_rejected() {
        let result = stamp_block(&[0u8; 33], 32);
        assert!(matches!(result, Err(StorageError::OversizedBlock { len: 33, max: 32 })));
        assert!(stamp_block(&[0u8; 32], 32).is_ok());
    }

    #[test]
    fn test_find_next_magic() {
        let mut buf = vec![0u8; 10];
        buf.extend_from_slice(&BLOCK_MAGIC);
        assert_eq!(find_next_magic(&buf, 0), Some(10));
        assert_eq!(find_next_magic(&buf, 11), None);
        assert_eq!(find_next_magic(&[1, 2], 0), None);
    }
}
