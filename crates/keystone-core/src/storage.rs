//! StorageHandle: the single seam between the execution engine and disk
//!
//! Composes checksum verification, power-failure injection, write
//! permission, disk-space reclamation, and LOB ObjectId allocation.
//!
//! Layout under the database directory:
//!   lob.ids        checksummed blocks, each an ObjectId reservation
//!   tmp/*.temp.db  scratch files handed out by `create_temp_file`
//!
//! No operation retries. Every failure reaches the caller as a
//! [`StorageError`] naming the file involved.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::block_file::{BlockFile, Recovery};
use crate::checksum::{self, ChecksumMismatch, FailOnCorruption, InvalidChecksumPolicy};
use crate::config::{CompressionAlgorithm, Config};
use crate::error::{StorageError, StoreResult};
use crate::file_store::{AccessMode, FileStore};
use crate::ids::ObjectId;
use crate::object_id::ObjectIdAllocator;
use crate::power_failure::PowerFailureSimulator;

/// ObjectId reservation file inside the database directory.
pub const OBJECT_ID_FILE: &str = "lob.ids";
/// Directory for scratch files.
pub const TEMP_DIR: &str = "tmp";
const TEMP_SUFFIX: &str = ".temp.db";

/// Kind of large object, for compression selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LobType {
    /// Binary data
    Blob,
    /// Character data
    Clob,
}

/// Whether the database currently accepts writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteState {
    /// Normal operation
    Writable,
    /// Read-only until set back to `Writable`
    ReadOnly,
    /// Temporarily refusing writes (e.g. exclusive-lock handoff)
    Suspended(String),
}

struct IdState {
    allocator: ObjectIdAllocator,
    /// None when the database was opened read-only
    file: Option<BlockFile>,
}

/// Storage handler for one open database.
///
/// All methods take `&self`; the handle is shared by every session.
pub struct StorageHandle {
    /// Database directory
    path: PathBuf,
    config: Config,
    write_state: RwLock<WriteState>,
    /// Fault-injection countdown for this database
    power: Arc<PowerFailureSimulator>,
    /// Strategy consulted on every checksum mismatch
    checksum_policy: RwLock<Arc<dyn InvalidChecksumPolicy>>,
    ids: Mutex<IdState>,
    temp_files: Mutex<Vec<PathBuf>>,
    temp_counter: AtomicU64,
    lob_sync: Mutex<()>,
    closed: AtomicBool,
}

impl StorageHandle {
    /// Open or create the database directory at `path`.
    ///
    /// Validates `config`, reloads the ObjectId reservation (dropping a torn
    /// tail block), removes scratch files left by a previous process, and
    /// arms the power-failure countdown from `config.power_off_countdown`.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> StoreResult<Self> {
        config.validate().map_err(|reason| StorageError::InvalidSetting {
            name: "config".into(),
            value: reason,
        })?;
        let path = path.as_ref().to_path_buf();

        if config.read_only {
            if !path.is_dir() {
                return Err(StorageError::NotFound { path });
            }
        } else {
            std::fs::create_dir_all(&path).map_err(|e| {
                StorageError::io_at(&path, &e, "Failed to create database directory")
            })?;
            remove_stale_temp_files(&path.join(TEMP_DIR));
        }

        let checksum_policy: Arc<dyn InvalidChecksumPolicy> = Arc::new(FailOnCorruption);
        let ids = load_object_ids(&path, &config, checksum_policy.as_ref())?;
        let write_state = if config.read_only {
            WriteState::ReadOnly
        } else {
            WriteState::Writable
        };
        let power = Arc::new(PowerFailureSimulator::with_countdown(config.power_off_countdown));

        info!(
            path = %path.display(),
            read_only = config.read_only,
            power_off_countdown = config.power_off_countdown,
            "storage opened"
        );

        Ok(Self {
            path,
            config,
            write_state: RwLock::new(write_state),
            power,
            checksum_policy: RwLock::new(checksum_policy),
            ids: Mutex::new(ids),
            temp_files: Mutex::new(Vec::new()),
            temp_counter: AtomicU64::new(0),
            lob_sync: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Directory the database was opened with.
    pub fn database_path(&self) -> &Path {
        &self.path
    }

    /// Configuration applied at open.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a file resource. Relative names resolve inside the database
    /// directory. Writable modes require [`check_writing_allowed`](Self::check_writing_allowed).
    pub fn open_file(
        &self,
        name: impl AsRef<Path>,
        mode: AccessMode,
        must_exist: bool,
    ) -> StoreResult<FileStore> {
        self.ensure_open()?;
        if mode.is_writable() {
            self.check_writing_allowed()?;
        }
        FileStore::open(&self.path.join(name), mode, must_exist)
    }

    /// Checksum over `data[start..end]`. `InvalidRange` if the range does not
    /// fit `data`.
    pub fn compute_checksum(&self, data: &[u8], start: usize, end: usize) -> StoreResult<u32> {
        checksum::checked_checksum(data, start, end)
    }

    /// Verify a range read from `file`, routing a mismatch through the
    /// installed policy. `Ok(false)` means the policy recovered.
    pub fn verify_checksum(
        &self,
        data: &[u8],
        start: usize,
        end: usize,
        expected: u32,
        file: &Path,
        base_offset: u64,
    ) -> StoreResult<bool> {
        let policy = self.policy();
        checksum::verify_range(data, start, end, expected, file, base_offset, policy.as_ref())
    }

    /// Report a mismatch found by the caller's own verification.
    pub fn handle_invalid_checksum(&self, mismatch: &ChecksumMismatch) -> StoreResult<()> {
        self.policy().handle_invalid_checksum(mismatch)
    }

    /// Install a recovery strategy for checksum mismatches.
    pub fn set_checksum_policy(&self, policy: Arc<dyn InvalidChecksumPolicy>) {
        *self.checksum_policy.write() = policy;
    }

    fn policy(&self) -> Arc<dyn InvalidChecksumPolicy> {
        Arc::clone(&self.checksum_policy.read())
    }

    /// Count down the power-failure simulator; fails once it hits zero.
    pub fn check_power_off(&self) -> StoreResult<()> {
        self.power.check()
    }

    /// The simulator shared by every writer of this database.
    pub fn power(&self) -> &Arc<PowerFailureSimulator> {
        &self.power
    }

    /// Arm the simulator so the `countdown`-th write check from now fails.
    pub fn arm_power_failure(&self, countdown: u64) {
        info!(countdown, "power failure armed");
        self.power.arm(countdown);
    }

    /// Restore power after a simulated failure.
    pub fn reset_power_failure(&self) {
        self.power.reset();
    }

    /// Fails with `ReadOnly` unless writes are currently permitted.
    pub fn check_writing_allowed(&self) -> StoreResult<()> {
        self.ensure_open()?;
        match &*self.write_state.read() {
            WriteState::Writable => Ok(()),
            WriteState::ReadOnly => Err(StorageError::ReadOnly {
                reason: if self.config.read_only {
                    "database opened read-only".into()
                } else {
                    "database set read-only".into()
                },
            }),
            WriteState::Suspended(reason) => Err(StorageError::ReadOnly {
                reason: reason.clone(),
            }),
        }
    }

    /// Current write state.
    pub fn write_state(&self) -> WriteState {
        self.write_state.read().clone()
    }

    /// Change the write state. A database opened read-only stays read-only.
    pub fn set_write_state(&self, state: WriteState) -> StoreResult<()> {
        if self.config.read_only && state != WriteState::ReadOnly {
            return Err(StorageError::ReadOnly {
                reason: "database opened read-only".into(),
            });
        }
        let mut current = self.write_state.write();
        if *current != state {
            info!(from = ?*current, to = ?state, "write state changed");
            *current = state;
        }
        Ok(())
    }

    /// Best-effort reclamation: delete registered scratch files.
    ///
    /// Returns the bytes reclaimed. Fails with `DiskFull` only if nothing
    /// could be freed. Files the caller already deleted are forgotten.
    pub fn free_up_disk_space(&self, requested_bytes: u64) -> StoreResult<u64> {
        let mut temp_files = self.temp_files.lock();
        let mut freed = 0u64;
        let mut removed = 0usize;

        temp_files.retain(|path| {
            let len = match std::fs::metadata(path) {
                Ok(meta) => meta.len(),
                Err(_) => return false,
            };
            match std::fs::remove_file(path) {
                Ok(()) => {
                    freed += len;
                    removed += 1;
                    false
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "could not remove temp file");
                    true
                }
            }
        });

        if removed == 0 {
            warn!(requested_bytes, "no disk space could be reclaimed");
            return Err(StorageError::DiskFull {
                path: Some(self.path.clone()),
                requested_bytes,
            });
        }
        info!(removed, freed, requested_bytes, "reclaimed disk space");
        Ok(freed)
    }

    /// Append one checksummed block, subject to write permission and the
    /// power-failure countdown.
    pub fn append_block(&self, file: &mut BlockFile, payload: &[u8]) -> StoreResult<u64> {
        self.check_writing_allowed()?;
        file.append(payload, &self.power)
    }

    /// Recover a block file with the installed checksum policy.
    pub fn recover_blocks(&self, file: &mut BlockFile) -> StoreResult<Recovery> {
        let policy = self.policy();
        if self.config.read_only {
            file.scan(policy.as_ref())
        } else {
            file.recover(policy.as_ref())
        }
    }

    /// Open (or create) a block file inside the database directory.
    pub fn open_block_file(&self, name: &str) -> StoreResult<BlockFile> {
        self.ensure_open()?;
        let path = self.path.join(name);
        if self.config.read_only {
            BlockFile::open_read_only(&path, self.config.max_block_size)
        } else {
            BlockFile::open(&path, self.config.max_block_size, self.config.sync_writes)
        }
    }

    /// Allocate a LOB ObjectId.
    ///
    /// With `need_fresh` the id was never handed out before, not even across
    /// restarts. Without it a released id from the same namespace may be
    /// reused. A live id is never returned.
    pub fn allocate_object_id(&self, need_fresh: bool, data_file: bool) -> StoreResult<ObjectId> {
        self.ensure_open()?;
        let mut ids = self.ids.lock();
        let IdState { allocator, file } = &mut *ids;

        let (id, advanced) = allocator.allocate(need_fresh, data_file)?;
        if advanced {
            let reservation = allocator.reservation();
            let persisted = match file {
                Some(file) => self.append_block(file, &reservation),
                None => Err(StorageError::ReadOnly {
                    reason: "database opened read-only".into(),
                }),
            };
            if let Err(e) = persisted {
                allocator.discard(id, data_file);
                return Err(e);
            }
            allocator.mark_persisted();
            debug!(id = id.0, data_file, "ObjectId reservation advanced");
        }
        Ok(id)
    }

    /// Add a reference to a live ObjectId (a LOB copied into another row).
    pub fn retain_object_id(&self, id: ObjectId, data_file: bool) -> bool {
        self.ids.lock().allocator.retain(id, data_file)
    }

    /// Drop a reference to a LOB's id. Returns false if it was not live.
    pub fn release_object_id(&self, id: ObjectId, data_file: bool) -> bool {
        self.ids.lock().allocator.release(id, data_file)
    }

    /// True if `id` is held by a live LOB.
    pub fn is_object_id_live(&self, id: ObjectId, data_file: bool) -> bool {
        self.ids.lock().allocator.is_live(id, data_file)
    }

    /// Compression tag for new LOBs of `lob_type`, or None for uncompressed.
    pub fn lob_compression_algorithm(&self, lob_type: LobType) -> Option<&'static str> {
        let algorithm: Option<CompressionAlgorithm> = match lob_type {
            LobType::Blob => self.config.lob_compression,
            LobType::Clob => self.config.clob_compression.or(self.config.lob_compression),
        };
        algorithm.map(|a| a.tag())
    }

    /// LOBs up to this many bytes are stored inline.
    pub fn max_length_inplace_lob(&self) -> usize {
        self.config.max_length_inplace_lob
    }

    /// Serialises LOB operations database-wide.
    pub fn lob_sync(&self) -> MutexGuard<'_, ()> {
        self.lob_sync.lock()
    }

    /// Create an empty scratch file with a path unique to this process and
    /// database. The file is registered for reclamation; the caller deletes
    /// it when done.
    pub fn create_temp_file(&self) -> StoreResult<PathBuf> {
        self.ensure_open()?;
        let dir = self.path.join(TEMP_DIR);
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::io_at(&dir, &e, "Failed to create temp directory"))?;

        loop {
            let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
            let path = dir.join(format!("{}-{}{}", std::process::id(), n, TEMP_SUFFIX));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    self.temp_files.lock().push(path.clone());
                    return Ok(path);
                }
                // Left behind by an earlier handle on the same directory
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StorageError::io_at(&path, &e, "Failed to create temp file")),
            }
        }
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the handle and delete leftover scratch files. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let leftovers = std::mem::take(&mut *self.temp_files.lock());
        for path in &leftovers {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "could not remove temp file on close"
                    );
                }
            }
        }
        info!(path = %self.path.display(), "storage closed");
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            Err(StorageError::DatabaseClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for StorageHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("path", &self.path)
            .field("write_state", &*self.write_state.read())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Rebuild the allocator from the last intact reservation block.
fn load_object_ids(
    path: &Path,
    config: &Config,
    policy: &dyn InvalidChecksumPolicy,
) -> StoreResult<IdState> {
    let id_path = path.join(OBJECT_ID_FILE);

    let (recovery, file) = if config.read_only {
        match BlockFile::open_read_only(&id_path, config.max_block_size) {
            Ok(mut file) => (file.scan(policy)?, None),
            Err(StorageError::NotFound { .. }) => (Recovery::default(), None),
            Err(e) => return Err(e),
        }
    } else {
        let mut file = BlockFile::open(&id_path, config.max_block_size, config.sync_writes)?;
        (file.recover(policy)?, Some(file))
    };

    let allocator = recovery
        .payloads
        .iter()
        .rev()
        .find_map(|payload| ObjectIdAllocator::from_reservation(payload));
    let allocator = match allocator {
        Some(allocator) => allocator,
        None => {
            if !recovery.payloads.is_empty() {
                warn!(
                    path = %id_path.display(),
                    "no readable ObjectId reservation, starting fresh"
                );
            }
            ObjectIdAllocator::new()
        }
    };
    debug!(
        path = %id_path.display(),
        blocks = recovery.payloads.len(),
        torn = recovery.torn_at.is_some(),
        "ObjectId reservation loaded"
    );
    Ok(IdState { allocator, file })
}

/// Scratch files from a previous process are garbage.
fn remove_stale_temp_files(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_temp = path.file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.ends_with(TEMP_SUFFIX));
        if is_temp && std::fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "removed stale temp files");
    }
}
