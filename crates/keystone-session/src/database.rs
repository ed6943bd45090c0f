//! Database: one open database shared by all of its sessions
//!
//! Owns the [`StorageHandle`], the [`ExclusiveModeController`], the
//! [`ResultCache`] and the modification generation.
//!
//! WRITE ORDERING (per commit, under the commit mutex):
//! 1. Journal append (checksummed block, power-failure checked)
//! 2. Caller's in-memory apply
//! 3. Generation bump (SeqCst)
//!
//! If the journal append fails, nothing is applied and the generation does
//! not move. The bump happens before the writer sees success, so the writer's
//! next read can never be served a result captured before its own write.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use keystone_core::{BlockFile, Config, SessionId, StorageError, StorageHandle, StoreResult};

use crate::exclusive::ExclusiveModeController;
use crate::result_cache::ResultCache;
use crate::session::Session;
use crate::settings::Setting;

/// Commit journal inside the database directory.
pub const JOURNAL_FILE: &str = "commit.journal";

/// An open database.
pub struct Database {
    storage: StorageHandle,
    exclusive: ExclusiveModeController,
    cache: ResultCache,
    /// Incremented once per committed write
    generation: AtomicU64,
    /// Commit serialization point; also the journal writer
    journal: Mutex<BlockFile>,
    /// Records found in the journal at open
    recovered: Vec<Vec<u8>>,
    next_session: AtomicU64,
    closed: AtomicBool,
}

impl Database {
    /// Open or create the database at `path`.
    ///
    /// Scans the commit journal, drops a torn tail block left by a crash,
    /// and keeps the intact records for [`recovered_records`](Self::recovered_records).
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> StoreResult<Arc<Self>> {
        let storage = StorageHandle::open(path, config)?;
        let mut journal = storage.open_block_file(JOURNAL_FILE)?;
        let recovery = storage.recover_blocks(&mut journal)?;

        if recovery.torn_at.is_some() || recovery.skipped > 0 {
            warn!(
                recovered = recovery.payloads.len(),
                skipped = recovery.skipped,
                torn_at = ?recovery.torn_at,
                "commit journal needed repair"
            );
        }
        if !recovery.payloads.is_empty() {
            info!(
                records = recovery.payloads.len(),
                path = %storage.database_path().display(),
                "recovered committed records"
            );
        }

        let config = storage.config();
        let cache = ResultCache::new(config.result_cache_capacity, config.optimize_reuse_results);

        Ok(Arc::new(Self {
            exclusive: ExclusiveModeController::new(),
            cache,
            generation: AtomicU64::new(0),
            journal: Mutex::new(journal),
            recovered: recovery.payloads,
            next_session: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            storage,
        }))
    }

    /// Open a new session. Fails fast with `ExclusiveModeActive` while
    /// another session holds exclusive mode.
    pub fn connect(self: &Arc<Self>) -> StoreResult<Session> {
        if self.is_closed() {
            return Err(StorageError::DatabaseClosed);
        }
        let id = SessionId(self.next_session.fetch_add(1, Ordering::Relaxed));
        self.exclusive.admit(id)?;
        debug!(session = %id, "session connected");
        Ok(Session::new(id, Arc::clone(self)))
    }

    /// End `session`: release exclusive mode if it held it and cancel any
    /// wait it is parked in. Callable from any thread.
    pub fn disconnect(&self, session: SessionId) {
        self.exclusive.disconnect(session);
        debug!(%session, "session disconnected");
    }

    /// Current modification generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Journal `record`, run `apply`, then advance the generation. Returns
    /// `apply`'s result and the new generation.
    pub(crate) fn commit<R>(
        &self,
        record: &[u8],
        apply: impl FnOnce() -> R,
    ) -> StoreResult<(R, u64)> {
        let mut journal = self.journal.lock();
        self.storage.append_block(&mut journal, record)?;
        let result = apply();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, bytes = record.len(), "write committed");
        Ok((result, generation))
    }

    /// Apply a runtime option on behalf of `session`.
    pub fn apply_setting(&self, session: SessionId, setting: Setting) -> StoreResult<()> {
        match setting {
            Setting::Exclusive(enable) => self.exclusive.set_exclusive(session, enable),
            Setting::OptimizeReuseResults(enable) => {
                self.exclusive.execute_gate(session)?;
                self.cache.set_enabled(enable);
                Ok(())
            }
        }
    }

    /// Records that were committed before the last shutdown or crash.
    pub fn recovered_records(&self) -> &[Vec<u8>] {
        &self.recovered
    }

    /// The storage handler.
    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    /// The exclusive-mode state machine.
    pub fn exclusive(&self) -> &ExclusiveModeController {
        &self.exclusive
    }

    /// The result cache.
    pub fn result_cache(&self) -> &ResultCache {
        &self.cache
    }

    pub(crate) fn generation_counter(&self) -> &AtomicU64 {
        &self.generation
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close: wake blocked sessions with `ConnectionClosed`, release the
    /// exclusive lock, drop cached results, close storage. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.exclusive.shutdown();
        self.cache.clear();
        self.storage.close();
        info!(generation = self.generation(), "database closed");
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.storage.database_path())
            .field("generation", &self.generation())
            .field("exclusive", &self.exclusive.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
