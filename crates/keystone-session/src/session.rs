//! Session: one connection to a [`Database`]
//!
//! Every statement passes the exclusive-mode gate first. Queries then go
//! through the result cache; updates go through the commit path, which
//! journals the write and advances the modification generation before
//! reporting success.
//!
//! Dropping a session disconnects it, which releases exclusive mode if the
//! session held it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keystone_core::{SessionId, StorageError, StoreResult};

use crate::database::Database;
use crate::settings::Setting;
use crate::statement::PreparedStatement;
use crate::value::{Row, Rows};

/// A connection. Holds a shared reference to its database.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    db: Arc<Database>,
    closed: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: SessionId, db: Arc<Database>) -> Self {
        Self {
            id,
            db,
            closed: AtomicBool::new(false),
        }
    }

    /// This session's id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The database this session is connected to.
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// True if this session holds exclusive mode.
    pub fn is_exclusive(&self) -> bool {
        self.db.exclusive().is_holder(self.id)
    }

    /// `SET EXCLUSIVE TRUE|FALSE`.
    pub fn set_exclusive(&self, enable: bool) -> StoreResult<()> {
        self.ensure_open()?;
        self.db.apply_setting(self.id, Setting::Exclusive(enable))
    }

    /// `SET <name> <value>` for the runtime options.
    pub fn set(&self, name: &str, value: &str) -> StoreResult<()> {
        self.ensure_open()?;
        let setting = Setting::parse(name, value)?;
        self.db.apply_setting(self.id, setting)
    }

    /// Run a query. `scan` produces the rows when the statement actually
    /// executes; it is skipped when a valid cached result exists.
    pub fn execute_query<F>(&self, statement: &PreparedStatement, scan: F) -> StoreResult<Rows>
    where
        F: FnOnce() -> StoreResult<Vec<Row>>,
    {
        self.ensure_open()?;
        self.db.exclusive().execute_gate(self.id)?;
        self.db.result_cache().lookup_or_compute(
            &statement.fingerprint(),
            statement.is_cacheable(),
            self.db.generation_counter(),
            scan,
        )
    }

    /// Run a write. `record` is journaled first; `apply` mutates the
    /// in-memory state only once the record is durable. Returns `apply`'s
    /// result after the modification generation has advanced.
    pub fn execute_update<R>(&self, record: &[u8], apply: impl FnOnce() -> R) -> StoreResult<R> {
        self.ensure_open()?;
        self.db.exclusive().execute_gate(self.id)?;
        self.db.storage().check_writing_allowed()?;
        let (result, _generation) = self.db.commit(record, apply)?;
        Ok(result)
    }

    /// Disconnect. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.db.disconnect(self.id);
        }
    }

    /// True once closed by either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.db.is_closed()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            Err(StorageError::ConnectionClosed { session: self.id })
        } else {
            Ok(())
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
