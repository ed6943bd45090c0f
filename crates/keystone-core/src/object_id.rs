//! ObjectId allocation for out-of-line large objects
//!
//! Two independent namespaces: ids for LOBs kept in the main data file and
//! ids for LOBs kept in their own files. Within a namespace an id is either
//! fresh (never handed out before), live (referenced by at least one LOB),
//! or free (released, eligible for reuse when the caller does not need a
//! fresh id).
//!
//! Fresh ids are reserved in chunks. The reservation high-water mark is what
//! gets persisted, so after a crash allocation resumes above every id that
//! could have been handed out.

use hashbrown::HashSet;

use crate::error::{StorageError, StoreResult};
use crate::ids::ObjectId;
use crate::int_int_map::IntIntMap;

/// Fresh ids reserved per persisted high-water mark.
pub const ID_RESERVE_CHUNK: i32 = 1024;

/// First id handed out in an empty namespace.
const FIRST_ID: i32 = 1;

/// Serialized reservation size: two i32 high-water marks.
pub const RESERVATION_LEN: usize = 8;

#[derive(Debug)]
struct Namespace {
    name: &'static str,
    next_fresh: i32,
    /// In-memory high-water mark
    reserved_until: i32,
    /// High-water mark known to be on disk
    persisted_until: i32,
    /// id -> live reference count
    live: IntIntMap,
    free: Vec<i32>,
    free_set: HashSet<i32>,
}

impl Namespace {
    fn new(name: &'static str, mark: i32) -> Self {
        let mark = mark.max(FIRST_ID);
        Self {
            name,
            next_fresh: mark,
            reserved_until: mark,
            persisted_until: mark,
            live: IntIntMap::new(),
            free: Vec::new(),
            free_set: HashSet::new(),
        }
    }

    /// Returns the id and whether it lies above the persisted mark.
    fn allocate(&mut self, need_fresh: bool) -> StoreResult<(i32, bool)> {
        if !need_fresh {
            if let Some(id) = self.free.pop() {
                self.free_set.remove(&id);
                self.live.put(id, 1);
                return Ok((id, false));
            }
        }

        let id = self.next_fresh;
        self.next_fresh = id
            .checked_add(1)
            .ok_or(StorageError::IdSpaceExhausted {
                namespace: self.name,
            })?;

        let mut advanced = false;
        if self.next_fresh > self.persisted_until {
            if self.next_fresh > self.reserved_until {
                self.reserved_until = self.next_fresh.saturating_add(ID_RESERVE_CHUNK);
            }
            advanced = true;
        }
        self.live.put(id, 1);
        Ok((id, advanced))
    }

    /// Forget an id whose reservation could not be persisted. The id is
    /// burned, never recycled.
    fn discard(&mut self, id: i32) {
        self.live.remove(id);
    }

    fn retain(&mut self, id: i32) -> bool {
        match self.live.get(id) {
            Some(refs) => {
                self.live.put(id, refs.saturating_add(1));
                true
            }
            None => false,
        }
    }

    fn release(&mut self, id: i32) -> bool {
        match self.live.get(id) {
            Some(refs) if refs > 1 => {
                self.live.put(id, refs - 1);
                true
            }
            Some(_) => {
                self.live.remove(id);
                if self.free_set.insert(id) {
                    self.free.push(id);
                }
                true
            }
            None => false,
        }
    }
}

/// Allocator for both ObjectId namespaces of one database.
#[derive(Debug)]
pub struct ObjectIdAllocator {
    data_file: Namespace,
    separate: Namespace,
}

impl ObjectIdAllocator {
    /// Allocator for a new database.
    pub fn new() -> Self {
        Self::resume(FIRST_ID, FIRST_ID)
    }

    /// Allocator continuing after persisted high-water marks.
    pub fn resume(data_file_mark: i32, separate_mark: i32) -> Self {
        Self {
            data_file: Namespace::new("data file", data_file_mark),
            separate: Namespace::new("separate files", separate_mark),
        }
    }

    /// Allocator from a persisted reservation; None if the bytes are malformed.
    pub fn from_reservation(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != RESERVATION_LEN {
            return None;
        }
        let data_file = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let separate = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Some(Self::resume(data_file, separate))
    }

    /// Current high-water marks, ready to persist.
    pub fn reservation(&self) -> [u8; RESERVATION_LEN] {
        let mut buf = [0u8; RESERVATION_LEN];
        buf[0..4].copy_from_slice(&self.data_file.reserved_until.to_le_bytes());
        buf[4..8].copy_from_slice(&self.separate.reserved_until.to_le_bytes());
        buf
    }

    fn namespace(&mut self, data_file: bool) -> &mut Namespace {
        if data_file {
            &mut self.data_file
        } else {
            &mut self.separate
        }
    }

    /// Allocate an id. Returns the id and whether the caller must persist
    /// [`reservation`](Self::reservation) and call
    /// [`mark_persisted`](Self::mark_persisted) before handing the id out.
    /// If persisting fails, [`discard`](Self::discard) the id.
    ///
    /// With `need_fresh` the id has never been handed out in this namespace.
    /// Without it a released id may be recycled. Never returns a live id.
    pub fn allocate(&mut self, need_fresh: bool, data_file: bool) -> StoreResult<(ObjectId, bool)> {
        let (id, advanced) = self.namespace(data_file).allocate(need_fresh)?;
        Ok((ObjectId(id), advanced))
    }

    /// The current reservation reached disk.
    pub fn mark_persisted(&mut self) {
        self.data_file.persisted_until = self.data_file.reserved_until;
        self.separate.persisted_until = self.separate.reserved_until;
    }

    /// Drop an id whose reservation failed to persist.
    pub fn discard(&mut self, id: ObjectId, data_file: bool) {
        self.namespace(data_file).discard(id.0);
    }

    /// Add a reference to a live id. False if the id is not live.
    pub fn retain(&mut self, id: ObjectId, data_file: bool) -> bool {
        self.namespace(data_file).retain(id.0)
    }

    /// Drop a reference; the id becomes free when the last one goes.
    /// False if the id was not live.
    pub fn release(&mut self, id: ObjectId, data_file: bool) -> bool {
        self.namespace(data_file).release(id.0)
    }

    /// True if `id` is referenced by a live LOB.
    pub fn is_live(&self, id: ObjectId, data_file: bool) -> bool {
        let ns = if data_file {
            &self.data_file
        } else {
            &self.separate
        };
        ns.live.contains_key(id.0)
    }

    /// Number of live ids in a namespace.
    pub fn live_count(&self, data_file: bool) -> usize {
        let ns = if data_file {
            &self.data_file
        } else {
            &self.separate
        };
        ns.live.len()
    }
}

impl Default for ObjectIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
