//! Open-addressing map from `i32` keys to `i32` values
//!
//! Two flat arrays, no per-entry allocation. An empty slot is marked by the
//! reserved value [`NOT_FOUND`] in the value array; there are no tombstones.
//! Removal uses backward-shift deletion: entries after the removed slot in
//! the same probe run are moved back so every remaining key is still
//! reachable from its home slot.
//!
//! Not thread-safe. Owners that share a map across threads wrap it in their
//! own lock.

/// Reserved value marking an empty slot. Never storable; returned by
/// [`IntIntMap::get_or_not_found`] for absent keys.
pub const NOT_FOUND: i32 = i32::MIN;

const MIN_CAPACITY: usize = 16;

/// Resize when `len / capacity` would exceed 3/4.
const LOAD_NUMERATOR: usize = 3;
const LOAD_DENOMINATOR: usize = 4;

/// Primitive `i32 -> i32` hash map.
#[derive(Debug, Clone)]
pub struct IntIntMap {
    keys: Vec<i32>,
    values: Vec<i32>,
    len: usize,
    mask: usize,
}

impl IntIntMap {
    /// Empty map with the minimum capacity.
    pub fn new() -> Self {
        Self::with_capacity(MIN_CAPACITY)
    }

    /// Empty map able to hold `capacity` entries without resizing.
    pub fn with_capacity(capacity: usize) -> Self {
        let slots = (capacity * LOAD_DENOMINATOR / LOAD_NUMERATOR + 1)
            .max(MIN_CAPACITY)
            .next_power_of_two();
        Self {
            keys: vec![0; slots],
            values: vec![NOT_FOUND; slots],
            len: 0,
            mask: slots - 1,
        }
    }

    /// Number of entries. O(1).
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of slots currently allocated.
    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    fn home(&self, key: i32) -> usize {
        // Fibonacci hashing; spreads sequential and stride-aligned keys
        let h = (key as u32).wrapping_mul(0x9E37_79B9);
        (h ^ (h >> 16)) as usize & self.mask
    }

    #[inline]
    fn is_empty_slot(&self, slot: usize) -> bool {
        self.values[slot] == NOT_FOUND
    }

    /// Slot holding `key`, if present.
    fn find(&self, key: i32) -> Option<usize> {
        let mut slot = self.home(key);
        loop {
            if self.is_empty_slot(slot) {
                return None;
            }
            if self.keys[slot] == key {
                return Some(slot);
            }
            slot = (slot + 1) & self.mask;
        }
    }

    /// Insert or overwrite. Returns the previous value.
    ///
    /// # Panics
    /// Panics if `value` is [`NOT_FOUND`], the reserved empty marker.
    pub fn put(&mut self, key: i32, value: i32) -> Option<i32> {
        assert_ne!(value, NOT_FOUND, "NOT_FOUND is reserved and cannot be stored");

        if (self.len + 1) * LOAD_DENOMINATOR > self.capacity() * LOAD_NUMERATOR {
            self.grow();
        }

        let mut slot = self.home(key);
        loop {
            if self.is_empty_slot(slot) {
                self.keys[slot] = key;
                self.values[slot] = value;
                self.len += 1;
                return None;
            }
            if self.keys[slot] == key {
                return Some(std::mem::replace(&mut self.values[slot], value));
            }
            slot = (slot + 1) & self.mask;
        }
    }

    /// Value for `key`.
    pub fn get(&self, key: i32) -> Option<i32> {
        self.find(key).map(|slot| self.values[slot])
    }

    /// Value for `key`, or [`NOT_FOUND`].
    pub fn get_or_not_found(&self, key: i32) -> i32 {
        self.get(key).unwrap_or(NOT_FOUND)
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: i32) -> bool {
        self.find(key).is_some()
    }

    /// Remove `key`. Returns its value if it was present.
    pub fn remove(&mut self, key: i32) -> Option<i32> {
        let mut hole = self.find(key)?;
        let removed = self.values[hole];

        // Backward shift: pull later members of the probe run into the hole
        // unless that would move them in front of their home slot.
        let mut slot = hole;
        loop {
            slot = (slot + 1) & self.mask;
            if self.is_empty_slot(slot) {
                break;
            }
            let home = self.home(self.keys[slot]);
            let dist_to_slot = slot.wrapping_sub(home) & self.mask;
            let dist_to_hole = hole.wrapping_sub(home) & self.mask;
            if dist_to_hole <= dist_to_slot {
                self.keys[hole] = self.keys[slot];
                self.values[hole] = self.values[slot];
                hole = slot;
            }
        }

        self.values[hole] = NOT_FOUND;
        self.len -= 1;
        Some(removed)
    }

    /// Remove every entry, keeping the allocation.
    pub fn clear(&mut self) {
        self.values.iter_mut().for_each(|v| *v = NOT_FOUND);
        self.len = 0;
    }

    /// Iterate `(key, value)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.keys.iter().zip(self.values.iter())
            .filter(|(_, &v)| v != NOT_FOUND)
            .map(|(&k, &v)| (k, v))
    }

    fn grow(&mut self) {
        let slots = self.capacity() * 2;
        let old_keys = std::mem::replace(&mut self.keys, vec![0; slots]);
        let old_values = std::mem::replace(&mut self.values, vec![NOT_FOUND; slots]);
        self.mask = slots - 1;
        self.len = 0;
        for (key, value) in old_keys.into_iter().zip(old_values) {
            if value != NOT_FOUND {
                self.put(key, value);
            }
        }
    }
}

impl Default for IntIntMap {
    fn default() -> Self {
        Self::new()
    }
}
