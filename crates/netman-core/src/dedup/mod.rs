//! Deduplicating, reference-counted multi-index
//!
//! [`DedupIndex`] stores immutable value objects (addresses, routes,
//! nameservers) keyed by their identity. Entries live in arena slots and are
//! addressed by [`EntryHandle`]s; each slot keeps the values contributed by
//! every owner so that retracting one contributor restores the value of the
//! remaining one.
//!
//! ```text
//!   by_key ──► slot ──► [owner 0: Arc<T>, owner 1: Arc<T>, ...]
//!                            ▲ visible value = last owner
//!   order  ──► [slot, slot, ...]   (insertion / priority order)
//! ```
//!
//! Structurally equal contributions share one `Arc` allocation.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;

/// A value that can be stored in a [`DedupIndex`]
///
/// `key()` returns the identity; two entries with equal keys can never
/// coexist in one index. Structural equality (`PartialEq`) compares every
/// field including metadata.
pub trait DedupEntry: Clone + PartialEq + fmt::Debug {
    /// Identity type
    type Key: Clone + Eq + Hash + Ord + fmt::Debug;

    /// Identity of this entry
    fn key(&self) -> Self::Key;
}

impl DedupEntry for IpAddr {
    type Key = IpAddr;

    fn key(&self) -> IpAddr {
        *self
    }
}

impl DedupEntry for String {
    type Key = String;

    fn key(&self) -> String {
        self.clone()
    }
}

/// Handle to an index slot
///
/// Handles carry a generation so that a handle to a slot that has since been
/// freed and reused is recognized as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    slot: usize,
    generation: u64,
}

#[derive(Debug, Clone)]
struct Slot<T: DedupEntry> {
    generation: u64,
    key: T::Key,
    owners: Vec<Arc<T>>,
}

impl<T: DedupEntry> Slot<T> {
    fn visible(&self) -> &Arc<T> {
        // a live slot always has at least one owner
        &self.owners[self.owners.len() - 1]
    }

    fn value(&self) -> &T {
        self.visible()
    }
}

/// Result of diffing two indices by identity
#[derive(Debug)]
pub struct IndexDiff<'a, T> {
    /// Entries only present in the left index
    pub only_left: Vec<&'a T>,
    /// Entries only present in the right index
    pub only_right: Vec<&'a T>,
    /// Entries present in both whose values differ (left, right)
    pub changed: Vec<(&'a T, &'a T)>,
}

impl<T> IndexDiff<'_, T> {
    /// True when both sides hold the same entries
    pub fn is_empty(&self) -> bool {
        self.only_left.is_empty() && self.only_right.is_empty() && self.changed.is_empty()
    }
}

/// Deduplicating, reference-counted, ordered index
#[derive(Debug, Clone)]
pub struct DedupIndex<T: DedupEntry> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<usize>,
    by_key: HashMap<T::Key, usize>,
    order: Vec<usize>,
    next_generation: u64,
}

impl<T: DedupEntry> Default for DedupIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DedupEntry> DedupIndex<T> {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_key: HashMap::new(),
            order: Vec::new(),
            next_generation: 0,
        }
    }

    /// Number of distinct entries
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the index holds no entry
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert an entry, returning the handle of its slot
    ///
    /// Inserting an entry whose identity is already present never creates a
    /// second slot: the ownership count grows by one and the visible value
    /// becomes the newly inserted one.
    pub fn insert(&mut self, entry: T) -> EntryHandle {
        self.insert_shared(Arc::new(entry))
    }

    /// Insert an already shared entry
    ///
    /// Used when copying entries between indices so both keep pointing at
    /// the same allocation.
    pub fn insert_shared(&mut self, entry: Arc<T>) -> EntryHandle {
        let key = entry.key();
        if let Some(&idx) = self.by_key.get(&key) {
            if let Some(slot) = self.slots[idx].as_mut() {
                let shared = slot
                    .owners
                    .iter()
                    .find(|owner| ***owner == *entry)
                    .cloned()
                    .unwrap_or(entry);
                slot.owners.push(shared);
                return EntryHandle {
                    slot: idx,
                    generation: slot.generation,
                };
            }
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        let slot = Slot {
            generation,
            key: key.clone(),
            owners: vec![entry],
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.by_key.insert(key, idx);
        self.order.push(idx);
        EntryHandle {
            slot: idx,
            generation,
        }
    }

    /// Release one reference held through `handle`
    ///
    /// A handle names a slot, not one contribution: every owner of an
    /// identity gets the same handle, so this releases the most recent
    /// owner. Use [`DedupIndex::release`] to retract a specific value.
    ///
    /// Returns the value that was dropped from the slot. Unknown or stale
    /// handles are ignored.
    pub fn remove(&mut self, handle: EntryHandle) -> Option<Arc<T>> {
        let slot = self.slots.get_mut(handle.slot)?.as_mut()?;
        if slot.generation != handle.generation {
            return None;
        }
        let dropped = slot.owners.pop();
        if slot.owners.is_empty() {
            self.free_slot(handle.slot);
        }
        dropped
    }

    /// Release the reference that `entry` contributed
    ///
    /// The owner structurally equal to `entry` is preferred; otherwise the
    /// most recent owner is released. Returns false when the identity is
    /// unknown.
    pub fn release(&mut self, entry: &T) -> bool {
        let Some(&idx) = self.by_key.get(&entry.key()) else {
            return false;
        };
        let Some(slot) = self.slots[idx].as_mut() else {
            return false;
        };
        match slot.owners.iter().rposition(|owner| **owner == *entry) {
            Some(pos) => {
                slot.owners.remove(pos);
            }
            None => {
                slot.owners.pop();
            }
        }
        if slot.owners.is_empty() {
            self.free_slot(idx);
        }
        true
    }

    /// Drop the slot for `key` regardless of its ownership count
    pub fn remove_key(&mut self, key: &T::Key) -> Option<Arc<T>> {
        let idx = *self.by_key.get(key)?;
        let visible = self.slots[idx].as_ref().map(|slot| slot.visible().clone());
        self.free_slot(idx);
        visible
    }

    fn free_slot(&mut self, idx: usize) {
        if let Some(slot) = self.slots[idx].take() {
            self.by_key.remove(&slot.key);
            self.order.retain(|&i| i != idx);
            self.free.push(idx);
        }
    }

    /// Look up the visible value for an identity
    pub fn lookup(&self, key: &T::Key) -> Option<&T> {
        let idx = *self.by_key.get(key)?;
        self.slots[idx].as_ref().map(Slot::value)
    }

    /// Whether an entry with this identity is present
    pub fn contains_key(&self, key: &T::Key) -> bool {
        self.by_key.contains_key(key)
    }

    /// Handle of the slot holding `key`
    pub fn handle_of(&self, key: &T::Key) -> Option<EntryHandle> {
        let idx = *self.by_key.get(key)?;
        self.slots[idx].as_ref().map(|slot| EntryHandle {
            slot: idx,
            generation: slot.generation,
        })
    }

    /// Number of owners of the entry with this identity (0 if absent)
    pub fn ref_count(&self, key: &T::Key) -> usize {
        self.by_key
            .get(key)
            .and_then(|&idx| self.slots[idx].as_ref())
            .map_or(0, |slot| slot.owners.len())
    }

    /// Shared pointer to the visible value, for checking allocation sharing
    pub fn lookup_shared(&self, key: &T::Key) -> Option<Arc<T>> {
        let idx = *self.by_key.get(key)?;
        self.slots[idx].as_ref().map(|slot| slot.visible().clone())
    }

    /// Iterate visible values in index order
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.order
            .iter()
            .filter_map(|&idx| self.slots[idx].as_ref())
            .map(Slot::value)
    }

    /// Iterate the shared visible values in index order
    pub fn iter_shared(&self) -> impl Iterator<Item = &Arc<T>> + '_ {
        self.order
            .iter()
            .filter_map(|&idx| self.slots[idx].as_ref())
            .map(Slot::visible)
    }

    /// Entry at position `i` in index order
    pub fn get(&self, i: usize) -> Option<&T> {
        let idx = *self.order.get(i)?;
        self.slots[idx].as_ref().map(Slot::value)
    }

    /// Remove every entry
    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_key.clear();
        self.order.clear();
    }

    /// Keep only entries for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        let doomed: Vec<T::Key> = self.iter().filter(|e| !keep(e)).map(|e| e.key()).collect();
        for key in doomed {
            self.remove_key(&key);
        }
    }

    /// Reorder entries by `cmp` (stable)
    pub fn sort_by(&mut self, mut cmp: impl FnMut(&T, &T) -> Ordering) {
        let slots = &self.slots;
        self.order.sort_by(|&a, &b| match (&slots[a], &slots[b]) {
            (Some(a), Some(b)) => cmp(a.value(), b.value()),
            _ => Ordering::Equal,
        });
    }

    /// Copy every owner of `other` into this index
    ///
    /// Ownership counts add up and `Arc` allocations are shared with `other`.
    pub fn extend_from(&mut self, other: &Self) {
        for &idx in &other.order {
            if let Some(slot) = &other.slots[idx] {
                for owner in &slot.owners {
                    self.insert_shared(owner.clone());
                }
            }
        }
    }

    /// Diff against `other` by identity
    ///
    /// `same` decides whether two values with equal identity count as
    /// unchanged; it lets callers ignore metadata that does not matter to
    /// them.
    pub fn diff<'a>(
        &'a self,
        other: &'a Self,
        same: impl Fn(&T, &T) -> bool,
    ) -> IndexDiff<'a, T> {
        let mut diff = IndexDiff {
            only_left: Vec::new(),
            only_right: Vec::new(),
            changed: Vec::new(),
        };
        for entry in self.iter() {
            match other.lookup(&entry.key()) {
                None => diff.only_left.push(entry),
                Some(theirs) if !same(entry, theirs) => diff.changed.push((entry, theirs)),
                Some(_) => {}
            }
        }
        for entry in other.iter() {
            if !self.contains_key(&entry.key()) {
                diff.only_right.push(entry);
            }
        }
        diff
    }
}

impl<T: DedupEntry> PartialEq for DedupIndex<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl<T: DedupEntry + Eq> Eq for DedupIndex<T> {}

impl<T: DedupEntry> FromIterator<T> for DedupIndex<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut index = Self::new();
        for entry in iter {
            index.insert(entry);
        }
        index
    }
}
