//! Chaining hash table with progressive rehashing.
//!
//! A resize never happens in one pass. When the load factor crosses a
//! threshold a second table is allocated and nodes migrate from the old
//! table to the new one a bounded number at a time, piggybacked on
//! subsequent mutating operations. Until the old table drains, every
//! lookup, insert and delete consults both tables, so no key is ever
//! invisible mid-migration.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

/// Chains per slot beyond which a grow starts.
const MAX_LOAD_FACTOR: usize = 8;
/// Load factor (inverted) below which a shrink starts.
const MIN_LOAD_DIVISOR: usize = 8;
/// Nodes migrated from the draining table per mutating operation.
const REHASH_WORK: usize = 128;
const MIN_SLOTS: usize = 4;

struct Node<K, V> {
    hash: u64,
    key: K,
    value: V,
    next: Option<Box<Node<K, V>>>,
}

struct Table<K, V> {
    slots: Vec<Option<Box<Node<K, V>>>>,
    mask: u64,
    len: usize,
}

impl<K, V> Table<K, V> {
    fn new(slot_count: usize) -> Self {
        debug_assert!(slot_count.is_power_of_two());
        let mut slots = Vec::new();
        slots.resize_with(slot_count, || None);
        Self {
            slots,
            mask: (slot_count - 1) as u64,
            len: 0,
        }
    }

    fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot_of(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    fn push_front(&mut self, mut node: Box<Node<K, V>>) {
        let pos = self.slot_of(node.hash);
        node.next = self.slots[pos].take();
        self.slots[pos] = Some(node);
        self.len += 1;
    }

    fn find<Q>(&self, hash: u64, key: &Q) -> Option<&Node<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut cur = self.slots[self.slot_of(hash)].as_deref();
        while let Some(node) = cur {
            if node.hash == hash && node.key.borrow() == key {
                return Some(node);
            }
            cur = node.next.as_deref();
        }
        None
    }

    fn find_mut<Q>(&mut self, hash: u64, key: &Q) -> Option<&mut Node<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let pos = self.slot_of(hash);
        let mut cur = self.slots[pos].as_deref_mut();
        while let Some(node) = cur {
            if node.hash == hash && node.key.borrow() == key {
                return Some(node);
            }
            cur = node.next.as_deref_mut();
        }
        None
    }

    /// Unlink and return the matching node.
    fn take<Q>(&mut self, hash: u64, key: &Q) -> Option<Box<Node<K, V>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let pos = self.slot_of(hash);
        let node = Self::take_from(&mut self.slots[pos], hash, key)?;
        self.len -= 1;
        Some(node)
    }

    fn take_from<Q>(
        link: &mut Option<Box<Node<K, V>>>,
        hash: u64,
        key: &Q,
    ) -> Option<Box<Node<K, V>>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let node = link.as_mut()?;
        if node.hash == hash && node.key.borrow() == key {
            let mut found = link.take()?;
            *link = found.next.take();
            Some(found)
        } else {
            Self::take_from(&mut node.next, hash, key)
        }
    }

    /// Pop one node from the first non-empty slot at or after `start`.
    /// Returns the node and the slot it came from.
    fn pop_any(&mut self, start: usize) -> Option<(usize, Box<Node<K, V>>)> {
        for pos in start..self.slots.len() {
            if let Some(mut node) = self.slots[pos].take() {
                self.slots[pos] = node.next.take();
                self.len -= 1;
                return Some((pos, node));
            }
        }
        None
    }
}

pub struct Dict<K, V> {
    newer: Table<K, V>,
    older: Option<Table<K, V>>,
    migrate_pos: usize,
    hasher: RandomState,
}

impl<K: Hash + Eq, V> Dict<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            newer: Table::new(MIN_SLOTS),
            older: None,
            migrate_pos: 0,
            hasher: RandomState::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.newer.len + self.older.as_ref().map_or(0, |t| t.len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while a progressive resize is draining the old table.
    #[must_use]
    pub fn is_rehashing(&self) -> bool {
        self.older.is_some()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hasher.hash_one(key);
        if let Some(older) = &self.older
            && let Some(node) = older.find(hash, key)
        {
            return Some(&node.value);
        }
        self.newer.find(hash, key).map(|node| &node.value)
    }

    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let hash = self.hasher.hash_one(key);
        if let Some(older) = &mut self.older
            && older.find(hash, key).is_some()
        {
            return older.find_mut(hash, key).map(|node| &mut node.value);
        }
        self.newer.find_mut(hash, key).map(|node| &mut node.value)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Insert or replace, returning the previous value when present.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.migrate_some();
        let hash = self.hasher.hash_one(&key);
        if let Some(older) = &mut self.older
            && let Some(node) = older.find_mut(hash, &key)
        {
            return Some(std::mem::replace(&mut node.value, value));
        }
        if let Some(node) = self.newer.find_mut(hash, &key) {
            return Some(std::mem::replace(&mut node.value, value));
        }
        self.newer.push_front(Box::new(Node {
            hash,
            key,
            value,
            next: None,
        }));
        self.maybe_start_grow();
        None
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.migrate_some();
        let hash = self.hasher.hash_one(key);
        let node = match &mut self.older {
            Some(older) => older.take(hash, key).or_else(|| self.newer.take(hash, key)),
            None => self.newer.take(hash, key),
        }?;
        self.maybe_start_shrink();
        Some(node.value)
    }

    /// Iterate every live pair in bucket order, newer table first.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            tables: [Some(&self.newer), self.older.as_ref()],
            table_idx: 0,
            slot: 0,
            node: None,
        }
    }

    fn maybe_start_grow(&mut self) {
        if self.older.is_some() {
            return;
        }
        if self.newer.len >= self.newer.slot_count() * MAX_LOAD_FACTOR {
            let grown = Table::new(self.newer.slot_count() * 2);
            self.older = Some(std::mem::replace(&mut self.newer, grown));
            self.migrate_pos = 0;
        }
    }

    fn maybe_start_shrink(&mut self) {
        if self.older.is_some() || self.newer.slot_count() <= MIN_SLOTS {
            return;
        }
        if self.newer.len * MIN_LOAD_DIVISOR <= self.newer.slot_count() {
            let shrunk = Table::new(self.newer.slot_count() / 2);
            self.older = Some(std::mem::replace(&mut self.newer, shrunk));
            self.migrate_pos = 0;
        }
    }

    /// One bounded migration step. Element count is preserved: a node is
    /// unlinked from the old table and relinked into the new one before the
    /// next node is touched.
    fn migrate_some(&mut self) {
        let Some(older) = &mut self.older else {
            return;
        };
        for _ in 0..REHASH_WORK {
            match older.pop_any(self.migrate_pos) {
                Some((pos, node)) => {
                    self.migrate_pos = pos;
                    self.newer.push_front(node);
                }
                None => break,
            }
        }
        if older.len == 0 {
            self.older = None;
            self.migrate_pos = 0;
        }
    }
}

impl<K: Hash + Eq, V> Default for Dict<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for Dict<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        let mut it = Iter {
            tables: [Some(&self.newer), self.older.as_ref()],
            table_idx: 0,
            slot: 0,
            node: None,
        };
        for (k, v) in &mut it {
            map.entry(k, v);
        }
        map.finish()
    }
}

pub struct Iter<'a, K, V> {
    tables: [Option<&'a Table<K, V>>; 2],
    table_idx: usize,
    slot: usize,
    node: Option<&'a Node<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(node) = self.node {
                self.node = node.next.as_deref();
                return Some((&node.key, &node.value));
            }
            let table = self.tables.get(self.table_idx).copied().flatten()?;
            if self.slot >= table.slots.len() {
                self.table_idx += 1;
                self.slot = 0;
                continue;
            }
            self.node = table.slots[self.slot].as_deref();
            self.slot += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Dict, MAX_LOAD_FACTOR, MIN_SLOTS};
    use proptest::prelude::*;
    use std::collections::HashMap;

    #[test]
    fn insert_get_remove() {
        let mut dict: Dict<Vec<u8>, u32> = Dict::new();
        assert_eq!(dict.insert(b"a".to_vec(), 1), None);
        assert_eq!(dict.insert(b"a".to_vec(), 2), Some(1));
        assert_eq!(dict.get(b"a".as_slice()), Some(&2));
        assert_eq!(dict.remove(b"a".as_slice()), Some(2));
        assert_eq!(dict.remove(b"a".as_slice()), None);
        assert!(dict.is_empty());
    }

    #[test]
    fn grow_keeps_every_key_reachable() {
        let mut dict: Dict<u64, u64> = Dict::new();
        let n = (MIN_SLOTS * MAX_LOAD_FACTOR * 4) as u64;
        for i in 0..n {
            dict.insert(i, i * 10);
        }
        assert_eq!(dict.len(), n as usize);
        for i in 0..n {
            assert_eq!(dict.get(&i), Some(&(i * 10)), "key {i} lost");
        }
    }

    #[test]
    fn lookups_work_mid_migration() {
        let mut dict: Dict<u64, u64> = Dict::new();
        // Enough inserts to trip at least one grow; the final insert leaves
        // the migration unfinished because each step is bounded.
        for i in 0..10_000_u64 {
            dict.insert(i, i);
            // Spot-check an old key while both tables coexist.
            if dict.is_rehashing() {
                assert_eq!(dict.get(&0), Some(&0));
            }
        }
        for i in 0..10_000_u64 {
            assert_eq!(dict.get(&i), Some(&i));
        }
    }

    #[test]
    fn shrink_starts_after_mass_removal() {
        let mut dict: Dict<u64, u64> = Dict::new();
        for i in 0..4096_u64 {
            dict.insert(i, i);
        }
        for i in 0..4096_u64 {
            dict.remove(&i);
        }
        // Drive any in-flight migration to completion.
        for i in 0..64_u64 {
            dict.insert(i, i);
            dict.remove(&i);
        }
        assert!(dict.is_empty());
    }

    #[test]
    fn iter_visits_each_pair_once() {
        let mut dict: Dict<u64, u64> = Dict::new();
        for i in 0..500_u64 {
            dict.insert(i, i + 1);
        }
        let mut seen: Vec<u64> = dict.iter().map(|(k, _)| *k).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..500).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn matches_std_hashmap_model(ops in proptest::collection::vec((0u8..3, 0u16..64, any::<u16>()), 0..400)) {
            let mut dict: Dict<u16, u16> = Dict::new();
            let mut model: HashMap<u16, u16> = HashMap::new();
            for (op, key, value) in ops {
                match op {
                    0 => prop_assert_eq!(dict.insert(key, value), model.insert(key, value)),
                    1 => prop_assert_eq!(dict.remove(&key), model.remove(&key)),
                    _ => prop_assert_eq!(dict.get(&key), model.get(&key)),
                }
                prop_assert_eq!(dict.len(), model.len());
            }
        }
    }
}
