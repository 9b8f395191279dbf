#![forbid(unsafe_code)]

//! The key space: a progressive-rehash dictionary mapping keys to typed
//! entries, with per-entry expiration tracked lazily on access and actively
//! by a bounded sweep over a deadline heap.
//!
//! All operations take `now_ms` explicitly; nothing here reads a clock.
//! The event loop is the only caller that does, which keeps every expiry
//! path deterministic under test.

mod avl;
mod dict;
mod zset;

pub use dict::{Dict, Iter};
pub use zset::ZSet;

use dk_expire::ExpireHeap;
use dk_lazyfree::DropPool;

/// Composite values at or above this element count are freed off-thread.
const LAZY_FREE_THRESHOLD: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    WrongType,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongType => write!(f, "operation against a key holding the wrong kind of value"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The inner value held by a key.
#[derive(Debug)]
pub enum Value {
    String(Vec<u8>),
    Hash(Dict<Vec<u8>, Vec<u8>>),
    SortedSet(ZSet),
}

impl Value {
    fn element_count(&self) -> usize {
        match self {
            Self::String(_) => 0,
            Self::Hash(fields) => fields.len(),
            Self::SortedSet(zset) => zset.len(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at_ms: None,
        }
    }

    fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at_ms.is_some_and(|at| at <= now_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlValue {
    KeyMissing,
    NoExpiry,
    RemainingMs(u64),
}

#[derive(Debug, Default)]
pub struct Store {
    entries: Dict<Vec<u8>, Entry>,
    ttl: ExpireHeap,
    lazyfree: Option<DropPool>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that frees large composite values on the given pool instead
    /// of inline on the control thread.
    #[must_use]
    pub fn with_lazyfree(pool: DropPool) -> Self {
        Self {
            entries: Dict::new(),
            ttl: ExpireHeap::new(),
            lazyfree: Some(pool),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ── string operations ────────────────────────────────────────

    /// Get a string value. `Ok(None)` when the key is absent or expired.
    pub fn get(&mut self, key: &[u8], now_ms: u64) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::String(v) => Ok(Some(v.clone())),
                _ => Err(StoreError::WrongType),
            },
            None => Ok(None),
        }
    }

    /// Upsert a string value. An existing TTL is preserved: overwriting a
    /// key's value does not clear its expiration, only PERSIST (or the
    /// expiry itself) does.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>, now_ms: u64) {
        self.drop_if_expired(&key, now_ms);
        if let Some(entry) = self.entries.get_mut(key.as_slice()) {
            let old = std::mem::replace(&mut entry.value, Value::String(value));
            self.dispose(old);
        } else {
            self.entries.insert(key, Entry::new(Value::String(value)));
        }
    }

    pub fn del(&mut self, key: &[u8], now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        match self.entries.remove(key) {
            Some(entry) => {
                self.dispose(entry.value);
                true
            }
            None => false,
        }
    }

    /// All live key names, bucket order. Keys past their deadline are
    /// filtered out even if the sweep has not caught up with them yet.
    #[must_use]
    pub fn keys(&self, now_ms: u64) -> Vec<Vec<u8>> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .collect()
    }

    // ── expiration ───────────────────────────────────────────────

    /// Set the key's deadline to `now + ttl_ms` and index it in the heap.
    /// Any older heap slot for the key goes stale. Non-positive TTL deletes
    /// immediately. False when the key is absent.
    pub fn expire_in(&mut self, key: &[u8], ttl_ms: i64, now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        if !self.entries.contains_key(key) {
            return false;
        }
        if ttl_ms <= 0 {
            self.del(key, now_ms);
            return true;
        }
        let deadline = now_ms.saturating_add(u64::try_from(ttl_ms).unwrap_or(u64::MAX));
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at_ms = Some(deadline);
        }
        self.ttl.push(deadline, key.to_vec());
        true
    }

    /// Clear the key's deadline. Its heap slot goes stale and is discarded
    /// by the next sweep that reaches it.
    pub fn persist(&mut self, key: &[u8], now_ms: u64) -> bool {
        self.drop_if_expired(key, now_ms);
        match self.entries.get_mut(key) {
            Some(entry) => {
                let had_ttl = entry.expires_at_ms.is_some();
                entry.expires_at_ms = None;
                had_ttl
            }
            None => false,
        }
    }

    #[must_use]
    pub fn ttl(&mut self, key: &[u8], now_ms: u64) -> TtlValue {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            None => TtlValue::KeyMissing,
            Some(entry) => match entry.expires_at_ms {
                None => TtlValue::NoExpiry,
                Some(at) => TtlValue::RemainingMs(at.saturating_sub(now_ms)),
            },
        }
    }

    /// Earliest pending heap deadline; drives the event loop's poll
    /// timeout. May point at a stale slot, which only means an early wake.
    #[must_use]
    pub fn next_deadline(&self) -> Option<u64> {
        self.ttl.peek_deadline()
    }

    /// Bounded active sweep: pop up to `budget` due heap slots, discard the
    /// stale ones, evict the rest. Returns the number of keys evicted.
    pub fn active_expire_cycle(&mut self, now_ms: u64, budget: usize) -> usize {
        let mut evicted = 0;
        for _ in 0..budget {
            let Some(slot) = self.ttl.pop_due(now_ms) else {
                break;
            };
            let due = self
                .entries
                .get(slot.key.as_slice())
                .is_some_and(|entry| entry.expires_at_ms == Some(slot.deadline_ms));
            if !due {
                // Stale slot: the TTL was overwritten, cleared, or the key
                // is already gone.
                continue;
            }
            if let Some(entry) = self.entries.remove(slot.key.as_slice()) {
                self.dispose(entry.value);
                evicted += 1;
            }
        }
        evicted
    }

    // ── hash operations ──────────────────────────────────────────

    /// Upsert a field, creating the hash when the key is absent. True when
    /// the field is new.
    pub fn hset(
        &mut self,
        key: &[u8],
        field: Vec<u8>,
        value: Vec<u8>,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        if !self.entries.contains_key(key) {
            self.entries
                .insert(key.to_vec(), Entry::new(Value::Hash(Dict::new())));
        }
        match self.entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::Hash(fields) => Ok(fields.insert(field, value).is_none()),
                _ => Err(StoreError::WrongType),
            },
            None => Ok(false),
        }
    }

    pub fn hget(
        &mut self,
        key: &[u8],
        field: &[u8],
        now_ms: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Hash(fields) => Ok(fields.get(field).cloned()),
                _ => Err(StoreError::WrongType),
            },
            None => Ok(None),
        }
    }

    /// Remove a field. True when it existed. Removing the last field
    /// removes the whole entry.
    pub fn hdel(&mut self, key: &[u8], field: &[u8], now_ms: u64) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        let removed = match self.entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::Hash(fields) => fields.remove(field).is_some(),
                _ => return Err(StoreError::WrongType),
            },
            None => return Ok(false),
        };
        self.remove_if_drained(key);
        Ok(removed)
    }

    /// Field names in bucket order. Absent key reads as an empty hash.
    pub fn hfields(&mut self, key: &[u8], now_ms: u64) -> Result<Vec<Vec<u8>>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::Hash(fields) => Ok(fields.iter().map(|(name, _)| name.clone()).collect()),
                _ => Err(StoreError::WrongType),
            },
            None => Ok(Vec::new()),
        }
    }

    // ── sorted-set operations ────────────────────────────────────

    /// Insert or re-score a member, creating the set when the key is
    /// absent. True when the member is newly inserted.
    pub fn zadd(
        &mut self,
        key: &[u8],
        score: f64,
        member: &[u8],
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        if !self.entries.contains_key(key) {
            self.entries
                .insert(key.to_vec(), Entry::new(Value::SortedSet(ZSet::new())));
        }
        match self.entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::SortedSet(zset) => Ok(zset.insert(score, member)),
                _ => Err(StoreError::WrongType),
            },
            None => Ok(false),
        }
    }

    pub fn zscore(
        &mut self,
        key: &[u8],
        member: &[u8],
        now_ms: u64,
    ) -> Result<Option<f64>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::SortedSet(zset) => Ok(zset.score(member)),
                _ => Err(StoreError::WrongType),
            },
            None => Ok(None),
        }
    }

    /// Remove a member. True when it existed. Removing the last member
    /// removes the whole entry.
    pub fn zrem(&mut self, key: &[u8], member: &[u8], now_ms: u64) -> Result<bool, StoreError> {
        self.drop_if_expired(key, now_ms);
        let removed = match self.entries.get_mut(key) {
            Some(entry) => match &mut entry.value {
                Value::SortedSet(zset) => zset.remove(member),
                _ => return Err(StoreError::WrongType),
            },
            None => return Ok(false),
        };
        self.remove_if_drained(key);
        Ok(removed)
    }

    /// Ascending `(score, member)` range starting at the first entry at or
    /// after the pair, shifted `offset` ranks, capped at `limit` entries.
    /// Absent key reads as an empty set.
    pub fn zquery(
        &mut self,
        key: &[u8],
        score: f64,
        member: &[u8],
        offset: i64,
        limit: usize,
        now_ms: u64,
    ) -> Result<Vec<(f64, Vec<u8>)>, StoreError> {
        self.drop_if_expired(key, now_ms);
        match self.entries.get(key) {
            Some(entry) => match &entry.value {
                Value::SortedSet(zset) => Ok(zset.range_from(score, member, offset, limit)),
                _ => Err(StoreError::WrongType),
            },
            None => Ok(Vec::new()),
        }
    }

    // ── internals ────────────────────────────────────────────────

    /// The lazy expiration check every key-resolving path runs first.
    fn drop_if_expired(&mut self, key: &[u8], now_ms: u64) {
        let expired = self
            .entries
            .get(key)
            .is_some_and(|entry| entry.is_expired(now_ms));
        if expired && let Some(entry) = self.entries.remove(key) {
            self.dispose(entry.value);
        }
    }

    /// Composite entries emptied by a field/member removal do not linger as
    /// empty shells; the key reads as absent afterwards.
    fn remove_if_drained(&mut self, key: &[u8]) {
        let drained = self.entries.get(key).is_some_and(|entry| {
            matches!(&entry.value, Value::Hash(_) | Value::SortedSet(_))
                && entry.value.element_count() == 0
        });
        if drained {
            self.entries.remove(key);
        }
    }

    /// Free a detached value, off-thread when it is large enough to stall
    /// the control thread. Ownership moves into the job; a full queue falls
    /// back to an inline drop.
    fn dispose(&mut self, value: Value) {
        let Some(pool) = &self.lazyfree else {
            return;
        };
        if value.element_count() < LAZY_FREE_THRESHOLD {
            return;
        }
        if let Err(job) = pool.try_submit(move || drop(value)) {
            job();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Store, StoreError, TtlValue};
    use dk_lazyfree::DropPool;

    #[test]
    fn set_get_and_del() {
        let mut store = Store::new();
        assert_eq!(store.get(b"janis", 0).unwrap(), None);
        store.set(b"janis".to_vec(), b"labakais".to_vec(), 0);
        assert_eq!(store.get(b"janis", 0).unwrap(), Some(b"labakais".to_vec()));
        assert!(store.del(b"janis", 0));
        assert!(!store.del(b"janis", 0));
        assert_eq!(store.get(b"janis", 0).unwrap(), None);
    }

    #[test]
    fn get_on_hash_key_is_wrong_type() {
        let mut store = Store::new();
        store.hset(b"h", b"f".to_vec(), b"v".to_vec(), 0).unwrap();
        assert_eq!(store.get(b"h", 0), Err(StoreError::WrongType));
        assert_eq!(
            store.hget(b"h", b"f", 0).unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[test]
    fn set_replaces_value_of_any_type() {
        let mut store = Store::new();
        store.zadd(b"k", 1.0, b"m", 0).unwrap();
        store.set(b"k".to_vec(), b"plain".to_vec(), 0);
        assert_eq!(store.get(b"k", 0).unwrap(), Some(b"plain".to_vec()));
    }

    #[test]
    fn ttl_lifecycle() {
        let mut store = Store::new();
        store.set(b"k".to_vec(), b"v".to_vec(), 1_000);
        assert!(store.expire_in(b"k", 5_000, 1_000));
        assert_eq!(store.ttl(b"k", 1_000), TtlValue::RemainingMs(5_000));
        assert_eq!(store.ttl(b"k", 3_000), TtlValue::RemainingMs(3_000));
        // Lazy eviction at the deadline.
        assert_eq!(store.get(b"k", 6_000).unwrap(), None);
        assert_eq!(store.ttl(b"k", 6_000), TtlValue::KeyMissing);
    }

    #[test]
    fn expire_on_missing_key_is_false() {
        let mut store = Store::new();
        assert!(!store.expire_in(b"missing", 1_000, 0));
    }

    #[test]
    fn non_positive_ttl_deletes_immediately() {
        let mut store = Store::new();
        store.set(b"k".to_vec(), b"v".to_vec(), 0);
        assert!(store.expire_in(b"k", 0, 0));
        assert_eq!(store.get(b"k", 0).unwrap(), None);
    }

    #[test]
    fn overwrite_preserves_ttl() {
        let mut store = Store::new();
        store.set(b"k".to_vec(), b"v1".to_vec(), 0);
        assert!(store.expire_in(b"k", 10_000, 0));
        store.set(b"k".to_vec(), b"v2".to_vec(), 1_000);
        assert_eq!(store.ttl(b"k", 1_000), TtlValue::RemainingMs(9_000));
        assert_eq!(store.get(b"k", 11_000).unwrap(), None);
    }

    #[test]
    fn persist_clears_ttl_and_key_survives() {
        let mut store = Store::new();
        store.set(b"k".to_vec(), b"v".to_vec(), 0);
        assert!(store.expire_in(b"k", 10_000, 0));
        assert!(store.persist(b"k", 0));
        assert_eq!(store.ttl(b"k", 0), TtlValue::NoExpiry);
        assert_eq!(store.get(b"k", 60_000).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn active_cycle_evicts_due_keys_only() {
        let mut store = Store::new();
        store.set(b"a".to_vec(), b"1".to_vec(), 0);
        store.set(b"b".to_vec(), b"2".to_vec(), 0);
        store.set(b"c".to_vec(), b"3".to_vec(), 0);
        store.expire_in(b"a", 1_000, 0);
        store.expire_in(b"b", 5_000, 0);
        assert_eq!(store.active_expire_cycle(2_000, 100), 1);
        assert_eq!(store.get(b"a", 2_000).unwrap(), None);
        assert_eq!(store.get(b"b", 2_000).unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"c", 2_000).unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn stale_heap_slot_after_persist_is_discarded() {
        let mut store = Store::new();
        store.set(b"k".to_vec(), b"v".to_vec(), 0);
        store.expire_in(b"k", 1_000, 0);
        store.persist(b"k", 0);
        assert_eq!(store.active_expire_cycle(2_000, 100), 0);
        assert_eq!(store.get(b"k", 2_000).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn stale_heap_slot_after_ttl_overwrite_is_discarded() {
        let mut store = Store::new();
        store.set(b"k".to_vec(), b"v".to_vec(), 0);
        store.expire_in(b"k", 1_000, 0);
        store.expire_in(b"k", 60_000, 0);
        // The first slot is due; the entry's deadline no longer matches it.
        assert_eq!(store.active_expire_cycle(2_000, 100), 0);
        assert_eq!(store.get(b"k", 2_000).unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.active_expire_cycle(61_000, 100), 1);
    }

    #[test]
    fn sweep_budget_is_bounded() {
        let mut store = Store::new();
        for i in 0..20_u32 {
            let key = i.to_string().into_bytes();
            store.set(key.clone(), b"v".to_vec(), 0);
            store.expire_in(&key, 100, 0);
        }
        assert_eq!(store.active_expire_cycle(200, 5), 5);
        assert_eq!(store.active_expire_cycle(200, 100), 15);
    }

    #[test]
    fn hash_field_overwrite_and_drain() {
        let mut store = Store::new();
        assert!(store.hset(b"h", b"f1".to_vec(), b"v1".to_vec(), 0).unwrap());
        assert!(!store.hset(b"h", b"f1".to_vec(), b"v2".to_vec(), 0).unwrap());
        assert_eq!(store.hget(b"h", b"f1", 0).unwrap(), Some(b"v2".to_vec()));
        assert!(store.hdel(b"h", b"f1", 0).unwrap());
        // Last field gone: key reads as absent, not as an empty hash entry.
        assert_eq!(store.hget(b"h", b"f1", 0).unwrap(), None);
        assert_eq!(store.get(b"h", 0).unwrap(), None);
    }

    #[test]
    fn hfields_on_missing_key_is_empty() {
        let mut store = Store::new();
        assert!(store.hfields(b"nope", 0).unwrap().is_empty());
    }

    #[test]
    fn zadd_zscore_scenario() {
        let mut store = Store::new();
        assert!(store.zadd(b"zset", 1.0, b"n1", 0).unwrap());
        assert!(store.zadd(b"zset", 2.0, b"n2", 0).unwrap());
        assert!(!store.zadd(b"zset", 1.1, b"n1", 0).unwrap());
        assert_eq!(store.zscore(b"zset", b"n1", 0).unwrap(), Some(1.1));
    }

    #[test]
    fn zquery_scenario() {
        let mut store = Store::new();
        store.zadd(b"zset", 1.1, b"n1", 0).unwrap();
        store.zadd(b"zset", 2.0, b"n2", 0).unwrap();
        assert_eq!(
            store.zquery(b"zset", 1.0, b"", 0, 10, 0).unwrap(),
            vec![(1.1, b"n1".to_vec()), (2.0, b"n2".to_vec())]
        );
        assert_eq!(
            store.zquery(b"zset", 1.1, b"", 1, 10, 0).unwrap(),
            vec![(2.0, b"n2".to_vec())]
        );
        assert!(store.zquery(b"zset", 1.1, b"", 2, 10, 0).unwrap().is_empty());
        assert!(store.zquery(b"gone", 0.0, b"", 0, 10, 0).unwrap().is_empty());
    }

    #[test]
    fn zrem_reports_presence() {
        let mut store = Store::new();
        store.zadd(b"zset", 1.0, b"n1", 0).unwrap();
        assert!(store.zrem(b"zset", b"n1", 0).unwrap());
        assert!(!store.zrem(b"zset", b"n1", 0).unwrap());
    }

    #[test]
    fn large_composite_delete_goes_through_the_pool() {
        let mut store = Store::with_lazyfree(DropPool::new(2));
        for i in 0..2_000_u32 {
            store
                .zadd(b"big", f64::from(i), i.to_string().as_bytes(), 0)
                .unwrap();
        }
        assert!(store.del(b"big", 0));
        assert_eq!(store.zscore(b"big", b"0", 0).unwrap(), None);
    }

    #[test]
    fn keys_filters_expired() {
        let mut store = Store::new();
        store.set(b"alive".to_vec(), b"1".to_vec(), 0);
        store.set(b"dying".to_vec(), b"2".to_vec(), 0);
        store.expire_in(b"dying", 1_000, 0);
        let mut keys = store.keys(2_000);
        keys.sort();
        assert_eq!(keys, vec![b"alive".to_vec()]);
    }
}
