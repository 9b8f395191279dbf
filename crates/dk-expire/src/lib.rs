#![forbid(unsafe_code)]

//! Min-heap index of key expiration deadlines.
//!
//! The heap is an index, not the source of truth: the per-entry deadline
//! stored alongside the value is authoritative. When a key's TTL is
//! overwritten or cleared, the old heap slot is left in place and becomes
//! stale; the store's sweep recognizes stale slots by comparing the popped
//! deadline against the entry's current one and discards them silently.

/// One pending expiration: absolute deadline plus the key it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlSlot {
    pub deadline_ms: u64,
    pub key: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ExpireHeap {
    slots: Vec<TtlSlot>,
}

impl ExpireHeap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Earliest pending deadline, if any. Stale slots are counted too, so
    /// this may be earlier than the first genuine expiry; waking early is
    /// harmless because the sweep discards stale slots.
    #[must_use]
    pub fn peek_deadline(&self) -> Option<u64> {
        self.slots.first().map(|slot| slot.deadline_ms)
    }

    pub fn push(&mut self, deadline_ms: u64, key: Vec<u8>) {
        self.slots.push(TtlSlot { deadline_ms, key });
        self.sift_up(self.slots.len() - 1);
    }

    pub fn pop(&mut self) -> Option<TtlSlot> {
        if self.slots.is_empty() {
            return None;
        }
        let last = self.slots.len() - 1;
        self.slots.swap(0, last);
        let slot = self.slots.pop();
        if !self.slots.is_empty() {
            self.sift_down(0);
        }
        slot
    }

    /// Pop the minimum slot only if its deadline is at or before `now_ms`.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<TtlSlot> {
        if self.peek_deadline()? <= now_ms {
            self.pop()
        } else {
            None
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.slots[parent].deadline_ms <= self.slots[pos].deadline_ms {
                break;
            }
            self.slots.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.slots.len();
        loop {
            let left = pos * 2 + 1;
            let right = pos * 2 + 2;
            let mut smallest = pos;
            if left < len && self.slots[left].deadline_ms < self.slots[smallest].deadline_ms {
                smallest = left;
            }
            if right < len && self.slots[right].deadline_ms < self.slots[smallest].deadline_ms {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.slots.swap(pos, smallest);
            pos = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ExpireHeap;

    #[test]
    fn pops_in_deadline_order() {
        let mut heap = ExpireHeap::new();
        heap.push(300, b"c".to_vec());
        heap.push(100, b"a".to_vec());
        heap.push(200, b"b".to_vec());
        assert_eq!(heap.peek_deadline(), Some(100));
        assert_eq!(heap.pop().map(|s| s.key), Some(b"a".to_vec()));
        assert_eq!(heap.pop().map(|s| s.key), Some(b"b".to_vec()));
        assert_eq!(heap.pop().map(|s| s.key), Some(b"c".to_vec()));
        assert_eq!(heap.pop(), None);
    }

    #[test]
    fn duplicate_deadlines_all_come_out() {
        let mut heap = ExpireHeap::new();
        for key in [b"x".to_vec(), b"y".to_vec(), b"z".to_vec()] {
            heap.push(50, key);
        }
        assert_eq!(heap.len(), 3);
        let mut keys: Vec<Vec<u8>> = std::iter::from_fn(|| heap.pop().map(|s| s.key)).collect();
        keys.sort();
        assert_eq!(keys, vec![b"x".to_vec(), b"y".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn pop_due_respects_now() {
        let mut heap = ExpireHeap::new();
        heap.push(100, b"soon".to_vec());
        heap.push(900, b"later".to_vec());
        assert_eq!(heap.pop_due(50), None);
        assert_eq!(heap.pop_due(100).map(|s| s.key), Some(b"soon".to_vec()));
        assert_eq!(heap.pop_due(100), None);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn interleaved_push_pop_keeps_order() {
        let mut heap = ExpireHeap::new();
        let deadlines = [70_u64, 10, 40, 90, 20, 60, 30, 80, 50];
        for (i, deadline) in deadlines.iter().enumerate() {
            heap.push(*deadline, vec![u8::try_from(i).unwrap()]);
        }
        let mut last = 0;
        while let Some(slot) = heap.pop() {
            assert!(slot.deadline_ms >= last);
            last = slot.deadline_ms;
        }
    }
}
