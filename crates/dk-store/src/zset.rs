//! Sorted set: a member→score map paired with the score-ordered tree.
//!
//! The two structures are kept mutually consistent: every `(member, score)`
//! in the map has its `(score, member)` twin in the tree and vice versa.
//! A disagreement means memory corruption somewhere upstream, so it aborts
//! instead of limping on.

use crate::avl::AvlTree;
use crate::dict::Dict;

#[derive(Debug, Default)]
pub struct ZSet {
    scores: Dict<Vec<u8>, f64>,
    index: AvlTree,
}

impl ZSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Insert a member or update its score. Returns true when the member is
    /// new. A score update is remove-then-insert on the tree side; mutating
    /// a node's score in place would break the tree order.
    pub fn insert(&mut self, score: f64, member: &[u8]) -> bool {
        if let Some(&old_score) = self.scores.get(member) {
            if old_score.total_cmp(&score).is_eq() {
                return false;
            }
            let detached = self.index.remove(old_score, member);
            assert!(detached, "zset index missing pair present in member map");
            self.index.insert(score, member.to_vec());
            self.scores.insert(member.to_vec(), score);
            return false;
        }
        self.index.insert(score, member.to_vec());
        self.scores.insert(member.to_vec(), score);
        true
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        let Some(score) = self.scores.remove(member) else {
            return false;
        };
        let detached = self.index.remove(score, member);
        assert!(detached, "zset index missing pair present in member map");
        true
    }

    #[must_use]
    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Ascending `(score, member)` entries starting at the first entry
    /// ordered at or after `(score, member)`, shifted by `offset` ranks.
    #[must_use]
    pub fn range_from(
        &self,
        score: f64,
        member: &[u8],
        offset: i64,
        limit: usize,
    ) -> Vec<(f64, Vec<u8>)> {
        let base = self.index.rank_ge(score, member);
        let Some(start) = i64::try_from(base)
            .ok()
            .and_then(|b| b.checked_add(offset))
        else {
            return Vec::new();
        };
        let Ok(start) = usize::try_from(start) else {
            return Vec::new();
        };
        let len = self.index.len();
        if start >= len {
            return Vec::new();
        }
        let take = limit.min(len - start);
        (start..start + take)
            .filter_map(|rank| self.index.select(rank))
            .map(|(s, m)| (s, m.to_vec()))
            .collect()
    }
}
