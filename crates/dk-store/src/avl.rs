//! Height-balanced order-statistic tree over `(score, member)` pairs.
//!
//! Nodes live in an arena (`Vec` plus free list) and link to each other by
//! `u32` handles, so rotations relink indices instead of juggling owned
//! pointers. Every node carries its height and subtree size; size is what
//! makes rank-based seeks and offset skips O(log n).
//!
//! Scores are ordered with `f64::total_cmp`, ties broken by member bytes
//! ascending. Equal `(score, member)` pairs never coexist: the sorted-set
//! layer removes the old pair before re-inserting a re-scored member.

use std::cmp::Ordering;

#[derive(Debug)]
struct AvlNode {
    score: f64,
    member: Vec<u8>,
    left: Option<u32>,
    right: Option<u32>,
    height: u32,
    count: u32,
}

#[derive(Debug, Default)]
pub struct AvlTree {
    nodes: Vec<AvlNode>,
    free: Vec<u32>,
    root: Option<u32>,
}

fn pair_cmp(a_score: f64, a_member: &[u8], b_score: f64, b_member: &[u8]) -> Ordering {
    a_score
        .total_cmp(&b_score)
        .then_with(|| a_member.cmp(b_member))
}

impl AvlTree {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count(self.root) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn insert(&mut self, score: f64, member: Vec<u8>) {
        let id = self.alloc(score, member);
        self.root = Some(self.insert_at(self.root, id));
    }

    /// Remove an exact `(score, member)` pair. False when absent.
    pub fn remove(&mut self, score: f64, member: &[u8]) -> bool {
        let (root, removed) = self.remove_at(self.root, score, member);
        self.root = root;
        match removed {
            Some(id) => {
                self.release(id);
                true
            }
            None => false,
        }
    }

    /// Rank of the first entry ordered at or after `(score, member)`;
    /// equals `len()` when every entry orders before the pair.
    #[must_use]
    pub fn rank_ge(&self, score: f64, member: &[u8]) -> usize {
        let mut rank = 0_usize;
        let mut cur = self.root;
        while let Some(id) = cur {
            let node = &self.nodes[id as usize];
            if pair_cmp(node.score, &node.member, score, member) == Ordering::Less {
                rank += self.count(node.left) as usize + 1;
                cur = node.right;
            } else {
                cur = node.left;
            }
        }
        rank
    }

    /// Entry at `rank` in ascending order, by order-statistic descent.
    #[must_use]
    pub fn select(&self, rank: usize) -> Option<(f64, &[u8])> {
        if rank >= self.len() {
            return None;
        }
        let mut remaining = rank;
        let mut cur = self.root;
        while let Some(id) = cur {
            let node = &self.nodes[id as usize];
            let left_count = self.count(node.left) as usize;
            match remaining.cmp(&left_count) {
                Ordering::Less => cur = node.left,
                Ordering::Equal => return Some((node.score, &node.member)),
                Ordering::Greater => {
                    remaining -= left_count + 1;
                    cur = node.right;
                }
            }
        }
        None
    }

    // ── arena plumbing ───────────────────────────────────────────

    fn alloc(&mut self, score: f64, member: Vec<u8>) -> u32 {
        let node = AvlNode {
            score,
            member,
            left: None,
            right: None,
            height: 1,
            count: 1,
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id as usize] = node;
                id
            }
            None => {
                self.nodes.push(node);
                u32::try_from(self.nodes.len() - 1).unwrap_or_else(|_| {
                    unreachable!("arena exceeds u32 handle space");
                })
            }
        }
    }

    fn release(&mut self, id: u32) {
        let node = &mut self.nodes[id as usize];
        node.member = Vec::new();
        node.left = None;
        node.right = None;
        self.free.push(id);
    }

    fn height(&self, id: Option<u32>) -> u32 {
        id.map_or(0, |i| self.nodes[i as usize].height)
    }

    fn count(&self, id: Option<u32>) -> u32 {
        id.map_or(0, |i| self.nodes[i as usize].count)
    }

    fn update(&mut self, id: u32) {
        let (left, right) = {
            let node = &self.nodes[id as usize];
            (node.left, node.right)
        };
        let height = 1 + self.height(left).max(self.height(right));
        let count = 1 + self.count(left) + self.count(right);
        let node = &mut self.nodes[id as usize];
        node.height = height;
        node.count = count;
    }

    // ── rotations and rebalancing ────────────────────────────────

    fn rotate_left(&mut self, id: u32) -> u32 {
        let pivot = self.nodes[id as usize]
            .right
            .unwrap_or_else(|| unreachable!("rotate_left without right child"));
        let inner = self.nodes[pivot as usize].left;
        self.nodes[id as usize].right = inner;
        self.nodes[pivot as usize].left = Some(id);
        self.update(id);
        self.update(pivot);
        pivot
    }

    fn rotate_right(&mut self, id: u32) -> u32 {
        let pivot = self.nodes[id as usize]
            .left
            .unwrap_or_else(|| unreachable!("rotate_right without left child"));
        let inner = self.nodes[pivot as usize].right;
        self.nodes[id as usize].left = inner;
        self.nodes[pivot as usize].right = Some(id);
        self.update(id);
        self.update(pivot);
        pivot
    }

    fn rebalance(&mut self, id: u32) -> u32 {
        self.update(id);
        let (left, right) = {
            let node = &self.nodes[id as usize];
            (node.left, node.right)
        };
        let lh = self.height(left);
        let rh = self.height(right);
        if lh == rh + 2 {
            let l = left.unwrap_or_else(|| unreachable!("left-heavy without left child"));
            let l_node = &self.nodes[l as usize];
            if self.height(l_node.left) < self.height(l_node.right) {
                let new_left = self.rotate_left(l);
                self.nodes[id as usize].left = Some(new_left);
            }
            self.rotate_right(id)
        } else if rh == lh + 2 {
            let r = right.unwrap_or_else(|| unreachable!("right-heavy without right child"));
            let r_node = &self.nodes[r as usize];
            if self.height(r_node.right) < self.height(r_node.left) {
                let new_right = self.rotate_right(r);
                self.nodes[id as usize].right = Some(new_right);
            }
            self.rotate_left(id)
        } else {
            id
        }
    }

    fn insert_at(&mut self, root: Option<u32>, id: u32) -> u32 {
        let Some(at) = root else {
            return id;
        };
        let goes_left = {
            let fresh = &self.nodes[id as usize];
            let node = &self.nodes[at as usize];
            pair_cmp(fresh.score, &fresh.member, node.score, &node.member) == Ordering::Less
        };
        if goes_left {
            let left = self.nodes[at as usize].left;
            let new_left = self.insert_at(left, id);
            self.nodes[at as usize].left = Some(new_left);
        } else {
            let right = self.nodes[at as usize].right;
            let new_right = self.insert_at(right, id);
            self.nodes[at as usize].right = Some(new_right);
        }
        self.rebalance(at)
    }

    fn remove_at(
        &mut self,
        root: Option<u32>,
        score: f64,
        member: &[u8],
    ) -> (Option<u32>, Option<u32>) {
        let Some(at) = root else {
            return (None, None);
        };
        let ord = {
            let node = &self.nodes[at as usize];
            pair_cmp(score, member, node.score, &node.member)
        };
        match ord {
            Ordering::Less => {
                let left = self.nodes[at as usize].left;
                let (new_left, removed) = self.remove_at(left, score, member);
                if removed.is_none() {
                    return (Some(at), None);
                }
                self.nodes[at as usize].left = new_left;
                (Some(self.rebalance(at)), removed)
            }
            Ordering::Greater => {
                let right = self.nodes[at as usize].right;
                let (new_right, removed) = self.remove_at(right, score, member);
                if removed.is_none() {
                    return (Some(at), None);
                }
                self.nodes[at as usize].right = new_right;
                (Some(self.rebalance(at)), removed)
            }
            Ordering::Equal => self.remove_here(at),
        }
    }

    /// Detach the node at `at`, splicing its successor in when it has two
    /// children. Returns (new subtree root, detached node id).
    fn remove_here(&mut self, at: u32) -> (Option<u32>, Option<u32>) {
        let (left, right) = {
            let node = &self.nodes[at as usize];
            (node.left, node.right)
        };
        match (left, right) {
            (None, None) => (None, Some(at)),
            (Some(child), None) | (None, Some(child)) => (Some(child), Some(at)),
            (Some(_), Some(right)) => {
                let (succ_score, succ_member) = {
                    let mut cur = right;
                    while let Some(next) = self.nodes[cur as usize].left {
                        cur = next;
                    }
                    let node = &self.nodes[cur as usize];
                    (node.score, node.member.clone())
                };
                let (new_right, detached) = self.remove_at(Some(right), succ_score, &succ_member);
                let succ =
                    detached.unwrap_or_else(|| unreachable!("successor vanished during removal"));
                // Move the successor's payload into this node; the detached
                // arena slot is what gets recycled.
                let payload = std::mem::take(&mut self.nodes[succ as usize].member);
                let node = &mut self.nodes[at as usize];
                node.score = succ_score;
                node.member = payload;
                node.right = new_right;
                (Some(self.rebalance(at)), Some(succ))
            }
        }
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        fn walk(tree: &AvlTree, id: Option<u32>) -> (u32, u32) {
            let Some(i) = id else { return (0, 0) };
            let node = &tree.nodes[i as usize];
            let (lh, lc) = walk(tree, node.left);
            let (rh, rc) = walk(tree, node.right);
            assert!(lh.abs_diff(rh) <= 1, "unbalanced at {i}");
            assert_eq!(node.height, 1 + lh.max(rh), "bad height at {i}");
            assert_eq!(node.count, 1 + lc + rc, "bad count at {i}");
            if let Some(l) = node.left {
                let left = &tree.nodes[l as usize];
                assert!(
                    pair_cmp(left.score, &left.member, node.score, &node.member)
                        == Ordering::Less
                );
            }
            if let Some(r) = node.right {
                let right = &tree.nodes[r as usize];
                assert!(
                    pair_cmp(node.score, &node.member, right.score, &right.member)
                        == Ordering::Less
                );
            }
            (1 + lh.max(rh), 1 + lc + rc)
        }
        walk(self, self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::AvlTree;
    use proptest::prelude::*;

    fn collect(tree: &AvlTree) -> Vec<(f64, Vec<u8>)> {
        (0..tree.len())
            .filter_map(|rank| tree.select(rank))
            .map(|(score, member)| (score, member.to_vec()))
            .collect()
    }

    #[test]
    fn ascending_order_with_member_tiebreak() {
        let mut tree = AvlTree::new();
        tree.insert(2.0, b"b".to_vec());
        tree.insert(1.0, b"z".to_vec());
        tree.insert(1.0, b"a".to_vec());
        tree.insert(-3.5, b"m".to_vec());
        tree.check_invariants();
        assert_eq!(
            collect(&tree),
            vec![
                (-3.5, b"m".to_vec()),
                (1.0, b"a".to_vec()),
                (1.0, b"z".to_vec()),
                (2.0, b"b".to_vec()),
            ]
        );
    }

    #[test]
    fn remove_absent_pair_is_false() {
        let mut tree = AvlTree::new();
        tree.insert(1.0, b"a".to_vec());
        assert!(!tree.remove(2.0, b"a"));
        assert!(!tree.remove(1.0, b"b"));
        assert!(tree.remove(1.0, b"a"));
        assert!(tree.is_empty());
    }

    #[test]
    fn rank_ge_counts_smaller_entries() {
        let mut tree = AvlTree::new();
        for i in 0..10 {
            tree.insert(f64::from(i), format!("m{i}").into_bytes());
        }
        assert_eq!(tree.rank_ge(f64::NEG_INFINITY, b""), 0);
        assert_eq!(tree.rank_ge(5.0, b""), 5);
        assert_eq!(tree.rank_ge(5.0, b"m5"), 5);
        assert_eq!(tree.rank_ge(5.0, b"m6"), 6);
        assert_eq!(tree.rank_ge(100.0, b""), 10);
    }

    #[test]
    fn sequential_inserts_stay_balanced() {
        let mut tree = AvlTree::new();
        for i in 0..1000 {
            tree.insert(f64::from(i), i.to_string().into_bytes());
        }
        tree.check_invariants();
        for i in (0..1000).step_by(3) {
            assert!(tree.remove(f64::from(i), i.to_string().as_bytes()));
        }
        tree.check_invariants();
        assert_eq!(tree.len(), 1000 - 334);
    }

    #[test]
    fn arena_slots_are_recycled() {
        let mut tree = AvlTree::new();
        for round in 0..5 {
            for i in 0..100 {
                tree.insert(f64::from(i), format!("r{round}-{i}").into_bytes());
            }
            for i in 0..100 {
                assert!(tree.remove(f64::from(i), format!("r{round}-{i}").as_bytes()));
            }
        }
        assert!(tree.is_empty());
        // No growth beyond the first round's peak.
        assert!(tree.nodes.len() <= 100);
    }

    proptest! {
        #[test]
        fn matches_sorted_vec_model(
            ops in proptest::collection::vec((any::<bool>(), 0u8..32, -4i8..4), 0..300)
        ) {
            let mut tree = AvlTree::new();
            let mut model: Vec<(f64, Vec<u8>)> = Vec::new();
            for (insert, member, score) in ops {
                let member = vec![member];
                let score = f64::from(score);
                if insert {
                    if !model.iter().any(|(s, m)| *s == score && *m == member) {
                        tree.insert(score, member.clone());
                        model.push((score, member));
                        model.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                    }
                } else {
                    let expect = model.iter().position(|(s, m)| *s == score && *m == member);
                    prop_assert_eq!(tree.remove(score, &member), expect.is_some());
                    if let Some(pos) = expect {
                        model.remove(pos);
                    }
                }
                tree.check_invariants();
                prop_assert_eq!(collect(&tree), model.clone());
            }
        }
    }
}
