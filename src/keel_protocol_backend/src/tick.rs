//! The tick tree: an ordered, sparse index over discretized debt-ratio
//! buckets.
//!
//! Buckets ("ticks") aggregate the collateral and debt *shares* of every
//! position currently mapped to them. The tree is an arena-allocated AVL
//! tree augmented with subtree share sums, so "highest occupied tick" and
//! "aggregate at or above tick T" are both O(log ticks).
//!
//! Nodes are addressed by monotonically increasing ids and are never freed:
//! when a whole bucket is scaled by a corrective operation (tick-level
//! rebalance, redemption) the bucket's node is abandoned in place with a
//! [Settlement] record chaining to the bucket's new location, and member
//! positions migrate lazily the next time they are touched. Correctness does
//! not depend on ever compacting the arena.

use crate::numeric::Ratio;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Tick = i32;
pub type NodeId = u32;

pub const MIN_TICK: Tick = 0;
pub const MAX_TICK: Tick = 20_000;
/// Returned by [TickTree::top_tick] on a tree with no debt. Callers must
/// check bucket emptiness explicitly; this is a sentinel, not an error.
pub const SENTINEL_TICK: Tick = i32::MIN;

const TICK_SCALE: Decimal = dec!(10_000);

/// Monotonic discretization of a debt ratio into a bucket index: one tick
/// per 0.0001 of debt ratio, clamped to the representable band.
pub fn discretize(ratio: Ratio) -> Tick {
    if ratio.0 <= Decimal::ZERO {
        return MIN_TICK;
    }
    if ratio.0 >= dec!(2) {
        return MAX_TICK;
    }
    let scaled = (ratio.0 * TICK_SCALE).floor();
    scaled
        .to_i32()
        .expect("bug: clamped tick out of i32 range")
        .clamp(MIN_TICK, MAX_TICK)
}

/// Recorded on an abandoned node when its whole bucket was scaled and moved.
/// Positions still pointing at the node apply the scales to their shares and
/// follow `next` to the bucket's new location (`None` when the bucket was
/// fully drained).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub collateral_scale: Decimal,
    pub debt_scale: Decimal,
    pub next: Option<NodeId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub tick: Tick,
    /// Live aggregate of this bucket, in share terms.
    coll_shares: Decimal,
    debt_shares: Decimal,
    /// Subtree aggregates (this bucket plus both children).
    sub_coll: Decimal,
    sub_debt: Decimal,
    left: Option<NodeId>,
    right: Option<NodeId>,
    height: u8,
    /// `Some` once the node has been abandoned.
    settlement: Option<Settlement>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TickTree {
    nodes: Vec<TreeNode>,
    root: Option<NodeId>,
    /// Live bucket per occupied tick; mirrors the AVL contents.
    live: BTreeMap<Tick, NodeId>,
}

impl TickTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total nodes ever allocated, including abandoned ones.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn occupied_ticks(&self) -> usize {
        self.live.len()
    }

    /// Tree-wide aggregate in share terms.
    pub fn totals(&self) -> (Decimal, Decimal) {
        self.sums(self.root)
    }

    /// Live aggregate of one bucket, in share terms.
    pub fn bucket(&self, tick: Tick) -> Option<(Decimal, Decimal)> {
        self.live.get(&tick).map(|&id| {
            let node = &self.nodes[id as usize];
            (node.coll_shares, node.debt_shares)
        })
    }

    pub fn is_live(&self, node_id: NodeId) -> bool {
        self.nodes[node_id as usize].settlement.is_none()
    }

    pub fn node_tick(&self, node_id: NodeId) -> Tick {
        self.nodes[node_id as usize].tick
    }

    /// The highest tick holding nonzero debt, or [SENTINEL_TICK].
    pub fn top_tick(&self) -> Tick {
        let mut cur = match self.root {
            Some(id) if self.nodes[id as usize].sub_debt > Decimal::ZERO => id,
            _ => return SENTINEL_TICK,
        };
        loop {
            let node = &self.nodes[cur as usize];
            if let Some(right) = node.right {
                if self.nodes[right as usize].sub_debt > Decimal::ZERO {
                    cur = right;
                    continue;
                }
            }
            if node.debt_shares > Decimal::ZERO {
                return node.tick;
            }
            cur = node
                .left
                .expect("bug: positive subtree debt with no holder");
        }
    }

    /// Aggregate (collateral shares, debt shares) over all buckets at or
    /// above `tick`.
    pub fn aggregate_at_or_above(&self, tick: Tick) -> (Decimal, Decimal) {
        self.aggregate_from(self.root, tick)
    }

    /// Adds a position's contribution to a bucket, creating the bucket
    /// lazily, and returns the bucket's live node id.
    pub fn add_contribution(
        &mut self,
        tick: Tick,
        coll_shares: Decimal,
        debt_shares: Decimal,
    ) -> NodeId {
        debug_assert!(coll_shares >= Decimal::ZERO && debt_shares >= Decimal::ZERO);
        if let Some(&id) = self.live.get(&tick) {
            self.apply_delta(tick, coll_shares, debt_shares);
            return id;
        }
        let id = self.alloc(tick, coll_shares, debt_shares);
        self.root = Some(self.insert_rec(self.root, id));
        self.live.insert(tick, id);
        id
    }

    /// Removes a position's contribution from its live bucket. The bucket is
    /// unlinked (and its node abandoned) once it no longer holds any shares.
    pub fn remove_contribution(
        &mut self,
        node_id: NodeId,
        coll_shares: Decimal,
        debt_shares: Decimal,
    ) {
        let node = &self.nodes[node_id as usize];
        assert!(
            node.settlement.is_none(),
            "bug: removing contribution from an abandoned node"
        );
        let tick = node.tick;
        self.apply_delta(tick, -coll_shares, -debt_shares);
        let node = &self.nodes[node_id as usize];
        assert!(
            node.coll_shares >= -SHARE_EPSILON && node.debt_shares >= -SHARE_EPSILON,
            "bug: bucket aggregate went negative"
        );
        if node.coll_shares <= SHARE_EPSILON && node.debt_shares <= SHARE_EPSILON {
            self.unlink(tick, None, Decimal::ONE, Decimal::ONE);
        }
    }

    /// Scales a whole live bucket by `(coll_scale, debt_scale)` and moves the
    /// scaled aggregate to `new_tick`, abandoning the old node with a
    /// settlement chain entry. Returns the id of the bucket's new location.
    ///
    /// `new_tick == None` asserts the bucket is fully drained by the scales.
    pub fn settle(
        &mut self,
        tick: Tick,
        coll_scale: Decimal,
        debt_scale: Decimal,
        new_tick: Option<Tick>,
    ) -> Option<NodeId> {
        assert!(coll_scale >= Decimal::ZERO && coll_scale <= Decimal::ONE);
        assert!(debt_scale >= Decimal::ZERO && debt_scale <= Decimal::ONE);
        let id = *self
            .live
            .get(&tick)
            .expect("bug: settling an unoccupied tick");
        let (coll, debt) = {
            let node = &self.nodes[id as usize];
            (node.coll_shares, node.debt_shares)
        };
        let scaled_coll = coll * coll_scale;
        let scaled_debt = debt * debt_scale;
        let next = match new_tick {
            Some(target) => {
                self.apply_delta(tick, -coll, -debt);
                self.unlink(tick, None, coll_scale, debt_scale);
                Some(self.add_contribution(target, scaled_coll, scaled_debt))
            }
            None => {
                assert!(
                    scaled_coll <= SHARE_EPSILON && scaled_debt <= SHARE_EPSILON,
                    "bug: dropping a bucket that still holds shares"
                );
                self.apply_delta(tick, -coll, -debt);
                self.unlink(tick, None, coll_scale, debt_scale);
                None
            }
        };
        self.nodes[id as usize]
            .settlement
            .as_mut()
            .expect("bug: unlink left node live")
            .next = next;
        next
    }

    /// Read-only settlement-chain walk: returns a position's shares after
    /// applying every settlement recorded since it last touched the tree,
    /// plus the live node it now belongs to (`None` if fully drained out).
    pub fn resolve(
        &self,
        mut node_id: NodeId,
        mut coll_shares: Decimal,
        mut debt_shares: Decimal,
    ) -> (Decimal, Decimal, Option<NodeId>) {
        loop {
            match self.nodes[node_id as usize].settlement {
                None => return (coll_shares, debt_shares, Some(node_id)),
                Some(s) => {
                    coll_shares *= s.collateral_scale;
                    debt_shares *= s.debt_scale;
                    match s.next {
                        Some(next) => node_id = next,
                        None => return (coll_shares, debt_shares, None),
                    }
                }
            }
        }
    }

    // ---- arena + AVL internals ----

    fn alloc(&mut self, tick: Tick, coll_shares: Decimal, debt_shares: Decimal) -> NodeId {
        let id = self.nodes.len() as NodeId;
        self.nodes.push(TreeNode {
            tick,
            coll_shares,
            debt_shares,
            sub_coll: coll_shares,
            sub_debt: debt_shares,
            left: None,
            right: None,
            height: 1,
            settlement: None,
        });
        id
    }

    /// Detaches a bucket from the AVL tree and the live map, marking its node
    /// abandoned with the given scales (identity scales for a bucket that
    /// simply emptied out).
    fn unlink(
        &mut self,
        tick: Tick,
        next: Option<NodeId>,
        coll_scale: Decimal,
        debt_scale: Decimal,
    ) {
        let id = self
            .live
            .remove(&tick)
            .expect("bug: unlinking an unoccupied tick");
        self.root = self.remove_rec(self.root, tick);
        let node = &mut self.nodes[id as usize];
        node.settlement = Some(Settlement {
            collateral_scale: coll_scale,
            debt_scale,
            next,
        });
    }

    fn height_of(&self, n: Option<NodeId>) -> i32 {
        n.map(|id| self.nodes[id as usize].height as i32).unwrap_or(0)
    }

    fn sums(&self, n: Option<NodeId>) -> (Decimal, Decimal) {
        n.map(|id| {
            let node = &self.nodes[id as usize];
            (node.sub_coll, node.sub_debt)
        })
        .unwrap_or((Decimal::ZERO, Decimal::ZERO))
    }

    fn refresh(&mut self, id: NodeId) {
        let (left, right) = {
            let node = &self.nodes[id as usize];
            (node.left, node.right)
        };
        let (lc, ld) = self.sums(left);
        let (rc, rd) = self.sums(right);
        let height = 1 + self.height_of(left).max(self.height_of(right));
        let node = &mut self.nodes[id as usize];
        node.sub_coll = node.coll_shares + lc + rc;
        node.sub_debt = node.debt_shares + ld + rd;
        node.height = height as u8;
    }

    fn balance_factor(&self, id: NodeId) -> i32 {
        let node = &self.nodes[id as usize];
        self.height_of(node.left) - self.height_of(node.right)
    }

    fn rotate_right(&mut self, id: NodeId) -> NodeId {
        let left = self.nodes[id as usize].left.expect("bug: rotate_right");
        self.nodes[id as usize].left = self.nodes[left as usize].right;
        self.nodes[left as usize].right = Some(id);
        self.refresh(id);
        self.refresh(left);
        left
    }

    fn rotate_left(&mut self, id: NodeId) -> NodeId {
        let right = self.nodes[id as usize].right.expect("bug: rotate_left");
        self.nodes[id as usize].right = self.nodes[right as usize].left;
        self.nodes[right as usize].left = Some(id);
        self.refresh(id);
        self.refresh(right);
        right
    }

    fn rebalance(&mut self, id: NodeId) -> NodeId {
        self.refresh(id);
        let bf = self.balance_factor(id);
        if bf > 1 {
            let left = self.nodes[id as usize].left.expect("bug: rebalance");
            if self.balance_factor(left) < 0 {
                let new_left = self.rotate_left(left);
                self.nodes[id as usize].left = Some(new_left);
                self.refresh(id);
            }
            self.rotate_right(id)
        } else if bf < -1 {
            let right = self.nodes[id as usize].right.expect("bug: rebalance");
            if self.balance_factor(right) > 0 {
                let new_right = self.rotate_right(right);
                self.nodes[id as usize].right = Some(new_right);
                self.refresh(id);
            }
            self.rotate_left(id)
        } else {
            id
        }
    }

    fn insert_rec(&mut self, root: Option<NodeId>, id: NodeId) -> NodeId {
        let Some(cur) = root else {
            self.refresh(id);
            return id;
        };
        let (cur_tick, new_tick) = (self.nodes[cur as usize].tick, self.nodes[id as usize].tick);
        if new_tick < cur_tick {
            let new_left = self.insert_rec(self.nodes[cur as usize].left, id);
            self.nodes[cur as usize].left = Some(new_left);
        } else if new_tick > cur_tick {
            let new_right = self.insert_rec(self.nodes[cur as usize].right, id);
            self.nodes[cur as usize].right = Some(new_right);
        } else {
            panic!("bug: duplicate tick insert");
        }
        self.rebalance(cur)
    }

    fn remove_rec(&mut self, root: Option<NodeId>, tick: Tick) -> Option<NodeId> {
        let cur = root.expect("bug: removing a tick not in the tree");
        let cur_tick = self.nodes[cur as usize].tick;
        if tick < cur_tick {
            let new_left = self.remove_rec(self.nodes[cur as usize].left, tick);
            self.nodes[cur as usize].left = new_left;
            Some(self.rebalance(cur))
        } else if tick > cur_tick {
            let new_right = self.remove_rec(self.nodes[cur as usize].right, tick);
            self.nodes[cur as usize].right = new_right;
            Some(self.rebalance(cur))
        } else {
            let (left, right) = {
                let node = &self.nodes[cur as usize];
                (node.left, node.right)
            };
            match (left, right) {
                (None, child) | (child, None) => child,
                (Some(_), Some(right)) => {
                    let (new_right, successor) = self.take_min(right);
                    self.nodes[successor as usize].left = left;
                    self.nodes[successor as usize].right = new_right;
                    Some(self.rebalance(successor))
                }
            }
        }
    }

    fn take_min(&mut self, root: NodeId) -> (Option<NodeId>, NodeId) {
        match self.nodes[root as usize].left {
            None => (self.nodes[root as usize].right, root),
            Some(left) => {
                let (new_left, min) = self.take_min(left);
                self.nodes[root as usize].left = new_left;
                (Some(self.rebalance(root)), min)
            }
        }
    }

    /// Adds `(dc, dd)` to the bucket at `tick`, updating subtree sums along
    /// the search path.
    fn apply_delta(&mut self, tick: Tick, dc: Decimal, dd: Decimal) {
        let mut cur = self.root.expect("bug: delta on an empty tree");
        loop {
            let node = &mut self.nodes[cur as usize];
            node.sub_coll += dc;
            node.sub_debt += dd;
            if tick == node.tick {
                node.coll_shares += dc;
                node.debt_shares += dd;
                return;
            }
            cur = if tick < node.tick {
                node.left.expect("bug: delta target tick not in tree")
            } else {
                node.right.expect("bug: delta target tick not in tree")
            };
        }
    }

    fn aggregate_from(&self, n: Option<NodeId>, tick: Tick) -> (Decimal, Decimal) {
        let Some(id) = n else {
            return (Decimal::ZERO, Decimal::ZERO);
        };
        let node = &self.nodes[id as usize];
        if node.tick < tick {
            self.aggregate_from(node.right, tick)
        } else {
            let (rc, rd) = self.sums(node.right);
            let (lc, ld) = self.aggregate_from(node.left, tick);
            (node.coll_shares + rc + lc, node.debt_shares + rd + ld)
        }
    }
}

/// Tolerance for treating a bucket's residual share dust as empty; Decimal
/// division leaves sub-e8s remainders that must not keep ghost buckets alive.
const SHARE_EPSILON: Decimal = dec!(0.000001);

#[cfg(test)]
mod tests {
    use super::*;

    fn shares(v: i64) -> Decimal {
        Decimal::from(v)
    }

    #[test]
    fn empty_tree_reports_sentinel() {
        let tree = TickTree::new();
        assert_eq!(tree.top_tick(), SENTINEL_TICK);
        assert_eq!(tree.totals(), (Decimal::ZERO, Decimal::ZERO));
    }

    #[test]
    fn discretize_is_monotonic_and_clamped() {
        assert_eq!(discretize(Ratio(dec!(0))), MIN_TICK);
        assert_eq!(discretize(Ratio(dec!(0.805))), 8050);
        assert_eq!(discretize(Ratio(dec!(0.88))), 8800);
        assert!(discretize(Ratio(dec!(0.5))) < discretize(Ratio(dec!(0.51))));
        assert_eq!(discretize(Ratio(Decimal::MAX)), MAX_TICK);
    }

    #[test]
    fn top_tick_tracks_highest_debt_bucket() {
        let mut tree = TickTree::new();
        tree.add_contribution(5_000, shares(100), shares(40));
        tree.add_contribution(8_000, shares(10), shares(8));
        tree.add_contribution(3_000, shares(500), shares(100));
        assert_eq!(tree.top_tick(), 8_000);

        // Collateral-only buckets never become the top tick.
        tree.add_contribution(9_000, shares(7), Decimal::ZERO);
        assert_eq!(tree.top_tick(), 8_000);
    }

    #[test]
    fn aggregates_cover_the_requested_band() {
        let mut tree = TickTree::new();
        for (tick, coll, debt) in [(1_000, 10, 1), (4_000, 20, 8), (7_000, 5, 3), (7_500, 2, 1)] {
            tree.add_contribution(tick, shares(coll), shares(debt));
        }
        assert_eq!(tree.aggregate_at_or_above(7_000), (shares(7), shares(4)));
        assert_eq!(tree.aggregate_at_or_above(0), tree.totals());
        assert_eq!(
            tree.aggregate_at_or_above(8_000),
            (Decimal::ZERO, Decimal::ZERO)
        );
    }

    #[test]
    fn removal_unlinks_empty_buckets_and_abandons_nodes() {
        let mut tree = TickTree::new();
        let a = tree.add_contribution(6_000, shares(10), shares(5));
        let b = tree.add_contribution(2_000, shares(30), shares(2));
        tree.remove_contribution(a, shares(10), shares(5));
        assert_eq!(tree.top_tick(), 2_000);
        assert!(!tree.is_live(a));
        assert!(tree.is_live(b));
        // Re-occupying the tick allocates a fresh node.
        let c = tree.add_contribution(6_000, shares(1), shares(1));
        assert_ne!(a, c);
        assert_eq!(tree.node_count(), 3);
    }

    #[test]
    fn many_buckets_stay_balanced() {
        let mut tree = TickTree::new();
        for tick in 0..500 {
            tree.add_contribution(tick * 37 % 9_973, shares(1), shares(1));
        }
        assert_eq!(tree.totals(), (shares(500), shares(500)));
        let (_, debt) = tree.aggregate_at_or_above(5_000);
        assert!(debt > Decimal::ZERO);
    }

    #[test]
    fn settlement_chain_scales_and_migrates() {
        let mut tree = TickTree::new();
        let node = tree.add_contribution(9_000, shares(100), shares(80));
        let next = tree
            .settle(9_000, dec!(0.9), dec!(0.5), Some(5_000))
            .expect("bucket survives");
        assert_eq!(tree.top_tick(), 5_000);
        let (coll, debt, live) = tree.resolve(node, shares(50), shares(40));
        assert_eq!(coll, dec!(45));
        assert_eq!(debt, dec!(20));
        assert_eq!(live, Some(next));

        // Second settlement extends the chain; resolution composes scales.
        tree.settle(5_000, dec!(1), dec!(0.5), Some(2_500));
        let (coll, debt, live) = tree.resolve(node, shares(50), shares(40));
        assert_eq!(coll, dec!(45));
        assert_eq!(debt, dec!(10));
        assert_eq!(live.map(|id| tree.node_tick(id)), Some(2_500));
    }

    #[test]
    fn full_drain_settlement_detaches_positions() {
        let mut tree = TickTree::new();
        let node = tree.add_contribution(9_500, shares(10), shares(9));
        assert_eq!(tree.settle(9_500, dec!(0), dec!(0), None), None);
        assert_eq!(tree.top_tick(), SENTINEL_TICK);
        let (coll, debt, live) = tree.resolve(node, shares(10), shares(9));
        assert_eq!(coll, Decimal::ZERO);
        assert_eq!(debt, Decimal::ZERO);
        assert_eq!(live, None);
    }
}
