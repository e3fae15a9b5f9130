//! Stream priority tree and DATA scheduling order (RFC 7540 Section 5.3).
//!
//! Streams form a dependency forest rooted at the virtual stream 0. The
//! scheduler walks the tree: a stream that is ready to send always precedes
//! its descendants, and among siblings the smallest virtual finish time
//! wins, which converges on weight-proportional bandwidth for peers with a
//! continuous backlog.

use std::collections::HashMap;

use tracing::trace;

use crate::frame::{PrioritySpec, StreamId};

/// How many closed streams keep their priority node so that late PRIORITY
/// frames and dependent streams still resolve. Pruned FIFO.
const RETIRED_CAPACITY: usize = 64;

#[derive(Debug)]
struct Node {
    parent: u32,
    weight: u16,
    children: Vec<u32>,
    /// Virtual finish time; advanced by octets-sent scaled inversely to
    /// weight.
    vtime: u64,
    /// High-water vtime dispatched among this node's children; newly woken
    /// children start here so an idle period is not a bandwidth credit.
    child_vtime_floor: u64,
    retired: bool,
}

impl Node {
    fn new(parent: u32, weight: u16) -> Self {
        Self {
            parent,
            weight,
            children: Vec::new(),
            vtime: 0,
            child_vtime_floor: 0,
            retired: false,
        }
    }
}

/// The dependency tree for one connection.
pub struct PriorityTree {
    nodes: HashMap<u32, Node>,
    /// Closed streams in retirement order, oldest first.
    retired: Vec<u32>,
}

impl Default for PriorityTree {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityTree {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(0, Node::new(0, 16));
        Self {
            nodes,
            retired: Vec::new(),
        }
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.nodes.contains_key(&id.value())
    }

    #[cfg(test)]
    fn parent_of(&self, id: u32) -> Option<u32> {
        self.nodes.get(&id).map(|n| n.parent)
    }

    /// Insert a stream with the given dependency, or reprioritize it if it
    /// already has a node.
    pub fn insert(&mut self, id: StreamId, spec: PrioritySpec) {
        let id = id.value();
        if id == 0 {
            return;
        }
        if !self.nodes.contains_key(&id) {
            self.nodes.insert(id, Node::new(0, spec.weight));
            self.attach(0, id);
        }
        self.reprioritize_inner(id, spec);
    }

    /// Apply a PRIORITY frame to an existing (or idle) stream.
    pub fn reprioritize(&mut self, id: StreamId, spec: PrioritySpec) {
        self.insert(id, spec);
    }

    fn reprioritize_inner(&mut self, id: u32, spec: PrioritySpec) {
        let dep = spec.dependency.value();
        if dep == id {
            // Self-dependency is rejected at the frame layer; tolerate it
            // here as a no-op for direct callers.
            return;
        }

        // A dependency on a stream we have never seen gets a default node
        // under the root, per RFC 7540 Section 5.3.1.
        if dep != 0 && !self.nodes.contains_key(&dep) {
            self.nodes.insert(dep, Node::new(0, 16));
            self.attach(0, dep);
        }

        // Cycle rule (Section 5.3.3): when the new parent is currently a
        // descendant of the reprioritized stream, first move that parent up
        // to the stream's old position.
        if dep != 0 && self.is_descendant_of(dep, id) {
            let old_parent = self.nodes[&id].parent;
            self.detach(dep);
            self.attach(old_parent, dep);
        }

        self.detach(id);
        if spec.exclusive {
            // The new node adopts every current child of the dependency.
            let adopted = std::mem::take(&mut self.nodes.get_mut(&dep).unwrap().children);
            for child in &adopted {
                self.nodes.get_mut(child).unwrap().parent = id;
            }
            self.nodes.get_mut(&id).unwrap().children.extend(adopted);
        }
        self.attach(dep, id);
        let node = self.nodes.get_mut(&id).unwrap();
        node.weight = spec.weight;
        trace!(stream = id, parent = dep, weight = spec.weight, "reprioritized");
    }

    /// A stream closed. Its node is retained for a while so dependents keep
    /// a meaningful position; the oldest retiree is pruned once the history
    /// is full.
    pub fn retire(&mut self, id: StreamId) {
        let id = id.value();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if id == 0 || node.retired {
            return;
        }
        node.retired = true;
        self.retired.push(id);

        if self.retired.len() > RETIRED_CAPACITY {
            let oldest = self.retired.remove(0);
            self.prune(oldest);
        }
    }

    /// The stream has queued data again; pull its virtual time up to the
    /// sibling floor so idleness does not accumulate as credit.
    pub fn wake(&mut self, id: StreamId) {
        let id = id.value();
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let floor = self.nodes[&node.parent].child_vtime_floor;
        let node = self.nodes.get_mut(&id).unwrap();
        node.vtime = node.vtime.max(floor);
    }

    /// Charge `octets` of transmitted DATA to a stream.
    pub fn on_sent(&mut self, id: StreamId, octets: usize) {
        let id = id.value();
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.vtime += octets as u64 * 256 / u64::from(node.weight);
        let (vtime, parent) = (node.vtime, node.parent);
        let parent = self.nodes.get_mut(&parent).unwrap();
        parent.child_vtime_floor = parent.child_vtime_floor.max(vtime);
    }

    /// Pick the next stream to send from, where `ready` reports whether a
    /// stream has queued data and open windows. Parents win over their
    /// descendants; siblings are ordered by virtual finish time.
    pub fn select(&self, ready: &dyn Fn(StreamId) -> bool) -> Option<StreamId> {
        self.select_from(0, ready)
    }

    fn select_from(&self, at: u32, ready: &dyn Fn(StreamId) -> bool) -> Option<StreamId> {
        let node = self.nodes.get(&at)?;
        let mut order: Vec<u32> = node.children.clone();
        order.sort_by_key(|id| (self.nodes[id].vtime, *id));

        for child in order {
            if !self.nodes[&child].retired && ready(StreamId::new(child)) {
                return Some(StreamId::new(child));
            }
            if let Some(found) = self.select_from(child, ready) {
                return Some(found);
            }
        }
        None
    }

    fn attach(&mut self, parent: u32, child: u32) {
        self.nodes.get_mut(&child).unwrap().parent = parent;
        let parent = self.nodes.get_mut(&parent).unwrap();
        if !parent.children.contains(&child) {
            parent.children.push(child);
        }
    }

    fn detach(&mut self, id: u32) {
        let parent = self.nodes[&id].parent;
        if let Some(parent) = self.nodes.get_mut(&parent) {
            parent.children.retain(|&c| c != id);
        }
    }

    /// Remove a retired node entirely, splicing its children up to its
    /// parent.
    fn prune(&mut self, id: u32) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        if let Some(parent) = self.nodes.get_mut(&node.parent) {
            parent.children.retain(|&c| c != id);
        }
        for child in node.children {
            if let Some(c) = self.nodes.get_mut(&child) {
                c.parent = node.parent;
            }
            if let Some(parent) = self.nodes.get_mut(&node.parent) {
                if !parent.children.contains(&child) {
                    parent.children.push(child);
                }
            }
        }
    }

    fn is_descendant_of(&self, candidate: u32, ancestor: u32) -> bool {
        let mut at = candidate;
        while at != 0 {
            let parent = self.nodes[&at].parent;
            if parent == ancestor {
                return true;
            }
            at = parent;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dependency: u32, weight: u16, exclusive: bool) -> PrioritySpec {
        PrioritySpec {
            exclusive,
            dependency: StreamId::new(dependency),
            weight,
        }
    }

    #[test]
    fn default_insert_hangs_off_root() {
        let mut tree = PriorityTree::new();
        tree.insert(StreamId::new(1), PrioritySpec::default());
        assert_eq!(tree.parent_of(1), Some(0));
    }

    #[test]
    fn exclusive_insert_adopts_siblings() {
        let mut tree = PriorityTree::new();
        tree.insert(StreamId::new(1), PrioritySpec::default());
        tree.insert(StreamId::new(3), PrioritySpec::default());
        tree.insert(StreamId::new(5), spec(0, 16, true));

        assert_eq!(tree.parent_of(5), Some(0));
        assert_eq!(tree.parent_of(1), Some(5));
        assert_eq!(tree.parent_of(3), Some(5));
    }

    #[test]
    fn dependency_on_unknown_stream_creates_default_node() {
        let mut tree = PriorityTree::new();
        tree.insert(StreamId::new(3), spec(1, 8, false));
        assert_eq!(tree.parent_of(3), Some(1));
        assert_eq!(tree.parent_of(1), Some(0));
    }

    #[test]
    fn cycle_is_broken_by_moving_parent_up() {
        let mut tree = PriorityTree::new();
        tree.insert(StreamId::new(1), PrioritySpec::default());
        tree.insert(StreamId::new(3), spec(1, 16, false));
        tree.insert(StreamId::new(5), spec(3, 16, false));

        // 1 now depends on its own descendant 5; 5 must move up first.
        tree.reprioritize(StreamId::new(1), spec(5, 16, false));
        assert_eq!(tree.parent_of(5), Some(0));
        assert_eq!(tree.parent_of(1), Some(5));
        assert_eq!(tree.parent_of(3), Some(1));
    }

    #[test]
    fn parent_is_selected_before_descendants() {
        let mut tree = PriorityTree::new();
        tree.insert(StreamId::new(1), PrioritySpec::default());
        tree.insert(StreamId::new(3), spec(1, 16, false));

        let all_ready = |_: StreamId| true;
        assert_eq!(tree.select(&all_ready), Some(StreamId::new(1)));

        let only_child = |id: StreamId| id.value() == 3;
        assert_eq!(tree.select(&only_child), Some(StreamId::new(3)));
    }

    #[test]
    fn selection_skips_blocked_streams() {
        let mut tree = PriorityTree::new();
        tree.insert(StreamId::new(1), PrioritySpec::default());
        tree.insert(StreamId::new(3), PrioritySpec::default());

        let only_three = |id: StreamId| id.value() == 3;
        assert_eq!(tree.select(&only_three), Some(StreamId::new(3)));
        let none = |_: StreamId| false;
        assert_eq!(tree.select(&none), None);
    }

    #[test]
    fn sibling_bandwidth_tracks_weights() {
        let mut tree = PriorityTree::new();
        tree.insert(StreamId::new(1), spec(0, 64, false));
        tree.insert(StreamId::new(3), spec(0, 192, false));

        let all_ready = |_: StreamId| true;
        let mut sent = HashMap::new();
        for _ in 0..400 {
            let id = tree.select(&all_ready).unwrap();
            tree.on_sent(id, 1000);
            *sent.entry(id.value()).or_insert(0u64) += 1000;
        }

        let light = sent[&1] as f64;
        let heavy = sent[&3] as f64;
        let ratio = heavy / light;
        assert!((2.5..3.5).contains(&ratio), "ratio {ratio} not near 3");
    }

    #[test]
    fn woken_stream_does_not_cash_in_idle_time() {
        let mut tree = PriorityTree::new();
        tree.insert(StreamId::new(1), PrioritySpec::default());
        tree.insert(StreamId::new(3), PrioritySpec::default());

        // Stream 1 sends alone for a while.
        for _ in 0..50 {
            tree.on_sent(StreamId::new(1), 1000);
        }
        // Stream 3 wakes; it must not get 50 rounds of catch-up.
        tree.wake(StreamId::new(3));

        let all_ready = |_: StreamId| true;
        let mut three_run = 0;
        loop {
            let id = tree.select(&all_ready).unwrap();
            if id.value() != 3 {
                break;
            }
            tree.on_sent(id, 1000);
            three_run += 1;
            assert!(three_run < 10, "stream 3 monopolized after waking");
        }
    }

    #[test]
    fn retired_streams_are_not_selected_but_anchor_children() {
        let mut tree = PriorityTree::new();
        tree.insert(StreamId::new(1), PrioritySpec::default());
        tree.insert(StreamId::new(3), spec(1, 16, false));
        tree.retire(StreamId::new(1));

        let all_ready = |_: StreamId| true;
        assert_eq!(tree.select(&all_ready), Some(StreamId::new(3)));
        assert_eq!(tree.parent_of(3), Some(1));
    }

    #[test]
    fn retirement_history_is_bounded() {
        let mut tree = PriorityTree::new();
        for i in 0..(RETIRED_CAPACITY as u32 + 10) {
            let id = StreamId::new(2 * i + 1);
            tree.insert(id, PrioritySpec::default());
            tree.retire(id);
        }
        // The earliest retirees are pruned outright.
        assert!(!tree.contains(StreamId::new(1)));
        assert!(tree.contains(StreamId::new(2 * RETIRED_CAPACITY as u32 + 1)));
    }
}
