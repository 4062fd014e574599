//! Load balancing policies satisfying the [`Balancer`] contract: round-robin,
//! weighted round-robin and least-connections.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::upstream::{Node, NodeKey};

/// A load balancing policy over a mutable pool of nodes.
///
/// Implementations must be safe for concurrent use: the pool is mutated from
/// the health-check and admin paths while `balance` runs on the dispatch path.
pub trait Balancer: Send + Sync {
    /// Adds a node to the balancing pool.
    fn add_node(&self, node: Arc<Node>);

    /// Removes a node from the balancing pool. Unknown keys are ignored.
    fn remove_node(&self, key: &NodeKey);

    /// Picks the node the next request should be sent to.
    ///
    /// Returns `None` when the pool is empty.
    fn balance(&self) -> Option<Selection>;
}

/// The outcome of a balancing decision: the chosen node plus, for policies
/// that track outstanding dispatches, a guard signalling completion on drop.
pub struct Selection {
    pub node: Arc<Node>,
    pub flight: Option<FlightGuard>,
}

impl Selection {
    fn untracked(node: Arc<Node>) -> Self {
        Self { node, flight: None }
    }
}

/// Round-robin: nodes are served in insertion order by a wrapping cursor.
#[derive(Default)]
pub struct RoundRobin {
    state: Mutex<RrState>,
}

#[derive(Default)]
struct RrState {
    nodes: Vec<Arc<Node>>,
    /// Index of the node the next `balance` call returns.
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn add_node(&self, node: Arc<Node>) {
        self.state.lock().nodes.push(node);
    }

    fn remove_node(&self, key: &NodeKey) {
        let mut state = self.state.lock();
        let Some(pos) = state.nodes.iter().position(|n| n.key == *key) else {
            return;
        };
        state.nodes.remove(pos);
        // The successor slides into the removed slot, so a cursor on the
        // deleted node already points at its successor; only deletions before
        // the cursor shift it.
        if pos < state.cursor {
            state.cursor -= 1;
        }
    }

    fn balance(&self) -> Option<Selection> {
        let mut state = self.state.lock();
        if state.nodes.is_empty() {
            return None;
        }
        if state.cursor >= state.nodes.len() {
            state.cursor = 0;
        }
        let node = state.nodes[state.cursor].clone();
        state.cursor += 1;
        Some(Selection::untracked(node))
    }
}

/// Weighted round-robin: like round-robin, but the cursor stays on each node
/// for `weight` consecutive requests before advancing.
#[derive(Default)]
pub struct WeightedRoundRobin {
    state: Mutex<WrrState>,
}

#[derive(Default)]
struct WrrState {
    nodes: Vec<Arc<Node>>,
    cursor: usize,
    /// Requests left for the cursor node, the next one included. At least 1
    /// whenever the pool is non-empty.
    credit: u32,
}

impl WrrState {
    fn reset_credit(&mut self) {
        // weights below 1 still grant one request per pass
        self.credit = self
            .nodes
            .get(self.cursor)
            .map(|n| n.weight.max(1))
            .unwrap_or(0);
    }
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for WeightedRoundRobin {
    fn add_node(&self, node: Arc<Node>) {
        let mut state = self.state.lock();
        state.nodes.push(node);
        if state.nodes.len() == 1 {
            state.cursor = 0;
            state.reset_credit();
        }
    }

    fn remove_node(&self, key: &NodeKey) {
        let mut state = self.state.lock();
        let Some(pos) = state.nodes.iter().position(|n| n.key == *key) else {
            return;
        };
        state.nodes.remove(pos);
        if pos < state.cursor {
            state.cursor -= 1;
        } else if pos == state.cursor {
            // the cursor now points at the successor (wrapping), which starts
            // with a fresh credit allowance
            if state.cursor >= state.nodes.len() {
                state.cursor = 0;
            }
            state.reset_credit();
        }
    }

    fn balance(&self) -> Option<Selection> {
        let mut state = self.state.lock();
        if state.nodes.is_empty() {
            return None;
        }
        let node = state.nodes[state.cursor].clone();
        state.credit -= 1;
        if state.credit == 0 {
            state.cursor = (state.cursor + 1) % state.nodes.len();
            state.reset_credit();
        }
        Some(Selection::untracked(node))
    }
}

/// Least-connections: a binary min-heap keyed by the number of in-flight
/// requests. Completion is observed through the [`FlightGuard`] attached to
/// every selection.
pub struct LeastConnections {
    state: Arc<Mutex<LcState>>,
}

#[derive(Default)]
struct LcState {
    /// Heap of entry ids, ordered by in-flight count.
    heap: Vec<u64>,
    entries: HashMap<u64, LcEntry>,
    next_id: u64,
}

struct LcEntry {
    node: Arc<Node>,
    in_flight: usize,
    /// Position in `heap`; meaningless once detached.
    pos: usize,
    /// Set when the node was removed while dispatches were still outstanding.
    detached: bool,
}

impl LcState {
    fn in_flight_at(&self, pos: usize) -> usize {
        self.entries.get(&self.heap[pos]).map_or(0, |e| e.in_flight)
    }

    fn less(&self, a: usize, b: usize) -> bool {
        self.in_flight_at(a) < self.in_flight_at(b)
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        let (id_a, id_b) = (self.heap[a], self.heap[b]);
        if let Some(entry) = self.entries.get_mut(&id_a) {
            entry.pos = a;
        }
        if let Some(entry) = self.entries.get_mut(&id_b) {
            entry.pos = b;
        }
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.less(pos, parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            if left >= self.heap.len() {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < self.heap.len() && self.less(right, left) {
                child = right;
            }
            if !self.less(child, pos) {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }

    fn heap_push(&mut self, id: u64) {
        self.heap.push(id);
        let pos = self.heap.len() - 1;
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.pos = pos;
        }
        self.sift_up(pos);
    }

    fn heap_remove(&mut self, pos: usize) {
        self.heap.swap_remove(pos);
        if pos < self.heap.len() {
            let moved = self.heap[pos];
            if let Some(entry) = self.entries.get_mut(&moved) {
                entry.pos = pos;
            }
            self.sift_down(pos);
            self.sift_up(pos);
        }
    }

    /// One dispatch to the entry finished.
    fn complete(&mut self, id: u64) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);
        if entry.detached {
            if entry.in_flight == 0 {
                self.entries.remove(&id);
            }
            return;
        }
        let pos = entry.pos;
        self.sift_up(pos);
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl LeastConnections {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(LcState::default())),
        }
    }
}

impl Balancer for LeastConnections {
    fn add_node(&self, node: Arc<Node>) {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.entries.insert(
            id,
            LcEntry {
                node,
                in_flight: 0,
                pos: 0,
                detached: false,
            },
        );
        state.heap_push(id);
    }

    fn remove_node(&self, key: &NodeKey) {
        let mut state = self.state.lock();
        let found = state.heap.iter().copied().enumerate().find(|(_, id)| {
            state
                .entries
                .get(id)
                .map(|e| e.node.key == *key)
                .unwrap_or(false)
        });
        let Some((pos, id)) = found else {
            return;
        };
        state.heap_remove(pos);
        // entries with outstanding dispatches stay detached until the last
        // flight guard drops, so a stale guard can never touch a reused slot
        let drained = state.entries.get(&id).map_or(true, |e| e.in_flight == 0);
        if drained {
            state.entries.remove(&id);
        } else if let Some(entry) = state.entries.get_mut(&id) {
            entry.detached = true;
        }
    }

    fn balance(&self) -> Option<Selection> {
        let mut state = self.state.lock();
        let root = *state.heap.first()?;
        let node = {
            let entry = state.entries.get_mut(&root)?;
            entry.in_flight += 1;
            entry.node.clone()
        };
        state.sift_down(0);
        Some(Selection {
            node,
            flight: Some(FlightGuard {
                state: Arc::downgrade(&self.state),
                id: root,
            }),
        })
    }
}

/// Tracks one outstanding dispatch to a least-connections node. Dropping the
/// guard releases the dispatch exactly once; the router keeps it alive for as
/// long as the response body is streaming.
pub struct FlightGuard {
    state: Weak<Mutex<LcState>>,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().complete(self.id);
        }
    }
}
