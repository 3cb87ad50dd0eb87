//! Scheduler distributing one byte budget across competing loaders.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    ResourceManager task                      │
//! │                                                              │
//! │  Register / Update / Priority / Unregister                   │
//! │        │                                                     │
//! │        ▼                                                     │
//! │  apply to node states ──► drain inbox ──► redistribute       │
//! │                                              │               │
//! │                     rank nodes by (priority, estimated_extra)│
//! │                                              │               │
//! │                Greedy: top node oversized, rest in full      │
//! │                       Baseline: proportional shares          │
//! │                                              │               │
//! │                                              ▼               │
//! │                          ResourceWorker::update_resources    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The manager is the only writer of a node's `limit`. Loaders report their
//! consumption and demand, and receive their grown cap back. Grants are never
//! revoked: a loader hands budget back by lowering its estimate, which burns
//! the surplus into `used`.

use super::state::ResourceState;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Multiple of its need granted to the top-ranked loader in greedy mode.
const GREEDY_HEADROOM: i64 = 2;

/// Identifier of a registered loader.
pub type NodeId = u64;

/// How spare budget is split between loaders that want more.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResourceMode {
    /// Each loader gets a share proportional to its unmet need.
    #[default]
    Baseline,
    /// Loaders are served in rank order. The top one is granted twice its
    /// need when the budget allows, the rest their full need.
    Greedy,
}

impl std::str::FromStr for ResourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "baseline" => Ok(Self::Baseline),
            "greedy" => Ok(Self::Greedy),
            other => Err(format!("unknown resource mode '{other}'")),
        }
    }
}

/// Receives budget grants.
pub trait ResourceWorker: Send + 'static {
    /// Called with the node's state after its limit grew.
    fn update_resources(&self, state: ResourceState);
}

struct Node {
    state: ResourceState,
    priority: i8,
    worker: Box<dyn ResourceWorker>,
}

/// Heap entry: higher priority first, then larger need, then older node.
#[derive(Debug, PartialEq, Eq)]
struct RankedNode {
    priority: i8,
    extra: i64,
    id: NodeId,
}

impl Ord for RankedNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.extra.cmp(&other.extra))
            .then(other.id.cmp(&self.id))
    }
}

impl PartialOrd for RankedNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// =============================================================================
// Resource Manager (core)
// =============================================================================

/// Budget bookkeeping and grant policy.
///
/// The aggregate `resource_state` counts every node's active limit as `using`,
/// so `resource_state.unused()` is the budget still free to grant.
pub struct ResourceManager {
    mode: ResourceMode,
    max_resource_limit: i64,
    resource_state: ResourceState,
    nodes: HashMap<NodeId, Node>,
    next_node_id: NodeId,
}

impl ResourceManager {
    pub fn new(mode: ResourceMode, max_resource_limit: i64) -> Self {
        assert!(max_resource_limit >= 0, "negative resource limit");
        Self {
            mode,
            max_resource_limit,
            resource_state: ResourceState::new(),
            nodes: HashMap::new(),
            next_node_id: 1,
        }
    }

    /// Registers a worker and immediately tries to satisfy pending demand.
    pub fn register_worker(&mut self, worker: Box<dyn ResourceWorker>, priority: i8) -> NodeId {
        let id = self.next_node_id;
        self.next_node_id += 1;
        self.insert_node(id, worker, priority);
        self.redistribute();
        id
    }

    fn insert_node(&mut self, id: NodeId, worker: Box<dyn ResourceWorker>, priority: i8) {
        let node = Node {
            state: ResourceState::new(),
            priority,
            worker,
        };
        assert!(
            self.nodes.insert(id, node).is_none(),
            "resource node {id} registered twice"
        );
        debug!(node = id, priority, "resource worker registered");
    }

    /// Applies a loader's report and redistributes.
    pub fn update_resources(&mut self, id: NodeId, state: &ResourceState) {
        if self.apply_resources(id, state) {
            self.redistribute();
        }
    }

    /// Applies a loader's report without redistributing.
    ///
    /// Returns false for unknown nodes (already unregistered).
    pub fn apply_resources(&mut self, id: NodeId, state: &ResourceState) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        self.resource_state -= &node.state;
        node.state.update_master(state);
        self.resource_state += &node.state;
        trace!(
            node = id,
            used = node.state.used(),
            using = node.state.using(),
            extra = node.state.estimated_extra(),
            "resource report"
        );
        true
    }

    pub fn update_priority(&mut self, id: NodeId, priority: i8) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.priority = priority;
        }
    }

    /// Removes a node, returning its active limit to the pool.
    pub fn unregister(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            self.resource_state -= &node.state;
            debug!(
                node = id,
                released = node.state.active_limit(),
                "resource worker unregistered"
            );
        }
    }

    /// Grants free budget to nodes with unmet need.
    pub fn redistribute(&mut self) {
        let active_limit = self.resource_state.active_limit();
        self.resource_state
            .update_limit(self.max_resource_limit - active_limit);

        match self.mode {
            ResourceMode::Greedy => self.redistribute_greedy(),
            ResourceMode::Baseline => self.redistribute_proportional(),
        }
    }

    fn ranked_nodes(&self) -> BinaryHeap<RankedNode> {
        self.nodes
            .iter()
            .map(|(&id, node)| RankedNode {
                priority: node.priority,
                extra: node.state.estimated_extra(),
                id,
            })
            .filter(|ranked| ranked.extra > 0)
            .collect()
    }

    fn need_of(state: &ResourceState) -> i64 {
        let unit = state.unit_size();
        (state.estimated_extra() + unit - 1) / unit * unit
    }

    fn redistribute_greedy(&mut self) {
        let mut heap = self.ranked_nodes();
        let mut headroom = GREEDY_HEADROOM;
        while let Some(ranked) = heap.pop() {
            if !self.satisfy_node(ranked.id, headroom) {
                break;
            }
            headroom = 1;
        }
    }

    /// Grants `min(need * headroom, unused)` rounded down to the node's unit.
    fn satisfy_node(&mut self, id: NodeId, headroom: i64) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        let need = Self::need_of(&node.state).saturating_mul(headroom);
        self.grant(id, need)
    }

    fn grant(&mut self, id: NodeId, amount: i64) -> bool {
        let unused = self.resource_state.unused();
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        let unit = node.state.unit_size();
        let mut give = amount.min(unused);
        give -= give % unit;
        if give <= 0 {
            return false;
        }
        self.resource_state.start_use(give);
        node.state.update_limit(give);
        debug!(node = id, give, limit = node.state.limit(), "resource grant");
        node.worker.update_resources(node.state);
        true
    }

    fn redistribute_proportional(&mut self) {
        let available = self.resource_state.unused();
        if available <= 0 {
            return;
        }
        let ranked = self.ranked_nodes().into_sorted_vec();
        let needs: Vec<(NodeId, i64, i64)> = ranked
            .iter()
            .rev()
            .filter_map(|r| {
                let node = self.nodes.get(&r.id)?;
                Some((r.id, Self::need_of(&node.state), node.state.unit_size()))
            })
            .collect();
        let total_need: i64 = needs.iter().map(|(_, need, _)| need).sum();
        if total_need == 0 {
            return;
        }

        if total_need <= available {
            for (id, need, _) in needs {
                self.grant(id, need);
            }
            return;
        }

        // Proportional shares rounded down to units, then largest remainder.
        let mut shares: Vec<(NodeId, i64, i64, i64, i128)> = needs
            .into_iter()
            .map(|(id, need, unit)| {
                let exact = need as i128 * available as i128;
                let share = (exact / total_need as i128) as i64;
                let remainder = exact % total_need as i128;
                (id, need, unit, share - share % unit, remainder)
            })
            .collect();
        let mut left = available - shares.iter().map(|s| s.3).sum::<i64>();
        shares.sort_by(|a, b| b.4.cmp(&a.4));
        for (_, need, unit, share, _) in shares.iter_mut() {
            if left >= *unit && *share + *unit <= *need {
                *share += *unit;
                left -= *unit;
            }
        }

        for (id, _, _, share, _) in shares {
            if share > 0 {
                self.grant(id, share);
            }
        }
    }

    /// Sum of all nodes' active limits.
    pub fn total_active_limit(&self) -> i64 {
        self.nodes.values().map(|n| n.state.active_limit()).sum()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

// =============================================================================
// Actor wrapper
// =============================================================================

enum ResourceMessage {
    Register {
        id: NodeId,
        worker: Box<dyn ResourceWorker>,
        priority: i8,
    },
    Update {
        id: NodeId,
        state: ResourceState,
    },
    Priority {
        id: NodeId,
        priority: i8,
    },
    Unregister {
        id: NodeId,
    },
}

/// Cloneable handle to a running resource manager task.
///
/// The task stops once every handle and lease is dropped.
#[derive(Clone)]
pub struct ResourceManagerHandle {
    tx: mpsc::UnboundedSender<ResourceMessage>,
    next_id: Arc<AtomicU64>,
}

impl ResourceManagerHandle {
    /// Spawns a manager task on the current runtime.
    pub fn spawn(mode: ResourceMode, max_resource_limit: i64) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = ResourceManager::new(mode, max_resource_limit);
        tokio::spawn(run(manager, rx));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Registers a worker; dropping the lease unregisters it.
    pub fn register_worker(&self, worker: Box<dyn ResourceWorker>, priority: i8) -> ResourceLease {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let _ = self.tx.send(ResourceMessage::Register {
            id,
            worker,
            priority,
        });
        ResourceLease {
            id,
            tx: self.tx.clone(),
        }
    }
}

/// A loader's registration with a resource manager.
pub struct ResourceLease {
    id: NodeId,
    tx: mpsc::UnboundedSender<ResourceMessage>,
}

impl ResourceLease {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Reports consumption and demand.
    pub fn update_resources(&self, state: ResourceState) {
        let _ = self.tx.send(ResourceMessage::Update { id: self.id, state });
    }

    pub fn update_priority(&self, priority: i8) {
        let _ = self.tx.send(ResourceMessage::Priority {
            id: self.id,
            priority,
        });
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        let _ = self.tx.send(ResourceMessage::Unregister { id: self.id });
    }
}

impl std::fmt::Debug for ResourceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceLease").field("id", &self.id).finish()
    }
}

async fn run(mut manager: ResourceManager, mut rx: mpsc::UnboundedReceiver<ResourceMessage>) {
    while let Some(message) = rx.recv().await {
        apply(&mut manager, message);
        // Coalesce whatever else is queued before granting.
        while let Ok(message) = rx.try_recv() {
            apply(&mut manager, message);
        }
        manager.redistribute();
    }
    debug!("resource manager stopped");
}

fn apply(manager: &mut ResourceManager, message: ResourceMessage) {
    match message {
        ResourceMessage::Register {
            id,
            worker,
            priority,
        } => manager.insert_node(id, worker, priority),
        ResourceMessage::Update { id, state } => {
            manager.apply_resources(id, &state);
        }
        ResourceMessage::Priority { id, priority } => manager.update_priority(id, priority),
        ResourceMessage::Unregister { id } => manager.unregister(id),
    }
}
