//! Tree persistence and resume.
//!
//! The storage seam is the [`TreeBackend`] trait: node rows keyed by
//! generated ids, write-once ancestry edges, a point-containment query over
//! root regions and a child walk. [`MemoryBackend`] implements it with flat
//! hash tables plus an R-tree over root bounding boxes, and can snapshot
//! itself to disk. [`TreeStore`] builds the engine-facing operations on top:
//! covering-root resolution, frontier reconstruction for resumed runs, and
//! idempotent persistence of refinement output.

use crate::error::{Result, VargridError};
use crate::region::Region;
use crate::scheduler::{PendingRegion, SampledNode};
use crate::tree::{AncestryEdge, Node, NodeId, Root, RootId};
use geo::Point;
use rstar::{AABB, PointDistance, RTree, RTreeObject};
use rustc_hash::FxHashMap;
use std::time::{Duration, SystemTime};

/// Persistent geometry store boundary.
///
/// Inserts are idempotent: re-inserting a node whose depth-scoped key
/// already exists returns the existing id, and re-inserting an existing
/// edge is a no-op. Nothing is ever deleted.
pub trait TreeBackend: Send {
    /// Insert a root record and index its region for containment queries.
    fn insert_root(&mut self, root: Root) -> Result<RootId>;

    fn root(&self, id: RootId) -> Result<Root>;

    /// Insert a node row; returns the existing id if the node's key is
    /// already present.
    fn insert_node(&mut self, node: Node) -> Result<NodeId>;

    fn node(&self, id: NodeId) -> Result<Node>;

    fn node_id_by_key(&self, key: &str) -> Option<NodeId>;

    /// One-time value write for a node created before its value was known.
    fn patch_node_value(&mut self, id: NodeId, value: f64) -> Result<()>;

    /// Append a parent→child edge; no-op if it already exists.
    fn insert_edge(&mut self, edge: AncestryEdge) -> Result<()>;

    /// Children of a node, in insertion order.
    fn children_of(&self, id: NodeId) -> Vec<NodeId>;

    /// Roots of the given measurement whose region contains the point.
    fn roots_containing(&self, point: Point<f64>, measurement: &str) -> Vec<RootId>;
}

#[derive(Debug, Clone)]
struct RootEnvelope {
    aabb: AABB<[f64; 2]>,
    root: RootId,
}

impl RTreeObject for RootEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

impl PointDistance for RootEnvelope {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        self.aabb.distance_2(point)
    }
}

fn root_envelope(root: &Root) -> RootEnvelope {
    let bbox = root.region.bbox();
    RootEnvelope {
        aabb: AABB::from_corners([bbox.min().x, bbox.min().y], [bbox.max().x, bbox.max().y]),
        root: root.id,
    }
}

/// In-memory backend: flat node/root tables, a key dedup index, child
/// adjacency and an R-tree over root bounding boxes.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    nodes: FxHashMap<NodeId, Node>,
    node_keys: FxHashMap<String, NodeId>,
    roots: FxHashMap<RootId, Root>,
    edges: Vec<AncestryEdge>,
    children: FxHashMap<NodeId, Vec<NodeId>>,
    root_index: RTree<RootEnvelope>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }
}

impl TreeBackend for MemoryBackend {
    fn insert_root(&mut self, root: Root) -> Result<RootId> {
        let id = root.id;
        self.root_index.insert(root_envelope(&root));
        self.roots.insert(id, root);
        Ok(id)
    }

    fn root(&self, id: RootId) -> Result<Root> {
        self.roots
            .get(&id)
            .cloned()
            .ok_or(VargridError::UnknownRoot(id))
    }

    fn insert_node(&mut self, node: Node) -> Result<NodeId> {
        let key = node.node_key();
        if let Some(&existing) = self.node_keys.get(&key) {
            return Ok(existing);
        }
        let id = node.id;
        self.node_keys.insert(key, id);
        self.nodes.insert(id, node);
        Ok(id)
    }

    fn node(&self, id: NodeId) -> Result<Node> {
        self.nodes
            .get(&id)
            .cloned()
            .ok_or(VargridError::UnknownNode(id))
    }

    fn node_id_by_key(&self, key: &str) -> Option<NodeId> {
        self.node_keys.get(key).copied()
    }

    fn patch_node_value(&mut self, id: NodeId, value: f64) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(VargridError::UnknownNode(id))?;
        node.value = Some(value);
        Ok(())
    }

    fn insert_edge(&mut self, edge: AncestryEdge) -> Result<()> {
        let siblings = self.children.entry(edge.parent).or_default();
        if siblings.contains(&edge.child) {
            return Ok(());
        }
        siblings.push(edge.child);
        self.edges.push(edge);
        Ok(())
    }

    fn children_of(&self, id: NodeId) -> Vec<NodeId> {
        self.children.get(&id).cloned().unwrap_or_default()
    }

    fn roots_containing(&self, point: Point<f64>, measurement: &str) -> Vec<RootId> {
        self.root_index
            .locate_all_at_point(&[point.x(), point.y()])
            .filter_map(|entry| self.roots.get(&entry.root))
            .filter(|root| root.measurement == measurement && root.region.contains(&point))
            .map(|root| root.id)
            .collect()
    }
}

#[cfg(feature = "snapshot")]
mod snapshot {
    //! Whole-backend snapshot persistence. The key index, adjacency and
    //! R-tree are derived data and are rebuilt on load.

    use super::*;
    use serde::{Deserialize, Serialize};
    use std::fs::File;
    use std::io::{BufReader, BufWriter};
    use std::path::Path;

    #[derive(Serialize, Deserialize)]
    struct Snapshot {
        nodes: Vec<Node>,
        roots: Vec<Root>,
        edges: Vec<AncestryEdge>,
    }

    impl MemoryBackend {
        /// Write all nodes, roots and edges to a snapshot file.
        pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
            let snapshot = Snapshot {
                nodes: self.nodes.values().cloned().collect(),
                roots: self.roots.values().cloned().collect(),
                edges: self.edges.clone(),
            };
            let file = File::create(path)?;
            bincode::serialize_into(BufWriter::new(file), &snapshot)
                .map_err(|e| VargridError::Serialization(e.to_string()))
        }

        /// Rebuild a backend from a snapshot file.
        pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
            let file = File::open(path)?;
            let snapshot: Snapshot = bincode::deserialize_from(BufReader::new(file))
                .map_err(|e| VargridError::Serialization(e.to_string()))?;

            let mut backend = Self::new();
            for node in snapshot.nodes {
                backend.node_keys.insert(node.node_key(), node.id);
                backend.nodes.insert(node.id, node);
            }
            for root in snapshot.roots {
                backend.root_index.insert(root_envelope(&root));
                backend.roots.insert(root.id, root);
            }
            for edge in snapshot.edges {
                backend.children.entry(edge.parent).or_default().push(edge.child);
                backend.edges.push(edge);
            }
            Ok(backend)
        }
    }
}

/// A persisted frontier reconstructed for a resumed run.
#[derive(Debug, Default)]
pub struct Frontier {
    /// Region values fresh enough to seed the sampler cache.
    pub seeds: Vec<(Region, f64)>,
    /// Frontier nodes that still need evaluation, with ancestry and points.
    pub pending: Vec<PendingRegion>,
    /// Fresh, valued leaves emitted directly into the final output without
    /// re-evaluation.
    pub converged: Vec<SampledNode>,
}

/// Engine-facing persistence component over a [`TreeBackend`].
#[derive(Debug)]
pub struct TreeStore<B: TreeBackend> {
    backend: B,
}

impl TreeStore<MemoryBackend> {
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }
}

impl<B: TreeBackend> TreeStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// For each existing root of this measurement whose region contains at
    /// least one of `points`, the subset of points it covers.
    pub fn find_roots_covering(
        &self,
        points: &[Point<f64>],
        measurement: &str,
    ) -> FxHashMap<RootId, Vec<Point<f64>>> {
        let mut out: FxHashMap<RootId, Vec<Point<f64>>> = FxHashMap::default();
        for &point in points {
            for root in self.backend.roots_containing(point, measurement) {
                out.entry(root).or_default().push(point);
            }
        }
        out
    }

    /// Resolve the covering root for a query: none means the caller must
    /// create one; more than one is an error — the points fall under two
    /// previously independent trees this subsystem cannot merge.
    pub fn resolve_root(
        &self,
        points: &[Point<f64>],
        measurement: &str,
    ) -> Result<Option<(RootId, Vec<Point<f64>>)>> {
        let mut covering = self.find_roots_covering(points, measurement);
        match covering.len() {
            0 => Ok(None),
            1 => Ok(covering.drain().next()),
            count => Err(VargridError::AmbiguousRoot { count }),
        }
    }

    /// Create a root record plus its unsampled root node. The node's value
    /// is patched once the sampler has resolved it.
    pub fn create_root(
        &mut self,
        region: &Region,
        measurement: &str,
        observed_at: SystemTime,
    ) -> Result<(RootId, NodeId)> {
        let node_id = self
            .backend
            .insert_node(Node::new(region.clone(), None, 0, None))?;
        let root_id = self
            .backend
            .insert_root(Root::new(region.clone(), measurement, observed_at, node_id))?;
        log::debug!("created root {root_id} for {measurement}");
        Ok((root_id, node_id))
    }

    pub fn root(&self, id: RootId) -> Result<Root> {
        self.backend.root(id)
    }

    /// One-time root value patch; the root node row exists before its value
    /// is known.
    pub fn set_root_value(&mut self, root_id: RootId, value: f64) -> Result<()> {
        let root = self.backend.root(root_id)?;
        let node = self.backend.node(root.root_node)?;
        if node.value.is_some() {
            return Err(VargridError::RootValueAlreadySet(root_id));
        }
        self.backend.patch_node_value(root.root_node, value)
    }

    /// Walk the persisted tree from the root, restricted to the query's
    /// points, and split the visited frontier into already-converged leaves
    /// and work that must be re-evaluated.
    ///
    /// Values are considered fresh when the root's observation time lies
    /// within `freshness_window` of the requested one; nodes carry no
    /// timestamp of their own. A stale tree seeds nothing: its frontier
    /// re-enters evaluation with unresolved ancestors and refines anew.
    pub fn load_frontier(
        &self,
        root_id: RootId,
        points: &[Point<f64>],
        observed_at: SystemTime,
        freshness_window: Duration,
    ) -> Result<Frontier> {
        let root = self.backend.root(root_id)?;
        let fresh = within_window(root.observed_at, observed_at, freshness_window);

        let mut frontier = Frontier::default();

        struct Visit {
            node: NodeId,
            ancestry: Vec<Region>,
            points: Vec<Point<f64>>,
        }

        let mut stack = vec![Visit {
            node: root.root_node,
            ancestry: Vec::new(),
            points: points.to_vec(),
        }];

        while let Some(visit) = stack.pop() {
            let node = self.backend.node(visit.node)?;

            if fresh && let Some(value) = node.value {
                frontier.seeds.push((node.region.clone(), value));
            }

            let children = self.backend.children_of(visit.node);
            if children.is_empty() {
                if fresh && let Some(value) = node.value {
                    frontier.converged.push(SampledNode {
                        value,
                        level: node.level,
                        region: node.region.clone(),
                        parent: visit.ancestry.last().cloned(),
                    });
                } else {
                    frontier.pending.push(PendingRegion {
                        region: node.region.clone(),
                        ancestry: visit.ancestry,
                        points: visit.points,
                    });
                }
                continue;
            }

            let mut ancestry = visit.ancestry;
            ancestry.push(node.region.clone());

            let mut rest = visit.points;
            for child_id in children {
                let child = self.backend.node(child_id)?;
                let (mine, others) = child.region.partition_points(&rest);
                rest = others;
                // Follow only edges that still lead toward a point of
                // interest.
                if mine.is_empty() {
                    continue;
                }
                stack.push(Visit {
                    node: child_id,
                    ancestry: ancestry.clone(),
                    points: mine,
                });
            }
        }

        log::debug!(
            "frontier for {root_id}: {} converged, {} pending, {} seeded values",
            frontier.converged.len(),
            frontier.pending.len(),
            frontier.seeds.len()
        );
        Ok(frontier)
    }

    /// Idempotent append of refinement output under a root.
    ///
    /// Parent links resolve through the key index; entries whose parent is
    /// not inserted yet are deferred to a later pass. A full pass with no
    /// progress means an ancestry that can never resolve.
    pub fn persist(&mut self, root_id: RootId, nodes: &[SampledNode]) -> Result<Vec<NodeId>> {
        // Ensure the root exists before writing under it.
        self.backend.root(root_id)?;

        let mut inserted = Vec::with_capacity(nodes.len());
        let mut pending: Vec<&SampledNode> = nodes.iter().collect();

        while !pending.is_empty() {
            let mut deferred = Vec::new();
            let mut progressed = false;

            for node in pending {
                let parent_id = match node.parent_key() {
                    Some(key) => match self.backend.node_id_by_key(&key) {
                        Some(id) => Some(id),
                        None => {
                            deferred.push(node);
                            continue;
                        }
                    },
                    None => None,
                };

                let id = self.backend.insert_node(Node::new(
                    node.region.clone(),
                    Some(node.value),
                    node.level,
                    parent_id,
                ))?;
                if let Some(parent) = parent_id {
                    self.backend.insert_edge(AncestryEdge {
                        root: root_id,
                        parent,
                        child: id,
                    })?;
                }
                inserted.push(id);
                progressed = true;
            }

            if deferred.is_empty() {
                break;
            }
            if !progressed {
                let missing_key = deferred[0].parent_key().unwrap_or_default();
                return Err(VargridError::CorruptAncestry {
                    unresolved: deferred.len(),
                    missing_key,
                });
            }
            pending = deferred;
        }

        log::debug!("persisted {} nodes under {root_id}", inserted.len());
        Ok(inserted)
    }
}

fn within_window(a: SystemTime, b: SystemTime, window: Duration) -> bool {
    let delta = match a.duration_since(b) {
        Ok(d) => d,
        Err(e) => e.duration(),
    };
    delta <= window
}
