//! Persisted tree model: nodes, roots and ancestry edges.
//!
//! The ancestry graph is stored as parent/child edges rather than embedded
//! child lists: nodes live in flat tables and edges are id pairs, which keeps
//! the persisted form free of cyclic in-memory structure and lets a partial
//! tree be reconstructed by walking edges from a root.

use crate::region::Region;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Identifier of a persisted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a sampling run's root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RootId(Uuid);

impl RootId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A persisted, evaluated region with its place in the ancestry tree.
///
/// `value` is written once, at creation, from the sampler result. The sole
/// exception is the root node: its record is created before its value is
/// known and patched exactly once after tree construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub region: Region,
    pub value: Option<f64>,
    pub level: u32,
    pub parent: Option<NodeId>,
}

impl Node {
    pub fn new(region: Region, value: Option<f64>, level: u32, parent: Option<NodeId>) -> Self {
        Self {
            id: NodeId::generate(),
            region,
            value,
            level,
            parent,
        }
    }

    /// Depth-scoped dedup key.
    pub fn node_key(&self) -> String {
        self.region.node_key(self.level)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// The top-level record of one sampling run: one measurement at one
/// observation time over one spatial extent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Root {
    pub id: RootId,
    pub region: Region,
    pub measurement: String,
    pub observed_at: SystemTime,
    pub root_node: NodeId,
}

impl Root {
    pub fn new(
        region: Region,
        measurement: impl Into<String>,
        observed_at: SystemTime,
        root_node: NodeId,
    ) -> Self {
        Self {
            id: RootId::generate(),
            region,
            measurement: measurement.into(),
            observed_at,
            root_node,
        }
    }
}

/// Write-once parent→child relation under a root. Edges are never deleted
/// or repointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestryEdge {
    pub root: RootId,
    pub parent: NodeId,
    pub child: NodeId,
}
