//! Metric-level cause graph primitives.
//!
//! The metric cause graph is a DAG over `(entity-node-id, metric-id)` pairs
//! with edges pointing from cause to effect. The cause tree stitches results
//! from multiple cross-host expansions together without duplication before
//! the final ranking pass.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use crate::models::event::{MetricSnapshot, Trend};

/// Default placeholder emitted in place of any virtual metric id.
pub const DEFAULT_VIRTUAL_METRIC_ID: &str = "virtual_metric";

/// `(pseudo-category, virtual metric id)` pairs; every category partition
/// implicitly contains these.
pub const VIRTUAL_METRIC_CATEGORIES: [(&str, &str); 4] = [
    ("VIRTUAL", "virtual_metric"),
    ("VIRTUAL_IO_DELAY", "virtual_io_delay"),
    ("VIRTUAL_IO_LOAD", "virtual_io_load"),
    ("VIRTUAL_NET_DELAY", "virtual_net_delay"),
];

pub fn is_virtual_metric(metric_id: &str) -> bool {
    VIRTUAL_METRIC_CATEGORIES.iter().any(|(_, id)| *id == metric_id)
}

pub fn is_virtual_category(category: &str) -> bool {
    VIRTUAL_METRIC_CATEGORIES.iter().any(|(cat, _)| *cat == category)
}

/// Identity of a node in the metric cause graph. Value semantics; usable as a
/// hash-map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricNodeId {
    pub entity_node_id: String,
    pub metric_id: String,
}

impl MetricNodeId {
    pub fn new(entity_node_id: impl Into<String>, metric_id: impl Into<String>) -> Self {
        Self {
            entity_node_id: entity_node_id.into(),
            metric_id: metric_id.into(),
        }
    }

    pub fn is_virtual(&self) -> bool {
        is_virtual_metric(&self.metric_id)
    }
}

/// Attributes of a metric cause-graph node: the metric-event snapshot plus
/// entity attributes inherited from the entity graph. Virtual nodes carry
/// entity attributes only.
#[derive(Debug, Clone)]
pub struct MetricNodeAttrs {
    pub entity_id: String,
    pub entity_type: String,
    pub machine_id: String,
    pub snapshot: Option<MetricSnapshot>,
    pub trend: Option<Trend>,
}

impl MetricNodeAttrs {
    pub fn corr_score(&self) -> f64 {
        self.snapshot
            .as_ref()
            .and_then(|s| s.corr_score)
            .unwrap_or(0.0)
    }

    pub fn abnormal_score(&self) -> f64 {
        self.snapshot
            .as_ref()
            .map(|s| s.abnormal_score)
            .unwrap_or(0.0)
    }
}

/// A metric cause-graph node: identity plus attributes.
#[derive(Debug, Clone)]
pub struct MetricNode {
    pub id: MetricNodeId,
    pub attrs: MetricNodeAttrs,
}

/// A ranked root-cause candidate with its explanatory path, directed from the
/// candidate root toward the triggering KPI.
#[derive(Debug, Clone)]
pub struct Cause {
    pub metric_id: String,
    pub entity_id: String,
    pub cause_score: f64,
    pub path: Vec<MetricNode>,
}

/// Directed graph over [`MetricNodeId`] keyed for O(1) lookup.
#[derive(Debug, Default)]
pub struct MetricCauseGraph {
    graph: DiGraph<MetricNode, ()>,
    index: HashMap<MetricNodeId, NodeIndex>,
}

impl MetricCauseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node, keeping existing attributes when the id is already
    /// present.
    pub fn add_node(&mut self, node: MetricNode) {
        if self.index.contains_key(&node.id) {
            return;
        }
        let id = node.id.clone();
        let idx = self.graph.add_node(node);
        self.index.insert(id, idx);
    }

    /// Adds a cause-to-effect edge between two existing nodes; parallel edges
    /// are collapsed.
    pub fn add_edge(&mut self, from: &MetricNodeId, to: &MetricNodeId) {
        let (Some(&f), Some(&t)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        if self.graph.find_edge(f, t).is_none() {
            self.graph.add_edge(f, t, ());
        }
    }

    pub fn contains(&self, id: &MetricNodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &MetricNodeId) -> Option<&MetricNode> {
        self.index.get(id).map(|&idx| &self.graph[idx])
    }

    pub fn node_mut(&mut self, id: &MetricNodeId) -> Option<&mut MetricNode> {
        self.index.get(id).copied().map(move |idx| &mut self.graph[idx])
    }

    /// Records the expected trend on a node unless one is already set.
    pub fn set_trend_if_unset(&mut self, id: &MetricNodeId, trend: Option<Trend>) {
        if let Some(node) = self.node_mut(id) {
            if node.attrs.trend.is_none() {
                node.attrs.trend = trend;
            }
        }
    }

    pub fn predecessors(&self, id: &MetricNodeId) -> Vec<&MetricNode> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn successors(&self, id: &MetricNodeId) -> Vec<&MetricNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &MetricNodeId, dir: Direction) -> Vec<&MetricNode> {
        let Some(&idx) = self.index.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, dir)
            .map(|n| &self.graph[n])
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &MetricNode> {
        self.graph.node_weights()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Edge list as id pairs, for diagnostics.
    pub fn edge_ids(&self) -> Vec<(MetricNodeId, MetricNodeId)> {
        self.graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .map(|(f, t)| (self.graph[f].id.clone(), self.graph[t].id.clone()))
            .collect()
    }
}

struct CauseTreeNode {
    node: MetricNode,
    children: Vec<MetricNodeId>,
}

/// A rooted tree over [`MetricNodeId`] used to de-duplicate overlapping
/// cross-host expansion results. The root is the triggering KPI metric node.
pub struct CauseTree {
    root: MetricNodeId,
    nodes: HashMap<MetricNodeId, CauseTreeNode>,
}

impl CauseTree {
    pub fn new(root: MetricNode) -> Self {
        let root_id = root.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(
            root_id.clone(),
            CauseTreeNode {
                node: root,
                children: Vec::new(),
            },
        );
        Self { root: root_id, nodes }
    }

    pub fn root_id(&self) -> &MetricNodeId {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mounts every cause path into the tree and returns the newly inserted
    /// metric nodes. The target of each path (its last node) must already be
    /// in the tree; ancestors toward the cause are appended as children. A
    /// path node whose id already exists anywhere in the tree is reused
    /// rather than duplicated.
    pub fn append_all_causes(&mut self, causes: &[Cause]) -> Vec<MetricNode> {
        let mut newly_added = Vec::new();
        for cause in causes {
            let Some(target) = cause.path.last() else {
                continue;
            };
            if !self.nodes.contains_key(&target.id) {
                continue;
            }
            let mut cursor = target.id.clone();
            for node in cause.path.iter().rev().skip(1) {
                if self.nodes.contains_key(&node.id) {
                    cursor = node.id.clone();
                    continue;
                }
                self.nodes.insert(
                    node.id.clone(),
                    CauseTreeNode {
                        node: node.clone(),
                        children: Vec::new(),
                    },
                );
                if let Some(parent) = self.nodes.get_mut(&cursor) {
                    parent.children.push(node.id.clone());
                }
                newly_added.push(node.clone());
                cursor = node.id.clone();
            }
        }
        newly_added
    }

    /// Converts the tree into a cause graph with one child-to-parent edge per
    /// tree relation (children are causes of their parents).
    pub fn to_cause_graph(&self) -> MetricCauseGraph {
        let mut graph = MetricCauseGraph::new();
        for tree_node in self.nodes.values() {
            graph.add_node(tree_node.node.clone());
        }
        for (parent_id, tree_node) in &self.nodes {
            for child_id in &tree_node.children {
                graph.add_edge(child_id, parent_id);
            }
        }
        graph
    }
}
