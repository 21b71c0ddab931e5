//! Entity-level and metric-level causal graph construction.
//!
//! The builder turns entity-level causal pairs into an entity graph, attaches
//! the anomalous metrics to their entities, prunes by correlation score, and
//! expands each entity edge into metric-level cause edges via the rule
//! engine's category tables.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;

use crate::analytics::trend::check_trend;
use crate::models::event::{AbnormalEvent, MetricSnapshot};
use crate::models::graph::{MetricCauseGraph, MetricNode, MetricNodeAttrs, MetricNodeId};
use crate::models::topology::TopoNode;
use crate::rules::categories::{MetricGroup, RuleMeta};
use crate::rules::engine::RuleEngine;
use crate::rules::entity::CausalRelation;

/// Minimum `corr_score` a metric must reach to stay on its entity.
pub const CORR_SCORE_THRESHOLD: f64 = 0.1;

/// An entity-graph node: topology attributes plus the anomalous metrics
/// attached to the entity.
#[derive(Debug, Clone)]
pub struct EntityNode {
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    pub machine_id: String,
    pub raw_data: HashMap<String, Value>,
    pub is_abnormal: bool,
    pub abnormal_metrics: HashMap<String, MetricSnapshot>,
}

impl EntityNode {
    fn from_topo(node: &TopoNode) -> Self {
        Self {
            id: node.id.clone(),
            entity_id: node.entity_id.clone(),
            entity_type: node.entity_type.clone(),
            machine_id: node.machine_id.clone(),
            raw_data: node.raw_data.clone(),
            is_abnormal: false,
            abnormal_metrics: HashMap::new(),
        }
    }

    /// Raw attributes as string labels, the label source for time-series
    /// queries.
    pub fn label_map(&self) -> HashMap<String, String> {
        self.raw_data
            .iter()
            .map(|(k, v)| {
                let val = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), val)
            })
            .collect()
    }

    /// Metric ids currently attached, in sorted order for deterministic
    /// expansion.
    pub fn abnormal_metric_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.abnormal_metrics.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// The per-cycle causal graph pair: entity-level graph plus its metric-level
/// expansion.
#[derive(Debug, Default)]
pub struct CausalGraph {
    entity_graph: DiGraph<EntityNode, Option<Arc<RuleMeta>>>,
    entity_index: HashMap<String, NodeIndex>,
    pub metric_graph: MetricCauseGraph,
}

impl CausalGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts every endpoint referenced by the causal pairs and adds the
    /// entity edges; pairs with endpoints missing from the node map are
    /// skipped and parallel edges collapse.
    pub fn init_entity_graph(
        &mut self,
        relations: &[CausalRelation],
        topo_nodes: &HashMap<String, TopoNode>,
    ) {
        for (from_id, to_id) in relations {
            let (Some(from), Some(to)) = (topo_nodes.get(from_id), topo_nodes.get(to_id)) else {
                continue;
            };
            let f = self.ensure_entity_node(from);
            let t = self.ensure_entity_node(to);
            if self.entity_graph.find_edge(f, t).is_none() {
                self.entity_graph.add_edge(f, t, None);
            }
        }
    }

    fn ensure_entity_node(&mut self, node: &TopoNode) -> NodeIndex {
        if let Some(&idx) = self.entity_index.get(&node.id) {
            return idx;
        }
        let idx = self.entity_graph.add_node(EntityNode::from_topo(node));
        self.entity_index.insert(node.id.clone(), idx);
        idx
    }

    /// Attaches each anomalous metric to the entity node whose `entity_id`
    /// matches. A duplicate metric id keeps the entry with the newer
    /// timestamp.
    pub fn add_abnormal_metrics(&mut self, events: &[AbnormalEvent]) {
        let by_entity_id: HashMap<String, NodeIndex> = self
            .entity_graph
            .node_indices()
            .map(|idx| (self.entity_graph[idx].entity_id.clone(), idx))
            .collect();

        for event in events {
            let Some(&idx) = by_entity_id.get(&event.entity_id) else {
                continue;
            };
            let node = &mut self.entity_graph[idx];
            node.is_abnormal = true;
            let snapshot = event.to_snapshot();
            match node.abnormal_metrics.get(&event.metric_id) {
                Some(existing) if existing.timestamp >= event.timestamp => {}
                _ => {
                    node.abnormal_metrics.insert(event.metric_id.clone(), snapshot);
                }
            }
        }
    }

    pub fn entity_node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entity_index.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn entity_node(&self, id: &str) -> Option<&EntityNode> {
        self.entity_index.get(id).map(|&idx| &self.entity_graph[idx])
    }

    pub fn entity_node_mut(&mut self, id: &str) -> Option<&mut EntityNode> {
        self.entity_index
            .get(id)
            .copied()
            .map(move |idx| &mut self.entity_graph[idx])
    }

    /// Drops metrics below the correlation threshold (or never scored); an
    /// entity left without metrics becomes non-abnormal.
    pub fn filter_abnormal_metrics_by_corr_score(&mut self) {
        for idx in self.entity_graph.node_indices().collect::<Vec<_>>() {
            let node = &mut self.entity_graph[idx];
            node.abnormal_metrics
                .retain(|_, snap| snap.corr_score.unwrap_or(0.0) >= CORR_SCORE_THRESHOLD);
            if node.abnormal_metrics.is_empty() {
                node.is_abnormal = false;
            }
        }
    }

    /// Attaches the expansion table to every entity edge, choosing the
    /// host-local or cross-host table by whether the endpoints share a
    /// machine.
    pub fn attach_rule_metas(&mut self, engine: &RuleEngine) {
        for edge in self.entity_graph.edge_indices().collect::<Vec<_>>() {
            let Some((f, t)) = self.entity_graph.edge_endpoints(edge) else {
                continue;
            };
            let from = &self.entity_graph[f];
            let to = &self.entity_graph[t];
            let same_host = from.machine_id == to.machine_id;
            let meta = engine.rule_meta_for(&from.entity_type, &to.entity_type, same_host);
            self.entity_graph[edge] = Some(meta);
        }
    }

    /// Builds the metric-level cause graph: one node per surviving abnormal
    /// metric, then one pass of category expansion per entity edge.
    pub fn build_metric_graph(&mut self) {
        for idx in self.entity_graph.node_indices().collect::<Vec<_>>() {
            let node = &self.entity_graph[idx];
            for metric_id in node.abnormal_metric_ids() {
                let snapshot = node.abnormal_metrics[&metric_id].clone();
                self.metric_graph.add_node(MetricNode {
                    id: MetricNodeId::new(node.id.clone(), metric_id),
                    attrs: MetricNodeAttrs {
                        entity_id: node.entity_id.clone(),
                        entity_type: node.entity_type.clone(),
                        machine_id: node.machine_id.clone(),
                        snapshot: Some(snapshot),
                        trend: None,
                    },
                });
            }
        }

        for edge in self.entity_graph.edge_indices().collect::<Vec<_>>() {
            self.expand_entity_edge(edge);
        }
    }

    fn expand_entity_edge(&mut self, edge: petgraph::graph::EdgeIndex) {
        let Some((f, t)) = self.entity_graph.edge_endpoints(edge) else {
            return;
        };
        let Some(meta) = self.entity_graph[edge].clone() else {
            return;
        };

        let from_node = self.entity_graph[f].clone();
        let to_node = self.entity_graph[t].clone();
        let relations = meta.expand(
            &from_node.abnormal_metric_ids(),
            &to_node.abnormal_metric_ids(),
        );

        let mut unique: HashSet<(String, String)> = HashSet::new();
        for (mut from_group, mut to_group) in relations {
            if from_group.is_virtual() {
                self.add_virtual_metric_node(&from_node, &from_group.metrics[0]);
            }
            if to_group.is_virtual() {
                self.add_virtual_metric_node(&to_node, &to_group.metrics[0]);
            }

            filter_group_by_trend(&mut from_group, &from_node);
            filter_group_by_trend(&mut to_group, &to_node);
            if from_group.metrics.is_empty() || to_group.metrics.is_empty() {
                continue;
            }

            let from_metric = metric_with_largest_score(&from_group.metrics, &from_node);
            let to_metric = metric_with_largest_score(&to_group.metrics, &to_node);
            if !unique.insert((from_metric.clone(), to_metric.clone())) {
                continue;
            }

            let from_id = MetricNodeId::new(from_node.id.clone(), from_metric);
            let to_id = MetricNodeId::new(to_node.id.clone(), to_metric);
            self.metric_graph.add_edge(&from_id, &to_id);
            self.metric_graph.set_trend_if_unset(&from_id, from_group.trend);
            self.metric_graph.set_trend_if_unset(&to_id, to_group.trend);
        }
    }

    fn add_virtual_metric_node(&mut self, entity: &EntityNode, metric_id: &str) {
        self.metric_graph.add_node(MetricNode {
            id: MetricNodeId::new(entity.id.clone(), metric_id),
            attrs: MetricNodeAttrs {
                entity_id: entity.entity_id.clone(),
                entity_type: entity.entity_type.clone(),
                machine_id: entity.machine_id.clone(),
                snapshot: None,
                trend: None,
            },
        });
    }

    pub fn entity_count(&self) -> usize {
        self.entity_graph.node_count()
    }
}

/// Keeps only group members whose observed trend agrees with the expected
/// one; virtual groups pass untouched.
fn filter_group_by_trend(group: &mut MetricGroup, entity: &EntityNode) {
    if group.is_virtual() {
        return;
    }
    let expect = group.trend;
    group.metrics.retain(|metric_id| {
        let real = entity
            .abnormal_metrics
            .get(metric_id)
            .and_then(|snap| snap.real_trend);
        let keep = check_trend(expect, real);
        if !keep {
            tracing::debug!(
                "trend of the metric ({}, {}) does not meet the expectation",
                metric_id,
                entity.id
            );
        }
        keep
    });
}

/// The group member with the largest correlation score; ties keep the first
/// seen.
fn metric_with_largest_score(metric_ids: &[String], entity: &EntityNode) -> String {
    let mut best = metric_ids[0].clone();
    if metric_ids.len() == 1 {
        return best;
    }
    let score_of = |metric_id: &str| {
        entity
            .abnormal_metrics
            .get(metric_id)
            .and_then(|s| s.corr_score)
            .unwrap_or(0.0)
    };
    let mut best_score = score_of(&best);
    for metric_id in metric_ids {
        let score = score_of(metric_id);
        if score > best_score {
            best = metric_id.clone();
            best_score = score;
        }
    }
    best
}
