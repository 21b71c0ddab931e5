//! Root-cause locating: host-local inference plus recursive cross-host
//! expansion over `runs_on` and `store_in` edges.

use std::collections::HashMap;

use crate::analytics::causal_graph::CausalGraph;
use crate::analytics::correlation::pearson;
use crate::analytics::policy::InferPolicy;
use crate::analytics::trend::series_trend;
use crate::clients::{MetricStore, TopologyStore};
use crate::error::Result;
use crate::models::event::AbnormalEvent;
use crate::models::graph::{Cause, CauseTree, MetricNode, MetricNodeAttrs, MetricNodeId};
use crate::models::topology::{HostTopo, RelationType, TopoEdge, TopoNode};
use crate::rules::engine::RuleEngine;
use crate::rules::entity::CausalRelation;

/// Cross-host edge types followed during cluster expansion.
const CROSS_HOST_EDGE_TYPES: [RelationType; 2] = [RelationType::RunsOn, RelationType::StoreIn];

/// Locates root causes for one triggering KPI across the cluster.
///
/// All state is owned by the current inference cycle and discarded after the
/// result is emitted.
pub struct CauseLocator<'a> {
    kpi: AbnormalEvent,
    abn_metrics: Vec<AbnormalEvent>,
    topo: &'a dyn TopologyStore,
    metrics: &'a dyn MetricStore,
    engine: &'a RuleEngine,
    policy: Box<dyn InferPolicy>,
    top_k: usize,

    topo_ts: i64,
    kpi_hist: Option<Vec<f64>>,
    cross_host_edges: Vec<TopoEdge>,
}

impl<'a> CauseLocator<'a> {
    pub fn new(
        kpi: AbnormalEvent,
        abn_metrics: Vec<AbnormalEvent>,
        topo: &'a dyn TopologyStore,
        metrics: &'a dyn MetricStore,
        engine: &'a RuleEngine,
        policy: Box<dyn InferPolicy>,
        top_k: usize,
    ) -> Self {
        Self {
            kpi,
            abn_metrics,
            topo,
            metrics,
            engine,
            policy,
            top_k,
            topo_ts: 0,
            kpi_hist: None,
            cross_host_edges: Vec::new(),
        }
    }

    /// Runs one full inference cycle and returns the final ranked causes.
    pub async fn locate(&mut self) -> Result<Vec<Cause>> {
        self.topo_ts = self.topo.recent_ts(self.kpi.timestamp / 1000).await?;
        self.init_cross_host_edges().await;

        let kpi_entity = self
            .topo
            .entity_by_id(&self.kpi.entity_id, self.topo_ts)
            .await?;
        let kpi_node_id = MetricNodeId::new(kpi_entity.id.clone(), self.kpi.metric_id.clone());

        let host_topo = self.topo.host_topo(&kpi_entity.machine_id, self.topo_ts).await?;
        let host_graph = self.construct_host_causal_graph(&host_topo).await?;
        tracing::debug!(
            "host metric cause graph edges are: {:?}",
            host_graph.metric_graph.edge_ids()
        );

        let host_causes = self.policy.infer(&host_graph.metric_graph, &kpi_node_id, 0)?;

        let root = host_graph
            .metric_graph
            .node(&kpi_node_id)
            .cloned()
            .unwrap_or_else(|| self.synthetic_root(&kpi_entity, &kpi_node_id));
        let mut cause_tree = CauseTree::new(root);
        let newly_added = cause_tree.append_all_causes(&host_causes);
        if newly_added.is_empty() {
            return Ok(Vec::new());
        }

        self.expand_across_hosts(&mut cause_tree, kpi_entity.machine_id.clone(), newly_added)
            .await?;

        let cluster_graph = cause_tree.to_cause_graph();
        tracing::debug!(
            "cluster metric cause graph edges are: {:?}",
            cluster_graph.edge_ids()
        );
        let causes = self.policy.infer(&cluster_graph, &kpi_node_id, self.top_k)?;
        Ok(filter_causes(causes))
    }

    /// Fallback root for the cause tree when the KPI metric node was pruned
    /// from the host graph.
    fn synthetic_root(&self, kpi_entity: &TopoNode, kpi_node_id: &MetricNodeId) -> MetricNode {
        MetricNode {
            id: kpi_node_id.clone(),
            attrs: MetricNodeAttrs {
                entity_id: self.kpi.entity_id.clone(),
                entity_type: kpi_entity.entity_type.clone(),
                machine_id: kpi_entity.machine_id.clone(),
                snapshot: Some(self.kpi.to_snapshot()),
                trend: None,
            },
        }
    }

    /// Precomputes all cross-host `runs_on`/`store_in` edges once per cycle;
    /// a failing edge type is logged and skipped.
    async fn init_cross_host_edges(&mut self) {
        let mut edges = Vec::new();
        for relation in CROSS_HOST_EDGE_TYPES {
            match self
                .topo
                .cross_host_edges(relation.as_str(), self.topo_ts)
                .await
            {
                Ok(found) => edges.extend(found),
                Err(err) => tracing::warn!("{err}"),
            }
        }
        self.cross_host_edges = edges;
    }

    fn edges_touching(&self, machine_id: &str) -> Vec<TopoEdge> {
        self.cross_host_edges
            .iter()
            .filter(|edge| {
                let from = edge.from_node.as_ref().map(|n| n.machine_id.as_str());
                let to = edge.to_node.as_ref().map(|n| n.machine_id.as_str());
                from == Some(machine_id) || to == Some(machine_id)
            })
            .cloned()
            .collect()
    }

    /// Breadth of the expansion: every newly inserted frontier node on a host
    /// pulls in that host's cross-host neighbours; only newly inserted tree
    /// nodes are expanded further. Per-neighbour failures are logged and
    /// skipped.
    async fn expand_across_hosts(
        &mut self,
        cause_tree: &mut CauseTree,
        start_machine: String,
        start_frontier: Vec<MetricNode>,
    ) -> Result<()> {
        let mut worklist = vec![(start_machine, start_frontier)];

        while let Some((machine_id, frontier)) = worklist.pop() {
            tracing::debug!("start cross host cause locating, affected machine id: {machine_id}");
            let affected_topo = match self.topo.host_topo(&machine_id, self.topo_ts).await {
                Ok(topo) => topo,
                Err(err) => {
                    tracing::warn!("{err}");
                    continue;
                }
            };

            for cross_edge in self.edges_touching(&machine_id) {
                let Some(neigh_entity) = neighbour_entity(&machine_id, &cross_edge) else {
                    continue;
                };
                let neigh_topo = match self
                    .topo
                    .host_topo(&neigh_entity.machine_id, self.topo_ts)
                    .await
                {
                    Ok(topo) => topo,
                    Err(err) => {
                        tracing::warn!("{err}");
                        continue;
                    }
                };

                let cross_graph = match self
                    .construct_cross_host_causal_graph(&affected_topo, &neigh_topo, &cross_edge)
                    .await
                {
                    Ok(graph) => graph,
                    Err(err) => {
                        tracing::warn!("{err}");
                        continue;
                    }
                };

                let mut neigh_causes = Vec::new();
                for start in frontier_node_ids(&frontier, &cross_graph) {
                    let causes = self.policy.infer(&cross_graph.metric_graph, &start, 0)?;
                    for cause in causes {
                        let on_neighbour = cause
                            .path
                            .first()
                            .map(|n| n.attrs.machine_id == neigh_topo.machine_id)
                            .unwrap_or(false);
                        if on_neighbour {
                            neigh_causes.push(cause);
                        } else {
                            tracing::debug!(
                                "cause (metric_id={}, entity_id={}) not in machine {}",
                                cause.metric_id,
                                cause.entity_id,
                                neigh_topo.machine_id
                            );
                        }
                    }
                }

                let newly_added = cause_tree.append_all_causes(&neigh_causes);
                if !newly_added.is_empty() {
                    worklist.push((neigh_entity.machine_id.clone(), newly_added));
                }
            }
        }
        Ok(())
    }

    async fn construct_host_causal_graph(&mut self, host_topo: &HostTopo) -> Result<CausalGraph> {
        let relations = self.engine.parse_host_relations(host_topo);
        self.construct_causal_graph(&relations, &host_topo.nodes).await
    }

    /// Combined two-host graph: the cross-host pairs whose effect lies on
    /// the affected host, plus the neighbour's own host rules.
    async fn construct_cross_host_causal_graph(
        &mut self,
        affected_topo: &HostTopo,
        neigh_topo: &HostTopo,
        cross_edge: &TopoEdge,
    ) -> Result<CausalGraph> {
        let mut combined_nodes: HashMap<String, TopoNode> = HashMap::new();
        combined_nodes.extend(affected_topo.nodes.clone());
        combined_nodes.extend(neigh_topo.nodes.clone());

        let cross_edges: HashMap<String, TopoEdge> =
            [(cross_edge.id.clone(), cross_edge.clone())].into();
        let mut relations: Vec<CausalRelation> = self
            .engine
            .parse_cross_relations(&combined_nodes, &cross_edges)
            .into_iter()
            .filter(|(_, effect)| affected_topo.nodes.contains_key(effect))
            .collect();
        relations.extend(self.engine.parse_host_relations(neigh_topo));

        self.construct_causal_graph(&relations, &combined_nodes).await
    }

    async fn construct_causal_graph(
        &mut self,
        relations: &[CausalRelation],
        topo_nodes: &HashMap<String, TopoNode>,
    ) -> Result<CausalGraph> {
        let mut graph = CausalGraph::new();
        graph.init_entity_graph(relations, topo_nodes);
        graph.add_abnormal_metrics(&self.abn_metrics);

        self.calc_corr_scores(&mut graph).await;
        graph.filter_abnormal_metrics_by_corr_score();

        graph.attach_rule_metas(self.engine);
        graph.build_metric_graph();
        Ok(graph)
    }

    /// Scores every attached metric against the KPI series: absolute Pearson
    /// correlation plus the observed trend. The KPI series is fetched once
    /// per cycle.
    async fn calc_corr_scores(&mut self, graph: &mut CausalGraph) {
        if self.kpi_hist.is_none() {
            let hist = self
                .metrics
                .hist_data(&self.kpi.metric_id, &self.kpi.labels, self.topo_ts)
                .await;
            self.kpi_hist = Some(hist);
        }
        let kpi_hist = self.kpi_hist.clone().unwrap_or_default();

        for node_id in graph.entity_node_ids() {
            let Some(node) = graph.entity_node(&node_id) else {
                continue;
            };
            if node.raw_data.is_empty() {
                tracing::debug!("entity {node_id} has no labels found");
                continue;
            }
            let labels = node.label_map();
            let metric_ids = node.abnormal_metric_ids();

            for metric_id in metric_ids {
                let hist = self
                    .metrics
                    .hist_data(&metric_id, &labels, self.topo_ts)
                    .await;
                let data_trend = series_trend(&hist);
                let corr = pearson(&kpi_hist, &hist);

                if let Some(node) = graph.entity_node_mut(&node_id) {
                    if let Some(snapshot) = node.abnormal_metrics.get_mut(&metric_id) {
                        snapshot.real_trend.get_or_insert(data_trend);
                        if let Some(corr) = corr {
                            snapshot.corr_score.get_or_insert(corr.abs());
                        }
                    }
                }
            }
        }
    }
}

/// The cross-host edge endpoint sitting on the other machine.
fn neighbour_entity(machine_id: &str, edge: &TopoEdge) -> Option<TopoNode> {
    let from = edge.from_node.as_ref()?;
    let to = edge.to_node.as_ref()?;
    let neighbour = if from.machine_id != machine_id { from } else { to };
    if neighbour.machine_id == machine_id {
        return None;
    }
    Some(neighbour.clone())
}

/// Frontier nodes that actually appear in the combined metric graph, deduped.
fn frontier_node_ids(frontier: &[MetricNode], graph: &CausalGraph) -> Vec<MetricNodeId> {
    let mut ids = Vec::new();
    for node in frontier {
        if graph.metric_graph.contains(&node.id) && !ids.contains(&node.id) {
            ids.push(node.id.clone());
        }
    }
    ids
}

/// Strips virtual-metric prefix nodes from a cause path; a cause reduced to
/// nothing is dropped.
fn clear_virtual_cause(cause: &Cause) -> Option<Cause> {
    let first_real = cause.path.iter().position(|node| !node.id.is_virtual())?;
    let path: Vec<MetricNode> = cause.path[first_real..].to_vec();
    Some(Cause {
        metric_id: path[0].id.metric_id.clone(),
        entity_id: path[0].attrs.entity_id.clone(),
        cause_score: cause.cause_score,
        path,
    })
}

/// Post-filters the final causes per the virtual-prefix rule.
pub fn filter_causes(causes: Vec<Cause>) -> Vec<Cause> {
    causes.iter().filter_map(clear_virtual_cause).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::graph::MetricNodeAttrs;
    use std::collections::HashMap;

    fn metric_node(entity: &str, metric: &str) -> MetricNode {
        MetricNode {
            id: MetricNodeId::new(entity, metric),
            attrs: MetricNodeAttrs {
                entity_id: format!("key-{entity}"),
                entity_type: "proc".to_string(),
                machine_id: "m1".to_string(),
                snapshot: None,
                trend: None,
            },
        }
    }

    #[test]
    fn test_clear_virtual_cause_strips_prefix() {
        let cause = Cause {
            metric_id: "virtual_metric".to_string(),
            entity_id: "key-cpu".to_string(),
            cause_score: 0.5,
            path: vec![
                metric_node("cpu1", "virtual_metric"),
                metric_node("proc1", "m_cpu"),
                metric_node("sli1", "m_latency"),
            ],
        };
        let filtered = clear_virtual_cause(&cause).unwrap();
        assert_eq!(filtered.metric_id, "m_cpu");
        assert_eq!(filtered.entity_id, "key-proc1");
        assert_eq!(filtered.path.len(), 2);
    }

    #[test]
    fn test_all_virtual_cause_dropped() {
        let cause = Cause {
            metric_id: "virtual_metric".to_string(),
            entity_id: "key-cpu".to_string(),
            cause_score: 0.5,
            path: vec![metric_node("cpu1", "virtual_metric")],
        };
        assert!(clear_virtual_cause(&cause).is_none());
        assert!(filter_causes(vec![cause]).is_empty());
    }

    #[test]
    fn test_neighbour_entity_selection() {
        let from = TopoNode {
            id: "host1".to_string(),
            entity_id: "key-host1".to_string(),
            entity_type: "host".to_string(),
            machine_id: "m1".to_string(),
            timestamp: 0,
            raw_data: HashMap::new(),
        };
        let mut to = from.clone();
        to.id = "proc2".to_string();
        to.machine_id = "m2".to_string();
        let edge = TopoEdge {
            id: "e".to_string(),
            edge_type: "runs_on".to_string(),
            from_id: from.id.clone(),
            to_id: to.id.clone(),
            from_node: Some(from),
            to_node: Some(to),
        };

        let neigh = neighbour_entity("m1", &edge).unwrap();
        assert_eq!(neigh.machine_id, "m2");
        let neigh = neighbour_entity("m2", &edge).unwrap();
        assert_eq!(neigh.machine_id, "m1");
    }
}
