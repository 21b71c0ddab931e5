//! Inference policies ranking root-cause candidates on the metric cause
//! graph.
//!
//! Both policies receive the graph and the target KPI metric node. Cause
//! paths are directed from the candidate root toward the target.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{InferError, Result};
use crate::models::graph::{Cause, MetricCauseGraph, MetricNode, MetricNodeId};

/// A ranking policy over the metric cause graph. `top_k == 0` keeps every
/// scored path (used by cross-host expansion).
pub trait InferPolicy: Send {
    fn infer(
        &mut self,
        graph: &MetricCauseGraph,
        target: &MetricNodeId,
        top_k: usize,
    ) -> Result<Vec<Cause>>;
}

/// Tunables for policy construction, taken from the inference config.
#[derive(Debug, Clone)]
pub struct PolicyOptions {
    /// Backward-transition damping factor of the random walk.
    pub rho: f64,
    /// Number of random-walk rounds; a hard upper bound on walk work.
    pub random_walk_round: u64,
    /// Fixed seed for reproducible walks; `None` seeds from entropy.
    pub seed: Option<u64>,
}

impl Default for PolicyOptions {
    fn default() -> Self {
        Self {
            rho: 0.05,
            random_walk_round: 10_000,
            seed: None,
        }
    }
}

/// Builds the policy selected by name (`dfs` | `rw`).
pub fn build_policy(name: &str, options: &PolicyOptions) -> Result<Box<dyn InferPolicy>> {
    match name {
        "dfs" => Ok(Box::new(DfsPolicy)),
        "rw" => Ok(Box::new(RandomWalkPolicy::new(options)?)),
        other => Err(InferError::Inference(format!(
            "unsupported infer policy {other}"
        ))),
    }
}

/// Depth-first path enumeration scored by mean correlation.
pub struct DfsPolicy;

impl DfsPolicy {
    /// All simple paths ending at the target, found by recursing on
    /// predecessors. A back-edge is a data bug: it is logged and skipped.
    fn all_paths_to(graph: &MetricCauseGraph, target: &MetricNodeId) -> Vec<Vec<MetricNode>> {
        let mut paths = Vec::new();
        let Some(target_node) = graph.node(target) else {
            return paths;
        };
        let mut path = vec![target_node.clone()];
        let mut selected: HashSet<MetricNodeId> = HashSet::from([target.clone()]);
        Self::dfs(graph, target, &mut path, &mut selected, &mut paths);
        paths
    }

    fn dfs(
        graph: &MetricCauseGraph,
        node_id: &MetricNodeId,
        path: &mut Vec<MetricNode>,
        selected: &mut HashSet<MetricNodeId>,
        paths: &mut Vec<Vec<MetricNode>>,
    ) {
        let mut has_pred = false;
        for pred in graph.predecessors(node_id) {
            has_pred = true;
            if selected.contains(&pred.id) {
                tracing::warn!("circle exists in cause graph, please check");
                continue;
            }
            selected.insert(pred.id.clone());
            path.push(pred.clone());
            Self::dfs(graph, &pred.id, path, selected, paths);
            path.pop();
            selected.remove(&pred.id);
        }
        if !has_pred {
            paths.push(path.iter().rev().cloned().collect());
        }
    }

    /// Mean `corr_score` over non-virtual nodes excluding the target; an
    /// empty or singleton path scores 0.0.
    fn path_score(path: &[MetricNode]) -> f64 {
        if path.len() < 2 {
            return 0.0;
        }
        let mut total = 0.0;
        let mut count = 0usize;
        for node in &path[..path.len() - 1] {
            if node.id.is_virtual() {
                continue;
            }
            total += node.attrs.corr_score();
            count += 1;
        }
        if count == 0 {
            0.0
        } else {
            total / count as f64
        }
    }

    /// Greedy top-k selection: the root must be non-virtual, its node id
    /// unseen, and its `(machine_id, metric_id)` unseen.
    fn top_paths(scored: Vec<(f64, Vec<MetricNode>)>, top_k: usize) -> Vec<(f64, Vec<MetricNode>)> {
        let mut top = Vec::new();
        let mut node_selected: HashSet<MetricNodeId> = HashSet::new();
        let mut metric_selected: HashSet<(String, String)> = HashSet::new();
        for (score, path) in scored {
            if top.len() == top_k {
                break;
            }
            let root = &path[0];
            if root.id.is_virtual() {
                continue;
            }
            let metric_key = (root.attrs.machine_id.clone(), root.id.metric_id.clone());
            if node_selected.contains(&root.id) || metric_selected.contains(&metric_key) {
                continue;
            }
            node_selected.insert(root.id.clone());
            metric_selected.insert(metric_key);
            top.push((score, path));
        }
        top
    }
}

impl InferPolicy for DfsPolicy {
    fn infer(
        &mut self,
        graph: &MetricCauseGraph,
        target: &MetricNodeId,
        top_k: usize,
    ) -> Result<Vec<Cause>> {
        if !graph.contains(target) {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f64, Vec<MetricNode>)> = Self::all_paths_to(graph, target)
            .into_iter()
            .map(|path| (Self::path_score(&path), path))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let top = if top_k > 0 {
            Self::top_paths(scored, top_k)
        } else {
            scored
        };

        Ok(top
            .into_iter()
            .map(|(score, path)| Cause {
                metric_id: path[0].id.metric_id.clone(),
                entity_id: path[0].attrs.entity_id.clone(),
                cause_score: score,
                path,
            })
            .collect())
    }
}

/// First-order random walk counting node visits.
pub struct RandomWalkPolicy {
    rho: f64,
    rounds: u64,
    rng: StdRng,
}

impl RandomWalkPolicy {
    pub fn new(options: &PolicyOptions) -> Result<Self> {
        if options.random_walk_round == 0 {
            return Err(InferError::Inference(
                "the walk round of the random walk algorithm must be positive".into(),
            ));
        }
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            rho: options.rho,
            rounds: options.random_walk_round,
            rng,
        })
    }

    /// One row of the transition matrix: forward probability to each of the
    /// node's own predecessors, damped backward probability to each of its
    /// own successors, and a self-loop; the row is normalized to sum to 1.
    fn transition_row(
        &self,
        graph: &MetricCauseGraph,
        node_id: &MetricNodeId,
    ) -> Result<Vec<(MetricNodeId, f64)>> {
        let mut row: Vec<(MetricNodeId, f64)> = Vec::new();
        let mut seen: HashSet<MetricNodeId> = HashSet::new();

        let mut max_forward = 0.0f64;
        for pred in graph.predecessors(node_id) {
            let weight = pred.attrs.abnormal_score().abs();
            max_forward = max_forward.max(weight);
            if seen.insert(pred.id.clone()) {
                row.push((pred.id.clone(), weight));
            }
        }
        for succ in graph.successors(node_id) {
            if seen.insert(succ.id.clone()) {
                row.push((succ.id.clone(), succ.attrs.abnormal_score().abs() * self.rho));
            }
        }
        if seen.insert(node_id.clone()) {
            let own = graph
                .node(node_id)
                .map(|n| n.attrs.abnormal_score().abs())
                .unwrap_or(0.0);
            row.push((node_id.clone(), (own - max_forward).max(0.0)));
        }

        let total: f64 = row.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return Err(InferError::Inference(
                "sum of transition probability can not be zero".into(),
            ));
        }
        for entry in &mut row {
            entry.1 /= total;
        }
        Ok(row)
    }
}

impl InferPolicy for RandomWalkPolicy {
    fn infer(
        &mut self,
        graph: &MetricCauseGraph,
        target: &MetricNodeId,
        top_k: usize,
    ) -> Result<Vec<Cause>> {
        if !graph.contains(target) {
            return Ok(Vec::new());
        }

        let mut matrix: HashMap<MetricNodeId, Vec<(MetricNodeId, f64)>> = HashMap::new();
        for node in graph.nodes() {
            matrix.insert(node.id.clone(), self.transition_row(graph, &node.id)?);
        }

        let mut visits: HashMap<MetricNodeId, u64> = HashMap::new();
        let mut current = target.clone();
        for _ in 0..self.rounds {
            let row = &matrix[&current];
            let mut draw: f64 = self.rng.gen();
            let mut next = current.clone();
            for (node_id, prob) in row {
                if draw < *prob {
                    next = node_id.clone();
                    break;
                }
                draw -= prob;
            }
            *visits.entry(next.clone()).or_insert(0) += 1;
            current = next;
        }

        let mut ranked: Vec<(MetricNodeId, u64)> = visits.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.entity_node_id.cmp(&b.0.entity_node_id))
                .then_with(|| a.0.metric_id.cmp(&b.0.metric_id))
        });

        let mut causes = Vec::new();
        for (node_id, count) in ranked.into_iter().take(top_k) {
            let Some(node) = graph.node(&node_id) else {
                continue;
            };
            causes.push(Cause {
                metric_id: node_id.metric_id.clone(),
                entity_id: node.attrs.entity_id.clone(),
                cause_score: count as f64 / self.rounds as f64,
                path: vec![node.clone()],
            });
        }
        Ok(causes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::MetricSnapshot;
    use crate::models::graph::MetricNodeAttrs;
    use std::collections::HashMap as StdHashMap;

    fn node(entity: &str, metric: &str, corr: f64, machine: &str) -> MetricNode {
        MetricNode {
            id: MetricNodeId::new(entity, metric),
            attrs: MetricNodeAttrs {
                entity_id: format!("key-{entity}"),
                entity_type: "proc".to_string(),
                machine_id: machine.to_string(),
                snapshot: Some(MetricSnapshot {
                    metric_id: metric.to_string(),
                    timestamp: 0,
                    abnormal_score: corr,
                    metric_labels: StdHashMap::new(),
                    entity_id: format!("key-{entity}"),
                    desc: String::new(),
                    corr_score: Some(corr),
                    real_trend: None,
                }),
                trend: None,
            },
        }
    }

    fn chain_graph() -> (MetricCauseGraph, MetricNodeId) {
        // disk -> proc -> sli
        let mut graph = MetricCauseGraph::new();
        let disk = node("disk1", "m_disk", 0.9, "m1");
        let proc_ = node("proc1", "m_cpu", 0.6, "m1");
        let sli = node("sli1", "m_latency", 1.0, "m1");
        let target = sli.id.clone();
        graph.add_node(disk.clone());
        graph.add_node(proc_.clone());
        graph.add_node(sli);
        graph.add_edge(&disk.id, &proc_.id);
        graph.add_edge(&proc_.id, &target);
        (graph, target)
    }

    #[test]
    fn test_dfs_enumerates_longest_path() {
        let (graph, target) = chain_graph();
        let causes = DfsPolicy.infer(&graph, &target, 3).unwrap();
        assert_eq!(causes.len(), 1);
        let cause = &causes[0];
        assert_eq!(cause.metric_id, "m_disk");
        assert_eq!(cause.path.len(), 3);
        assert_eq!(cause.path.last().unwrap().id, target);
        // mean of 0.9 and 0.6 over the non-target nodes
        assert!((cause.cause_score - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_dfs_missing_target_is_empty() {
        let (graph, _) = chain_graph();
        let causes = DfsPolicy
            .infer(&graph, &MetricNodeId::new("ghost", "m"), 3)
            .unwrap();
        assert!(causes.is_empty());
    }

    #[test]
    fn test_dfs_top_k_zero_keeps_all_paths() {
        let (graph, target) = chain_graph();
        let causes = DfsPolicy.infer(&graph, &target, 0).unwrap();
        // the only maximal path survives; top_k = 0 performs no dedup
        assert_eq!(causes.len(), 1);
    }

    #[test]
    fn test_dfs_dedups_machine_metric_pairs() {
        // two proc entities on the same machine with the same metric id
        let mut graph = MetricCauseGraph::new();
        let a = node("proc1", "m_cpu", 0.9, "m1");
        let b = node("proc2", "m_cpu", 0.8, "m1");
        let sli = node("sli1", "m_latency", 1.0, "m1");
        let target = sli.id.clone();
        graph.add_node(a.clone());
        graph.add_node(b.clone());
        graph.add_node(sli);
        graph.add_edge(&a.id, &target);
        graph.add_edge(&b.id, &target);

        let causes = DfsPolicy.infer(&graph, &target, 5).unwrap();
        assert_eq!(causes.len(), 1);
        assert_eq!(causes[0].path[0].id, a.id);
    }

    #[test]
    fn test_dfs_skips_virtual_roots() {
        let mut graph = MetricCauseGraph::new();
        let virt = MetricNode {
            id: MetricNodeId::new("cpu1", "virtual_metric"),
            attrs: MetricNodeAttrs {
                entity_id: "key-cpu1".to_string(),
                entity_type: "cpu".to_string(),
                machine_id: "m1".to_string(),
                snapshot: None,
                trend: None,
            },
        };
        let sli = node("sli1", "m_latency", 1.0, "m1");
        let target = sli.id.clone();
        graph.add_node(virt.clone());
        graph.add_node(sli);
        graph.add_edge(&virt.id, &target);

        let causes = DfsPolicy.infer(&graph, &target, 3).unwrap();
        assert!(causes.is_empty());
    }

    #[test]
    fn test_random_walk_zero_rounds_rejected_at_construction() {
        let options = PolicyOptions {
            random_walk_round: 0,
            ..Default::default()
        };
        assert!(matches!(
            RandomWalkPolicy::new(&options),
            Err(InferError::Inference(_))
        ));
    }

    #[test]
    fn test_random_walk_scores_bounded_and_sum_le_one() {
        let (graph, target) = chain_graph();
        let options = PolicyOptions {
            rho: 0.05,
            random_walk_round: 2000,
            seed: Some(7),
        };
        let mut policy = RandomWalkPolicy::new(&options).unwrap();
        let causes = policy.infer(&graph, &target, 2).unwrap();
        assert!(!causes.is_empty());
        let sum: f64 = causes.iter().map(|c| c.cause_score).sum();
        assert!(sum <= 1.0 + 1e-9);
        assert!(causes.iter().all(|c| (0.0..=1.0).contains(&c.cause_score)));
    }

    #[test]
    fn test_random_walk_deterministic_with_seed() {
        let (graph, target) = chain_graph();
        let run = |seed| {
            let options = PolicyOptions {
                rho: 0.05,
                random_walk_round: 500,
                seed: Some(seed),
            };
            let mut policy = RandomWalkPolicy::new(&options).unwrap();
            policy
                .infer(&graph, &target, 3)
                .unwrap()
                .into_iter()
                .map(|c| (c.metric_id, c.cause_score))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(42), run(42));
    }

    #[test]
    fn test_random_walk_zero_sum_row_is_error() {
        // an isolated node with zero score has a zero-sum transition row
        let mut graph = MetricCauseGraph::new();
        let lonely = node("proc1", "m_cpu", 0.0, "m1");
        let target = lonely.id.clone();
        graph.add_node(lonely);
        let options = PolicyOptions {
            random_walk_round: 10,
            seed: Some(1),
            ..Default::default()
        };
        let mut policy = RandomWalkPolicy::new(&options).unwrap();
        assert!(matches!(
            policy.infer(&graph, &target, 1),
            Err(InferError::Inference(_))
        ));
    }

    #[test]
    fn test_unsupported_policy_rejected() {
        assert!(matches!(
            build_policy("bayes", &PolicyOptions::default()),
            Err(InferError::Inference(_))
        ));
    }
}
