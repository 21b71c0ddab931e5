//! End-to-end inference scenarios over in-memory topology and time-series
//! stores.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use rca_hub::analytics::locator::CauseLocator;
use rca_hub::analytics::policy::{build_policy, PolicyOptions};
use rca_hub::clients::{MetricStore, TopologyStore};
use rca_hub::error::{InferError, Result};
use rca_hub::models::event::AbnormalEvent;
use rca_hub::models::topology::{HostTopo, RelationType, TopoEdge, TopoNode};
use rca_hub::pipeline::aggregator::{AggregatorConfig, EventAggregator};
use rca_hub::pipeline::consumer::VecEventSource;
use rca_hub::rules::engine::RuleEngine;
use rca_hub::schemas::metadata::ObserveMetaRegistry;

const SAMPLE_LEN: usize = 4;

// ---------------------------------------------------------------------------
// In-memory collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockTopology {
    snapshot_ts: Vec<i64>,
    tolerated_bias: i64,
    entities: HashMap<String, TopoNode>,
    host_topos: HashMap<String, HostTopo>,
    cross_edges: Vec<TopoEdge>,
}

#[async_trait]
impl TopologyStore for MockTopology {
    async fn recent_ts(&self, ts_sec: i64) -> Result<i64> {
        let recent = self
            .snapshot_ts
            .iter()
            .filter(|&&ts| ts <= ts_sec)
            .max()
            .copied()
            .ok_or_else(|| {
                InferError::Db(format!(
                    "can not find topological graph at the abnormal timestamp {ts_sec}"
                ))
            })?;
        if ts_sec - recent > self.tolerated_bias {
            return Err(InferError::Db(format!(
                "the queried topological graph is too old, topo timestamp={recent}"
            )));
        }
        Ok(recent)
    }

    async fn entity_by_id(&self, entity_id: &str, _ts_sec: i64) -> Result<TopoNode> {
        self.entities
            .get(entity_id)
            .cloned()
            .ok_or_else(|| InferError::Db(format!("can not find entity {entity_id} satisfied")))
    }

    async fn host_topo(&self, machine_id: &str, _ts_sec: i64) -> Result<HostTopo> {
        self.host_topos
            .get(machine_id)
            .cloned()
            .ok_or_else(|| InferError::Db(format!("can not find machine {machine_id} satisfied")))
    }

    async fn cross_host_edges(&self, edge_type: &str, _ts_sec: i64) -> Result<Vec<TopoEdge>> {
        Ok(self
            .cross_edges
            .iter()
            .filter(|e| e.edge_type == edge_type)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct MockMetrics {
    series: HashMap<String, Vec<f64>>,
}

#[async_trait]
impl MetricStore for MockMetrics {
    async fn hist_data(
        &self,
        metric_id: &str,
        _labels: &HashMap<String, String>,
        _end_ts: i64,
    ) -> Vec<f64> {
        self.series
            .get(metric_id)
            .cloned()
            .unwrap_or_else(|| vec![0.0; SAMPLE_LEN])
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn node(id: &str, key: &str, entity_type: &str, machine_id: &str) -> TopoNode {
    let mut raw_data = HashMap::new();
    raw_data.insert("machine_id".to_string(), Value::String(machine_id.to_string()));
    raw_data.insert("type".to_string(), Value::String(entity_type.to_string()));
    TopoNode {
        id: id.to_string(),
        entity_id: key.to_string(),
        entity_type: entity_type.to_string(),
        machine_id: machine_id.to_string(),
        timestamp: 999,
        raw_data,
    }
}

fn edge(id: &str, relation: RelationType, from: &TopoNode, to: &TopoNode) -> TopoEdge {
    TopoEdge {
        id: id.to_string(),
        edge_type: relation.as_str().to_string(),
        from_id: from.id.clone(),
        to_id: to.id.clone(),
        from_node: Some(from.clone()),
        to_node: Some(to.clone()),
    }
}

fn abn_event(entity_id: &str, metric_id: &str, ts: i64, score: f64) -> AbnormalEvent {
    AbnormalEvent {
        timestamp: ts,
        metric_id: metric_id.to_string(),
        score,
        labels: HashMap::from([("machine_id".to_string(), "H1".to_string())]),
        entity_id: entity_id.to_string(),
        event_id: format!("{ts}_evt"),
        desc: format!("{metric_id} anomaly"),
        hist_data: Vec::new(),
    }
}

/// Single-host fixture: sli1 belongs to proc1, cpu1 beside them on H1.
fn single_host_topology() -> MockTopology {
    let sli = node("E/sli1", "sli_h1_1", "sli", "H1");
    let proc_ = node("E/proc1", "proc_h1_1", "proc", "H1");
    let cpu = node("E/cpu1", "cpu_h1_0", "cpu", "H1");

    let mut topo = HostTopo::new("H1");
    for n in [&sli, &proc_, &cpu] {
        topo.nodes.insert(n.id.clone(), n.clone());
    }
    let belongs = edge("belongs_to/1", RelationType::BelongsTo, &sli, &proc_);
    topo.edges.insert(belongs.id.clone(), belongs);

    MockTopology {
        snapshot_ts: vec![999],
        tolerated_bias: 120,
        entities: HashMap::from([
            (sli.entity_id.clone(), sli),
            (proc_.entity_id.clone(), proc_),
            (cpu.entity_id.clone(), cpu),
        ]),
        host_topos: HashMap::from([("H1".to_string(), topo)]),
        cross_edges: Vec::new(),
    }
}

fn correlated_metrics() -> MockMetrics {
    MockMetrics {
        series: HashMap::from([
            ("sli_latency".to_string(), vec![1.0, 2.0, 3.0, 4.0]),
            ("proc_cpu_util".to_string(), vec![2.0, 4.0, 6.0, 8.0]),
            ("disk_util".to_string(), vec![1.5, 2.5, 3.5, 4.5]),
        ]),
    }
}

fn dfs_locator<'a>(
    kpi: AbnormalEvent,
    metrics: Vec<AbnormalEvent>,
    topo: &'a MockTopology,
    store: &'a MockMetrics,
    engine: &'a RuleEngine,
    top_k: usize,
) -> CauseLocator<'a> {
    let policy = build_policy("dfs", &PolicyOptions::default()).unwrap();
    CauseLocator::new(kpi, metrics, topo, store, engine, policy, top_k)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// S1: one CPU anomaly on the KPI's process; the cause is the process metric
/// reached through the belongs-to chain.
#[tokio::test]
async fn test_s1_single_host_cause() {
    let topo = single_host_topology();
    let store = correlated_metrics();
    let engine = RuleEngine::new();

    let kpi = abn_event("sli_h1_1", "sli_latency", 1_000_000, 0.9);
    let cpu_anomaly = abn_event("proc_h1_1", "proc_cpu_util", 999_500, 0.8);
    let all_metrics = vec![kpi.clone(), cpu_anomaly];

    let mut locator = dfs_locator(kpi, all_metrics, &topo, &store, &engine, 3);
    let causes = locator.locate().await.unwrap();

    assert_eq!(causes.len(), 1);
    let cause = &causes[0];
    assert_eq!(cause.metric_id, "proc_cpu_util");
    assert_eq!(cause.entity_id, "proc_h1_1");
    // path runs from the process metric to the KPI metric
    let path_metrics: Vec<&str> = cause.path.iter().map(|n| n.id.metric_id.as_str()).collect();
    assert_eq!(path_metrics, vec!["proc_cpu_util", "sli_latency"]);
    // no cause starts with a virtual node, and scores are positive
    assert!(!cause.path[0].id.is_virtual());
    assert!(cause.cause_score > 0.0);
}

/// S2: a duplicate anomaly at a later timestamp replaces the earlier one;
/// still exactly one cause.
#[tokio::test]
async fn test_s2_duplicate_metric_keeps_later_event() {
    let topo = single_host_topology();
    let store = correlated_metrics();
    let engine = RuleEngine::new();

    let kpi = abn_event("sli_h1_1", "sli_latency", 1_000_000, 0.9);
    let early = abn_event("proc_h1_1", "proc_cpu_util", 999_500, 0.8);
    let late = abn_event("proc_h1_1", "proc_cpu_util", 999_800, 0.7);
    let all_metrics = vec![kpi.clone(), early, late];

    let mut locator = dfs_locator(kpi, all_metrics, &topo, &store, &engine, 3);
    let causes = locator.locate().await.unwrap();

    assert_eq!(causes.len(), 1);
    let root = &causes[0].path[0];
    let snapshot = root.attrs.snapshot.as_ref().unwrap();
    assert_eq!(snapshot.timestamp, 999_800);
}

/// S3: a `sys` KPI event never triggers inference; the aggregator raises
/// `NoKpi`.
#[tokio::test]
async fn test_s3_sys_event_does_not_trigger() {
    let payload = json!({
        "Timestamp": 1_000_000,
        "Attributes": {
            "event_id": "e1",
            "event_type": "sys",
            "entity_id": "sli_h1_1",
        },
        "Resource": {
            "metric": "sli_latency",
            "labels": {"machine_id": "H1"},
            "score": 0.9,
        },
    })
    .to_string()
    .into_bytes();

    let registry = Arc::new(ObserveMetaRegistry::new("gala_gopher"));
    let mut aggregator = EventAggregator::new(
        VecEventSource::new([payload]),
        VecEventSource::new([]),
        registry,
        AggregatorConfig {
            valid_duration: 60,
            future_duration: 10,
            aging_duration: 120,
        },
    );
    aggregator.consume_kpi_events().await;
    assert!(matches!(
        aggregator.get_abnormal_info().await,
        Err(InferError::NoKpi)
    ));
}

/// S4: the cluster cause graph grows across a `runs_on` edge to the
/// neighbouring host; the returned cause lives on the neighbour.
#[tokio::test]
async fn test_s4_cross_host_expansion() {
    let mut topo = single_host_topology();

    // second host with a disk behind the cross edge
    let host2 = node("E/host2", "host_h2", "host", "H2");
    let disk2 = node("E/disk2", "disk_h2_sda", "disk", "H2");
    let mut h2 = HostTopo::new("H2");
    h2.nodes.insert(host2.id.clone(), host2.clone());
    h2.nodes.insert(disk2.id.clone(), disk2.clone());
    topo.host_topos.insert("H2".to_string(), h2);
    topo.entities.insert(host2.entity_id.clone(), host2.clone());
    topo.entities.insert(disk2.entity_id.clone(), disk2.clone());

    let proc1 = topo.host_topos["H1"].nodes["E/proc1"].clone();
    topo.cross_edges.push(edge(
        "runs_on/x",
        RelationType::RunsOn,
        &host2,
        &proc1,
    ));

    let store = correlated_metrics();
    let engine = RuleEngine::new();

    let kpi = abn_event("sli_h1_1", "sli_latency", 1_000_000, 0.9);
    let cpu_anomaly = abn_event("proc_h1_1", "proc_cpu_util", 999_500, 0.8);
    let disk_anomaly = abn_event("disk_h2_sda", "disk_util", 999_600, 0.9);
    let all_metrics = vec![kpi.clone(), cpu_anomaly, disk_anomaly];

    let mut locator = dfs_locator(kpi, all_metrics, &topo, &store, &engine, 1);
    let causes = locator.locate().await.unwrap();

    assert_eq!(causes.len(), 1);
    let cause = &causes[0];
    assert_eq!(cause.metric_id, "disk_util");
    assert_eq!(cause.path[0].attrs.machine_id, "H2");
    assert!(cause.path.len() >= 2);
    assert_eq!(cause.path.last().unwrap().id.metric_id, "sli_latency");
}

/// S5: a zero-round random walk is rejected at construction.
#[test]
fn test_s5_zero_round_random_walk_rejected() {
    let options = PolicyOptions {
        random_walk_round: 0,
        ..Default::default()
    };
    assert!(matches!(
        build_policy("rw", &options),
        Err(InferError::Inference(_))
    ));
}

/// S6: a candidate whose correlation falls below the threshold is pruned;
/// the result is empty.
#[tokio::test]
async fn test_s6_low_correlation_pruned() {
    let topo = single_host_topology();
    // orthogonal series: Pearson correlation is exactly zero
    let store = MockMetrics {
        series: HashMap::from([
            ("sli_latency".to_string(), vec![1.0, 2.0, 3.0, 4.0]),
            ("proc_cpu_util".to_string(), vec![3.0, 1.0, 4.0, 2.0]),
        ]),
    };
    let engine = RuleEngine::new();

    let kpi = abn_event("sli_h1_1", "sli_latency", 1_000_000, 0.9);
    let cpu_anomaly = abn_event("proc_h1_1", "proc_cpu_util", 999_500, 0.8);
    let all_metrics = vec![kpi.clone(), cpu_anomaly];

    let mut locator = dfs_locator(kpi, all_metrics, &topo, &store, &engine, 3);
    let causes = locator.locate().await.unwrap();
    assert!(causes.is_empty());
}

/// Boundary: no snapshot within the tolerated bias aborts the cycle.
#[tokio::test]
async fn test_snapshot_out_of_bias_aborts() {
    let mut topo = single_host_topology();
    topo.snapshot_ts = vec![500];

    let store = correlated_metrics();
    let engine = RuleEngine::new();
    let kpi = abn_event("sli_h1_1", "sli_latency", 1_000_000, 0.9);

    let mut locator = dfs_locator(kpi.clone(), vec![kpi], &topo, &store, &engine, 3);
    assert!(matches!(locator.locate().await, Err(InferError::Db(_))));
}

/// Boundary: a zero-variance candidate series yields a NaN correlation and
/// is dropped rather than ranked.
#[tokio::test]
async fn test_zero_variance_series_dropped() {
    let topo = single_host_topology();
    let store = MockMetrics {
        series: HashMap::from([
            ("sli_latency".to_string(), vec![1.0, 2.0, 3.0, 4.0]),
            ("proc_cpu_util".to_string(), vec![5.0, 5.0, 5.0, 5.0]),
        ]),
    };
    let engine = RuleEngine::new();

    let kpi = abn_event("sli_h1_1", "sli_latency", 1_000_000, 0.9);
    let cpu_anomaly = abn_event("proc_h1_1", "proc_cpu_util", 999_500, 0.8);

    let mut locator = dfs_locator(kpi.clone(), vec![kpi, cpu_anomaly], &topo, &store, &engine, 3);
    let causes = locator.locate().await.unwrap();
    assert!(causes.is_empty());
}

/// Idempotence: identical inputs give identical DFS output.
#[tokio::test]
async fn test_dfs_inference_is_idempotent() {
    let topo = single_host_topology();
    let store = correlated_metrics();
    let engine = RuleEngine::new();

    let run = || async {
        let kpi = abn_event("sli_h1_1", "sli_latency", 1_000_000, 0.9);
        let cpu_anomaly = abn_event("proc_h1_1", "proc_cpu_util", 999_500, 0.8);
        let mut locator = dfs_locator(
            kpi.clone(),
            vec![kpi, cpu_anomaly],
            &topo,
            &store,
            &engine,
            3,
        );
        locator
            .locate()
            .await
            .unwrap()
            .into_iter()
            .map(|c| {
                (
                    c.metric_id,
                    c.entity_id,
                    (c.cause_score * 1e9).round() as i64,
                    c.path.len(),
                )
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(run().await, run().await);
}
