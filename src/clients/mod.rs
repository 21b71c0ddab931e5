//! External collaborators behind narrow interfaces: the graph database
//! holding topology snapshots and the time-series store holding metric
//! history. The inference core only ever talks to the traits; the concrete
//! clients live beside them.

pub mod arango;
pub mod timeseries;
pub mod topology;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::topology::{HostTopo, TopoEdge, TopoNode};

/// Topology snapshot queries.
#[async_trait]
pub trait TopologyStore: Send + Sync {
    /// Largest snapshot timestamp at or before `ts_sec`, within the
    /// tolerated bias.
    async fn recent_ts(&self, ts_sec: i64) -> Result<i64>;

    /// The unique entity with the given snapshot-scoped key.
    async fn entity_by_id(&self, entity_id: &str, ts_sec: i64) -> Result<TopoNode>;

    /// The host entity for `machine_id` plus its same-machine subgraph.
    async fn host_topo(&self, machine_id: &str, ts_sec: i64) -> Result<HostTopo>;

    /// All edges of `edge_type` whose endpoints sit on different machines,
    /// with endpoints resolved. A missing edge collection yields an empty
    /// list.
    async fn cross_host_edges(&self, edge_type: &str, ts_sec: i64) -> Result<Vec<TopoEdge>>;
}

/// Historical metric series queries.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Fixed-length, evenly-spaced, gap-filled series ending at `end_ts`.
    /// Failures degrade to an all-zero series.
    async fn hist_data(
        &self,
        metric_id: &str,
        labels: &HashMap<String, String>,
        end_ts: i64,
    ) -> Vec<f64>;
}
