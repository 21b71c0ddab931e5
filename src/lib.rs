//! RCA Hub
//!
//! Root-cause inference engine for distributed observability pipelines. Two
//! broker streams feed the engine: a small stream of KPI anomalies that
//! trigger inference, and a large stream of metric anomalies that supply
//! candidate causes. Each triggering KPI is correlated against the nearest
//! topology snapshot of the monitored fleet, and the engine emits a ranked
//! list of likely causal metrics with an explanatory path through the
//! topology.
//!
//! # Overview
//!
//! - **Event pipeline**: Kafka consumers feeding the time-aligning
//!   abnormal-event aggregator, plus the metadata refresher and the cause
//!   publisher
//! - **Rules**: a closed entity-rule set over topology subgraphs and
//!   declarative metric-category expansion tables
//! - **Analytics**: Pearson correlation against the KPI series, entity- and
//!   metric-level causal graph construction, cross-host expansion, and the
//!   DFS / random-walk ranking policies
//! - **Clients**: ArangoDB topology snapshots and Prometheus range queries
//!   behind narrow trait seams
//!
//! # Example
//!
//! ```rust
//! use rca_hub::models::graph::{MetricCauseGraph, MetricNode, MetricNodeAttrs, MetricNodeId};
//!
//! let mut graph = MetricCauseGraph::new();
//! let cause = MetricNode {
//!     id: MetricNodeId::new("entities/proc1", "proc_cpu_util"),
//!     attrs: MetricNodeAttrs {
//!         entity_id: "proc_host1_42".to_string(),
//!         entity_type: "proc".to_string(),
//!         machine_id: "host1".to_string(),
//!         snapshot: None,
//!         trend: None,
//!     },
//! };
//! let effect = MetricNode {
//!     id: MetricNodeId::new("entities/sli1", "sli_latency"),
//!     attrs: MetricNodeAttrs {
//!         entity_id: "sli_host1_42".to_string(),
//!         entity_type: "sli".to_string(),
//!         machine_id: "host1".to_string(),
//!         snapshot: None,
//!         trend: None,
//!     },
//! };
//! let effect_id = effect.id.clone();
//! graph.add_node(cause);
//! graph.add_node(effect);
//! graph.add_edge(&MetricNodeId::new("entities/proc1", "proc_cpu_util"), &effect_id);
//! assert_eq!(graph.predecessors(&effect_id).len(), 1);
//! ```

pub mod analytics;
pub mod clients;
pub mod common;
pub mod error;
pub mod keywords;
pub mod models;
pub mod output;
pub mod pipeline;
pub mod rules;
pub mod schemas;

// Re-export commonly used types at the crate root
pub use analytics::locator::CauseLocator;
pub use analytics::policy::{build_policy, InferPolicy, PolicyOptions};
pub use common::config::InferConfig;
pub use error::{InferError, Result};
pub use models::event::{AbnormalEvent, Trend};
pub use models::graph::{Cause, CauseTree, MetricCauseGraph, MetricNode, MetricNodeId};
pub use pipeline::aggregator::{AggregatorConfig, EventAggregator};
pub use schemas::metadata::{ObserveMeta, ObserveMetaRegistry};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constant() {
        assert!(!VERSION.is_empty());
    }
}
