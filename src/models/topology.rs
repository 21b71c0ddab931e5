//! Typed topology snapshot model.
//!
//! Snapshots of the monitored fleet are persisted per second in the graph
//! database; the inference core only ever sees the slice returned by the
//! topology client queries.

use std::collections::HashMap;

use serde_json::Value;

/// Observation entity types known to the rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityType {
    Host,
    Container,
    AppInstance,
    Pod,
    Process,
    Thread,
    TcpLink,
    Endpoint,
    Sli,
    Disk,
    Block,
    Netcard,
    Cpu,
    FileSystem,
    Qdisc,
    Mem,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Host => "host",
            EntityType::Container => "container",
            EntityType::AppInstance => "appinstance",
            EntityType::Pod => "pod",
            EntityType::Process => "proc",
            EntityType::Thread => "thread",
            EntityType::TcpLink => "tcp_link",
            EntityType::Endpoint => "endpoint",
            EntityType::Sli => "sli",
            EntityType::Disk => "disk",
            EntityType::Block => "block",
            EntityType::Netcard => "nic",
            EntityType::Cpu => "cpu",
            EntityType::FileSystem => "file_system",
            EntityType::Qdisc => "qdisc",
            EntityType::Mem => "mem",
        }
    }
}

/// Relation types carried on topology edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationType {
    BelongsTo,
    RunsOn,
    IsPeer,
    IsClient,
    IsServer,
    StoreIn,
    Connect,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::BelongsTo => "belongs_to",
            RelationType::RunsOn => "runs_on",
            RelationType::IsPeer => "is_peer",
            RelationType::IsClient => "is_client",
            RelationType::IsServer => "is_server",
            RelationType::StoreIn => "store_in",
            RelationType::Connect => "connect",
        }
    }
}

/// A typed observation entity from a topology snapshot.
#[derive(Debug, Clone)]
pub struct TopoNode {
    /// Graph-database unique id (`<collection>/<key>`).
    pub id: String,
    /// Snapshot-scoped entity key.
    pub entity_id: String,
    pub entity_type: String,
    pub machine_id: String,
    pub timestamp: i64,
    /// Raw document attributes, used as label source for time-series queries.
    pub raw_data: HashMap<String, Value>,
}

impl TopoNode {
    pub fn is_type(&self, entity_type: EntityType) -> bool {
        self.entity_type == entity_type.as_str()
    }

    /// Raw attribute rendered as a plain string, if present.
    pub fn raw_str(&self, key: &str) -> Option<String> {
        self.raw_data.get(key).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Raw attributes reduced to a string-to-string label map.
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
}

/// A typed topology edge with endpoints resolved against the query that
/// produced it.
#[derive(Debug, Clone)]
pub struct TopoEdge {
    pub id: String,
    pub edge_type: String,
    pub from_id: String,
    pub to_id: String,
    /// Resolved endpoints; only valid for the query that produced the edge.
    pub from_node: Option<TopoNode>,
    pub to_node: Option<TopoNode>,
}

impl TopoEdge {
    pub fn is_type(&self, relation: RelationType) -> bool {
        self.edge_type == relation.as_str()
    }
}

/// The topology slice of one host: the host entity plus everything reachable
/// over `belongs_to`/`runs_on` within the same `machine_id`.
#[derive(Debug, Clone, Default)]
pub struct HostTopo {
    pub machine_id: String,
    pub nodes: HashMap<String, TopoNode>,
    pub edges: HashMap<String, TopoEdge>,
}

impl HostTopo {
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    /// True when every edge's endpoints exist in the node map.
    pub fn is_consistent(&self) -> bool {
        self.edges
            .values()
            .all(|e| self.nodes.contains_key(&e.from_id) && self.nodes.contains_key(&e.to_id))
    }
}
