//! Topology snapshot client over ArangoDB.
//!
//! Snapshots are stored under timestamp-suffixed entity collections
//! (`ObserveEntities_<ts>`) with edge collections named by relation type;
//! snapshot seconds live in the `Timestamps` collection.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::clients::arango::ArangoClient;
use crate::clients::TopologyStore;
use crate::error::{InferError, Result};
use crate::models::topology::{EntityType, HostTopo, RelationType, TopoEdge, TopoNode};

const TIMESTAMP_COLL: &str = "Timestamps";
const ENTITY_COLL_PREFIX: &str = "ObserveEntities";

fn entity_collection(ts_sec: i64) -> String {
    format!("{ENTITY_COLL_PREFIX}_{ts_sec}")
}

fn value_to_map(value: &Value) -> HashMap<String, Value> {
    value
        .as_object()
        .cloned()
        .unwrap_or_else(Map::new)
        .into_iter()
        .collect()
}

fn node_from_doc(doc: &Value) -> TopoNode {
    TopoNode {
        id: doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_string(),
        entity_id: doc.get("_key").and_then(Value::as_str).unwrap_or_default().to_string(),
        entity_type: doc.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
        machine_id: doc
            .get("machine_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        timestamp: doc.get("timestamp").and_then(Value::as_i64).unwrap_or_default(),
        raw_data: value_to_map(doc),
    }
}

fn edge_from_doc(doc: &Value) -> TopoEdge {
    TopoEdge {
        id: doc.get("_id").and_then(Value::as_str).unwrap_or_default().to_string(),
        edge_type: doc.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
        from_id: doc.get("_from").and_then(Value::as_str).unwrap_or_default().to_string(),
        to_id: doc.get("_to").and_then(Value::as_str).unwrap_or_default().to_string(),
        from_node: None,
        to_node: None,
    }
}

/// ArangoDB-backed implementation of [`TopologyStore`].
#[derive(Debug, Clone)]
pub struct ArangoTopologyClient {
    client: ArangoClient,
    /// Maximum hops of the host subgraph traversal.
    topo_depth: i64,
    /// Maximum age in seconds a snapshot may lag the KPI.
    tolerated_bias: i64,
}

impl ArangoTopologyClient {
    pub fn new(client: ArangoClient, topo_depth: i64, tolerated_bias: i64) -> Self {
        Self {
            client,
            topo_depth,
            tolerated_bias,
        }
    }

    async fn query_entities(
        &self,
        ts_sec: i64,
        filters: &[(&str, Value)],
    ) -> Result<Vec<TopoNode>> {
        let mut bind_vars = Map::new();
        bind_vars.insert("@collection".to_string(), Value::from(entity_collection(ts_sec)));
        let mut filter_str = String::new();
        if !filters.is_empty() {
            let clauses: Vec<String> = filters
                .iter()
                .map(|(key, _)| format!("v.{key} == @{}", key.trim_start_matches('_')))
                .collect();
            filter_str = format!("FILTER {}", clauses.join(" AND "));
            for (key, value) in filters {
                bind_vars.insert(key.trim_start_matches('_').to_string(), value.clone());
            }
        }

        let aql = format!(
            "FOR v IN @@collection\n  {filter_str}\n  RETURN v"
        );
        let rows = self.client.query(&aql, Value::Object(bind_vars)).await?;
        Ok(rows.iter().map(node_from_doc).collect())
    }
}

#[async_trait]
impl TopologyStore for ArangoTopologyClient {
    async fn recent_ts(&self, ts_sec: i64) -> Result<i64> {
        let aql = "FOR t IN @@collection\n  FILTER TO_NUMBER(t._key) <= @ts\n  SORT t._key DESC\n  LIMIT 1\n  RETURN t._key";
        let rows = self
            .client
            .query(aql, json!({"@collection": TIMESTAMP_COLL, "ts": ts_sec}))
            .await?;
        let recent = rows
            .first()
            .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())))
            .ok_or_else(|| {
                InferError::Db(format!(
                    "can not find topological graph at the abnormal timestamp {ts_sec}"
                ))
            })?;
        let recent: i64 = recent
            .parse()
            .map_err(|_| InferError::Db(format!("invalid snapshot timestamp {recent}")))?;
        if ts_sec - recent > self.tolerated_bias {
            return Err(InferError::Db(format!(
                "the queried topological graph is too old, topo timestamp={recent}"
            )));
        }
        Ok(recent)
    }

    async fn entity_by_id(&self, entity_id: &str, ts_sec: i64) -> Result<TopoNode> {
        let entities = self
            .query_entities(ts_sec, &[("_key", Value::from(entity_id))])
            .await?;
        match entities.len() {
            0 => Err(InferError::Db(format!(
                "can not find entity {entity_id} satisfied"
            ))),
            1 => Ok(entities.into_iter().next().expect("len checked")),
            _ => Err(InferError::Db(format!(
                "multiple entities with the same entity id {entity_id} found"
            ))),
        }
    }

    async fn host_topo(&self, machine_id: &str, ts_sec: i64) -> Result<HostTopo> {
        let hosts = self
            .query_entities(
                ts_sec,
                &[
                    ("type", Value::from(EntityType::Host.as_str())),
                    ("machine_id", Value::from(machine_id)),
                ],
            )
            .await?;
        let host = match hosts.len() {
            0 => {
                return Err(InferError::Db(format!(
                    "can not find machine {machine_id} satisfied"
                )))
            }
            1 => hosts.into_iter().next().expect("len checked"),
            _ => {
                return Err(InferError::Db(format!(
                    "multiple hosts with the same machine id {machine_id} found"
                )))
            }
        };

        let edge_colls = format!(
            "{}, {}",
            RelationType::BelongsTo.as_str(),
            RelationType::RunsOn.as_str()
        );
        let aql = format!(
            "WITH @@collection\n\
             FOR v, e IN 1..@depth ANY @start_v {edge_colls}\n\
               OPTIONS {{\"uniqueVertices\": \"path\"}}\n\
               FILTER v.machine_id == @machine_id\n\
               RETURN {{\"node\": v, \"edge\": e}}"
        );
        let bind_vars = json!({
            "@collection": entity_collection(ts_sec),
            "depth": self.topo_depth,
            "start_v": host.id,
            "machine_id": machine_id,
        });
        let rows = self.client.query(&aql, bind_vars).await?;

        let mut topo = HostTopo::new(machine_id);
        topo.nodes.insert(host.id.clone(), host);
        for row in &rows {
            if let Some(node_doc) = row.get("node") {
                let node = node_from_doc(node_doc);
                topo.nodes.entry(node.id.clone()).or_insert(node);
            }
            if let Some(edge_doc) = row.get("edge") {
                let edge = edge_from_doc(edge_doc);
                topo.edges.entry(edge.id.clone()).or_insert(edge);
            }
        }
        for edge in topo.edges.values_mut() {
            edge.from_node = topo.nodes.get(&edge.from_id).cloned();
            edge.to_node = topo.nodes.get(&edge.to_id).cloned();
        }
        Ok(topo)
    }

    async fn cross_host_edges(&self, edge_type: &str, ts_sec: i64) -> Result<Vec<TopoEdge>> {
        let aql = r#"FOR e IN @@edge
  FILTER e.timestamp == @ts
  LET from = (FOR v IN @@coll FILTER v._id == e._from RETURN v)
  LET to = (FOR v IN @@coll FILTER v._id == e._to RETURN v)
  FILTER from[0].machine_id != to[0].machine_id
  RETURN {edge: e, from: from, to: to}"#;
        let bind_vars = json!({
            "@edge": edge_type,
            "@coll": entity_collection(ts_sec),
            "ts": ts_sec,
        });
        let rows = self.client.query_optional_collection(aql, bind_vars).await?;

        let mut edges = Vec::new();
        for row in &rows {
            let Some(edge_doc) = row.get("edge") else {
                continue;
            };
            let mut edge = edge_from_doc(edge_doc);
            edge.from_node = row
                .get("from")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .map(node_from_doc);
            edge.to_node = row
                .get("to")
                .and_then(|v| v.as_array())
                .and_then(|a| a.first())
                .map(node_from_doc);
            edges.push(edge);
        }
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_collection_name() {
        assert_eq!(entity_collection(1000), "ObserveEntities_1000");
    }

    #[test]
    fn test_node_from_doc_keeps_raw_data() {
        let doc = json!({
            "_id": "ObserveEntities_1000/proc1",
            "_key": "proc1",
            "type": "proc",
            "machine_id": "m1",
            "timestamp": 1000,
            "comm": "nginx",
        });
        let node = node_from_doc(&doc);
        assert_eq!(node.id, "ObserveEntities_1000/proc1");
        assert_eq!(node.entity_id, "proc1");
        assert_eq!(node.entity_type, "proc");
        assert_eq!(node.raw_str("comm").as_deref(), Some("nginx"));
    }

    #[test]
    fn test_edge_from_doc() {
        let doc = json!({
            "_id": "belongs_to/1",
            "type": "belongs_to",
            "_from": "ObserveEntities_1000/sli1",
            "_to": "ObserveEntities_1000/proc1",
        });
        let edge = edge_from_doc(&doc);
        assert!(edge.is_type(RelationType::BelongsTo));
        assert_eq!(edge.from_id, "ObserveEntities_1000/sli1");
        assert!(edge.from_node.is_none());
    }
}
