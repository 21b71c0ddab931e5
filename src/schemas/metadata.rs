//! Observation metadata registry.
//!
//! Metadata describes, per entity type, which label keys identify an entity
//! and which metric ids belong to it. The registry is seeded from the
//! extension YAML at startup and kept fresh by the metadata-topic refresher;
//! it is the only object shared between the refresher and the inference loop.
//! Records are replaced wholesale as `Arc` snapshots, so readers always
//! observe a consistent record.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{InferError, Result};

/// Separator between the entity type and each key value in a derived id.
const ENTITY_ID_SEP: &str = "_";

/// Characters escaped in derived entity ids, beyond controls: the URL
/// path-segment reserved set. One canonical form, applied everywhere.
const ENTITY_ID_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b':');

/// Metadata record for one entity type.
#[derive(Debug, Clone, Default)]
pub struct ObserveMeta {
    pub entity_type: String,
    /// Label keys that identify an entity, in declaration order.
    pub keys: Vec<String>,
    pub labels: Vec<String>,
    pub metrics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ObserveMetaSpec {
    #[serde(rename = "type", alias = "entity_name", alias = "entity_type")]
    entity_type: String,
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    metrics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExtObserveMetaFile {
    #[serde(default)]
    observe_entities: Vec<ObserveMetaSpec>,
}

impl From<ObserveMetaSpec> for ObserveMeta {
    fn from(spec: ObserveMetaSpec) -> Self {
        ObserveMeta {
            entity_type: spec.entity_type,
            keys: spec.keys,
            labels: spec.labels,
            metrics: spec.metrics,
        }
    }
}

/// Shared registry of observation metadata, keyed by entity type.
#[derive(Debug)]
pub struct ObserveMetaRegistry {
    /// Metric-id prefix of the collection agent, e.g. `gala_gopher`.
    data_agent: String,
    metas: DashMap<String, Arc<ObserveMeta>>,
}

impl ObserveMetaRegistry {
    pub fn new(data_agent: impl Into<String>) -> Self {
        Self {
            data_agent: data_agent.into(),
            metas: DashMap::new(),
        }
    }

    /// Replaces the record for the meta's entity type wholesale.
    pub fn replace(&self, meta: ObserveMeta) {
        self.metas.insert(meta.entity_type.clone(), Arc::new(meta));
    }

    pub fn get(&self, entity_type: &str) -> Option<Arc<ObserveMeta>> {
        self.metas.get(entity_type).map(|m| m.value().clone())
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Seeds the registry from the extension metadata YAML.
    pub fn load_ext_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| InferError::Metadata(format!("unable to read metadata file: {e}")))?;
        self.load_ext_yaml(&content)
    }

    pub fn load_ext_yaml(&self, content: &str) -> Result<usize> {
        let file: ExtObserveMetaFile = serde_yaml::from_str(content)
            .map_err(|e| InferError::Metadata(format!("invalid metadata file: {e}")))?;
        let count = file.observe_entities.len();
        for spec in file.observe_entities {
            self.replace(spec.into());
        }
        Ok(count)
    }

    /// Applies one metadata-topic message. Messages carry an `entity_name`
    /// (or `entity_type`) and the key/label/metric arrays for that type.
    pub fn apply_update(&self, data: &Value) -> Result<()> {
        let spec: ObserveMetaSpec = serde_json::from_value(data.clone())
            .map_err(|e| InferError::Metadata(format!("invalid metadata update: {e}")))?;
        self.replace(spec.into());
        Ok(())
    }

    /// Resolves the entity type owning a metric id.
    ///
    /// Metric ids follow `<data_agent>_<entity_type>_<metric_name>`; when
    /// several registered types prefix-match, the longest wins (`tcp_link`
    /// over `tcp`).
    pub fn entity_type_of_metric(&self, metric_id: &str) -> Result<String> {
        let agent_prefix = format!("{}{}", self.data_agent, ENTITY_ID_SEP);
        let rest = metric_id.strip_prefix(&agent_prefix).ok_or_else(|| {
            InferError::Metadata(format!(
                "metric {metric_id} does not match data agent {}",
                self.data_agent
            ))
        })?;

        let mut best: Option<String> = None;
        for entry in self.metas.iter() {
            let ty = entry.key();
            let type_prefix = format!("{ty}{ENTITY_ID_SEP}");
            if rest.starts_with(&type_prefix)
                && best.as_ref().map_or(true, |b| ty.len() > b.len())
            {
                best = Some(ty.clone());
            }
        }
        best.ok_or_else(|| {
            InferError::Metadata(format!("no entity type registered for metric {metric_id}"))
        })
    }

    /// Reduces query labels to the subset that identifies the entity owning
    /// the metric, per the metadata-declared keys.
    pub fn entity_keys_of_metric(
        &self,
        metric_id: &str,
        labels: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let entity_type = self.entity_type_of_metric(metric_id)?;
        let meta = self.get(&entity_type).ok_or_else(|| {
            InferError::Metadata(format!("no metadata for entity type {entity_type}"))
        })?;

        let mut res = HashMap::with_capacity(meta.keys.len());
        for key in &meta.keys {
            let val = labels.get(key).ok_or_else(|| {
                InferError::Metadata(format!(
                    "label {key} required by entity type {entity_type} is missing"
                ))
            })?;
            res.insert(key.clone(), val.clone());
        }
        Ok(res)
    }

    /// Derives the canonical entity id for a metric event: the entity type,
    /// then each declared key's label value in order, joined with a fixed
    /// separator and percent-escaped. Deterministic and idempotent.
    pub fn derive_entity_id(
        &self,
        metric_id: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String> {
        let entity_type = self.entity_type_of_metric(metric_id)?;
        let meta = self.get(&entity_type).ok_or_else(|| {
            InferError::Metadata(format!("no metadata for entity type {entity_type}"))
        })?;

        let mut parts = Vec::with_capacity(meta.keys.len() + 1);
        parts.push(entity_type.clone());
        for key in &meta.keys {
            let val = labels.get(key).ok_or_else(|| {
                InferError::Metadata(format!(
                    "label {key} required to identify {entity_type} is missing"
                ))
            })?;
            parts.push(val.clone());
        }

        let raw = parts.join(ENTITY_ID_SEP);
        Ok(utf8_percent_encode(&raw, ENTITY_ID_ESCAPE).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> ObserveMetaRegistry {
        let registry = ObserveMetaRegistry::new("gala_gopher");
        registry.replace(ObserveMeta {
            entity_type: "tcp".to_string(),
            keys: vec!["machine_id".to_string()],
            ..Default::default()
        });
        registry.replace(ObserveMeta {
            entity_type: "tcp_link".to_string(),
            keys: vec![
                "machine_id".to_string(),
                "tgid".to_string(),
                "s_port".to_string(),
            ],
            ..Default::default()
        });
        registry
    }

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_longest_entity_type_wins() {
        let registry = registry();
        let ty = registry
            .entity_type_of_metric("gala_gopher_tcp_link_rtt")
            .unwrap();
        assert_eq!(ty, "tcp_link");
    }

    #[test]
    fn test_unknown_agent_prefix_rejected() {
        let registry = registry();
        assert!(registry.entity_type_of_metric("node_exporter_cpu_idle").is_err());
    }

    #[test]
    fn test_derive_entity_id_canonical_form() {
        let registry = registry();
        let lbls = labels(&[("machine_id", "m-1"), ("tgid", "42"), ("s_port", "80")]);
        let id = registry
            .derive_entity_id("gala_gopher_tcp_link_rtt", &lbls)
            .unwrap();
        assert_eq!(id, "tcp_link_m-1_42_80");
    }

    #[test]
    fn test_derive_entity_id_escapes_reserved_chars() {
        let registry = ObserveMetaRegistry::new("gala_gopher");
        registry.replace(ObserveMeta {
            entity_type: "disk".to_string(),
            keys: vec!["machine_id".to_string(), "disk_name".to_string()],
            ..Default::default()
        });
        let lbls = labels(&[("machine_id", "m1"), ("disk_name", "/dev/sda")]);
        let id = registry
            .derive_entity_id("gala_gopher_disk_util", &lbls)
            .unwrap();
        assert_eq!(id, "disk_m1_%2Fdev%2Fsda");
    }

    #[test]
    fn test_missing_key_aborts_derivation() {
        let registry = registry();
        let lbls = labels(&[("machine_id", "m1"), ("tgid", "42")]);
        assert!(registry
            .derive_entity_id("gala_gopher_tcp_link_rtt", &lbls)
            .is_err());
    }

    #[test]
    fn test_entity_keys_subset() {
        let registry = registry();
        let lbls = labels(&[
            ("machine_id", "m1"),
            ("tgid", "42"),
            ("s_port", "80"),
            ("extra", "ignored"),
        ]);
        let keys = registry
            .entity_keys_of_metric("gala_gopher_tcp_link_rtt", &lbls)
            .unwrap();
        assert_eq!(keys.len(), 3);
        assert!(!keys.contains_key("extra"));
    }

    #[test]
    fn test_apply_update_replaces_wholesale() {
        let registry = registry();
        let update = serde_json::json!({
            "entity_name": "tcp_link",
            "keys": ["machine_id"],
            "metrics": ["gala_gopher_tcp_link_rtt"],
        });
        registry.apply_update(&update).unwrap();
        let meta = registry.get("tcp_link").unwrap();
        assert_eq!(meta.keys, vec!["machine_id".to_string()]);
        assert_eq!(meta.metrics.len(), 1);
    }

    #[test]
    fn test_load_ext_yaml() {
        let registry = ObserveMetaRegistry::new("gala_gopher");
        let yaml = r#"
observe_entities:
  - type: sli
    keys: [machine_id, tgid]
    metrics: [gala_gopher_sli_rtt_nsec]
  - type: proc
    keys: [machine_id, tgid]
"#;
        let count = registry.load_ext_yaml(yaml).unwrap();
        assert_eq!(count, 2);
        assert!(registry.get("sli").is_some());
        assert!(registry.get("proc").is_some());
    }
}
