//! Rule engine: the entity-rule sequence plus the declarative category
//! tables loaded from the infer-rule YAML.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{InferError, Result};
use crate::models::event::Trend;
use crate::models::topology::{HostTopo, TopoEdge, TopoNode};
use crate::rules::categories::{MetricCategory, MetricCategoryPair, RuleMeta};
use crate::rules::entity::{cross_rules, host_rules, CausalRelation, EntityRule};

#[derive(Debug, Deserialize)]
struct CategorySpec {
    category: String,
    #[serde(default)]
    metrics: Vec<String>,
    #[serde(default)]
    trend: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryPairSpec {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct InferRuleSpec {
    from_type: String,
    to_type: String,
    #[serde(default)]
    metric_range: Vec<CategoryPairSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    metric_categories: HashMap<String, Vec<CategorySpec>>,
    #[serde(default)]
    infer_rules: Vec<InferRuleSpec>,
    #[serde(default)]
    cross_rules: Vec<InferRuleSpec>,
}

/// Applies the closed entity-rule set and resolves per-edge expansion
/// tables.
#[derive(Debug)]
pub struct RuleEngine {
    rules: Vec<EntityRule>,
    cross: Vec<EntityRule>,
    metric_categories: HashMap<String, Vec<MetricCategory>>,
    rule_metas: HashMap<(String, String), Arc<RuleMeta>>,
    cross_rule_metas: HashMap<(String, String), Arc<RuleMeta>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            rules: host_rules(),
            cross: cross_rules(),
            metric_categories: HashMap::new(),
            rule_metas: HashMap::new(),
            cross_rule_metas: HashMap::new(),
        }
    }

    /// Entity-level causal pairs of a single-host subgraph.
    pub fn parse_host_relations(&self, topo: &HostTopo) -> Vec<CausalRelation> {
        self.apply_rules(&self.rules, &topo.nodes, &topo.edges)
    }

    /// Entity-level causal pairs of a cross-host edge set.
    pub fn parse_cross_relations(
        &self,
        nodes: &HashMap<String, TopoNode>,
        edges: &HashMap<String, TopoEdge>,
    ) -> Vec<CausalRelation> {
        self.apply_rules(&self.cross, nodes, edges)
    }

    fn apply_rules(
        &self,
        rules: &[EntityRule],
        nodes: &HashMap<String, TopoNode>,
        edges: &HashMap<String, TopoEdge>,
    ) -> Vec<CausalRelation> {
        let mut relations = Vec::new();
        for rule in rules {
            relations.extend(rule.apply(nodes, edges));
        }
        relations
    }

    /// The expansion table for an entity pair, host-local or cross-host,
    /// falling back to `ALL -> ALL` over the types' category tables.
    pub fn rule_meta_for(
        &self,
        from_type: &str,
        to_type: &str,
        same_host: bool,
    ) -> Arc<RuleMeta> {
        let key = (from_type.to_string(), to_type.to_string());
        let table = if same_host {
            &self.rule_metas
        } else {
            &self.cross_rule_metas
        };
        if let Some(meta) = table.get(&key) {
            return meta.clone();
        }
        Arc::new(RuleMeta::default_for(
            from_type,
            to_type,
            self.categories_of(from_type),
            self.categories_of(to_type),
        ))
    }

    fn categories_of(&self, entity_type: &str) -> Vec<MetricCategory> {
        self.metric_categories
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Loads category tables and rule metas from the infer-rule YAML file.
    pub fn load_rule_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| InferError::Inference(format!("unable to read rule file: {e}")))?;
        self.load_rule_yaml(&content)
    }

    pub fn load_rule_yaml(&mut self, content: &str) -> Result<()> {
        let file: RuleFile = serde_yaml::from_str(content)
            .map_err(|e| InferError::Inference(format!("invalid rule file: {e}")))?;

        for (entity_type, specs) in file.metric_categories {
            let categories = specs
                .into_iter()
                .map(|spec| MetricCategory {
                    name: spec.category,
                    metrics: spec.metrics,
                    trend: spec.trend.as_deref().map(Trend::parse).unwrap_or(Trend::Default),
                })
                .collect();
            self.metric_categories.insert(entity_type, categories);
        }

        let host_metas = self.build_rule_metas(file.infer_rules);
        self.rule_metas.extend(host_metas);
        let cross_metas = self.build_rule_metas(file.cross_rules);
        self.cross_rule_metas.extend(cross_metas);

        Ok(())
    }

    fn build_rule_metas(
        &self,
        specs: Vec<InferRuleSpec>,
    ) -> HashMap<(String, String), Arc<RuleMeta>> {
        let mut metas = HashMap::new();
        for spec in specs {
            let pairs = spec
                .metric_range
                .into_iter()
                .map(|p| MetricCategoryPair { from: p.from, to: p.to })
                .collect();
            let meta = RuleMeta {
                from_type: spec.from_type.clone(),
                to_type: spec.to_type.clone(),
                from_categories: self.categories_of(&spec.from_type),
                to_categories: self.categories_of(&spec.to_type),
                category_pairs: pairs,
            };
            metas
                .entry((spec.from_type, spec.to_type))
                .or_insert_with(|| Arc::new(meta));
        }
        metas
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::categories::METRIC_CATEGORY_ALL;

    const RULE_YAML: &str = r#"
metric_categories:
  proc:
    - category: PROC_IO_LOAD
      metrics:
        - gala_gopher_proc_write_bytes
        - gala_gopher_proc_read_bytes
      trend: rise
  disk:
    - category: DISK_IO_LOAD
      metrics:
        - gala_gopher_disk_wspeed_kB
      trend: rise
infer_rules:
  - from_type: proc
    to_type: disk
    metric_range:
      - from: PROC_IO_LOAD
        to: DISK_IO_LOAD
cross_rules:
  - from_type: disk
    to_type: proc
    metric_range:
      - from: DISK_IO_LOAD
        to: PROC_IO_LOAD
"#;

    #[test]
    fn test_load_rule_yaml() {
        let mut engine = RuleEngine::new();
        engine.load_rule_yaml(RULE_YAML).unwrap();

        let meta = engine.rule_meta_for("proc", "disk", true);
        assert_eq!(meta.category_pairs.len(), 1);
        assert_eq!(meta.category_pairs[0].from, "PROC_IO_LOAD");
        assert_eq!(meta.from_categories.len(), 1);
        assert_eq!(meta.from_categories[0].trend, Trend::Rise);

        let cross_meta = engine.rule_meta_for("disk", "proc", false);
        assert_eq!(cross_meta.category_pairs[0].to, "PROC_IO_LOAD");
    }

    #[test]
    fn test_unconfigured_pair_falls_back_to_all() {
        let mut engine = RuleEngine::new();
        engine.load_rule_yaml(RULE_YAML).unwrap();

        let meta = engine.rule_meta_for("cpu", "proc", true);
        assert_eq!(meta.category_pairs.len(), 1);
        assert_eq!(meta.category_pairs[0].from, METRIC_CATEGORY_ALL);
        assert_eq!(meta.category_pairs[0].to, METRIC_CATEGORY_ALL);
        // the proc side still carries its configured category table
        assert_eq!(meta.to_categories.len(), 1);
    }

    #[test]
    fn test_invalid_yaml_rejected() {
        let mut engine = RuleEngine::new();
        assert!(engine.load_rule_yaml("metric_categories: [not, a, map]").is_err());
    }
}
