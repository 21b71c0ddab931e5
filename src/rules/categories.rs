//! Metric categories and per-edge causal expansion tables.
//!
//! A `RuleMeta` describes, for one `(from_type, to_type)` entity pair, how
//! the anomalous metrics on each side are partitioned into categories and
//! which category pairings produce metric-level cause edges.

use crate::models::event::Trend;
use crate::models::graph::{is_virtual_category, VIRTUAL_METRIC_CATEGORIES};

/// Pseudo-category matching every non-virtual group.
pub const METRIC_CATEGORY_ALL: &str = "ALL";
/// Pseudo-category collecting metrics that match no configured category.
pub const METRIC_CATEGORY_OTHER: &str = "OTHER";

/// A named grouping of metric ids for one entity type, with the anomaly
/// trend expected of its members.
#[derive(Debug, Clone)]
pub struct MetricCategory {
    pub name: String,
    pub metrics: Vec<String>,
    pub trend: Trend,
}

/// An ordered `(from-category, to-category)` pairing.
#[derive(Debug, Clone)]
pub struct MetricCategoryPair {
    pub from: String,
    pub to: String,
}

/// One side of an expanded causal relation: a concrete group of metric ids
/// under a category, with that category's expected trend attached.
#[derive(Debug, Clone)]
pub struct MetricGroup {
    pub category: String,
    pub trend: Option<Trend>,
    pub metrics: Vec<String>,
}

impl MetricGroup {
    pub fn is_virtual(&self) -> bool {
        is_virtual_category(&self.category)
    }
}

/// Causal expansion table for one `(from_type, to_type)` entity pair.
#[derive(Debug, Clone, Default)]
pub struct RuleMeta {
    pub from_type: String,
    pub to_type: String,
    pub from_categories: Vec<MetricCategory>,
    pub to_categories: Vec<MetricCategory>,
    pub category_pairs: Vec<MetricCategoryPair>,
}

/// Partitions metric ids by category, in category declaration order.
///
/// Every input metric lands in exactly one non-virtual group: the first
/// category containing it, or `OTHER`. The virtual pseudo-groups are always
/// appended, each holding its single virtual metric id.
fn group_by_category(metrics: &[String], categories: &[MetricCategory]) -> Vec<MetricGroup> {
    let mut groups = Vec::new();
    let mut parted = vec![false; metrics.len()];

    for category in categories {
        let mut part = Vec::new();
        for (i, metric) in metrics.iter().enumerate() {
            if !parted[i] && category.metrics.iter().any(|m| m == metric) {
                part.push(metric.clone());
                parted[i] = true;
            }
        }
        if !part.is_empty() {
            groups.push(MetricGroup {
                category: category.name.clone(),
                trend: Some(category.trend),
                metrics: part,
            });
        }
    }

    let other: Vec<String> = metrics
        .iter()
        .zip(&parted)
        .filter(|(_, parted)| !**parted)
        .map(|(m, _)| m.clone())
        .collect();
    if !other.is_empty() {
        groups.push(MetricGroup {
            category: METRIC_CATEGORY_OTHER.to_string(),
            trend: None,
            metrics: other,
        });
    }

    for (category, metric_id) in VIRTUAL_METRIC_CATEGORIES {
        groups.push(MetricGroup {
            category: category.to_string(),
            trend: None,
            metrics: vec![metric_id.to_string()],
        });
    }

    groups
}

/// Resolves a configured category name against the computed groups.
///
/// `ALL` enumerates every non-virtual group, exploding `OTHER` into one
/// singleton group per metric; any other name selects that one group when
/// present.
fn aggregate_groups(category: &str, groups: &[MetricGroup]) -> Vec<MetricGroup> {
    if category == METRIC_CATEGORY_ALL {
        let mut res = Vec::new();
        for group in groups {
            if group.is_virtual() {
                continue;
            }
            if group.category == METRIC_CATEGORY_OTHER {
                res.extend(group.metrics.iter().map(|metric| MetricGroup {
                    category: METRIC_CATEGORY_OTHER.to_string(),
                    trend: None,
                    metrics: vec![metric.clone()],
                }));
            } else {
                res.push(group.clone());
            }
        }
        res
    } else {
        groups
            .iter()
            .filter(|g| g.category == category)
            .cloned()
            .collect()
    }
}

impl RuleMeta {
    /// The `ALL -> ALL` fallback table for an entity pair.
    pub fn default_for(
        from_type: impl Into<String>,
        to_type: impl Into<String>,
        from_categories: Vec<MetricCategory>,
        to_categories: Vec<MetricCategory>,
    ) -> Self {
        RuleMeta {
            from_type: from_type.into(),
            to_type: to_type.into(),
            from_categories,
            to_categories,
            category_pairs: vec![MetricCategoryPair {
                from: METRIC_CATEGORY_ALL.to_string(),
                to: METRIC_CATEGORY_ALL.to_string(),
            }],
        }
    }

    /// Expands the configured category pairs against the real metric sets of
    /// both endpoints, yielding all `(from-group, to-group)` cross products.
    pub fn expand(
        &self,
        real_from_metrics: &[String],
        real_to_metrics: &[String],
    ) -> Vec<(MetricGroup, MetricGroup)> {
        let from_groups = group_by_category(real_from_metrics, &self.from_categories);
        let to_groups = group_by_category(real_to_metrics, &self.to_categories);

        let mut relations = Vec::new();
        for pair in &self.category_pairs {
            let all_from = aggregate_groups(&pair.from, &from_groups);
            let all_to = aggregate_groups(&pair.to, &to_groups);
            for from_group in &all_from {
                for to_group in &all_to {
                    relations.push((from_group.clone(), to_group.clone()));
                }
            }
        }
        relations
    }
}
