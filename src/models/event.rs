//! Anomaly event model.
//!
//! Two streams feed the engine: a small stream of KPI anomalies that trigger
//! inference and a large stream of metric anomalies that supply candidate
//! causes. Both carry the same event shape.

use std::collections::HashMap;

use crate::schemas::metadata::ObserveMetaRegistry;

/// Expected or observed direction of an anomalous series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trend {
    Rise,
    Fall,
    Default,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trend::Rise => "rise",
            Trend::Fall => "fall",
            Trend::Default => "default",
        }
    }

    /// Parses a configured trend string; anything unrecognized maps to
    /// `Default`, matching the rule-file semantics.
    pub fn parse(s: &str) -> Trend {
        match s {
            "rise" => Trend::Rise,
            "fall" => Trend::Fall,
            _ => Trend::Default,
        }
    }
}

/// An anomaly notification consumed from the broker.
///
/// `entity_id` may be empty on ingress; the aggregator derives it from the
/// metric labels before the event enters the buffer. `hist_data` stays empty
/// until the correlator fetches the historical series.
#[derive(Debug, Clone)]
pub struct AbnormalEvent {
    /// Event timestamp in milliseconds since the epoch.
    pub timestamp: i64,
    pub metric_id: String,
    /// Non-negative anomaly score; negative inputs are clamped on parse.
    pub score: f64,
    pub labels: HashMap<String, String>,
    pub entity_id: String,
    pub event_id: String,
    pub desc: String,
    /// Fixed-length historical series, filled lazily by the correlator.
    pub hist_data: Vec<f64>,
}

impl AbnormalEvent {
    pub fn set_hist_data(&mut self, hist_data: &[f64]) {
        self.hist_data = hist_data.to_vec();
    }

    /// Ensures the event carries a non-empty `entity_id`.
    ///
    /// An id already present on ingress is kept. Otherwise the id is derived
    /// from the metric id and labels via the observation-metadata registry;
    /// returns false when the mapping cannot be resolved, in which case the
    /// caller drops the event.
    pub fn update_entity_id(&mut self, registry: &ObserveMetaRegistry) -> bool {
        if !self.entity_id.is_empty() {
            return true;
        }

        match registry.derive_entity_id(&self.metric_id, &self.labels) {
            Ok(entity_id) => {
                self.entity_id = entity_id;
                !self.entity_id.is_empty()
            }
            Err(err) => {
                tracing::debug!("{}", err);
                false
            }
        }
    }

    /// Snapshot of the event as attached to an entity-graph node.
    pub fn to_snapshot(&self) -> MetricSnapshot {
        MetricSnapshot {
            metric_id: self.metric_id.clone(),
            timestamp: self.timestamp,
            abnormal_score: self.score,
            metric_labels: self.labels.clone(),
            entity_id: self.entity_id.clone(),
            desc: self.desc.clone(),
            corr_score: None,
            real_trend: None,
        }
    }
}

/// Per-metric attributes carried through the entity graph and onto metric
/// cause-graph nodes.
#[derive(Debug, Clone)]
pub struct MetricSnapshot {
    pub metric_id: String,
    pub timestamp: i64,
    pub abnormal_score: f64,
    pub metric_labels: HashMap<String, String>,
    pub entity_id: String,
    pub desc: String,
    /// `|pearson(KPI series, metric series)|`, absent when the correlation is
    /// NaN or not yet computed.
    pub corr_score: Option<f64>,
    /// Trend observed on the fetched series.
    pub real_trend: Option<Trend>,
}
