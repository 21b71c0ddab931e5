//! Result formatter.
//!
//! Turns the final cause list into the inference result object and wraps it
//! in the broker envelope. Virtual metric ids in emitted paths are renamed
//! to the default placeholder.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Value};

use crate::keywords::CauseKeywords;
use crate::models::event::AbnormalEvent;
use crate::models::graph::{Cause, MetricNode, DEFAULT_VIRTUAL_METRIC_ID};

/// The triggering KPI as emitted, taken from the path's last node.
#[derive(Debug, Clone, Serialize)]
pub struct AbnormalKpiInfo {
    pub metric_id: String,
    pub entity_id: String,
    pub timestamp: i64,
    pub metric_labels: HashMap<String, String>,
    pub desc: String,
}

/// One node of an emitted cause path.
#[derive(Debug, Clone, Serialize)]
pub struct PathNodeInfo {
    pub metric_id: String,
    pub entity_id: String,
    pub metric_labels: HashMap<String, String>,
    pub timestamp: i64,
    pub desc: String,
    pub score: f64,
}

/// One ranked cause with its explanatory path.
#[derive(Debug, Clone, Serialize)]
pub struct CauseMetricInfo {
    pub metric_id: String,
    pub entity_id: String,
    pub metric_labels: HashMap<String, String>,
    pub timestamp: i64,
    pub desc: String,
    pub score: f64,
    pub keyword: String,
    pub path: Vec<PathNodeInfo>,
}

/// The inference result object carried in the envelope's `Resource`.
#[derive(Debug, Clone, Serialize)]
pub struct InferResult {
    pub abnormal_kpi: AbnormalKpiInfo,
    pub cause_metrics: Vec<CauseMetricInfo>,
    pub desc: String,
}

fn path_node_info(node: &MetricNode) -> PathNodeInfo {
    let metric_id = if node.id.is_virtual() {
        DEFAULT_VIRTUAL_METRIC_ID.to_string()
    } else {
        node.id.metric_id.clone()
    };
    let snapshot = node.attrs.snapshot.as_ref();
    PathNodeInfo {
        metric_id,
        entity_id: node.attrs.entity_id.clone(),
        metric_labels: snapshot.map(|s| s.metric_labels.clone()).unwrap_or_default(),
        timestamp: snapshot.map(|s| s.timestamp).unwrap_or_default(),
        desc: snapshot.map(|s| s.desc.clone()).unwrap_or_default(),
        score: node.attrs.corr_score(),
    }
}

fn abnormal_kpi_info(kpi_node: &MetricNode) -> AbnormalKpiInfo {
    let snapshot = kpi_node.attrs.snapshot.as_ref();
    AbnormalKpiInfo {
        metric_id: kpi_node.id.metric_id.clone(),
        entity_id: kpi_node.attrs.entity_id.clone(),
        timestamp: snapshot.map(|s| s.timestamp).unwrap_or_default(),
        metric_labels: snapshot.map(|s| s.metric_labels.clone()).unwrap_or_default(),
        desc: snapshot.map(|s| s.desc.clone()).unwrap_or_default(),
    }
}

fn desc_sentence(kpi: &AbnormalKpiInfo, cause_metrics: &[CauseMetricInfo]) -> String {
    let mut desc = format!(
        "{}, the top {} probable root causes are: ",
        kpi.desc,
        cause_metrics.len()
    );
    for (i, cause) in cause_metrics.iter().enumerate() {
        desc.push_str(&format!("{}. {}; ", i + 1, cause.desc));
    }
    desc
}

/// Formats the final cause list; `None` when there is nothing to report.
pub fn format_infer_result(causes: &[Cause], keywords: &CauseKeywords) -> Option<InferResult> {
    let first = causes.first()?;
    let kpi_node = first.path.last()?;
    let abnormal_kpi = abnormal_kpi_info(kpi_node);

    let mut cause_metrics = Vec::with_capacity(causes.len());
    for cause in causes {
        let root = cause.path.first()?;
        let snapshot = root.attrs.snapshot.as_ref();
        cause_metrics.push(CauseMetricInfo {
            metric_id: cause.metric_id.clone(),
            entity_id: cause.entity_id.clone(),
            metric_labels: snapshot.map(|s| s.metric_labels.clone()).unwrap_or_default(),
            timestamp: snapshot.map(|s| s.timestamp).unwrap_or_default(),
            desc: snapshot.map(|s| s.desc.clone()).unwrap_or_default(),
            score: cause.cause_score,
            keyword: keywords.keyword_of(&root.attrs.entity_type),
            path: cause.path.iter().map(path_node_info).collect(),
        });
    }

    let desc = desc_sentence(&abnormal_kpi, &cause_metrics);
    Some(InferResult {
        abnormal_kpi,
        cause_metrics,
        desc,
    })
}

/// Wraps the result in the standard broker envelope.
pub fn build_cause_message(kpi: &AbnormalEvent, result: &InferResult) -> Value {
    let keywords: Vec<&str> = result
        .cause_metrics
        .iter()
        .map(|c| c.keyword.as_str())
        .collect();
    json!({
        "Timestamp": kpi.timestamp,
        "event_id": kpi.event_id,
        "Attributes": {
            "event_id": kpi.event_id,
        },
        "Resource": result,
        "keywords": keywords,
        "SeverityText": "WARN",
        "SeverityNumber": 13,
        "Body": "A cause inferring event for an abnormal event",
    })
}
