//! Broker event payloads.
//!
//! Anomaly events arrive as UTF-8 JSON with `Timestamp` / `Attributes` /
//! `Resource` / `Body` envelopes. Parsing is lenient about extra fields and
//! strict about the few the engine needs; malformed events are dropped by the
//! caller, never blocking the pipeline.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{InferError, Result};
use crate::models::event::AbnormalEvent;
use crate::schemas::metadata::ObserveMetaRegistry;

/// `event_type` value that marks a KPI event as triggering.
pub const APP_EVENT_TYPE: &str = "app";

#[derive(Debug, Default, Deserialize)]
struct Attributes {
    #[serde(default)]
    event_id: String,
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    entity_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct InlineCauseMetric {
    #[serde(default)]
    metric: String,
    #[serde(default)]
    labels: HashMap<String, Value>,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Default, Deserialize)]
struct Resource {
    metric: Option<String>,
    /// Some producers spell the field `metrics`.
    metrics: Option<String>,
    #[serde(default)]
    labels: HashMap<String, Value>,
    #[serde(default)]
    score: f64,
    #[serde(default)]
    description: String,
    #[serde(default)]
    cause_metrics: Vec<InlineCauseMetric>,
}

#[derive(Debug, Deserialize)]
struct EventPayload {
    #[serde(rename = "Timestamp")]
    timestamp: Option<f64>,
    #[serde(rename = "Attributes", default)]
    attributes: Attributes,
    #[serde(rename = "Resource", default)]
    resource: Resource,
    #[serde(rename = "Body", default)]
    body: String,
}

fn stringify_labels(labels: HashMap<String, Value>) -> HashMap<String, String> {
    labels
        .into_iter()
        .map(|(k, v)| {
            let val = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            (k, val)
        })
        .collect()
}

fn clamp_score(score: f64) -> f64 {
    score.max(0.0)
}

/// Extracts the `Attributes.event_type` of a raw payload.
pub fn event_type(data: &Value) -> String {
    data.get("Attributes")
        .and_then(|a| a.get("event_type"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Parses one anomaly event from a raw broker payload.
///
/// Requires a metric id and either an entity id or metric labels; the
/// anomaly score is clamped to be non-negative and the description falls
/// back to the payload `Body`.
pub fn parse_event(data: &Value) -> Result<AbnormalEvent> {
    let payload: EventPayload = serde_json::from_value(data.clone())
        .map_err(|e| InferError::DataParse(e.to_string()))?;

    let metric_id = [payload.resource.metric, payload.resource.metrics]
        .into_iter()
        .flatten()
        .find(|m| !m.is_empty())
        .ok_or_else(|| {
            InferError::DataParse("attribute \"Resource.metric\" required in abnormal event".into())
        })?;
    if payload.attributes.entity_id.is_empty() && payload.resource.labels.is_empty() {
        return Err(InferError::DataParse(
            "metric labels or entity id required in abnormal event".into(),
        ));
    }

    let desc = if payload.resource.description.is_empty() {
        payload.body
    } else {
        payload.resource.description
    };

    Ok(AbnormalEvent {
        timestamp: payload.timestamp.unwrap_or_default() as i64,
        metric_id,
        score: clamp_score(payload.resource.score),
        labels: stringify_labels(payload.resource.labels),
        entity_id: payload.attributes.entity_id,
        event_id: payload.attributes.event_id,
        desc,
        hist_data: Vec::new(),
    })
}

/// Parses the metric anomalies a KPI payload carries inline as
/// `Resource.cause_metrics`. Each one is stamped with the KPI timestamp and
/// event id; events whose entity id cannot be derived are dropped.
pub fn parse_inline_cause_metrics(
    data: &Value,
    registry: &ObserveMetaRegistry,
) -> Vec<AbnormalEvent> {
    let payload: EventPayload = match serde_json::from_value(data.clone()) {
        Ok(p) => p,
        Err(_) => return Vec::new(),
    };

    let timestamp = payload.timestamp.unwrap_or_default() as i64;
    let event_id = payload.attributes.event_id;

    let mut events = Vec::new();
    for inline in payload.resource.cause_metrics {
        let mut evt = AbnormalEvent {
            timestamp,
            metric_id: inline.metric,
            score: clamp_score(inline.score),
            labels: stringify_labels(inline.labels),
            entity_id: String::new(),
            event_id: event_id.clone(),
            desc: inline.description,
            hist_data: Vec::new(),
        };
        if !evt.update_entity_id(registry) {
            tracing::debug!(
                "can't identify entity id of the inline cause metric {}",
                evt.metric_id
            );
            continue;
        }
        events.push(evt);
    }
    events
}
