//! Time-series client over the Prometheus range-query API.
//!
//! Series come back as raw samples and are bucketized onto a fixed,
//! evenly-spaced grid so every metric yields the same sample count; gaps are
//! filled with zeros.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::clients::MetricStore;
use crate::schemas::metadata::ObserveMetaRegistry;

/// One raw sample from the range endpoint.
#[derive(Debug, Clone, Copy)]
pub struct DataRecord {
    pub timestamp: f64,
    pub value: f64,
}

fn range_query_expr(metric_id: &str, query_options: &HashMap<String, String>) -> String {
    if query_options.is_empty() {
        return metric_id.to_string();
    }
    let mut keys: Vec<&String> = query_options.keys().collect();
    keys.sort();
    let selectors: Vec<String> = keys
        .iter()
        .map(|k| format!("{k}=\"{}\"", query_options[*k]))
        .collect();
    format!("{metric_id}{{{}}}", selectors.join(", "))
}

/// Prometheus HTTP collector for range data.
#[derive(Debug, Clone)]
pub struct PrometheusCollector {
    http: reqwest::Client,
    base_url: String,
    range_api: String,
}

impl PrometheusCollector {
    pub fn new(base_url: impl Into<String>, range_api: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            range_api: range_api.into(),
        }
    }

    /// Fetches raw range samples; any transport or status failure degrades
    /// to an empty record set.
    pub async fn get_range_data(
        &self,
        metric_id: &str,
        start: i64,
        end: i64,
        step: i64,
        query_options: &HashMap<String, String>,
    ) -> Vec<DataRecord> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), self.range_api);
        let query = range_query_expr(metric_id, query_options);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("query", query.as_str()),
                ("start", &start.to_string()),
                ("end", &end.to_string()),
                ("step", &step.to_string()),
            ])
            .send()
            .await;

        let body: Value = match resp {
            Ok(resp) => match resp.json().await {
                Ok(body) => body,
                Err(err) => {
                    tracing::error!("invalid time-series response: {err}");
                    return Vec::new();
                }
            },
            Err(err) => {
                tracing::error!("time-series request failed: {err}");
                return Vec::new();
            }
        };

        if body.get("status").and_then(Value::as_str) != Some("success") {
            tracing::warn!("failed to request {url}, response is: {body}");
            return Vec::new();
        }
        parse_range_result(&body)
    }
}

fn parse_range_result(body: &Value) -> Vec<DataRecord> {
    let mut records = Vec::new();
    let result = body
        .get("data")
        .and_then(|d| d.get("result"))
        .and_then(Value::as_array);
    for series in result.into_iter().flatten() {
        let values = series.get("values").and_then(Value::as_array);
        for pair in values.into_iter().flatten() {
            let Some(pair) = pair.as_array() else {
                continue;
            };
            let (Some(ts), Some(val)) = (pair.first(), pair.get(1)) else {
                continue;
            };
            let Some(timestamp) = ts.as_f64() else {
                continue;
            };
            let value = match val {
                Value::String(s) => s.parse::<f64>().ok(),
                other => other.as_f64(),
            };
            if let Some(value) = value {
                records.push(DataRecord { timestamp, value });
            }
        }
    }
    records
}

/// Places raw samples onto the fixed grid covering
/// `[end_ts - sample_duration, end_ts]`. Bucket `i` ends at
/// `end_ts - (sample_num - 1 - i) * step`; a sample lands in the earliest
/// bucket whose endpoint is at or after it, provided it is no older than two
/// steps before that endpoint. Empty buckets hold zero.
pub fn fill_hist_data(
    records: &[DataRecord],
    end_ts: i64,
    sample_duration: i64,
    step: i64,
) -> Vec<f64> {
    let sample_num = (sample_duration / step).max(0) as usize;
    let start_ts = end_ts - sample_duration;
    let mut res = vec![0.0; sample_num];

    let mut i = 0usize;
    let mut j = 0usize;
    while i < sample_num && j < records.len() {
        let bucket_end = (start_ts + (i as i64 + 1) * step) as f64;
        if bucket_end < records[j].timestamp {
            i += 1;
            continue;
        }
        if records[j].timestamp + ((2 * step) as f64) < bucket_end {
            j += 1;
            continue;
        }
        res[i] = records[j].value;
        i += 1;
        j += 1;
    }
    res
}

/// [`MetricStore`] over the Prometheus collector, reducing query labels to
/// the entity-identifying subset before fetching.
pub struct TimeSeriesClient {
    collector: PrometheusCollector,
    sample_duration: i64,
    step: i64,
    registry: Arc<ObserveMetaRegistry>,
}

impl TimeSeriesClient {
    pub fn new(
        collector: PrometheusCollector,
        sample_duration: i64,
        step: i64,
        registry: Arc<ObserveMetaRegistry>,
    ) -> Self {
        Self {
            collector,
            sample_duration,
            step,
            registry,
        }
    }

    fn empty_series(&self) -> Vec<f64> {
        vec![0.0; (self.sample_duration / self.step).max(0) as usize]
    }
}

#[async_trait]
impl MetricStore for TimeSeriesClient {
    async fn hist_data(
        &self,
        metric_id: &str,
        labels: &HashMap<String, String>,
        end_ts: i64,
    ) -> Vec<f64> {
        let query_options = match self.registry.entity_keys_of_metric(metric_id, labels) {
            Ok(options) => options,
            Err(err) => {
                tracing::debug!("{err}");
                return self.empty_series();
            }
        };

        let start_ts = end_ts - self.sample_duration;
        let records = self
            .collector
            .get_range_data(metric_id, start_ts, end_ts, self.step, &query_options)
            .await;
        if records.is_empty() {
            tracing::warn!("no history data of the metric {metric_id}");
            return self.empty_series();
        }
        fill_hist_data(&records, end_ts, self.sample_duration, self.step)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_range_query_expr() {
        let mut options = HashMap::new();
        options.insert("machine_id".to_string(), "m1".to_string());
        options.insert("tgid".to_string(), "42".to_string());
        assert_eq!(
            range_query_expr("gala_gopher_proc_cpu_util", &options),
            "gala_gopher_proc_cpu_util{machine_id=\"m1\", tgid=\"42\"}"
        );
        assert_eq!(range_query_expr("up", &HashMap::new()), "up");
    }

    #[test]
    fn test_parse_range_result_flattens_series() {
        let body = json!({
            "status": "success",
            "data": {"result": [
                {"metric": {"__name__": "m"}, "values": [[100, "1.5"], [105, "2.5"]]},
                {"metric": {"__name__": "m"}, "values": [[110, 3.5]]}
            ]}
        });
        let records = parse_range_result(&body);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].value, 1.5);
        assert_eq!(records[2].value, 3.5);
    }

    #[test]
    fn test_fill_hist_data_grid_alignment() {
        // end 60, duration 20, step 5 -> buckets end at 45, 50, 55, 60
        let records = [
            DataRecord { timestamp: 44.0, value: 1.0 },
            DataRecord { timestamp: 50.0, value: 2.0 },
            DataRecord { timestamp: 59.0, value: 3.0 },
        ];
        let series = fill_hist_data(&records, 60, 20, 5);
        assert_eq!(series, vec![1.0, 2.0, 0.0, 3.0]);
    }

    #[test]
    fn test_fill_hist_data_discards_stale_samples() {
        // a sample more than two steps older than the bucket end is skipped
        let records = [
            DataRecord { timestamp: 10.0, value: 9.0 },
            DataRecord { timestamp: 58.0, value: 1.0 },
        ];
        let series = fill_hist_data(&records, 60, 20, 5);
        assert_eq!(series, vec![0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_fill_hist_data_empty_records() {
        assert_eq!(fill_hist_data(&[], 60, 20, 5), vec![0.0; 4]);
    }
}
