//! Abnormal-event aggregator.
//!
//! Time-aligns the KPI and metric anomaly streams around each triggering KPI
//! timestamp: metric events inside the valid window ride along with the KPI,
//! aged events are evicted, and events arriving up to the future horizon are
//! still accepted. The KPI and metric watermarks are kept strictly separate.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{InferError, Result};
use crate::models::event::AbnormalEvent;
use crate::pipeline::consumer::EventSource;
use crate::schemas::events::{self, APP_EVENT_TYPE};
use crate::schemas::metadata::ObserveMetaRegistry;

/// Aggregator window settings, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    /// Metric events within `[kpi_ts - valid, kpi_ts + future]` ride along.
    pub valid_duration: i64,
    /// How far past the KPI timestamp metric events are still accepted.
    pub future_duration: i64,
    /// Metric events older than `kpi_ts - aging` are evicted.
    pub aging_duration: i64,
}

/// Aggregates the two anomaly streams into `(KPI, candidate metrics)` pairs.
pub struct EventAggregator<K, M> {
    kpi_source: K,
    metric_source: M,
    registry: Arc<ObserveMetaRegistry>,

    valid_duration_ms: i64,
    future_duration_ms: i64,
    aging_duration_ms: i64,

    metric_events: Vec<AbnormalEvent>,
    kpi_queue: VecDeque<AbnormalEvent>,
    last_kpi_ts: i64,
    last_metric_ts: i64,
}

impl<K: EventSource, M: EventSource> EventAggregator<K, M> {
    pub fn new(
        kpi_source: K,
        metric_source: M,
        registry: Arc<ObserveMetaRegistry>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            kpi_source,
            metric_source,
            registry,
            valid_duration_ms: config.valid_duration * 1000,
            future_duration_ms: config.future_duration * 1000,
            aging_duration_ms: config.aging_duration * 1000,
            metric_events: Vec::new(),
            kpi_queue: VecDeque::new(),
            last_kpi_ts: 0,
            last_metric_ts: 0,
        }
    }

    /// Dequeues one triggering KPI and returns it with the buffered metric
    /// events that fall inside its valid window. Fails with `NoKpi` when no
    /// KPI is queued.
    pub async fn get_abnormal_info(&mut self) -> Result<(AbnormalEvent, Vec<AbnormalEvent>)> {
        let kpi = self.kpi_queue.pop_front().ok_or(InferError::NoKpi)?;

        self.consume_kpi_events_until(kpi.timestamp).await;
        self.consume_metric_events_until(kpi.timestamp).await;
        self.clear_aging_events(kpi.timestamp);
        let metric_events = self.filter_valid_events(kpi.timestamp);

        Ok((kpi, metric_events))
    }

    /// Drives the KPI stream until a triggering KPI is queued or the stream
    /// goes silent.
    pub async fn consume_kpi_events(&mut self) {
        loop {
            let Some(payload) = self.poll_kpi().await else {
                return;
            };
            let Some(data) = parse_json(&payload) else {
                continue;
            };
            self.process_kpi_event(&data);
            self.last_kpi_ts = self.last_kpi_ts.max(event_ts(&data));
            if !self.kpi_queue.is_empty() {
                return;
            }
        }
    }

    /// Drives the KPI stream forward until its watermark passes
    /// `cur_ts + future`, so later same-timestamp KPIs are also buffered
    /// into the metric pool.
    async fn consume_kpi_events_until(&mut self, cur_ts: i64) {
        if self.is_future(self.last_kpi_ts, cur_ts) {
            return;
        }
        loop {
            let Some(payload) = self.poll_kpi().await else {
                return;
            };
            let Some(data) = parse_json(&payload) else {
                continue;
            };
            self.process_kpi_event(&data);
            let evt_ts = event_ts(&data);
            self.last_kpi_ts = self.last_kpi_ts.max(evt_ts);
            if self.is_future(evt_ts, cur_ts) {
                return;
            }
        }
    }

    /// Drives the metric stream forward until its watermark passes
    /// `cur_ts + future`, dropping already-aged events and buffering the
    /// rest.
    async fn consume_metric_events_until(&mut self, cur_ts: i64) {
        if self.is_future(self.last_metric_ts, cur_ts) {
            return;
        }
        loop {
            let Some(payload) = self.poll_metric().await else {
                return;
            };
            let Some(data) = parse_json(&payload) else {
                continue;
            };
            let evt_ts = event_ts(&data);
            self.last_metric_ts = self.last_metric_ts.max(evt_ts);
            if !self.is_aging(evt_ts, cur_ts) {
                self.process_metric_event(&data);
            }
            if self.is_future(evt_ts, cur_ts) {
                return;
            }
        }
    }

    async fn poll_kpi(&mut self) -> Option<Vec<u8>> {
        match self.kpi_source.poll().await {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("{err}");
                None
            }
        }
    }

    async fn poll_metric(&mut self) -> Option<Vec<u8>> {
        match self.metric_source.poll().await {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!("{err}");
                None
            }
        }
    }

    /// Every KPI-stream event lands in the metric buffer; `app`-typed ones
    /// are additionally enqueued as triggering KPIs, and any inline cause
    /// metrics ride along into the buffer.
    fn process_kpi_event(&mut self, data: &Value) {
        let mut event = match events::parse_event(data) {
            Ok(event) => event,
            Err(err) => {
                tracing::error!("{err}");
                return;
            }
        };
        if !event.update_entity_id(&self.registry) {
            tracing::warn!(
                "can't identify entity id of the abnormal kpi {}",
                event.metric_id
            );
            return;
        }

        self.metric_events.push(event.clone());
        if events::event_type(data) == APP_EVENT_TYPE {
            self.kpi_queue.push_back(event);
        }

        let inline = events::parse_inline_cause_metrics(data, &self.registry);
        self.metric_events.extend(inline);
    }

    fn process_metric_event(&mut self, data: &Value) {
        let mut event = match events::parse_event(data) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!("{err}");
                return;
            }
        };
        if !event.update_entity_id(&self.registry) {
            tracing::debug!("can't identify entity id of the metric {}", event.metric_id);
            return;
        }
        self.metric_events.push(event);
    }

    fn filter_valid_events(&self, cur_ts: i64) -> Vec<AbnormalEvent> {
        self.metric_events
            .iter()
            .filter(|evt| self.is_valid(evt.timestamp, cur_ts))
            .cloned()
            .collect()
    }

    fn clear_aging_events(&mut self, cur_ts: i64) {
        let aging_duration_ms = self.aging_duration_ms;
        self.metric_events
            .retain(|evt| evt.timestamp + aging_duration_ms >= cur_ts);
    }

    fn is_valid(&self, evt_ts: i64, cur_ts: i64) -> bool {
        cur_ts - self.valid_duration_ms < evt_ts && evt_ts <= cur_ts + self.future_duration_ms
    }

    fn is_aging(&self, evt_ts: i64, cur_ts: i64) -> bool {
        evt_ts + self.aging_duration_ms < cur_ts
    }

    fn is_future(&self, evt_ts: i64, cur_ts: i64) -> bool {
        evt_ts > cur_ts + self.future_duration_ms
    }

    /// Buffered metric-event count, for diagnostics.
    pub fn buffered_len(&self) -> usize {
        self.metric_events.len()
    }
}

fn parse_json(payload: &[u8]) -> Option<Value> {
    match serde_json::from_slice(payload) {
        Ok(data) => Some(data),
        Err(err) => {
            tracing::warn!("{err}");
            None
        }
    }
}

fn event_ts(data: &Value) -> i64 {
    data.get("Timestamp")
        .and_then(Value::as_f64)
        .unwrap_or_default() as i64
}
