//! Cause-event publisher.
//!
//! Wraps the inference result envelope and sends it key-less onto the
//! configured inference topic; publishing errors are logged and never
//! interrupt the loop.

use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord};
use serde_json::Value;

use crate::error::{InferError, Result};
use crate::pipeline::consumer::BrokerAuth;

/// Kafka producer for the inference topic.
pub struct CausePublisher {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl CausePublisher {
    pub fn new(auth: &BrokerAuth, topic: impl Into<String>) -> Result<Self> {
        let producer: FutureProducer = auth
            .client_config()
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| InferError::Inference(format!("failed to create producer: {e}")))?;
        Ok(Self {
            producer,
            topic: topic.into(),
            send_timeout: Duration::from_secs(5),
        })
    }

    /// Publishes one cause message; failures are logged, not propagated.
    pub async fn publish(&self, message: &Value) {
        let payload = message.to_string();
        let record: FutureRecord<'_, (), String> =
            FutureRecord::to(&self.topic).payload(&payload);
        match self.producer.send(record, self.send_timeout).await {
            Ok(_) => {
                tracing::info!("a cause inferring event has been sent to the broker");
            }
            Err((err, _)) => {
                tracing::error!("failed to publish cause event: {err}");
            }
        }
    }
}
