//! Broker event sources.
//!
//! Each stream is consumed through the [`EventSource`] trait so the
//! aggregator and the tests never touch Kafka directly. The Kafka
//! implementation translates a silent stream into `None` via a per-stream
//! poll timeout.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;

use crate::error::{InferError, Result};

/// A raw-payload stream with bounded polling.
#[async_trait]
pub trait EventSource: Send {
    /// The next payload, or `None` when the stream stays silent for the
    /// poll timeout.
    async fn poll(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Broker connection settings shared by all consumers and the producer.
#[derive(Debug, Clone, Default)]
pub struct BrokerAuth {
    pub server: String,
    pub auth_type: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerAuth {
    /// Base client config with SASL/PLAIN applied when configured.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.server);
        if self.auth_type.as_deref() == Some("sasl_plaintext") {
            config
                .set("security.protocol", "SASL_PLAINTEXT")
                .set("sasl.mechanism", "PLAIN")
                .set("sasl.username", self.username.clone().unwrap_or_default())
                .set("sasl.password", self.password.clone().unwrap_or_default());
        }
        config
    }
}

/// Kafka-backed [`EventSource`] for one topic.
pub struct KafkaEventSource {
    consumer: StreamConsumer,
    poll_timeout: Duration,
}

impl KafkaEventSource {
    pub fn new(
        auth: &BrokerAuth,
        topic: &str,
        group_id: &str,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let consumer: StreamConsumer = auth
            .client_config()
            .set("group.id", group_id)
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| InferError::Inference(format!("failed to create consumer: {e}")))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| InferError::Inference(format!("failed to subscribe to {topic}: {e}")))?;
        Ok(Self {
            consumer,
            poll_timeout,
        })
    }
}

#[async_trait]
impl EventSource for KafkaEventSource {
    async fn poll(&mut self) -> Result<Option<Vec<u8>>> {
        match tokio::time::timeout(self.poll_timeout, self.consumer.recv()).await {
            Ok(Ok(message)) => Ok(Some(
                message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            )),
            Ok(Err(err)) => {
                tracing::error!("kafka consumer error: {err}");
                Ok(None)
            }
            Err(_elapsed) => Ok(None),
        }
    }
}

/// In-memory source for tests and replays.
#[derive(Debug, Default)]
pub struct VecEventSource {
    payloads: std::collections::VecDeque<Vec<u8>>,
}

impl VecEventSource {
    pub fn new(payloads: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            payloads: payloads.into_iter().collect(),
        }
    }

    pub fn push(&mut self, payload: Vec<u8>) {
        self.payloads.push_back(payload);
    }
}

#[async_trait]
impl EventSource for VecEventSource {
    async fn poll(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.payloads.pop_front())
    }
}
