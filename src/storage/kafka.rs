// Kafka driver for the outbound bus. One record per recipient; the
// platform gateways consume the per-service topics.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde_json::{json, Map, Value};

use crate::config::BusConfig;
use crate::error::{DispatchError, Result};
use crate::storage::PushBus;

pub struct KafkaPushBus {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPushBus {
    pub fn new(config: &BusConfig) -> Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| DispatchError::Bus(format!("producer init: {}", e)))?;
        Ok(Self {
            producer,
            timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn publish(
        &self,
        topic: &str,
        device_token: &str,
        body: &Map<String, Value>,
        metadata: &Map<String, Value>,
        push_metadata: &Map<String, Value>,
        push_expiry: i64,
        template_name: &str,
    ) -> Result<()> {
        let envelope = json!({
            "deviceToken": device_token,
            "payload": body,
            "metadata": metadata,
            "pushMetadata": push_metadata,
            "pushExpiry": push_expiry,
            "templateName": template_name,
        })
        .to_string();

        let record = FutureRecord::to(topic).key(device_token).payload(&envelope);
        self.producer
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _)| DispatchError::Bus(format!("publish to {}: {}", topic, e)))?;
        Ok(())
    }
}

#[async_trait]
impl PushBus for KafkaPushBus {
    async fn send_apns_push(
        &self,
        topic: &str,
        device_token: &str,
        body: &Map<String, Value>,
        metadata: &Map<String, Value>,
        push_metadata: &Map<String, Value>,
        push_expiry: i64,
        template_name: &str,
    ) -> Result<()> {
        self.publish(
            topic,
            device_token,
            body,
            metadata,
            push_metadata,
            push_expiry,
            template_name,
        )
        .await
    }

    async fn send_gcm_push(
        &self,
        topic: &str,
        device_token: &str,
        body: &Map<String, Value>,
        metadata: &Map<String, Value>,
        push_metadata: &Map<String, Value>,
        push_expiry: i64,
        template_name: &str,
    ) -> Result<()> {
        self.publish(
            topic,
            device_token,
            body,
            metadata,
            push_metadata,
            push_expiry,
            template_name,
        )
        .await
    }
}
