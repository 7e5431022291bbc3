use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::{RoutesGeneratedEvent, DELIVERY_ROUTES_GENERATED, EVENT_TYPE_ATTRIBUTE};
use std::time::Duration;
use tracing::info;

use crate::config::Config;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Announces that a generation run finished. Carries no route details.
    async fn publish_routes_generated(&self) -> Result<()>;
}

pub struct KafkaEventPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventPublisher {
    pub fn from_config(config: &Config) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("Failed to create Kafka producer")?;

        Ok(Self {
            producer,
            topic: config.routes_generated_topic.clone(),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish_routes_generated(&self) -> Result<()> {
        let json = serde_json::to_string(&RoutesGeneratedEvent::new())?;
        let headers = OwnedHeaders::new().insert(Header {
            key: EVENT_TYPE_ATTRIBUTE,
            value: Some(DELIVERY_ROUTES_GENERATED),
        });
        let record = FutureRecord::to(&self.topic)
            .payload(&json)
            .key(DELIVERY_ROUTES_GENERATED)
            .headers(headers);

        let (partition, offset) = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish {}: {}", DELIVERY_ROUTES_GENERATED, e))?;

        info!(
            "Published {} to {} (partition {}, offset {})",
            DELIVERY_ROUTES_GENERATED, self.topic, partition, offset
        );
        Ok(())
    }
}
