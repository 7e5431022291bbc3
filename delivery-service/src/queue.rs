use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::config::Config;

/// How long a receive keeps collecting once the first message has arrived.
const BATCH_LINGER: Duration = Duration::from_millis(100);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub body: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// At-least-once message source. A message that is neither acknowledged nor
/// released is redelivered eventually; a released one is redelivered on the
/// next receive.
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<InboundMessage>>;

    async fn acknowledge(&self, message: &InboundMessage) -> Result<()>;

    async fn release(&self, message: &InboundMessage) -> Result<()>;
}

pub struct KafkaMessageSource {
    consumer: StreamConsumer,
    // Lowest released offset per (topic, partition), applied as a seek before the next receive.
    rewinds: Mutex<HashMap<(String, i32), i64>>,
}

impl KafkaMessageSource {
    pub fn from_config(config: &Config) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &config.consumer_group)
            .set("bootstrap.servers", &config.kafka_brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .context("Failed to create Kafka consumer")?;

        consumer
            .subscribe(&[&config.order_events_topic])
            .with_context(|| format!("Failed to subscribe to {}", config.order_events_topic))?;

        Ok(Self {
            consumer,
            rewinds: Mutex::new(HashMap::new()),
        })
    }

    async fn apply_rewinds(&self) -> Result<()> {
        let mut rewinds = self.rewinds.lock().await;
        for ((topic, partition), offset) in rewinds.drain() {
            debug!("Rewinding {}[{}] to offset {}", topic, partition, offset);
            self.consumer
                .seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
                .with_context(|| format!("Failed to seek {topic}[{partition}] to {offset}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for KafkaMessageSource {
    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<InboundMessage>> {
        self.apply_rewinds().await?;

        let mut deadline = Instant::now() + wait;
        let mut batch = Vec::with_capacity(max_messages);
        let mut message_stream = self.consumer.stream();

        while batch.len() < max_messages {
            let next = match time::timeout_at(deadline, message_stream.next()).await {
                Ok(next) => next,
                Err(_) => break,
            };

            match next {
                Some(Ok(m)) => {
                    let body = match m.payload_view::<str>() {
                        Some(Ok(text)) => text.to_string(),
                        Some(Err(e)) => {
                            warn!("Non UTF-8 payload at {}[{}]@{}: {}", m.topic(), m.partition(), m.offset(), e);
                            String::from_utf8_lossy(m.payload().unwrap_or_default()).into_owned()
                        }
                        None => String::new(),
                    };
                    batch.push(InboundMessage {
                        body,
                        topic: m.topic().to_string(),
                        partition: m.partition(),
                        offset: m.offset(),
                    });
                    deadline = deadline.min(Instant::now() + BATCH_LINGER);
                }
                Some(Err(e)) if batch.is_empty() => return Err(e).context("Error receiving message"),
                Some(Err(e)) => {
                    warn!("Error receiving message, returning partial batch: {}", e);
                    break;
                }
                None => break,
            }
        }

        Ok(batch)
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<()> {
        let rewinds = self.rewinds.lock().await;
        if let Some(&rewind) = rewinds.get(&(message.topic.clone(), message.partition)) {
            if rewind <= message.offset {
                debug!(
                    "Skipping commit of {}[{}]@{} behind released offset {}",
                    message.topic, message.partition, message.offset, rewind
                );
                return Ok(());
            }
        }
        drop(rewinds);

        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&message.topic, message.partition, Offset::Offset(message.offset + 1))?;
        self.consumer
            .commit(&tpl, CommitMode::Async)
            .context("Error committing message")?;
        Ok(())
    }

    async fn release(&self, message: &InboundMessage) -> Result<()> {
        let mut rewinds = self.rewinds.lock().await;
        rewinds
            .entry((message.topic.clone(), message.partition))
            .and_modify(|offset| *offset = (*offset).min(message.offset))
            .or_insert(message.offset);
        Ok(())
    }
}
