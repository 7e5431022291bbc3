use anyhow::{Context, Result};
use shared::{event_type, parse_event_body, OrderCreatedEvent, ORDER_CREATED};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::{ProcessedEvent, Shipment};
use crate::geocoding::Geocoder;
use crate::queue::{InboundMessage, MessageSource};
use crate::store::{EventLedger, ShipmentStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Not an `order_created` event.
    Ignored,
    /// Event id already in the ledger.
    Duplicate,
    /// A shipment for the order already existed; only the ledger was written.
    AlreadyExists,
    Created,
    /// The message can never be processed (bad JSON, bad payload, values that do not
    /// fit storage). It is logged and acknowledged so it does not hold up its partition.
    Rejected,
}

pub struct OrderEventConsumer {
    source: Arc<dyn MessageSource>,
    ledger: Arc<dyn EventLedger>,
    shipments: Arc<dyn ShipmentStore>,
    geocoder: Arc<dyn Geocoder>,
    batch_size: usize,
    poll_wait: Duration,
    retry_backoff: Duration,
}

impl OrderEventConsumer {
    pub fn new(
        config: &Config,
        source: Arc<dyn MessageSource>,
        ledger: Arc<dyn EventLedger>,
        shipments: Arc<dyn ShipmentStore>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        Self {
            source,
            ledger,
            shipments,
            geocoder,
            batch_size: config.poll_batch_size(),
            poll_wait: config.poll_wait(),
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Polls until `shutdown` flips to true. An in-flight message always finishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Order event consumer started");

        while !*shutdown.borrow() {
            let batch = tokio::select! {
                _ = shutdown.changed() => break,
                received = self.source.receive(self.batch_size, self.poll_wait) => received,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Error receiving order events: {:#}", e);
                    tokio::time::sleep(self.retry_backoff).await;
                    continue;
                }
            };

            let mut released = false;
            let mut pending = batch.into_iter();
            for message in pending.by_ref() {
                if !self.process(&message).await {
                    released = true;
                }
                if *shutdown.borrow() {
                    break;
                }
            }

            for message in pending {
                if let Err(e) = self.source.release(&message).await {
                    error!("Error releasing message at offset {}: {:#}", message.offset, e);
                }
            }

            if released {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        info!("Order event consumer stopped");
    }

    /// Handles one message and acknowledges or releases it. Returns whether it was acknowledged.
    ///
    /// Only errors from the ledger, the store or the connection pool release the message;
    /// those may succeed on redelivery.
    pub async fn process(&self, message: &InboundMessage) -> bool {
        match self.handle_message(message).await {
            Ok(outcome) => {
                debug!("Message at offset {} handled: {:?}", message.offset, outcome);
                if let Err(e) = self.source.acknowledge(message).await {
                    error!("Error acknowledging message at offset {}: {:#}", message.offset, e);
                }
                true
            }
            Err(e) => {
                error!(
                    "Error processing message at {}[{}]@{}, leaving it for redelivery: {:#}",
                    message.topic, message.partition, message.offset, e
                );
                if let Err(e) = self.source.release(message).await {
                    error!("Error releasing message at offset {}: {:#}", message.offset, e);
                }
                false
            }
        }
    }

    pub async fn handle_message(&self, message: &InboundMessage) -> Result<Outcome> {
        let (event, shipment) = match decode(&message.body) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Ok(Outcome::Ignored),
            Err(e) => {
                error!(
                    "Rejecting message at {}[{}]@{}, it will not be retried: {:#}",
                    message.topic, message.partition, message.offset, e
                );
                return Ok(Outcome::Rejected);
            }
        };

        self.handle_order_created(&event, shipment).await
    }

    async fn handle_order_created(&self, event: &OrderCreatedEvent, mut shipment: Shipment) -> Result<Outcome> {
        if self.ledger.has_been_processed(&event.event_id).await? {
            info!("Event {} already processed, skipping", event.event_id);
            return Ok(Outcome::Duplicate);
        }

        let outcome = if self.shipments.find_by_order_id(event.order_id).await?.is_some() {
            warn!("Shipment for order {} already exists", event.order_id);
            Outcome::AlreadyExists
        } else {
            self.geocode(&mut shipment).await;

            if self.shipments.insert(&shipment).await? {
                info!(
                    "Created shipment {} for order {} (geocoding {})",
                    shipment.id, shipment.order_id, shipment.geocoding_status
                );
                Outcome::Created
            } else {
                warn!("Shipment for order {} was created concurrently", event.order_id);
                Outcome::AlreadyExists
            }
        };

        let recorded = self
            .ledger
            .record(&ProcessedEvent::new(&event.event_id, ORDER_CREATED))
            .await
            .with_context(|| format!("Failed to record event {}", event.event_id))?;
        if !recorded {
            debug!("Event {} was recorded concurrently", event.event_id);
        }

        Ok(outcome)
    }

    /// Full address first, then city and country only. Failure is stored on the shipment.
    async fn geocode(&self, shipment: &mut Shipment) {
        let full = self
            .geocoder
            .geocode(
                &shipment.delivery_address,
                &shipment.delivery_city,
                &shipment.delivery_country,
            )
            .await;

        let error = match full {
            Ok(coordinates) => {
                shipment.set_coordinates(coordinates);
                return;
            }
            Err(e) => e,
        };

        warn!(
            "Geocoding failed for order {}: {}; falling back to city level",
            shipment.order_id, error
        );

        match self
            .geocoder
            .geocode("", &shipment.delivery_city, &shipment.delivery_country)
            .await
        {
            Ok(coordinates) => shipment.set_coordinates(coordinates),
            Err(e) => {
                warn!("City-level geocoding failed for order {}: {}", shipment.order_id, e);
                shipment.mark_geocoding_failed();
            }
        }
    }
}

/// Everything that can be checked without touching storage. Any error here fails
/// the same way on every delivery. `None` means the event is not for this service.
fn decode(body: &str) -> Result<Option<(OrderCreatedEvent, Shipment)>> {
    let body = parse_event_body(body)?;

    match event_type(&body) {
        Some(ORDER_CREATED) => {}
        other => {
            info!("Skipping event of type {:?}", other);
            return Ok(None);
        }
    }

    let event = OrderCreatedEvent::from_value(body)?;
    ProcessedEvent::validate_event_id(&event.event_id)?;
    let shipment = Shipment::from_order(&event)
        .with_context(|| format!("Invalid order_created event {}", event.event_id))?;

    Ok(Some((event, shipment)))
}
