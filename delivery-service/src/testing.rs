//! In-memory doubles for the store, geocoder, publisher and message source.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{Coordinates, ProcessedEvent, Route, RouteStatus, Shipment, ShipmentStatus, Vehicle};
use crate::geocoding::{build_query, Geocoder, GeocodingError};
use crate::publisher::EventPublisher;
use crate::queue::{InboundMessage, MessageSource};
use crate::store::{
    EventLedger, PageRequest, RouteFilter, RouteStore, ShipmentStore, StatusChange, VehicleRegistry,
};

#[derive(Default)]
struct State {
    events: HashMap<String, ProcessedEvent>,
    shipments: Vec<Shipment>,
    vehicles: Vec<Vehicle>,
    routes: Vec<Route>,
    route_inserts: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_route_insert_at: Option<usize>,
    ledger_failures: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `n`th route creation (1-based) fail without writing anything.
    pub fn failing_route_insert(n: usize) -> Self {
        Self {
            fail_route_insert_at: Some(n),
            ..Self::default()
        }
    }

    /// Makes the next `n` ledger writes fail, as a dropped connection would.
    pub fn failing_ledger_writes(self, n: usize) -> Self {
        self.ledger_failures.store(n, Ordering::SeqCst);
        self
    }

    pub async fn add_shipment(&self, shipment: Shipment) {
        self.state.lock().await.shipments.push(shipment);
    }

    pub async fn add_vehicle(&self, vehicle: Vehicle) {
        self.state.lock().await.vehicles.push(vehicle);
    }

    pub async fn shipments(&self) -> Vec<Shipment> {
        self.state.lock().await.shipments.clone()
    }

    pub async fn routes(&self) -> Vec<Route> {
        self.state.lock().await.routes.clone()
    }

    pub async fn processed_event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }
}

#[async_trait]
impl EventLedger for MemoryStore {
    async fn has_been_processed(&self, event_id: &str) -> Result<bool> {
        Ok(self.state.lock().await.events.contains_key(event_id))
    }

    async fn record(&self, event: &ProcessedEvent) -> Result<bool> {
        let injected = self
            .ledger_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            bail!("Connection reset while recording event {}", event.event_id);
        }

        let mut state = self.state.lock().await;
        if state.events.contains_key(&event.event_id) {
            return Ok(false);
        }
        state.events.insert(event.event_id.clone(), event.clone());
        Ok(true)
    }
}

#[async_trait]
impl ShipmentStore for MemoryStore {
    async fn insert(&self, shipment: &Shipment) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.shipments.iter().any(|s| s.order_id == shipment.order_id) {
            return Ok(false);
        }
        state.shipments.push(shipment.clone());
        Ok(true)
    }

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<Shipment>> {
        let state = self.state.lock().await;
        Ok(state.shipments.iter().find(|s| s.order_id == order_id).cloned())
    }

    async fn find_pending_by_date(&self, target_date: NaiveDate) -> Result<Vec<Shipment>> {
        let state = self.state.lock().await;
        Ok(state
            .shipments
            .iter()
            .filter(|s| s.target_date == target_date && s.status == ShipmentStatus::Pending)
            .cloned()
            .collect())
    }

    async fn count_pending_by_date(&self, target_date: NaiveDate) -> Result<i64> {
        Ok(self.find_pending_by_date(target_date).await?.len() as i64)
    }

    async fn find_by_route(&self, route_id: Uuid) -> Result<Vec<Shipment>> {
        let state = self.state.lock().await;
        let mut shipments: Vec<Shipment> = state
            .shipments
            .iter()
            .filter(|s| s.route_id == Some(route_id))
            .cloned()
            .collect();
        shipments.sort_by_key(|s| s.sequence_in_route);
        Ok(shipments)
    }

    async fn update_status(&self, change: StatusChange<ShipmentStatus>) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(apply_shipment_change(&mut state.shipments, &change))
    }
}

#[async_trait]
impl VehicleRegistry for MemoryStore {
    async fn insert(&self, vehicle: &Vehicle) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.vehicles.iter().any(|v| v.license_plate == vehicle.license_plate) {
            return Ok(false);
        }
        state.vehicles.push(vehicle.clone());
        Ok(true)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Vehicle>> {
        let state = self.state.lock().await;
        Ok(state.vehicles.iter().find(|v| v.id == id).cloned())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Vehicle>> {
        let state = self.state.lock().await;
        Ok(state.vehicles.iter().filter(|v| ids.contains(&v.id)).cloned().collect())
    }

    async fn list_active(&self) -> Result<Vec<Vehicle>> {
        let state = self.state.lock().await;
        let mut vehicles: Vec<Vehicle> = state.vehicles.iter().filter(|v| v.is_active).cloned().collect();
        vehicles.sort_by(|a, b| a.license_plate.cmp(&b.license_plate));
        Ok(vehicles)
    }

    async fn update(&self, vehicle: &Vehicle) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.vehicles.iter_mut().find(|v| v.id == vehicle.id) {
            Some(stored) => {
                *stored = vehicle.clone();
                Ok(())
            }
            None => bail!("Vehicle {} not found", vehicle.id),
        }
    }
}

#[async_trait]
impl RouteStore for MemoryStore {
    async fn create_with_assignments(&self, route: &Route, shipments: &[Shipment]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.route_inserts += 1;
        if self.fail_route_insert_at == Some(state.route_inserts) {
            bail!("Injected failure on route insert {}", state.route_inserts);
        }

        for shipment in shipments {
            let pending = state
                .shipments
                .iter()
                .any(|s| s.id == shipment.id && s.status == ShipmentStatus::Pending);
            if !pending {
                bail!("Shipment {} is no longer pending", shipment.id);
            }
        }

        for shipment in shipments {
            if let Some(stored) = state.shipments.iter_mut().find(|s| s.id == shipment.id) {
                stored.route_id = shipment.route_id;
                stored.sequence_in_route = shipment.sequence_in_route;
                stored.status = shipment.status;
            }
        }
        state.routes.push(route.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Route>> {
        let state = self.state.lock().await;
        Ok(state.routes.iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, filter: &RouteFilter, page: &PageRequest) -> Result<(Vec<Route>, i64)> {
        let state = self.state.lock().await;
        let mut matching: Vec<Route> = state
            .routes
            .iter()
            .filter(|r| filter.route_date.map_or(true, |date| r.route_date == date))
            .filter(|r| filter.status.map_or(true, |status| r.status == status))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.route_date
                .cmp(&a.route_date)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect();
        Ok((items, total))
    }

    async fn update_status(
        &self,
        route: StatusChange<RouteStatus>,
        shipments: &[StatusChange<ShipmentStatus>],
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state
            .routes
            .iter_mut()
            .find(|r| r.id == route.id && r.status == route.from)
        {
            Some(stored) => stored.status = route.to,
            None => return Ok(false),
        }
        for change in shipments {
            apply_shipment_change(&mut state.shipments, change);
        }
        Ok(true)
    }
}

fn apply_shipment_change(shipments: &mut [Shipment], change: &StatusChange<ShipmentStatus>) -> bool {
    match shipments
        .iter_mut()
        .find(|s| s.id == change.id && s.status == change.from)
    {
        Some(stored) => {
            stored.status = change.to;
            true
        }
        None => false,
    }
}

/// Serves route and shipment reads from a snapshot and writes to the live store,
/// the way a request that read before a concurrent commit would see things.
pub struct StaleView {
    live: Arc<MemoryStore>,
    shipments: Vec<Shipment>,
    routes: Vec<Route>,
}

impl StaleView {
    pub async fn capture(live: Arc<MemoryStore>) -> Self {
        let (shipments, routes) = {
            let state = live.state.lock().await;
            (state.shipments.clone(), state.routes.clone())
        };
        Self {
            live,
            shipments,
            routes,
        }
    }
}

#[async_trait]
impl ShipmentStore for StaleView {
    async fn insert(&self, shipment: &Shipment) -> Result<bool> {
        ShipmentStore::insert(&*self.live, shipment).await
    }

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<Shipment>> {
        Ok(self.shipments.iter().find(|s| s.order_id == order_id).cloned())
    }

    async fn find_pending_by_date(&self, target_date: NaiveDate) -> Result<Vec<Shipment>> {
        self.live.find_pending_by_date(target_date).await
    }

    async fn count_pending_by_date(&self, target_date: NaiveDate) -> Result<i64> {
        self.live.count_pending_by_date(target_date).await
    }

    async fn find_by_route(&self, route_id: Uuid) -> Result<Vec<Shipment>> {
        let mut shipments: Vec<Shipment> = self
            .shipments
            .iter()
            .filter(|s| s.route_id == Some(route_id))
            .cloned()
            .collect();
        shipments.sort_by_key(|s| s.sequence_in_route);
        Ok(shipments)
    }

    async fn update_status(&self, change: StatusChange<ShipmentStatus>) -> Result<bool> {
        ShipmentStore::update_status(&*self.live, change).await
    }
}

#[async_trait]
impl RouteStore for StaleView {
    async fn create_with_assignments(&self, route: &Route, shipments: &[Shipment]) -> Result<()> {
        self.live.create_with_assignments(route, shipments).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Route>> {
        Ok(self.routes.iter().find(|r| r.id == id).cloned())
    }

    async fn list(&self, filter: &RouteFilter, page: &PageRequest) -> Result<(Vec<Route>, i64)> {
        self.live.list(filter, page).await
    }

    async fn update_status(
        &self,
        route: StatusChange<RouteStatus>,
        shipments: &[StatusChange<ShipmentStatus>],
    ) -> Result<bool> {
        RouteStore::update_status(&*self.live, route, shipments).await
    }
}

/// Answers from a fixed table keyed by the joined query string.
#[derive(Default)]
pub struct FakeGeocoder {
    answers: HashMap<String, Coordinates>,
    calls: AtomicUsize,
}

impl FakeGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, address: &str, city: &str, country: &str, coordinates: Coordinates) -> Self {
        self.answers.insert(build_query(address, city, country), coordinates);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Geocoder for FakeGeocoder {
    async fn geocode(&self, address: &str, city: &str, country: &str) -> Result<Coordinates, GeocodingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let query = build_query(address, city, country);
        self.answers
            .get(&query)
            .copied()
            .ok_or(GeocodingError::NoResults(query))
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: AtomicUsize,
    fail: bool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            published: AtomicUsize::new(0),
            fail: true,
        }
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_routes_generated(&self) -> Result<()> {
        if self.fail {
            bail!("Broker unavailable");
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A single-partition log read from a cursor, with the commit and rewind rules of
/// the Kafka source: a release rewinds the next receive to the lowest released offset,
/// and acknowledgements at or past a pending rewind are dropped.
#[derive(Default)]
pub struct MemoryMessageSource {
    log: Mutex<Log>,
    acknowledged: Mutex<Vec<InboundMessage>>,
    released: Mutex<Vec<InboundMessage>>,
}

#[derive(Default)]
struct Log {
    bodies: Vec<String>,
    position: usize,
    rewind: Option<usize>,
}

impl MemoryMessageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push(&self, body: impl Into<String>) {
        self.log.lock().await.bodies.push(body.into());
    }

    pub async fn acknowledged(&self) -> Vec<InboundMessage> {
        self.acknowledged.lock().await.clone()
    }

    pub async fn released(&self) -> Vec<InboundMessage> {
        self.released.lock().await.clone()
    }
}

#[async_trait]
impl MessageSource for MemoryMessageSource {
    async fn receive(&self, max_messages: usize, _wait: Duration) -> Result<Vec<InboundMessage>> {
        let batch: Vec<InboundMessage> = {
            let mut log = self.log.lock().await;
            if let Some(offset) = log.rewind.take() {
                log.position = offset;
            }
            let start = log.position;
            let end = (start + max_messages).min(log.bodies.len());
            log.position = end;
            (start..end)
                .map(|offset| InboundMessage {
                    body: log.bodies[offset].clone(),
                    topic: "order-events".to_string(),
                    partition: 0,
                    offset: offset as i64,
                })
                .collect()
        };
        if batch.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(batch)
    }

    async fn acknowledge(&self, message: &InboundMessage) -> Result<()> {
        let behind_rewind = matches!(
            self.log.lock().await.rewind,
            Some(rewind) if rewind as i64 <= message.offset
        );
        if !behind_rewind {
            self.acknowledged.lock().await.push(message.clone());
        }
        Ok(())
    }

    async fn release(&self, message: &InboundMessage) -> Result<()> {
        self.released.lock().await.push(message.clone());
        let offset = message.offset as usize;
        let mut log = self.log.lock().await;
        log.rewind = Some(log.rewind.map_or(offset, |rewind| rewind.min(offset)));
        Ok(())
    }
}
