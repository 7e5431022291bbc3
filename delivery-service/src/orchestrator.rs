use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{Route, Shipment, Vehicle};
use crate::error::{DeliveryError, DeliveryResult};
use crate::optimizer::{self, RoutePlan};
use crate::publisher::EventPublisher;
use crate::store::{RouteStore, ShipmentStore, VehicleRegistry};

/// Batch job turning the pending shipments of a date into planned routes.
pub struct RouteGenerator {
    shipments: Arc<dyn ShipmentStore>,
    vehicles: Arc<dyn VehicleRegistry>,
    routes: Arc<dyn RouteStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl RouteGenerator {
    pub fn new(
        shipments: Arc<dyn ShipmentStore>,
        vehicles: Arc<dyn VehicleRegistry>,
        routes: Arc<dyn RouteStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            shipments,
            vehicles,
            routes,
            publisher,
        }
    }

    /// Pending shipments for `target_date` right now. May differ from what a
    /// later run picks up.
    pub async fn pending_count(&self, target_date: NaiveDate) -> DeliveryResult<i64> {
        Ok(self.shipments.count_pending_by_date(target_date).await?)
    }

    /// Runs `generate` in the background; the outcome is only logged.
    pub fn spawn(self: &Arc<Self>, target_date: NaiveDate, vehicle_ids: Vec<Uuid>) -> JoinHandle<()> {
        let generator = Arc::clone(self);
        tokio::spawn(async move {
            match generator.generate(target_date, &vehicle_ids).await {
                Ok(routes) => info!("Route generation for {} produced {} routes", target_date, routes.len()),
                Err(e) => error!("Route generation for {} aborted: {}", target_date, e),
            }
        })
    }

    pub async fn generate(&self, target_date: NaiveDate, vehicle_ids: &[Uuid]) -> DeliveryResult<Vec<Route>> {
        if vehicle_ids.is_empty() {
            return Err(DeliveryError::validation("vehicle_ids cannot be empty"));
        }

        let pending = self.shipments.find_pending_by_date(target_date).await?;
        if pending.is_empty() {
            info!("No pending shipments for {}", target_date);
            return Ok(Vec::new());
        }

        let vehicles = self.resolve_vehicles(vehicle_ids).await?;

        let (geocoded, excluded): (Vec<Shipment>, Vec<Shipment>) =
            pending.into_iter().partition(Shipment::is_geocoded);
        if !excluded.is_empty() {
            warn!(
                "Excluding {} shipments without coordinates from routes for {}",
                excluded.len(),
                target_date
            );
        }

        let plans = optimizer::optimize(&geocoded, &vehicles)?;

        let mut created = Vec::with_capacity(plans.len());
        for plan in plans {
            match self.persist(target_date, plan).await {
                Ok(route) => created.push(route),
                Err(e) => {
                    error!(
                        "Stopping route generation for {} after {} committed routes: {}",
                        target_date,
                        created.len(),
                        e
                    );
                    return Err(e);
                }
            }
        }

        if !created.is_empty() {
            if let Err(e) = self.publisher.publish_routes_generated().await {
                error!("Failed to publish routes generated notification: {:#}", e);
            }
        }

        Ok(created)
    }

    /// Requested vehicles that exist and are active, in request order.
    async fn resolve_vehicles(&self, vehicle_ids: &[Uuid]) -> DeliveryResult<Vec<Vehicle>> {
        let mut found: HashMap<Uuid, Vehicle> = self
            .vehicles
            .find_by_ids(vehicle_ids)
            .await?
            .into_iter()
            .map(|v| (v.id, v))
            .collect();

        let mut seen = HashSet::new();
        let mut usable = Vec::new();
        for id in vehicle_ids {
            if !seen.insert(*id) {
                continue;
            }
            match found.remove(id) {
                Some(vehicle) if vehicle.is_active => usable.push(vehicle),
                Some(vehicle) => warn!("Vehicle {} is inactive, skipping", vehicle.license_plate),
                None => warn!("Vehicle {} not found, skipping", id),
            }
        }

        if usable.is_empty() {
            return Err(DeliveryError::validation("No active vehicles among the requested ids"));
        }
        Ok(usable)
    }

    /// Commits one route together with its shipment assignments.
    async fn persist(&self, target_date: NaiveDate, plan: RoutePlan) -> DeliveryResult<Route> {
        let route = Route::planned(
            plan.vehicle.id,
            target_date,
            plan.total_distance_km,
            plan.estimated_duration_minutes,
            plan.shipments.len() as i32,
        );

        let mut shipments = plan.shipments;
        for (index, shipment) in shipments.iter_mut().enumerate() {
            shipment.assign_to_route(route.id, index as i32 + 1)?;
        }

        self.routes.create_with_assignments(&route, &shipments).await?;

        info!(
            "Planned route {} for vehicle {}: {} stops, {:.2} km, {} min",
            route.id,
            plan.vehicle.license_plate,
            route.total_orders,
            route.total_distance_km,
            route.estimated_duration_minutes
        );
        Ok(route)
    }
}
