use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::domain::{Route, RouteStatus, Shipment, ShipmentStatus, Vehicle};
use crate::error::{DeliveryError, DeliveryResult};
use crate::store::{Page, PageRequest, RouteFilter, RouteStore, ShipmentStore, StatusChange, VehicleRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub vehicle_plate: Option<String>,
    pub driver_name: Option<String>,
    pub route_date: NaiveDate,
    pub status: RouteStatus,
    pub estimated_duration_minutes: i32,
    pub total_distance_km: f64,
    pub total_orders: i32,
}

impl RouteSummary {
    fn new(route: Route, vehicle: Option<&Vehicle>) -> Self {
        Self {
            id: route.id,
            vehicle_id: route.vehicle_id,
            vehicle_plate: vehicle.map(|v| v.license_plate.clone()),
            driver_name: vehicle.map(|v| v.driver_name.clone()),
            route_date: route.route_date,
            status: route.status,
            estimated_duration_minutes: route.estimated_duration_minutes,
            total_distance_km: route.total_distance_km,
            total_orders: route.total_orders,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStop {
    pub id: Uuid,
    pub order_id: Uuid,
    pub delivery_address: String,
    pub delivery_city: String,
    pub sequence_in_route: Option<i32>,
    pub status: ShipmentStatus,
}

impl From<Shipment> for RouteStop {
    fn from(shipment: Shipment) -> Self {
        Self {
            id: shipment.id,
            order_id: shipment.order_id,
            delivery_address: shipment.delivery_address,
            delivery_city: shipment.delivery_city,
            sequence_in_route: shipment.sequence_in_route,
            status: shipment.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteDetail {
    #[serde(flatten)]
    pub summary: RouteSummary,
    pub driver_phone: Option<String>,
    pub shipments: Vec<RouteStop>,
}

/// Delivery view of a single order.
#[derive(Debug, Clone, Serialize)]
pub struct ShipmentInfo {
    pub shipment_id: Uuid,
    pub order_id: Uuid,
    pub status: ShipmentStatus,
    pub route_id: Option<Uuid>,
    pub target_date: NaiveDate,
    pub vehicle_plate: Option<String>,
    pub driver_name: Option<String>,
}

/// Queries and manual transitions over routes, shipments and vehicles.
pub struct DeliveryService {
    shipments: Arc<dyn ShipmentStore>,
    vehicles: Arc<dyn VehicleRegistry>,
    routes: Arc<dyn RouteStore>,
}

impl DeliveryService {
    pub fn new(
        shipments: Arc<dyn ShipmentStore>,
        vehicles: Arc<dyn VehicleRegistry>,
        routes: Arc<dyn RouteStore>,
    ) -> Self {
        Self {
            shipments,
            vehicles,
            routes,
        }
    }

    async fn find_route(&self, id: Uuid) -> DeliveryResult<Route> {
        self.routes
            .find_by_id(id)
            .await?
            .ok_or_else(|| DeliveryError::not_found("Route", id))
    }

    async fn find_vehicle(&self, id: Uuid) -> DeliveryResult<Vehicle> {
        self.vehicles
            .find_by_id(id)
            .await?
            .ok_or_else(|| DeliveryError::not_found("Vehicle", id))
    }

    pub async fn get_route(&self, id: Uuid) -> DeliveryResult<RouteDetail> {
        let route = self.find_route(id).await?;
        let vehicle = self.vehicles.find_by_id(route.vehicle_id).await?;
        let shipments = self.shipments.find_by_route(route.id).await?;

        Ok(RouteDetail {
            driver_phone: vehicle.as_ref().and_then(|v| v.driver_phone.clone()),
            summary: RouteSummary::new(route, vehicle.as_ref()),
            shipments: shipments.into_iter().map(RouteStop::from).collect(),
        })
    }

    pub async fn list_routes(&self, filter: &RouteFilter, page: PageRequest) -> DeliveryResult<Page<RouteSummary>> {
        let (routes, total) = self.routes.list(filter, &page).await?;

        let mut vehicles: HashMap<Uuid, Option<Vehicle>> = HashMap::new();
        for route in &routes {
            if !vehicles.contains_key(&route.vehicle_id) {
                let vehicle = self.vehicles.find_by_id(route.vehicle_id).await?;
                vehicles.insert(route.vehicle_id, vehicle);
            }
        }

        let page = Page::new(routes, total, &page);
        Ok(page.map(|route| {
            let vehicle = vehicles.get(&route.vehicle_id).and_then(Option::as_ref);
            RouteSummary::new(route, vehicle)
        }))
    }

    /// Starting a route puts its assigned shipments in transit in the same write.
    pub async fn update_route_status(&self, id: Uuid, status: &str) -> DeliveryResult<Route> {
        let next: RouteStatus = status.parse()?;
        let mut route = self.find_route(id).await?;
        let previous = route.status;
        route.transition_to(next)?;

        let mut changed = Vec::new();
        if next == RouteStatus::EnProgreso {
            for shipment in self.shipments.find_by_route(route.id).await? {
                if shipment.status == ShipmentStatus::AssignedToRoute {
                    changed.push(StatusChange::new(
                        shipment.id,
                        ShipmentStatus::AssignedToRoute,
                        ShipmentStatus::InTransit,
                    ));
                }
            }
        }

        let applied = self
            .routes
            .update_status(StatusChange::new(route.id, previous, next), &changed)
            .await?;
        if !applied {
            // Another request moved the route after it was read.
            let current = self.find_route(id).await?.status;
            return Err(DeliveryError::invalid_transition("Route", current, next));
        }

        info!(
            "Route {} moved from {} to {} ({} shipments updated)",
            route.id,
            previous,
            route.status,
            changed.len()
        );
        Ok(route)
    }

    pub async fn get_shipment(&self, order_id: Uuid) -> DeliveryResult<ShipmentInfo> {
        let shipment = self.find_shipment(order_id).await?;

        let mut vehicle = None;
        if let Some(route_id) = shipment.route_id {
            if let Some(route) = self.routes.find_by_id(route_id).await? {
                vehicle = self.vehicles.find_by_id(route.vehicle_id).await?;
            }
        }

        Ok(ShipmentInfo {
            shipment_id: shipment.id,
            order_id: shipment.order_id,
            status: shipment.status,
            route_id: shipment.route_id,
            target_date: shipment.target_date,
            vehicle_plate: vehicle.as_ref().map(|v| v.license_plate.clone()),
            driver_name: vehicle.map(|v| v.driver_name),
        })
    }

    /// Only `in_transit` and `delivered` can be set by hand.
    pub async fn update_shipment_status(&self, order_id: Uuid, status: &str) -> DeliveryResult<Shipment> {
        let next: ShipmentStatus = status.parse()?;
        let mut shipment = self.find_shipment(order_id).await?;

        if !matches!(next, ShipmentStatus::InTransit | ShipmentStatus::Delivered) {
            return Err(DeliveryError::invalid_transition("Shipment", shipment.status, next));
        }
        let previous = shipment.status;
        shipment.transition_to(next)?;

        let change = StatusChange::new(shipment.id, previous, next);
        if !self.shipments.update_status(change).await? {
            let current = self.find_shipment(order_id).await?.status;
            return Err(DeliveryError::invalid_transition("Shipment", current, next));
        }
        info!("Shipment for order {} is now {}", order_id, shipment.status);
        Ok(shipment)
    }

    async fn find_shipment(&self, order_id: Uuid) -> DeliveryResult<Shipment> {
        self.shipments
            .find_by_order_id(order_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found("Shipment", order_id))
    }

    pub async fn list_vehicles(&self) -> DeliveryResult<Vec<Vehicle>> {
        Ok(self.vehicles.list_active().await?)
    }

    pub async fn register_vehicle(
        &self,
        license_plate: &str,
        driver_name: &str,
        driver_phone: Option<String>,
    ) -> DeliveryResult<Vehicle> {
        let vehicle = Vehicle::register(license_plate, driver_name, driver_phone)?;

        if !self.vehicles.insert(&vehicle).await? {
            return Err(DeliveryError::validation(format!(
                "Vehicle with license plate {} already exists",
                vehicle.license_plate
            )));
        }

        info!("Registered vehicle {} ({})", vehicle.license_plate, vehicle.id);
        Ok(vehicle)
    }

    pub async fn update_vehicle(
        &self,
        id: Uuid,
        driver_name: Option<String>,
        driver_phone: Option<String>,
    ) -> DeliveryResult<Vehicle> {
        let mut vehicle = self.find_vehicle(id).await?;
        vehicle.update_driver(driver_name, driver_phone)?;
        self.vehicles.update(&vehicle).await?;
        Ok(vehicle)
    }

    /// Soft delete; routes that reference the vehicle are untouched.
    pub async fn deactivate_vehicle(&self, id: Uuid) -> DeliveryResult<Vehicle> {
        let mut vehicle = self.find_vehicle(id).await?;
        vehicle.deactivate();
        self.vehicles.update(&vehicle).await?;
        info!("Deactivated vehicle {}", vehicle.license_plate);
        Ok(vehicle)
    }

    pub async fn activate_vehicle(&self, id: Uuid) -> DeliveryResult<Vehicle> {
        let mut vehicle = self.find_vehicle(id).await?;
        vehicle.activate();
        self.vehicles.update(&vehicle).await?;
        info!("Activated vehicle {}", vehicle.license_plate);
        Ok(vehicle)
    }
}
