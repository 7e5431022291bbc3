use anyhow::{anyhow, Context, Result};
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;
use num_traits::ToPrimitive;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{Coordinates, ProcessedEvent, Route, Shipment, Vehicle};
use crate::schema::{processed_events, routes, shipments, vehicles};

#[derive(Debug, Clone, Queryable)]
pub struct VehicleRow {
    pub id: Uuid,
    pub license_plate: String,
    pub driver_name: String,
    pub driver_phone: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = vehicles)]
pub struct NewVehicle {
    pub id: Uuid,
    pub license_plate: String,
    pub driver_name: String,
    pub driver_phone: Option<String>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable)]
pub struct RouteRow {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub route_date: NaiveDate,
    pub status: String,
    pub estimated_duration_minutes: i32,
    pub total_distance_km: BigDecimal,
    pub total_orders: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = routes)]
pub struct NewRoute {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub route_date: NaiveDate,
    pub status: String,
    pub estimated_duration_minutes: i32,
    pub total_distance_km: BigDecimal,
    pub total_orders: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
pub struct ShipmentRow {
    pub id: Uuid,
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub delivery_address: String,
    pub delivery_city: String,
    pub delivery_country: String,
    pub latitude: Option<BigDecimal>,
    pub longitude: Option<BigDecimal>,
    pub geocoding_status: String,
    pub route_id: Option<Uuid>,
    pub sequence_in_route: Option<i32>,
    pub order_timestamp: DateTime<Utc>,
    pub target_date: NaiveDate,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = shipments)]
pub struct NewShipment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub delivery_address: String,
    pub delivery_city: String,
    pub delivery_country: String,
    pub latitude: Option<BigDecimal>,
    pub longitude: Option<BigDecimal>,
    pub geocoding_status: String,
    pub route_id: Option<Uuid>,
    pub sequence_in_route: Option<i32>,
    pub order_timestamp: DateTime<Utc>,
    pub target_date: NaiveDate,
    pub status: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = processed_events)]
pub struct NewProcessedEvent {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

/// Fixed-scale decimal for a NUMERIC column.
pub fn to_decimal(value: f64, scale: usize) -> Result<BigDecimal> {
    BigDecimal::from_str(&format!("{value:.scale$}"))
        .with_context(|| format!("Cannot store {value} as a decimal"))
}

fn to_f64(value: &BigDecimal) -> Result<f64> {
    value
        .to_f64()
        .ok_or_else(|| anyhow!("Decimal {value} does not fit in f64"))
}

impl From<VehicleRow> for Vehicle {
    fn from(row: VehicleRow) -> Self {
        Self {
            id: row.id,
            license_plate: row.license_plate,
            driver_name: row.driver_name,
            driver_phone: row.driver_phone,
            is_active: row.is_active,
        }
    }
}

impl From<&Vehicle> for NewVehicle {
    fn from(vehicle: &Vehicle) -> Self {
        Self {
            id: vehicle.id,
            license_plate: vehicle.license_plate.clone(),
            driver_name: vehicle.driver_name.clone(),
            driver_phone: vehicle.driver_phone.clone(),
            is_active: vehicle.is_active,
        }
    }
}

impl TryFrom<RouteRow> for Route {
    type Error = anyhow::Error;

    fn try_from(row: RouteRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            vehicle_id: row.vehicle_id,
            route_date: row.route_date,
            status: row.status.parse()?,
            estimated_duration_minutes: row.estimated_duration_minutes,
            total_distance_km: to_f64(&row.total_distance_km)?,
            total_orders: row.total_orders,
            created_at: row.created_at,
        })
    }
}

impl TryFrom<&Route> for NewRoute {
    type Error = anyhow::Error;

    fn try_from(route: &Route) -> Result<Self> {
        Ok(Self {
            id: route.id,
            vehicle_id: route.vehicle_id,
            route_date: route.route_date,
            status: route.status.as_str().to_string(),
            estimated_duration_minutes: route.estimated_duration_minutes,
            total_distance_km: to_decimal(route.total_distance_km, 2)?,
            total_orders: route.total_orders,
            created_at: route.created_at,
        })
    }
}

impl TryFrom<ShipmentRow> for Shipment {
    type Error = anyhow::Error;

    fn try_from(row: ShipmentRow) -> Result<Self> {
        let coordinates = match (&row.latitude, &row.longitude) {
            (Some(lat), Some(lon)) => Some(Coordinates::new(to_f64(lat)?, to_f64(lon)?)?),
            _ => None,
        };

        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            customer_id: row.customer_id,
            delivery_address: row.delivery_address,
            delivery_city: row.delivery_city,
            delivery_country: row.delivery_country,
            coordinates,
            geocoding_status: row.geocoding_status.parse()?,
            route_id: row.route_id,
            sequence_in_route: row.sequence_in_route,
            order_timestamp: row.order_timestamp,
            target_date: row.target_date,
            status: row.status.parse()?,
        })
    }
}

impl TryFrom<&Shipment> for NewShipment {
    type Error = anyhow::Error;

    fn try_from(shipment: &Shipment) -> Result<Self> {
        let (latitude, longitude) = match shipment.coordinates {
            Some(point) => (
                Some(to_decimal(point.latitude(), 8)?),
                Some(to_decimal(point.longitude(), 8)?),
            ),
            None => (None, None),
        };

        Ok(Self {
            id: shipment.id,
            order_id: shipment.order_id,
            customer_id: shipment.customer_id,
            delivery_address: shipment.delivery_address.clone(),
            delivery_city: shipment.delivery_city.clone(),
            delivery_country: shipment.delivery_country.clone(),
            latitude,
            longitude,
            geocoding_status: shipment.geocoding_status.as_str().to_string(),
            route_id: shipment.route_id,
            sequence_in_route: shipment.sequence_in_route,
            order_timestamp: shipment.order_timestamp,
            target_date: shipment.target_date,
            status: shipment.status.as_str().to_string(),
        })
    }
}

impl From<&ProcessedEvent> for NewProcessedEvent {
    fn from(event: &ProcessedEvent) -> Self {
        Self {
            id: event.id,
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            processed_at: event.processed_at,
        }
    }
}
