use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use shared::OrderCreatedEvent;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{DeliveryError, DeliveryResult};

const EARTH_RADIUS_KM: f64 = 6371.0;

// Column widths of the delivery tables.
pub const MAX_LICENSE_PLATE_LEN: usize = 20;
pub const MAX_DRIVER_NAME_LEN: usize = 100;
pub const MAX_DRIVER_PHONE_LEN: usize = 30;
pub const MAX_ADDRESS_LEN: usize = 500;
pub const MAX_CITY_LEN: usize = 100;
pub const MAX_COUNTRY_LEN: usize = 100;
pub const MAX_EVENT_ID_LEN: usize = 255;

/// Rejects values that would not fit their column.
fn check_length(field: &str, value: &str, max: usize) -> DeliveryResult<()> {
    let length = value.chars().count();
    if length > max {
        return Err(DeliveryError::validation(format!(
            "{field} is too long ({length} characters, at most {max})"
        )));
    }
    Ok(())
}

/// Immutable latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Coordinates {
    latitude: f64,
    longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> DeliveryResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(DeliveryError::validation(format!("Latitude out of range: {latitude}")));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(DeliveryError::validation(format!("Longitude out of range: {longitude}")));
        }

        Ok(Self {
            latitude: normalize_zero(latitude),
            longitude: normalize_zero(longitude),
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Great-circle (haversine) distance in kilometres.
    pub fn distance_to(&self, other: &Coordinates) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_KM * c
    }
}

// -0.0 and 0.0 must compare and hash equal.
fn normalize_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

impl PartialEq for Coordinates {
    fn eq(&self, other: &Self) -> bool {
        self.latitude.to_bits() == other.latitude.to_bits()
            && self.longitude.to_bits() == other.longitude.to_bits()
    }
}

impl Eq for Coordinates {}

impl Hash for Coordinates {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.latitude.to_bits().hash(state);
        self.longitude.to_bits().hash(state);
    }
}

macro_rules! status_enum {
    ($name:ident, $label:literal, { $($variant:ident => $value:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $value)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $value),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DeliveryError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(DeliveryError::validation(format!(
                        "Unknown {} '{}'",
                        $label, other
                    ))),
                }
            }
        }
    };
}

status_enum!(GeocodingStatus, "geocoding status", {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
});

status_enum!(ShipmentStatus, "shipment status", {
    Pending => "pending",
    AssignedToRoute => "assigned_to_route",
    InTransit => "in_transit",
    Delivered => "delivered",
});

status_enum!(RouteStatus, "route status", {
    Planeada => "planeada",
    EnProgreso => "en_progreso",
    Completada => "completada",
    Cancelada => "cancelada",
});

impl RouteStatus {
    /// A `planeada` route has to be started before it can be cancelled.
    pub fn can_transition_to(&self, next: RouteStatus) -> bool {
        matches!(
            (self, next),
            (RouteStatus::Planeada, RouteStatus::EnProgreso)
                | (RouteStatus::EnProgreso, RouteStatus::Completada)
                | (RouteStatus::EnProgreso, RouteStatus::Cancelada)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Uuid,
    pub license_plate: String,
    pub driver_name: String,
    pub driver_phone: Option<String>,
    pub is_active: bool,
}

impl Vehicle {
    pub fn register(
        license_plate: &str,
        driver_name: &str,
        driver_phone: Option<String>,
    ) -> DeliveryResult<Self> {
        let license_plate = license_plate.trim();
        let driver_name = driver_name.trim();

        if license_plate.is_empty() {
            return Err(DeliveryError::validation("license_plate is required"));
        }
        if driver_name.is_empty() {
            return Err(DeliveryError::validation("driver_name is required"));
        }
        check_length("license_plate", license_plate, MAX_LICENSE_PLATE_LEN)?;
        check_length("driver_name", driver_name, MAX_DRIVER_NAME_LEN)?;

        let driver_phone = driver_phone.filter(|phone| !phone.trim().is_empty());
        if let Some(phone) = &driver_phone {
            check_length("driver_phone", phone, MAX_DRIVER_PHONE_LEN)?;
        }

        Ok(Self {
            id: Uuid::new_v4(),
            license_plate: license_plate.to_string(),
            driver_name: driver_name.to_string(),
            driver_phone,
            is_active: true,
        })
    }

    /// Applies the provided fields; `None` leaves a field untouched.
    pub fn update_driver(
        &mut self,
        driver_name: Option<String>,
        driver_phone: Option<String>,
    ) -> DeliveryResult<()> {
        let driver_name = match &driver_name {
            Some(name) => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(DeliveryError::validation("driver_name cannot be empty"));
                }
                check_length("driver_name", name, MAX_DRIVER_NAME_LEN)?;
                Some(name.to_string())
            }
            None => None,
        };
        if let Some(phone) = &driver_phone {
            check_length("driver_phone", phone, MAX_DRIVER_PHONE_LEN)?;
        }

        if let Some(name) = driver_name {
            self.driver_name = name;
        }
        if let Some(phone) = driver_phone {
            self.driver_phone = Some(phone);
        }
        Ok(())
    }

    pub fn activate(&mut self) {
        self.is_active = true;
    }

    pub fn deactivate(&mut self) {
        self.is_active = false;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shipment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub delivery_address: String,
    pub delivery_city: String,
    pub delivery_country: String,
    pub coordinates: Option<Coordinates>,
    pub geocoding_status: GeocodingStatus,
    pub route_id: Option<Uuid>,
    pub sequence_in_route: Option<i32>,
    pub order_timestamp: DateTime<Utc>,
    pub target_date: NaiveDate,
    pub status: ShipmentStatus,
}

impl Shipment {
    pub fn from_order(event: &OrderCreatedEvent) -> DeliveryResult<Self> {
        for (field, value, max) in [
            ("delivery_address", &event.delivery_address, MAX_ADDRESS_LEN),
            ("delivery_city", &event.delivery_city, MAX_CITY_LEN),
            ("delivery_country", &event.delivery_country, MAX_COUNTRY_LEN),
        ] {
            if value.trim().is_empty() {
                return Err(DeliveryError::validation(format!("{field} is required")));
            }
            check_length(field, value, max)?;
        }

        Ok(Self {
            id: Uuid::new_v4(),
            order_id: event.order_id,
            customer_id: event.customer_id,
            delivery_address: event.delivery_address.clone(),
            delivery_city: event.delivery_city.clone(),
            delivery_country: event.delivery_country.clone(),
            coordinates: None,
            geocoding_status: GeocodingStatus::Pending,
            route_id: None,
            sequence_in_route: None,
            order_timestamp: event.order_timestamp,
            target_date: Self::estimated_delivery_date(event.order_timestamp),
            status: ShipmentStatus::Pending,
        })
    }

    /// Orders are delivered the day after they are placed.
    pub fn estimated_delivery_date(order_timestamp: DateTime<Utc>) -> NaiveDate {
        (order_timestamp + Duration::days(1)).date_naive()
    }

    pub fn set_coordinates(&mut self, coordinates: Coordinates) {
        self.coordinates = Some(coordinates);
        self.geocoding_status = GeocodingStatus::Success;
    }

    pub fn mark_geocoding_failed(&mut self) {
        self.coordinates = None;
        self.geocoding_status = GeocodingStatus::Failed;
    }

    pub fn is_geocoded(&self) -> bool {
        self.geocoding_status == GeocodingStatus::Success && self.coordinates.is_some()
    }

    pub fn assign_to_route(&mut self, route_id: Uuid, sequence: i32) -> DeliveryResult<()> {
        if self.status != ShipmentStatus::Pending {
            return Err(DeliveryError::invalid_transition(
                "Shipment",
                self.status,
                ShipmentStatus::AssignedToRoute,
            ));
        }

        self.route_id = Some(route_id);
        self.sequence_in_route = Some(sequence);
        self.status = ShipmentStatus::AssignedToRoute;
        Ok(())
    }

    /// Manual transitions; assignment happens only through route generation.
    pub fn transition_to(&mut self, next: ShipmentStatus) -> DeliveryResult<()> {
        let allowed = matches!(
            (self.status, next),
            (ShipmentStatus::AssignedToRoute, ShipmentStatus::InTransit)
                | (ShipmentStatus::InTransit, ShipmentStatus::Delivered)
        );
        if !allowed {
            return Err(DeliveryError::invalid_transition("Shipment", self.status, next));
        }

        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub route_date: NaiveDate,
    pub status: RouteStatus,
    pub estimated_duration_minutes: i32,
    pub total_distance_km: f64,
    pub total_orders: i32,
    pub created_at: DateTime<Utc>,
}

impl Route {
    pub fn planned(
        vehicle_id: Uuid,
        route_date: NaiveDate,
        total_distance_km: f64,
        estimated_duration_minutes: i32,
        total_orders: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            vehicle_id,
            route_date,
            status: RouteStatus::Planeada,
            estimated_duration_minutes,
            total_distance_km,
            total_orders,
            created_at: Utc::now(),
        }
    }

    pub fn transition_to(&mut self, next: RouteStatus) -> DeliveryResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DeliveryError::invalid_transition("Route", self.status, next));
        }

        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedEvent {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedEvent {
    /// Event ids become ledger keys, so they must be non-blank and fit the column.
    pub fn validate_event_id(event_id: &str) -> DeliveryResult<()> {
        if event_id.trim().is_empty() {
            return Err(DeliveryError::validation("event_id is required"));
        }
        check_length("event_id", event_id, MAX_EVENT_ID_LEN)
    }

    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: event_id.into(),
            event_type: event_type.into(),
            processed_at: Utc::now(),
        }
    }
}
