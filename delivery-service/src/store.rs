use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{ProcessedEvent, Route, RouteStatus, Shipment, ShipmentStatus, Vehicle};
use crate::error::{DeliveryError, DeliveryResult};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

/// Idempotency ledger for inbound events.
#[async_trait]
pub trait EventLedger: Send + Sync {
    async fn has_been_processed(&self, event_id: &str) -> Result<bool>;

    /// Returns `false` when the event id was already recorded; that is not an error.
    async fn record(&self, event: &ProcessedEvent) -> Result<bool>;
}

#[async_trait]
pub trait ShipmentStore: Send + Sync {
    /// Returns `false` when a shipment already exists for the same order.
    async fn insert(&self, shipment: &Shipment) -> Result<bool>;

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<Shipment>>;

    async fn find_pending_by_date(&self, target_date: NaiveDate) -> Result<Vec<Shipment>>;

    async fn count_pending_by_date(&self, target_date: NaiveDate) -> Result<i64>;

    /// Shipments of a route ordered by `sequence_in_route`.
    async fn find_by_route(&self, route_id: Uuid) -> Result<Vec<Shipment>>;

    /// Returns `false` when the stored status is no longer `change.from`; nothing is written then.
    async fn update_status(&self, change: StatusChange<ShipmentStatus>) -> Result<bool>;
}

#[async_trait]
pub trait VehicleRegistry: Send + Sync {
    /// Returns `false` when the license plate is already registered.
    async fn insert(&self, vehicle: &Vehicle) -> Result<bool>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Vehicle>>;

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Vehicle>>;

    /// Active vehicles ordered by license plate.
    async fn list_active(&self) -> Result<Vec<Vehicle>>;

    async fn update(&self, vehicle: &Vehicle) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteFilter {
    pub route_date: Option<NaiveDate>,
    pub status: Option<RouteStatus>,
}

#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Inserts `route` and writes the route assignment of every shipment in one
    /// transaction. Each shipment must still be pending in storage.
    async fn create_with_assignments(&self, route: &Route, shipments: &[Shipment]) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Route>>;

    /// Newest route date first; returns the page and the total match count.
    async fn list(&self, filter: &RouteFilter, page: &PageRequest) -> Result<(Vec<Route>, i64)>;

    /// Applies the route change and the shipment changes in one transaction.
    ///
    /// Returns `false` without writing anything when the route is no longer in
    /// `route.from`. Shipment changes whose `from` no longer matches are skipped,
    /// since those shipments were moved on by someone else.
    async fn update_status(
        &self,
        route: StatusChange<RouteStatus>,
        shipments: &[StatusChange<ShipmentStatus>],
    ) -> Result<bool>;
}

/// Compare-and-set on a status column: applies only while the stored status is still `from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange<S> {
    pub id: Uuid,
    pub from: S,
    pub to: S,
}

impl<S> StatusChange<S> {
    pub fn new(id: Uuid, from: S, to: S) -> Self {
        Self { id, from, to }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page: Option<u32>, page_size: Option<u32>) -> DeliveryResult<Self> {
        let page = page.unwrap_or(1);
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);

        if page < 1 {
            return Err(DeliveryError::validation("page must be at least 1"));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(DeliveryError::validation(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        Ok(Self { page, page_size })
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page - 1) * i64::from(self.page_size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub has_next: bool,
    pub has_previous: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, request: &PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            page_size: request.page_size,
            has_next: request.offset() + request.limit() < total,
            has_previous: request.offset() > 0,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            page: self.page,
            page_size: self.page_size,
            has_next: self.has_next,
            has_previous: self.has_previous,
        }
    }
}
