use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use diesel::pg::Pg;
use diesel::prelude::*;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{ProcessedEvent, Route, RouteStatus, Shipment, ShipmentStatus, Vehicle};
use crate::models::*;
use crate::schema::*;
use crate::store::{
    EventLedger, PageRequest, RouteFilter, RouteStore, ShipmentStore, StatusChange, VehicleRegistry,
};

pub type DbPool = bb8::Pool<AsyncDieselConnectionManager<AsyncPgConnection>>;

pub async fn build_pool(database_url: &str, max_size: u32) -> Result<DbPool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = bb8::Pool::builder().max_size(max_size).build(manager).await?;
    Ok(pool)
}

/// PostgreSQL-backed implementation of every store capability.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn load_shipments(rows: Vec<ShipmentRow>) -> Result<Vec<Shipment>> {
    rows.into_iter().map(Shipment::try_from).collect()
}

fn filtered_routes(filter: &RouteFilter) -> routes::BoxedQuery<'static, Pg> {
    let mut query = routes::table.into_boxed();
    if let Some(route_date) = filter.route_date {
        query = query.filter(routes::route_date.eq(route_date));
    }
    if let Some(status) = filter.status {
        query = query.filter(routes::status.eq(status.as_str()));
    }
    query
}

#[async_trait]
impl EventLedger for PgStore {
    async fn has_been_processed(&self, event_id: &str) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let count: i64 = processed_events::table
            .filter(processed_events::event_id.eq(event_id))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(count > 0)
    }

    async fn record(&self, event: &ProcessedEvent) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let inserted = diesel::insert_into(processed_events::table)
            .values(NewProcessedEvent::from(event))
            .on_conflict(processed_events::event_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(inserted == 1)
    }
}

#[async_trait]
impl ShipmentStore for PgStore {
    async fn insert(&self, shipment: &Shipment) -> Result<bool> {
        let row = NewShipment::try_from(shipment)?;
        let mut conn = self.pool.get().await?;

        let inserted = diesel::insert_into(shipments::table)
            .values(&row)
            .on_conflict(shipments::order_id)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(inserted == 1)
    }

    async fn find_by_order_id(&self, order_id: Uuid) -> Result<Option<Shipment>> {
        let mut conn = self.pool.get().await?;

        let row = shipments::table
            .filter(shipments::order_id.eq(order_id))
            .first::<ShipmentRow>(&mut conn)
            .await
            .optional()?;

        row.map(Shipment::try_from).transpose()
    }

    async fn find_pending_by_date(&self, target_date: NaiveDate) -> Result<Vec<Shipment>> {
        let mut conn = self.pool.get().await?;

        let rows = shipments::table
            .filter(shipments::target_date.eq(target_date))
            .filter(shipments::status.eq(ShipmentStatus::Pending.as_str()))
            .order((shipments::order_timestamp.asc(), shipments::id.asc()))
            .load::<ShipmentRow>(&mut conn)
            .await?;

        load_shipments(rows)
    }

    async fn count_pending_by_date(&self, target_date: NaiveDate) -> Result<i64> {
        let mut conn = self.pool.get().await?;

        let count = shipments::table
            .filter(shipments::target_date.eq(target_date))
            .filter(shipments::status.eq(ShipmentStatus::Pending.as_str()))
            .count()
            .get_result(&mut conn)
            .await?;

        Ok(count)
    }

    async fn find_by_route(&self, route_id: Uuid) -> Result<Vec<Shipment>> {
        let mut conn = self.pool.get().await?;

        let rows = shipments::table
            .filter(shipments::route_id.eq(route_id))
            .order(shipments::sequence_in_route.asc())
            .load::<ShipmentRow>(&mut conn)
            .await?;

        load_shipments(rows)
    }

    async fn update_status(&self, change: StatusChange<ShipmentStatus>) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(
            shipments::table
                .filter(shipments::id.eq(change.id))
                .filter(shipments::status.eq(change.from.as_str())),
        )
        .set((
            shipments::status.eq(change.to.as_str()),
            shipments::updated_at.eq(Utc::now()),
        ))
        .execute(&mut conn)
        .await?;

        Ok(updated == 1)
    }
}

#[async_trait]
impl VehicleRegistry for PgStore {
    async fn insert(&self, vehicle: &Vehicle) -> Result<bool> {
        let mut conn = self.pool.get().await?;

        let inserted = diesel::insert_into(vehicles::table)
            .values(NewVehicle::from(vehicle))
            .on_conflict(vehicles::license_plate)
            .do_nothing()
            .execute(&mut conn)
            .await?;

        Ok(inserted == 1)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Vehicle>> {
        let mut conn = self.pool.get().await?;

        let row = vehicles::table
            .find(id)
            .first::<VehicleRow>(&mut conn)
            .await
            .optional()?;

        Ok(row.map(Vehicle::from))
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Vehicle>> {
        let mut conn = self.pool.get().await?;

        let rows = vehicles::table
            .filter(vehicles::id.eq_any(ids.to_vec()))
            .load::<VehicleRow>(&mut conn)
            .await?;

        Ok(rows.into_iter().map(Vehicle::from).collect())
    }

    async fn list_active(&self) -> Result<Vec<Vehicle>> {
        let mut conn = self.pool.get().await?;

        let rows = vehicles::table
            .filter(vehicles::is_active.eq(true))
            .order(vehicles::license_plate.asc())
            .load::<VehicleRow>(&mut conn)
            .await?;

        Ok(rows.into_iter().map(Vehicle::from).collect())
    }

    async fn update(&self, vehicle: &Vehicle) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let updated = diesel::update(vehicles::table.find(vehicle.id))
            .set((
                vehicles::driver_name.eq(&vehicle.driver_name),
                vehicles::driver_phone.eq(&vehicle.driver_phone),
                vehicles::is_active.eq(vehicle.is_active),
                vehicles::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await?;

        if updated != 1 {
            bail!("Vehicle {} not found", vehicle.id);
        }
        Ok(())
    }
}

#[async_trait]
impl RouteStore for PgStore {
    async fn create_with_assignments(&self, route: &Route, shipments: &[Shipment]) -> Result<()> {
        let new_route = NewRoute::try_from(route)?;
        let assignments: Vec<(Uuid, Option<Uuid>, Option<i32>, &'static str)> = shipments
            .iter()
            .map(|s| (s.id, s.route_id, s.sequence_in_route, s.status.as_str()))
            .collect();
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                diesel::insert_into(routes::table)
                    .values(&new_route)
                    .execute(conn)
                    .await?;

                let now = Utc::now();
                for (shipment_id, route_id, sequence, status) in assignments {
                    let updated = diesel::update(
                        shipments::table
                            .filter(shipments::id.eq(shipment_id))
                            .filter(shipments::status.eq(ShipmentStatus::Pending.as_str())),
                    )
                    .set((
                        shipments::route_id.eq(route_id),
                        shipments::sequence_in_route.eq(sequence),
                        shipments::status.eq(status),
                        shipments::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                    if updated != 1 {
                        bail!("Shipment {} is no longer pending", shipment_id);
                    }
                }

                Ok(())
            })
        })
        .await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Route>> {
        let mut conn = self.pool.get().await?;

        let row = routes::table
            .find(id)
            .first::<RouteRow>(&mut conn)
            .await
            .optional()?;

        row.map(Route::try_from).transpose()
    }

    async fn list(&self, filter: &RouteFilter, page: &PageRequest) -> Result<(Vec<Route>, i64)> {
        let mut conn = self.pool.get().await?;

        let total: i64 = filtered_routes(filter).count().get_result(&mut conn).await?;

        let rows = filtered_routes(filter)
            .order((routes::route_date.desc(), routes::created_at.desc()))
            .limit(page.limit())
            .offset(page.offset())
            .load::<RouteRow>(&mut conn)
            .await?;

        let routes = rows.into_iter().map(Route::try_from).collect::<Result<Vec<_>>>()?;
        Ok((routes, total))
    }

    async fn update_status(
        &self,
        route: StatusChange<RouteStatus>,
        shipments: &[StatusChange<ShipmentStatus>],
    ) -> Result<bool> {
        let shipments = shipments.to_vec();
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            Box::pin(async move {
                let now = Utc::now();
                let updated = diesel::update(
                    routes::table
                        .filter(routes::id.eq(route.id))
                        .filter(routes::status.eq(route.from.as_str())),
                )
                .set((routes::status.eq(route.to.as_str()), routes::updated_at.eq(now)))
                .execute(conn)
                .await?;

                if updated != 1 {
                    return Ok(false);
                }

                for change in shipments {
                    let updated = diesel::update(
                        shipments::table
                            .filter(shipments::id.eq(change.id))
                            .filter(shipments::status.eq(change.from.as_str())),
                    )
                    .set((shipments::status.eq(change.to.as_str()), shipments::updated_at.eq(now)))
                    .execute(conn)
                    .await?;

                    if updated != 1 {
                        debug!("Shipment {} already left {}, not moving it", change.id, change.from);
                    }
                }

                Ok(true)
            })
        })
        .await
    }
}
