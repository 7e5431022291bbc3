use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::{Route, RouteStatus, Shipment, Vehicle};
use crate::error::DeliveryError;
use crate::lifecycle::{DeliveryService, RouteDetail, RouteSummary, ShipmentInfo};
use crate::orchestrator::RouteGenerator;
use crate::store::{Page, PageRequest, RouteFilter};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<DeliveryService>,
    pub generator: Arc<RouteGenerator>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error_code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError(DeliveryError);

impl<E: Into<DeliveryError>> From<E> for ApiError {
    fn from(error: E) -> Self {
        Self(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self.0 {
            DeliveryError::NotFound { .. } => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            DeliveryError::InvalidStatusTransition { .. } => (StatusCode::BAD_REQUEST, "INVALID_STATUS_TRANSITION"),
            DeliveryError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            DeliveryError::Internal(e) => {
                tracing::error!("Internal error: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let message = match self.0 {
            DeliveryError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        (status, Json(ErrorResponse { error_code, message })).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct GenerateRoutesRequest {
    pub target_date: NaiveDate,
    pub vehicle_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct GenerateRoutesResponse {
    pub message: String,
    pub target_date: NaiveDate,
    pub num_vehicles: usize,
    pub num_pending_shipments: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListRoutesParams {
    pub date: Option<NaiveDate>,
    pub status: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterVehicleRequest {
    pub license_plate: String,
    pub driver_name: String,
    pub driver_phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateVehicleRequest {
    pub driver_name: Option<String>,
    pub driver_phone: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/routes/generate", post(generate_routes))
        .route("/routes", get(list_routes))
        .route("/routes/:id", get(get_route))
        .route("/routes/:id/status", patch(update_route_status))
        .route("/shipments/:order_id", get(get_shipment))
        .route("/shipments/:order_id/status", patch(update_shipment_status))
        .route("/vehicles", get(list_vehicles).post(register_vehicle))
        .route("/vehicles/:id", axum::routing::put(update_vehicle).delete(deactivate_vehicle))
        .route("/vehicles/:id/activate", post(activate_vehicle))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

/// Starts generation in the background and answers right away.
pub async fn generate_routes(
    State(state): State<AppState>,
    Json(request): Json<GenerateRoutesRequest>,
) -> ApiResult<(StatusCode, Json<GenerateRoutesResponse>)> {
    if request.vehicle_ids.is_empty() {
        return Err(DeliveryError::validation("vehicle_ids cannot be empty").into());
    }

    let num_pending_shipments = state.generator.pending_count(request.target_date).await?;
    let num_vehicles = request.vehicle_ids.len();
    state.generator.spawn(request.target_date, request.vehicle_ids);

    tracing::info!(
        "Route generation started for {} with {} vehicles and {} pending shipments",
        request.target_date,
        num_vehicles,
        num_pending_shipments
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateRoutesResponse {
            message: "Route generation started".to_string(),
            target_date: request.target_date,
            num_vehicles,
            num_pending_shipments,
        }),
    ))
}

pub async fn list_routes(
    State(state): State<AppState>,
    Query(params): Query<ListRoutesParams>,
) -> ApiResult<Json<Page<RouteSummary>>> {
    let filter = RouteFilter {
        route_date: params.date,
        status: params.status.as_deref().map(str::parse::<RouteStatus>).transpose()?,
    };
    let page = PageRequest::new(params.page, params.page_size)?;

    Ok(Json(state.service.list_routes(&filter, page).await?))
}

pub async fn get_route(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<RouteDetail>> {
    Ok(Json(state.service.get_route(id).await?))
}

pub async fn update_route_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<StatusUpdateRequest>,
) -> ApiResult<Json<Route>> {
    Ok(Json(state.service.update_route_status(id, &request.status).await?))
}

pub async fn get_shipment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<ShipmentInfo>> {
    Ok(Json(state.service.get_shipment(order_id).await?))
}

pub async fn update_shipment_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<StatusUpdateRequest>,
) -> ApiResult<Json<Shipment>> {
    Ok(Json(state.service.update_shipment_status(order_id, &request.status).await?))
}

pub async fn list_vehicles(State(state): State<AppState>) -> ApiResult<Json<Vec<Vehicle>>> {
    Ok(Json(state.service.list_vehicles().await?))
}

pub async fn register_vehicle(
    State(state): State<AppState>,
    Json(request): Json<RegisterVehicleRequest>,
) -> ApiResult<(StatusCode, Json<Vehicle>)> {
    let vehicle = state
        .service
        .register_vehicle(&request.license_plate, &request.driver_name, request.driver_phone)
        .await?;
    Ok((StatusCode::CREATED, Json(vehicle)))
}

pub async fn update_vehicle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateVehicleRequest>,
) -> ApiResult<Json<Vehicle>> {
    Ok(Json(
        state
            .service
            .update_vehicle(id, request.driver_name, request.driver_phone)
            .await?,
    ))
}

pub async fn deactivate_vehicle(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<StatusCode> {
    state.service.deactivate_vehicle(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn activate_vehicle(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Vehicle>> {
    Ok(Json(state.service.activate_vehicle(id).await?))
}

pub async fn health_check() -> &'static str {
    "OK"
}
