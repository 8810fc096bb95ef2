use axum::extract::{Json, Path, State, rejection::JsonRejection};

use super::model::{EndTripRequest, EndTripResponse, StartTripRequest, StartTripResponse};
use crate::AppState;
use crate::error::AppError;
use crate::models::{Location, Trip};
use crate::routes::{detached, json_rejection};

#[axum::debug_handler]
pub async fn start_trip(
    State(state): State<AppState>,
    payload: Result<Json<StartTripRequest>, JsonRejection>,
) -> Result<Json<StartTripResponse>, AppError> {
    let Json(req) = payload.map_err(json_rejection)?;
    let reservations = state.reservations.clone();

    let started = detached(async move {
        reservations
            .start_trip(&req.user_id, &req.scooter_id, req.idempotency_key.as_deref())
            .await
    })
    .await?;

    Ok(Json(started.into()))
}

#[axum::debug_handler]
pub async fn end_trip(
    State(state): State<AppState>,
    payload: Result<Json<EndTripRequest>, JsonRejection>,
) -> Result<Json<EndTripResponse>, AppError> {
    let Json(req) = payload.map_err(json_rejection)?;
    let (Some(latitude), Some(longitude)) = (req.end_latitude, req.end_longitude) else {
        let missing = if req.end_latitude.is_none() {
            "endLatitude"
        } else {
            "endLongitude"
        };
        return Err(AppError::Validation(format!("Missing required parameter {missing}")));
    };
    let reservations = state.reservations.clone();

    let trip = detached(async move {
        reservations
            .end_trip(&req.trip_id, Location::new(latitude, longitude))
            .await
    })
    .await?;

    Ok(Json(trip.into()))
}

#[axum::debug_handler]
pub async fn get_trip(
    State(state): State<AppState>,
    Path(trip_id): Path<String>,
) -> Result<Json<Trip>, AppError> {
    let trip = state.reservations.get_trip(&trip_id).await?;
    Ok(Json(trip))
}
