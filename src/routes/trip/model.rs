use serde::{Deserialize, Serialize};

use crate::models::Trip;
use crate::reservation::TripStarted;

/// 缺失的字段按空值处理，由协调器给出具体的校验错误
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTripRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub scooter_id: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndTripRequest {
    #[serde(default)]
    pub trip_id: String,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct StartTripResponse {
    pub message: &'static str,
    #[serde(flatten)]
    pub started: TripStarted,
}

impl From<TripStarted> for StartTripResponse {
    fn from(started: TripStarted) -> Self {
        Self {
            message: "Trip started successfully",
            started,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EndTripResponse {
    pub message: &'static str,
    pub trip: Trip,
}

impl From<Trip> for EndTripResponse {
    fn from(trip: Trip) -> Self {
        Self {
            message: "Trip ended successfully",
            trip,
        }
    }
}
