use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Location, ModelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripStatus {
    Active,
    Completed,
}

impl TripStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripStatus::Active => "ACTIVE",
            TripStatus::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for TripStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TripStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(TripStatus::Active),
            "COMPLETED" => Ok(TripStatus::Completed),
            other => Err(ModelError::UnknownTripStatus(other.to_string())),
        }
    }
}

/// 行程。ACTIVE -> COMPLETED 单向流转，记录永不删除
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub trip_id: String,
    pub user_id: String,
    pub scooter_id: String,
    pub status: TripStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_location: Location,
    pub end_location: Option<Location>,
    /// 行程距离（米）
    pub distance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Trip {
    pub fn is_active(&self) -> bool {
        self.status == TripStatus::Active
    }

    /// 计算结束行程需要写入的字段
    pub fn completion(&self, end_location: Location, end_time: DateTime<Utc>) -> TripCompletion {
        TripCompletion {
            end_time,
            end_location,
            distance: self.start_location.distance_to(&end_location),
        }
    }
}

/// 开始行程时创建的记录，起点由预约时的车辆位置决定
#[derive(Debug, Clone)]
pub struct NewTrip {
    pub trip_id: String,
    pub user_id: String,
    pub scooter_id: String,
    pub start_time: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

impl NewTrip {
    pub fn new(user_id: &str, scooter_id: &str, idempotency_key: Option<String>) -> Self {
        Self {
            trip_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            scooter_id: scooter_id.to_string(),
            start_time: Utc::now(),
            idempotency_key,
        }
    }

    pub fn into_trip(self, start_location: Location) -> Trip {
        Trip {
            trip_id: self.trip_id,
            user_id: self.user_id,
            scooter_id: self.scooter_id,
            status: TripStatus::Active,
            start_time: self.start_time,
            end_time: None,
            start_location,
            end_location: None,
            distance: 0.0,
            idempotency_key: self.idempotency_key,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TripCompletion {
    pub end_time: DateTime<Utc>,
    pub end_location: Location,
    pub distance: f64,
}

/// 行程表中的一行，也是变更流事件里的 image
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TripRecord {
    pub trip_id: String,
    pub user_id: String,
    pub scooter_id: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub start_latitude: f64,
    pub start_longitude: f64,
    pub end_latitude: Option<f64>,
    pub end_longitude: Option<f64>,
    pub distance: f64,
    pub idempotency_key: Option<String>,
}

impl TryFrom<TripRecord> for Trip {
    type Error = ModelError;

    fn try_from(record: TripRecord) -> Result<Self, Self::Error> {
        let status: TripStatus = record.status.parse()?;
        let end_location = match (record.end_latitude, record.end_longitude) {
            (Some(lat), Some(lon)) => Some(Location::new(lat, lon)),
            _ => None,
        };
        if status == TripStatus::Completed && end_location.is_none() {
            return Err(ModelError::MissingEndLocation(record.trip_id));
        }

        Ok(Self {
            trip_id: record.trip_id,
            user_id: record.user_id,
            scooter_id: record.scooter_id,
            status,
            start_time: record.start_time,
            end_time: record.end_time,
            start_location: Location::new(record.start_latitude, record.start_longitude),
            end_location,
            distance: record.distance,
            idempotency_key: record.idempotency_key,
        })
    }
}

impl From<&Trip> for TripRecord {
    fn from(trip: &Trip) -> Self {
        Self {
            trip_id: trip.trip_id.clone(),
            user_id: trip.user_id.clone(),
            scooter_id: trip.scooter_id.clone(),
            status: trip.status.as_str().to_string(),
            start_time: trip.start_time,
            end_time: trip.end_time,
            start_latitude: trip.start_location.latitude,
            start_longitude: trip.start_location.longitude,
            end_latitude: trip.end_location.map(|l| l.latitude),
            end_longitude: trip.end_location.map(|l| l.longitude),
            distance: trip.distance,
            idempotency_key: trip.idempotency_key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trip_starts_active_with_zero_distance() {
        let trip = NewTrip::new("u1", "s1", None).into_trip(Location::new(40.71, -74.0));
        assert!(trip.is_active());
        assert_eq!(trip.end_time, None);
        assert_eq!(trip.distance, 0.0);
        assert!(Uuid::parse_str(&trip.trip_id).is_ok());
    }

    #[test]
    fn completion_measures_start_to_end() {
        let trip = NewTrip::new("u1", "s1", None).into_trip(Location::new(40.000, -74.0));
        let done = trip.completion(Location::new(40.001, -74.0), Utc::now());
        assert!((done.distance - 111.19).abs() < 0.5);
    }

    #[test]
    fn completed_record_requires_end_location() {
        let trip = NewTrip::new("u1", "s1", None).into_trip(Location::new(1.0, 1.0));
        let mut record = TripRecord::from(&trip);
        record.status = "COMPLETED".into();
        assert!(matches!(
            Trip::try_from(record),
            Err(ModelError::MissingEndLocation(_))
        ));
    }

    #[test]
    fn idempotency_key_is_omitted_when_absent() {
        let trip = NewTrip::new("u1", "s1", None).into_trip(Location::new(1.0, 1.0));
        let value = serde_json::to_value(&trip).unwrap();
        assert!(value.get("idempotencyKey").is_none());
        assert_eq!(value["status"], "ACTIVE");
        assert!(value["endTime"].is_null());
    }
}
