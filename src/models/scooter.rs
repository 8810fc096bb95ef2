use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{Location, ModelError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScooterStatus {
    Available,
    InUse,
}

impl ScooterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScooterStatus::Available => "AVAILABLE",
            ScooterStatus::InUse => "IN_USE",
        }
    }
}

impl fmt::Display for ScooterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScooterStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(ScooterStatus::Available),
            "IN_USE" => Ok(ScooterStatus::InUse),
            other => Err(ModelError::UnknownScooterStatus(other.to_string())),
        }
    }
}

/// 车辆（API 与缓存使用的形态）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scooter {
    pub scooter_id: String,
    pub status: ScooterStatus,
    pub location: Location,
    pub battery_level: i32,
    pub updated_at: DateTime<Utc>,
}

impl Scooter {
    pub fn is_available(&self) -> bool {
        self.status == ScooterStatus::Available
    }
}

/// 车辆表中的一行，也是变更流事件里的 image
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ScooterRecord {
    pub scooter_id: String,
    pub status: String,
    pub latitude: f64,
    pub longitude: f64,
    pub battery_level: i32,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ScooterRecord> for Scooter {
    type Error = ModelError;

    fn try_from(record: ScooterRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            status: record.status.parse()?,
            scooter_id: record.scooter_id,
            location: Location::new(record.latitude, record.longitude),
            battery_level: record.battery_level,
            updated_at: record.updated_at,
        })
    }
}

impl From<&Scooter> for ScooterRecord {
    fn from(scooter: &Scooter) -> Self {
        Self {
            scooter_id: scooter.scooter_id.clone(),
            status: scooter.status.as_str().to_string(),
            latitude: scooter.location.latitude,
            longitude: scooter.location.longitude,
            battery_level: scooter.battery_level,
            updated_at: scooter.updated_at,
        }
    }
}
