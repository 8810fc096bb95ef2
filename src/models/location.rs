use serde::{Deserialize, Serialize};

use crate::utils::geo::{calculate_distance, is_valid_latitude, is_valid_longitude};

/// 经纬度坐标（单位：度）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// 校验坐标范围，返回不合法的字段名
    pub fn validate(&self) -> Result<(), &'static str> {
        if !is_valid_latitude(self.latitude) {
            return Err("latitude");
        }
        if !is_valid_longitude(self.longitude) {
            return Err("longitude");
        }
        Ok(())
    }

    /// 到另一点的球面距离（米）
    pub fn distance_to(&self, other: &Location) -> f64 {
        calculate_distance(
            self.latitude,
            self.longitude,
            other.latitude,
            other.longitude,
        )
    }
}
