// 附近车辆搜索
// 读穿缓存：查询坐标按精度取整后作为缓存键，未命中时从权威存储扫描可用车辆。
// 距离以取整后的网格中心计算，同一个键对应的结果与具体查询点无关

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::FleetCache;
use crate::cache::keys::{AVAILABLE_SCOOTERS_KEY, nearby_scooters_key};
use crate::config::Config;
use crate::error::AppError;
use crate::models::{Location, Scooter};
use crate::store::{FleetStore, ScooterFilter};
use crate::utils::geo::round_coordinate;
use crate::utils::timed;

/// 缓存读取失败时的额外尝试次数
const CACHE_READ_RETRIES: usize = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NearbyScooter {
    pub scooter_id: String,
    pub location: Location,
    /// 到查询点所在网格中心的距离（米）
    pub distance: f64,
    pub battery_level: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSource {
    Cache,
    Store,
}

impl SearchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchSource::Cache => "HIT",
            SearchSource::Store => "MISS",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// 按距离升序，距离相同时按车辆ID
    pub scooters: Vec<NearbyScooter>,
    pub source: SearchSource,
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub cache_ttl_secs: u64,
    pub precision: u32,
    pub max_radius: f64,
    pub use_availability_index: bool,
    pub store_timeout: Duration,
    pub cache_timeout: Duration,
}

impl SearchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_ttl_secs: config.search_cache_ttl_secs,
            precision: config.coordinate_precision,
            max_radius: config.max_search_radius,
            use_availability_index: config.search_use_availability_index,
            store_timeout: config.store_timeout(),
            cache_timeout: config.cache_timeout(),
        }
    }
}

pub struct GeoSearchEngine {
    store: Arc<dyn FleetStore>,
    cache: Arc<dyn FleetCache>,
    settings: SearchSettings,
}

impl GeoSearchEngine {
    pub fn new(store: Arc<dyn FleetStore>, cache: Arc<dyn FleetCache>, settings: SearchSettings) -> Self {
        Self {
            store,
            cache,
            settings,
        }
    }

    pub async fn search_nearby(
        &self,
        latitude: f64,
        longitude: f64,
        radius: f64,
    ) -> Result<SearchOutcome, AppError> {
        if let Err(field) = Location::new(latitude, longitude).validate() {
            return Err(AppError::Validation(format!("Invalid {field}")));
        }
        if !(radius.is_finite() && radius > 0.0) {
            return Err(AppError::Validation("Invalid radius".into()));
        }
        let radius = radius.min(self.settings.max_radius);

        let precision = self.settings.precision;
        let center = Location::new(
            round_coordinate(latitude, precision),
            round_coordinate(longitude, precision),
        );
        let key = nearby_scooters_key(center.latitude, center.longitude, radius, precision);

        if let Some(scooters) = self.read_cached(&key).await {
            tracing::debug!(key = %key, count = scooters.len(), "Nearby search served from cache");
            return Ok(SearchOutcome {
                scooters,
                source: SearchSource::Cache,
            });
        }

        let candidates = self.available_scooters().await?;
        let scooters = rank_within(&center, radius, candidates);

        if !scooters.is_empty() {
            self.write_cached(&key, &scooters).await;
        }

        Ok(SearchOutcome {
            scooters,
            source: SearchSource::Store,
        })
    }

    // 读取失败重试一次；内容无法解析视为未命中
    async fn read_cached(&self, key: &str) -> Option<Vec<NearbyScooter>> {
        for attempt in 0..=CACHE_READ_RETRIES {
            match timed(self.settings.cache_timeout, self.cache.get(key)).await {
                Ok(Some(raw)) => {
                    return match serde_json::from_str(&raw) {
                        Ok(scooters) => Some(scooters),
                        Err(e) => {
                            tracing::warn!(key = %key, "Discarding unreadable search cache entry: {}", e);
                            None
                        }
                    };
                }
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(key = %key, attempt, "Search cache read failed: {}", e);
                }
            }
        }
        None
    }

    async fn write_cached(&self, key: &str, scooters: &[NearbyScooter]) {
        let payload = match serde_json::to_string(scooters) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to encode search result: {}", e);
                return;
            }
        };
        if let Err(e) = timed(
            self.settings.cache_timeout,
            self.cache.set_ex(key, &payload, self.settings.cache_ttl_secs),
        )
        .await
        {
            tracing::warn!(key = %key, "Search cache write failed: {}", e);
        }
    }

    async fn available_scooters(&self) -> Result<Vec<Scooter>, AppError> {
        if self.settings.use_availability_index {
            if let Some(scooters) = self.indexed_scooters().await? {
                return Ok(scooters);
            }
        }

        timed(
            self.settings.store_timeout,
            self.store.scan_scooters(ScooterFilter::available()),
        )
        .await
        .map_err(|e| {
            tracing::error!("Available scooter scan failed: {}", e);
            AppError::from(e)
        })
    }

    // 索引读取失败或为空时返回 None，由调用方退回全表扫描。
    // 索引可能滞后，状态以存储为准
    async fn indexed_scooters(&self) -> Result<Option<Vec<Scooter>>, AppError> {
        let ids = match timed(
            self.settings.cache_timeout,
            self.cache.zrange_all(AVAILABLE_SCOOTERS_KEY),
        )
        .await
        {
            Ok(ids) if !ids.is_empty() => ids,
            Ok(_) => return Ok(None),
            Err(e) => {
                tracing::warn!("Availability index read failed, scanning store: {}", e);
                return Ok(None);
            }
        };

        let scooters = timed(self.settings.store_timeout, self.store.get_scooters(&ids))
            .await
            .map_err(|e| {
                tracing::error!("Indexed scooter lookup failed: {}", e);
                AppError::from(e)
            })?;
        Ok(Some(scooters.into_iter().filter(Scooter::is_available).collect()))
    }
}

/// 计算到中心点的距离，保留半径内的车辆并按距离排序
fn rank_within(center: &Location, radius: f64, scooters: Vec<Scooter>) -> Vec<NearbyScooter> {
    let mut nearby: Vec<NearbyScooter> = scooters
        .into_iter()
        .filter_map(|scooter| {
            let distance = center.distance_to(&scooter.location);
            (distance <= radius).then(|| NearbyScooter {
                scooter_id: scooter.scooter_id,
                location: scooter.location,
                distance,
                battery_level: scooter.battery_level,
            })
        })
        .collect();

    nearby.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.scooter_id.cmp(&b.scooter_id))
    });
    nearby
}
