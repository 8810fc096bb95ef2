// 变更传播
// 消费权威存储的变更流，把车辆快照、可用车辆索引、行程快照和排行榜写入缓存。
// 只有这里写入缓存中的可用性状态。每条快照带版本号：车辆取 updated_at，行程取状态顺序，
// 旧版本的事件（乱序或重复投递）不会覆盖缓存中更新的状态

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::cache::keys::{AVAILABLE_SCOOTERS_KEY, USER_LEADERBOARD_KEY, fleet_key, trip_key};
use crate::cache::{CacheError, FleetCache, IndexChange, SnapshotWrite};
use crate::config::Config;
use crate::models::{Scooter, ScooterRecord, Trip, TripRecord, TripStatus};
use crate::store::{ChangeEvent, ChangeEventType, ChangeFeed, FeedError, FleetStore, StoreError};
use crate::utils::timed;

/// 无法处理的事件，保留原始内容供离线对账
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub payload: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    Applied,
    /// 缓存中已有更新的版本，事件被丢弃
    Stale,
    Ignored,
    DeadLettered,
}

#[derive(Debug, thiserror::Error)]
enum PropagateError {
    #[error("undecodable image: {0}")]
    Malformed(String),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PropagateError {
    fn is_transient(&self) -> bool {
        match self {
            PropagateError::Malformed(_) => false,
            PropagateError::Cache(_) => true,
            PropagateError::Store(e) => e.is_transient(),
        }
    }
}

pub struct ChangePropagator {
    store: Arc<dyn FleetStore>,
    cache: Arc<dyn FleetCache>,
    fleet_table: String,
    trip_table: String,
    max_retries: u32,
    backoff: Duration,
    store_timeout: Duration,
    cache_timeout: Duration,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

fn decode<T: DeserializeOwned>(event: &ChangeEvent) -> Result<T, PropagateError> {
    serde_json::from_value(event.image.clone()).map_err(|e| PropagateError::Malformed(e.to_string()))
}

fn scooter_fields(scooter: &Scooter) -> Vec<(String, String)> {
    let location = serde_json::to_string(&scooter.location).unwrap_or_default();
    vec![
        ("status".into(), scooter.status.as_str().into()),
        ("latitude".into(), scooter.location.latitude.to_string()),
        ("longitude".into(), scooter.location.longitude.to_string()),
        ("location".into(), location),
        ("batteryLevel".into(), scooter.battery_level.to_string()),
        ("updatedAt".into(), scooter.updated_at.to_rfc3339()),
    ]
}

// 行程只会 ACTIVE -> COMPLETED，状态顺序即版本
fn trip_version(trip: &Trip) -> i64 {
    match trip.status {
        TripStatus::Active => 0,
        TripStatus::Completed => 1,
    }
}

fn trip_fields(trip: &Trip) -> Vec<(String, String)> {
    let mut fields = vec![
        ("userId".into(), trip.user_id.clone()),
        ("scooterId".into(), trip.scooter_id.clone()),
        ("status".into(), trip.status.as_str().into()),
        ("startTime".into(), trip.start_time.to_rfc3339()),
        ("startLocation".into(), serde_json::to_string(&trip.start_location).unwrap_or_default()),
        ("distance".into(), trip.distance.to_string()),
    ];
    if let Some(end_time) = trip.end_time {
        fields.push(("endTime".into(), end_time.to_rfc3339()));
    }
    if let Some(end_location) = trip.end_location {
        fields.push(("endLocation".into(), serde_json::to_string(&end_location).unwrap_or_default()));
    }
    fields
}

impl ChangePropagator {
    pub fn new(store: Arc<dyn FleetStore>, cache: Arc<dyn FleetCache>, config: &Config) -> Self {
        Self {
            store,
            cache,
            fleet_table: config.fleet_table.clone(),
            trip_table: config.trip_table.clone(),
            max_retries: config.propagator_max_retries,
            backoff: config.propagator_backoff(),
            store_timeout: config.store_timeout(),
            cache_timeout: config.cache_timeout(),
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        match self.dead_letters.lock() {
            Ok(letters) => letters.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn dead_letter(&self, payload: String, reason: String) {
        tracing::error!(reason = %reason, payload = %payload, "Change event dead-lettered");
        match self.dead_letters.lock() {
            Ok(mut letters) => letters.push(DeadLetter { payload, reason }),
            Err(poisoned) => poisoned.into_inner().push(DeadLetter { payload, reason }),
        }
    }

    /// 处理一条事件，临时故障按指数退避重试，重试耗尽或永久错误进入死信
    pub async fn handle(&self, event: &ChangeEvent) -> Propagation {
        if event.event_type == ChangeEventType::Remove {
            return Propagation::Ignored;
        }
        if event.source != self.fleet_table && event.source != self.trip_table {
            tracing::debug!("Ignoring change event from table {}", event.source);
            return Propagation::Ignored;
        }

        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            let err = match self.apply(event).await {
                Ok(outcome) => return outcome,
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= self.max_retries {
                let payload = serde_json::to_string(event).unwrap_or_default();
                self.dead_letter(payload, err.to_string());
                return Propagation::DeadLettered;
            }

            attempt += 1;
            tracing::warn!(
                source = %event.source,
                attempt,
                "Cache propagation failed, retrying in {:?}: {}",
                delay,
                err
            );
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }

    async fn apply(&self, event: &ChangeEvent) -> Result<Propagation, PropagateError> {
        let applied = if event.source == self.fleet_table {
            let scooter = Scooter::try_from(decode::<ScooterRecord>(event)?)
                .map_err(|e| PropagateError::Malformed(e.to_string()))?;
            self.apply_scooter(&scooter).await?
        } else {
            let trip = Trip::try_from(decode::<TripRecord>(event)?)
                .map_err(|e| PropagateError::Malformed(e.to_string()))?;
            self.apply_trip(&trip).await?
        };

        if applied {
            Ok(Propagation::Applied)
        } else {
            tracing::debug!(source = %event.source, "Skipping change event older than cached snapshot");
            Ok(Propagation::Stale)
        }
    }

    async fn apply_scooter(&self, scooter: &Scooter) -> Result<bool, PropagateError> {
        let key = fleet_key(&scooter.scooter_id);
        let fields = scooter_fields(scooter);
        // 版本和分数都来自记录本身，重复投递写入相同的值
        let version = scooter.updated_at.timestamp_millis();
        let index = if scooter.is_available() {
            IndexChange::Add {
                set: AVAILABLE_SCOOTERS_KEY,
                member: &scooter.scooter_id,
                score: version as f64,
            }
        } else {
            IndexChange::Remove {
                set: AVAILABLE_SCOOTERS_KEY,
                member: &scooter.scooter_id,
            }
        };

        let write = SnapshotWrite {
            key: &key,
            version,
            fields: &fields,
            index: Some(index),
        };
        Ok(timed(self.cache_timeout, self.cache.write_snapshot(write)).await?)
    }

    async fn apply_trip(&self, trip: &Trip) -> Result<bool, PropagateError> {
        let key = trip_key(&trip.trip_id);
        let fields = trip_fields(trip);
        let write = SnapshotWrite {
            key: &key,
            version: trip_version(trip),
            fields: &fields,
            index: None,
        };
        if !timed(self.cache_timeout, self.cache.write_snapshot(write)).await? {
            return Ok(false);
        }

        if trip.status != TripStatus::Completed {
            return Ok(true);
        }
        let total = timed(self.store_timeout, self.store.user_total_distance(&trip.user_id)).await?;
        if let Some(total) = total {
            timed(
                self.cache_timeout,
                self.cache.zadd(USER_LEADERBOARD_KEY, total, &trip.user_id),
            )
            .await?;
        }
        Ok(true)
    }

    /// 持续消费变更流，直到流关闭
    pub async fn run<F: ChangeFeed>(&self, mut feed: F) {
        tracing::info!("Change propagator started");
        loop {
            match feed.next_event().await {
                Ok(Some(event)) => {
                    self.handle(&event).await;
                }
                Ok(None) => {
                    tracing::info!("Change feed closed, propagator stopping");
                    return;
                }
                Err(FeedError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Change propagator lagged, {} events skipped; cache may be stale until TTL or next change",
                        skipped
                    );
                }
                Err(FeedError::Malformed { payload, reason }) => {
                    self.dead_letter(payload, reason);
                }
                Err(e @ FeedError::Unavailable(_)) => {
                    tracing::error!("{}", e);
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}
