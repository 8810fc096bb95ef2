// 预约协调器
// 开始行程：车辆 AVAILABLE -> IN_USE 与创建 ACTIVE 行程在一次条件写入中完成。
// 结束行程：先条件写入行程 ACTIVE -> COMPLETED，再释放车辆（车辆没有新的 ACTIVE 行程时才写入）；
// 第二步失败时车辆进入释放队列，由对账任务修复

pub mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::models::{Location, NewTrip, Scooter, Trip};
use crate::store::{FleetStore, StoreError};
use crate::utils::timed;

pub use reconcile::{Reconciler, SweepReport};

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("{0}")]
    Validation(String),
    #[error("Scooter {0} not found")]
    ScooterNotFound(String),
    #[error("Scooter {0} is not available")]
    ScooterUnavailable(String),
    #[error("Trip {0} not found")]
    TripNotFound(String),
    #[error("Trip {0} is not active")]
    TripNotActive(String),
    #[error("Fleet store is temporarily unavailable")]
    StoreUnavailable,
}

impl From<ReservationError> for AppError {
    fn from(e: ReservationError) -> Self {
        let message = e.to_string();
        match e {
            ReservationError::Validation(_) => AppError::Validation(message),
            ReservationError::ScooterNotFound(_) | ReservationError::TripNotFound(_) => {
                AppError::NotFound(message)
            }
            ReservationError::ScooterUnavailable(_) | ReservationError::TripNotActive(_) => {
                AppError::Conflict(message)
            }
            ReservationError::StoreUnavailable => AppError::TransientInfra(message),
        }
    }
}

/// 开始行程的结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripStarted {
    pub trip_id: String,
    pub start_time: DateTime<Utc>,
    pub scooter: Scooter,
}

/// 行程已完成但车辆释放失败，等待对账
#[derive(Debug, Clone)]
pub struct PendingRelease {
    pub scooter_id: String,
    pub trip_id: String,
    pub location: Location,
}

pub type ReleaseSender = mpsc::UnboundedSender<PendingRelease>;
pub type ReleaseReceiver = mpsc::UnboundedReceiver<PendingRelease>;

pub fn release_queue() -> (ReleaseSender, ReleaseReceiver) {
    mpsc::unbounded_channel()
}

fn require<'a>(value: &'a str, field: &str) -> Result<&'a str, ReservationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ReservationError::Validation(format!("Missing required parameter {field}")));
    }
    Ok(value)
}

// 基础设施错误只记日志，不向调用方暴露细节
fn store_failure(operation: &str, e: StoreError) -> ReservationError {
    tracing::error!("Store failure during {}: {}", operation, e);
    ReservationError::StoreUnavailable
}

pub struct ReservationCoordinator {
    store: Arc<dyn FleetStore>,
    releases: ReleaseSender,
    store_timeout: Duration,
}

impl ReservationCoordinator {
    pub fn new(store: Arc<dyn FleetStore>, releases: ReleaseSender, store_timeout: Duration) -> Self {
        Self {
            store,
            releases,
            store_timeout,
        }
    }

    pub async fn start_trip(
        &self,
        user_id: &str,
        scooter_id: &str,
        idempotency_key: Option<&str>,
    ) -> Result<TripStarted, ReservationError> {
        let user_id = require(user_id, "userId")?;
        let scooter_id = require(scooter_id, "scooterId")?;
        let idempotency_key = match idempotency_key {
            Some(key) => {
                let key = require(key, "idempotencyKey")?;
                if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                    return Err(ReservationError::Validation(
                        "idempotencyKey is too long".into(),
                    ));
                }
                Some(key)
            }
            None => None,
        };

        // 客户端超时重试：同一个幂等键直接返回已创建的行程
        if let Some(key) = idempotency_key {
            if let Some(started) = self.replay(key, user_id, scooter_id).await? {
                return Ok(started);
            }
        }

        let new_trip = NewTrip::new(user_id, scooter_id, idempotency_key.map(str::to_string));
        match timed(self.store_timeout, self.store.reserve_scooter(new_trip)).await {
            Ok((scooter, trip)) => {
                tracing::info!(
                    trip_id = %trip.trip_id,
                    scooter_id = %scooter.scooter_id,
                    user_id = %trip.user_id,
                    "Trip started"
                );
                Ok(TripStarted {
                    trip_id: trip.trip_id,
                    start_time: trip.start_time,
                    scooter,
                })
            }
            Err(StoreError::NotFound) => Err(ReservationError::ScooterNotFound(scooter_id.into())),
            Err(StoreError::ConditionFailed | StoreError::DuplicateIdempotencyKey(_)) => {
                // 并发的同键请求可能赢得了竞争，此时返回它创建的行程
                if let Some(key) = idempotency_key {
                    if let Some(started) = self.replay(key, user_id, scooter_id).await? {
                        return Ok(started);
                    }
                }
                tracing::debug!("Scooter {} lost reservation race or is in use", scooter_id);
                Err(ReservationError::ScooterUnavailable(scooter_id.into()))
            }
            Err(e) => Err(store_failure("start trip", e)),
        }
    }

    async fn replay(
        &self,
        key: &str,
        user_id: &str,
        scooter_id: &str,
    ) -> Result<Option<TripStarted>, ReservationError> {
        let existing = timed(self.store_timeout, self.store.find_trip_by_idempotency_key(key))
            .await
            .map_err(|e| store_failure("idempotency lookup", e))?;
        let Some(trip) = existing else {
            return Ok(None);
        };

        if trip.user_id != user_id || trip.scooter_id != scooter_id {
            return Err(ReservationError::Validation(
                "idempotencyKey was already used for a different trip".into(),
            ));
        }

        let scooter = timed(self.store_timeout, self.store.get_scooter(&trip.scooter_id))
            .await
            .map_err(|e| store_failure("idempotency lookup", e))?
            .ok_or_else(|| ReservationError::ScooterNotFound(trip.scooter_id.clone()))?;

        tracing::info!(trip_id = %trip.trip_id, "Replayed trip start for idempotency key");
        Ok(Some(TripStarted {
            trip_id: trip.trip_id,
            start_time: trip.start_time,
            scooter,
        }))
    }

    pub async fn end_trip(&self, trip_id: &str, end: Location) -> Result<Trip, ReservationError> {
        let trip_id = require(trip_id, "tripId")?;
        if let Err(field) = end.validate() {
            return Err(ReservationError::Validation(format!(
                "Invalid end{}{}",
                field[..1].to_uppercase(),
                &field[1..]
            )));
        }

        let trip = timed(self.store_timeout, self.store.get_trip(trip_id))
            .await
            .map_err(|e| store_failure("end trip", e))?
            .ok_or_else(|| ReservationError::TripNotFound(trip_id.into()))?;
        if !trip.is_active() {
            return Err(ReservationError::TripNotActive(trip_id.into()));
        }

        let completion = trip.completion(end, Utc::now());
        let completed = match timed(
            self.store_timeout,
            self.store.complete_trip(trip_id, completion),
        )
        .await
        {
            Ok(trip) => trip,
            Err(StoreError::ConditionFailed) => {
                return Err(ReservationError::TripNotActive(trip_id.into()));
            }
            Err(StoreError::NotFound) => return Err(ReservationError::TripNotFound(trip_id.into())),
            Err(e) => return Err(store_failure("end trip", e)),
        };

        // 行程已完成，释放车辆失败不回滚，交给对账任务
        match timed(
            self.store_timeout,
            self.store.release_scooter(&completed.scooter_id, end),
        )
        .await
        {
            Ok(_) => {
                tracing::info!(
                    trip_id = %completed.trip_id,
                    scooter_id = %completed.scooter_id,
                    distance = completed.distance,
                    "Trip completed"
                );
            }
            // 对账已经释放过车辆，并且车辆已开始新的行程，不能再覆盖
            Err(StoreError::ConditionFailed) => {
                tracing::warn!(
                    trip_id = %completed.trip_id,
                    scooter_id = %completed.scooter_id,
                    "Scooter already reserved by a newer trip, skipping release"
                );
            }
            Err(e) => self.enqueue_release(&completed, end, e),
        }

        Ok(completed)
    }

    fn enqueue_release(&self, trip: &Trip, location: Location, cause: StoreError) {
        let violation = AppError::InvariantViolation(format!(
            "Trip {} completed but scooter {} was not released",
            trip.trip_id, trip.scooter_id
        ));
        tracing::error!(kind = violation.kind(), cause = %cause, "{}", violation);

        let pending = PendingRelease {
            scooter_id: trip.scooter_id.clone(),
            trip_id: trip.trip_id.clone(),
            location,
        };
        if self.releases.send(pending).is_err() {
            tracing::error!(
                "Release queue closed, scooter {} will only be repaired by the periodic sweep",
                trip.scooter_id
            );
        }
    }

    pub async fn get_trip(&self, trip_id: &str) -> Result<Trip, ReservationError> {
        let trip_id = require(trip_id, "tripId")?;
        timed(self.store_timeout, self.store.get_trip(trip_id))
            .await
            .map_err(|e| store_failure("get trip", e))?
            .ok_or_else(|| ReservationError::TripNotFound(trip_id.into()))
    }
}
