// 权威存储
// 车辆与行程的唯一事实来源，状态流转都依赖条件更新

pub mod feed;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{Location, ModelError, NewTrip, Scooter, ScooterStatus, Trip, TripCompletion};

pub use feed::{ChangeEvent, ChangeEventType, ChangeFeed, FeedError};
pub use memory::MemoryFleetStore;
pub use postgres::PgFleetStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    /// 条件更新的前置条件不成立，未产生任何写入
    #[error("conditional check failed")]
    ConditionFailed,
    #[error("idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),
    #[error("store call timed out")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(#[from] ModelError),
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::Timeout
    }
}

impl StoreError {
    /// 基础设施故障，调用方可以重试
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Timeout | StoreError::Unavailable(_))
    }
}

/// 扫描车辆表的过滤条件
#[derive(Debug, Clone, Copy, Default)]
pub struct ScooterFilter {
    pub status: Option<ScooterStatus>,
}

impl ScooterFilter {
    pub fn available() -> Self {
        Self {
            status: Some(ScooterStatus::Available),
        }
    }

    pub fn matches(&self, scooter: &Scooter) -> bool {
        self.status.is_none_or(|status| scooter.status == status)
    }
}

#[async_trait]
pub trait FleetStore: Send + Sync {
    async fn get_scooter(&self, scooter_id: &str) -> StoreResult<Option<Scooter>>;

    /// 新增或覆盖车辆记录（车队录入，不参与预约流程）
    async fn put_scooter(&self, scooter: &Scooter) -> StoreResult<()>;

    async fn scan_scooters(&self, filter: ScooterFilter) -> StoreResult<Vec<Scooter>>;

    /// 按 id 批量读取，缺失的 id 直接忽略
    async fn get_scooters(&self, scooter_ids: &[String]) -> StoreResult<Vec<Scooter>>;

    async fn get_trip(&self, trip_id: &str) -> StoreResult<Option<Trip>>;

    async fn find_trip_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Trip>>;

    /// 条件更新：车辆必须存在且为 AVAILABLE，成功时车辆变为 IN_USE 并同时写入 ACTIVE 行程。
    /// 车辆不存在返回 NotFound，状态不符返回 ConditionFailed，两者都不产生写入
    async fn reserve_scooter(&self, trip: NewTrip) -> StoreResult<(Scooter, Trip)>;

    /// 条件更新：行程必须为 ACTIVE，成功时变为 COMPLETED
    async fn complete_trip(&self, trip_id: &str, completion: TripCompletion) -> StoreResult<Trip>;

    /// 没有 ACTIVE 行程引用该车辆时置为 AVAILABLE 并更新位置，不要求当前状态为 IN_USE。
    /// 车辆已被新行程占用时返回 ConditionFailed，不产生写入
    async fn release_scooter(&self, scooter_id: &str, location: Location) -> StoreResult<Scooter>;

    /// 仅当车辆为 IN_USE 且没有 ACTIVE 行程时释放，用于对账修复。
    /// 不需要修复时返回 None
    async fn release_if_idle(
        &self,
        scooter_id: &str,
        location: Option<Location>,
    ) -> StoreResult<Option<Scooter>>;

    /// IN_USE 但没有任何 ACTIVE 行程引用的车辆。
    /// 在 `ended_after` 之后才结束过行程的车辆不返回，它们的释放可能仍在进行
    async fn scan_stuck_scooters(&self, ended_after: DateTime<Utc>) -> StoreResult<Vec<Scooter>>;

    /// 用户已完成行程的累计距离（米），没有已完成行程时返回 None
    async fn user_total_distance(&self, user_id: &str) -> StoreResult<Option<f64>>;
}
