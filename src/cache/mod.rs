// 缓存模块
// 缓存只是加速层：附近搜索的读穿缓存，以及由变更流维护的车辆、行程快照和有序集合索引。
// 权威数据永远在 store 中，缓存可能在 TTL 内过期

pub mod keys;
pub mod operations;

use std::collections::HashMap;

use async_trait::async_trait;

pub use operations::{MemoryCache, RedisCache};

pub type CacheResult<T> = Result<T, CacheError>;

/// 快照哈希中保存版本号的字段
pub const SNAPSHOT_VERSION_FIELD: &str = "version";

/// 与快照在同一次原子写入中生效的有序集合变更
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IndexChange<'a> {
    Add { set: &'a str, member: &'a str, score: f64 },
    Remove { set: &'a str, member: &'a str },
}

/// 带版本的快照写入。缓存中的版本更新时整个写入被丢弃，版本相同时照常覆盖
#[derive(Debug, Clone, Copy)]
pub struct SnapshotWrite<'a> {
    pub key: &'a str,
    pub version: i64,
    pub fields: &'a [(String, String)],
    pub index: Option<IndexChange<'a>>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache call timed out")]
    Timeout,
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for CacheError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CacheError::Timeout
    }
}

#[async_trait]
pub trait FleetCache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<()>;

    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, String>>;

    /// 原子地比较版本并写入快照和索引，返回是否写入
    async fn write_snapshot(&self, write: SnapshotWrite<'_>) -> CacheResult<bool>;

    async fn zadd(&self, set: &str, score: f64, member: &str) -> CacheResult<()>;

    async fn zrem(&self, set: &str, member: &str) -> CacheResult<()>;

    /// 有序集合的全部成员，按 score 升序
    async fn zrange_all(&self, set: &str) -> CacheResult<Vec<String>>;

    /// 按 score 降序取 [start, stop] 区间（闭区间，从 0 开始）
    async fn zrevrange_withscores(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> CacheResult<Vec<(String, f64)>>;

    /// 按 score 降序的排名（从 0 开始）
    async fn zrevrank(&self, set: &str, member: &str) -> CacheResult<Option<usize>>;

    async fn zscore(&self, set: &str, member: &str) -> CacheResult<Option<f64>>;
}
