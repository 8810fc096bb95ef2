use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use redis::{AsyncCommands, Client as RedisClient, Script, aio::MultiplexedConnection};

use crate::cache::{CacheResult, FleetCache, IndexChange, SNAPSHOT_VERSION_FIELD, SnapshotWrite};

// KEYS[1] 快照哈希，KEYS[2] 索引（可选）
// ARGV: 版本字段, 版本, 索引操作(add/rem/none), 成员, 分数, 之后是字段和值
static SNAPSHOT_SCRIPT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r#"
        local current = redis.call('HGET', KEYS[1], ARGV[1])
        if current and tonumber(current) > tonumber(ARGV[2]) then
            return 0
        end
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2], unpack(ARGV, 6))
        if ARGV[3] == 'add' then
            redis.call('ZADD', KEYS[2], ARGV[5], ARGV[4])
        elseif ARGV[3] == 'rem' then
            redis.call('ZREM', KEYS[2], ARGV[4])
        end
        return 1
        "#,
    )
});

/// Redis 缓存。每次操作单独获取多路复用连接，不持有全局连接
#[derive(Clone)]
pub struct RedisCache {
    redis_client: Arc<RedisClient>,
}

impl RedisCache {
    pub fn new(redis_client: Arc<RedisClient>) -> Self {
        Self { redis_client }
    }

    async fn connection(&self) -> CacheResult<MultiplexedConnection> {
        Ok(self.redis_client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl FleetCache for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(key, value, ttl_secs).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        Ok(conn.hgetall(key).await?)
    }

    async fn write_snapshot(&self, write: SnapshotWrite<'_>) -> CacheResult<bool> {
        let mut invocation = SNAPSHOT_SCRIPT.key(write.key);
        match write.index {
            Some(IndexChange::Add { set, member, score }) => {
                invocation.key(set).arg(SNAPSHOT_VERSION_FIELD).arg(write.version);
                invocation.arg("add").arg(member).arg(score);
            }
            Some(IndexChange::Remove { set, member }) => {
                invocation.key(set).arg(SNAPSHOT_VERSION_FIELD).arg(write.version);
                invocation.arg("rem").arg(member).arg(0);
            }
            None => {
                invocation.arg(SNAPSHOT_VERSION_FIELD).arg(write.version);
                invocation.arg("none").arg("").arg(0);
            }
        }
        for (field, value) in write.fields {
            invocation.arg(field).arg(value);
        }

        let mut conn = self.connection().await?;
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn zadd(&self, set: &str, score: f64, member: &str) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.zadd(set, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, set: &str, member: &str) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.zrem(set, member).await?;
        Ok(())
    }

    async fn zrange_all(&self, set: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.zrange(set, 0, -1).await?)
    }

    async fn zrevrange_withscores(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> CacheResult<Vec<(String, f64)>> {
        let mut conn = self.connection().await?;
        Ok(conn.zrevrange_withscores(set, start, stop).await?)
    }

    async fn zrevrank(&self, set: &str, member: &str) -> CacheResult<Option<usize>> {
        let mut conn = self.connection().await?;
        Ok(conn.zrevrank(set, member).await?)
    }

    async fn zscore(&self, set: &str, member: &str) -> CacheResult<Option<f64>> {
        let mut conn = self.connection().await?;
        Ok(conn.zscore(set, member).await?)
    }
}
