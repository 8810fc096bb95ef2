use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::cache::{
    CacheError, CacheResult, FleetCache, IndexChange, SNAPSHOT_VERSION_FIELD, SnapshotWrite,
};

#[derive(Default)]
struct CacheState {
    strings: HashMap<String, (String, Instant)>,
    hashes: HashMap<String, HashMap<String, String>>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
}

/// 进程内缓存，语义与所用到的 Redis 命令一致。
/// 过期时间基于 tokio 时钟，测试中可以用暂停的时钟推进
#[derive(Default)]
pub struct MemoryCache {
    state: Mutex<CacheState>,
    // 接下来需要失败的调用次数
    failures: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 n 次调用返回 Unavailable，模拟缓存故障
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn lock(&self) -> CacheResult<MutexGuard<'_, CacheState>> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CacheError::Unavailable("injected failure".into()));
        }
        self.state
            .lock()
            .map_err(|_| CacheError::Unavailable("memory cache lock poisoned".into()))
    }

    // 降序：score 大的在前，score 相同时成员名大的在前（与 ZREVRANGE 一致）
    fn sorted_desc(set: &HashMap<String, f64>) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> =
            set.iter().map(|(m, s)| (m.clone(), *s)).collect();
        members.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
        members
    }
}

// Redis 区间语义：负数从末尾计数，越界自动截断
fn normalize_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl FleetCache for MemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut state = self.lock()?;
        let expired = match state.strings.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => {
                return Ok(Some(value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.strings.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> CacheResult<()> {
        let now = Instant::now();
        let mut state = self.lock()?;
        // 写入时顺带清理过期条目，长时间运行也不会无限增长
        state.strings.retain(|_, (_, expires_at)| *expires_at > now);
        state.strings.insert(
            key.to_string(),
            (value.to_string(), now + Duration::from_secs(ttl_secs)),
        );
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> CacheResult<HashMap<String, String>> {
        Ok(self.lock()?.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn write_snapshot(&self, write: SnapshotWrite<'_>) -> CacheResult<bool> {
        let mut state = self.lock()?;
        let hash = state.hashes.entry(write.key.to_string()).or_default();
        let cached = hash
            .get(SNAPSHOT_VERSION_FIELD)
            .and_then(|v| v.parse::<i64>().ok());
        if cached.is_some_and(|cached| cached > write.version) {
            return Ok(false);
        }

        for (field, value) in write.fields {
            hash.insert(field.clone(), value.clone());
        }
        hash.insert(SNAPSHOT_VERSION_FIELD.to_string(), write.version.to_string());

        match write.index {
            Some(IndexChange::Add { set, member, score }) => {
                state
                    .sorted_sets
                    .entry(set.to_string())
                    .or_default()
                    .insert(member.to_string(), score);
            }
            Some(IndexChange::Remove { set, member }) => {
                if let Some(members) = state.sorted_sets.get_mut(set) {
                    members.remove(member);
                }
            }
            None => {}
        }
        Ok(true)
    }

    async fn zadd(&self, set: &str, score: f64, member: &str) -> CacheResult<()> {
        self.lock()?
            .sorted_sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, set: &str, member: &str) -> CacheResult<()> {
        if let Some(members) = self.lock()?.sorted_sets.get_mut(set) {
            members.remove(member);
        }
        Ok(())
    }

    async fn zrange_all(&self, set: &str) -> CacheResult<Vec<String>> {
        let state = self.lock()?;
        let Some(members) = state.sorted_sets.get(set) else {
            return Ok(Vec::new());
        };
        let mut ascending = Self::sorted_desc(members);
        ascending.reverse();
        Ok(ascending.into_iter().map(|(m, _)| m).collect())
    }

    async fn zrevrange_withscores(
        &self,
        set: &str,
        start: isize,
        stop: isize,
    ) -> CacheResult<Vec<(String, f64)>> {
        let state = self.lock()?;
        let Some(members) = state.sorted_sets.get(set) else {
            return Ok(Vec::new());
        };
        let sorted = Self::sorted_desc(members);
        Ok(match normalize_range(sorted.len(), start, stop) {
            Some((from, to)) => sorted[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn zrevrank(&self, set: &str, member: &str) -> CacheResult<Option<usize>> {
        let state = self.lock()?;
        Ok(state
            .sorted_sets
            .get(set)
            .and_then(|members| Self::sorted_desc(members).iter().position(|(m, _)| m == member)))
    }

    async fn zscore(&self, set: &str, member: &str) -> CacheResult<Option<f64>> {
        Ok(self
            .lock()?
            .sorted_sets
            .get(set)
            .and_then(|members| members.get(member).copied()))
    }
}
