/// 缓存操作
/// Redis 实现用于部署，内存实现用于测试和本地运行

mod memory_cache;
mod redis_cache;

pub use memory_cache::MemoryCache;
pub use redis_cache::RedisCache;
