use std::future::Future;
use std::time::Duration;

pub mod geo;

/// 给一次存储或缓存调用加上超时，超时转换为对应层的错误类型
pub async fn timed<T, E, F>(limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<tokio::time::error::Elapsed>,
{
    tokio::time::timeout(limit, fut).await?
}

pub mod error_codes {
    pub const VALIDATION_ERROR: i32 = 1000;
    pub const CONFLICT: i32 = 1001;
    pub const NOT_FOUND: i32 = 1004;
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const INVARIANT_VIOLATION: i32 = 5001;
}
