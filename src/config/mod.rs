use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::utils::geo::MAX_COORDINATE_PRECISION;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub fleet_table: String,
    pub trip_table: String,
    pub change_channel: String,
    pub search_cache_ttl_secs: u64,
    pub coordinate_precision: u32,
    /// 最大搜索半径（米）
    pub max_search_radius: f64,
    pub search_use_availability_index: bool,
    pub store_timeout_ms: u64,
    pub cache_timeout_ms: u64,
    pub propagator_max_retries: u32,
    pub propagator_backoff_ms: u64,
    pub reconcile_interval_secs: u64,
    /// 行程结束后多久之内，扫描不接管该车辆的释放
    pub reconcile_grace_ms: u64,
    pub db_max_connections: u32,
}

// 表名和通道名会直接拼进 SQL，只允许小写标识符
fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && s.len() <= 48
}

struct Source<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        (self.lookup)(name)
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing(name))
    }

    fn parsed<T: FromStr>(&self, name: &'static str, default: T) -> Result<T, ConfigError> {
        match (self.lookup)(name) {
            None => Ok(default),
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value }),
        }
    }

    fn identifier(&self, name: &'static str, default: &str) -> Result<String, ConfigError> {
        let value = (self.lookup)(name).unwrap_or_else(|| default.to_string());
        if is_sql_identifier(&value) {
            Ok(value)
        } else {
            Err(ConfigError::Invalid { name, value })
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = Source { lookup };

        let mut config = Config {
            database_url: src.required("DATABASE_URL")?,
            redis_url: src.required("REDIS_URL")?,
            server_host: src.parsed("SERVER_HOST", "0.0.0.0".to_string())?,
            server_port: src.parsed("SERVER_PORT", 3000)?,
            fleet_table: src.identifier("FLEET_TABLE", "scooters")?,
            trip_table: src.identifier("TRIP_TABLE", "trips")?,
            change_channel: src.identifier("CHANGE_CHANNEL", "fleet_changes")?,
            search_cache_ttl_secs: src.parsed("SEARCH_CACHE_TTL", 300)?,
            coordinate_precision: src.parsed("COORDINATE_PRECISION", 3)?,
            max_search_radius: src.parsed("MAX_SEARCH_RADIUS", 5000.0)?,
            search_use_availability_index: src.parsed("SEARCH_USE_AVAILABILITY_INDEX", false)?,
            store_timeout_ms: src.parsed("STORE_TIMEOUT_MS", 2000)?,
            cache_timeout_ms: src.parsed("CACHE_TIMEOUT_MS", 500)?,
            propagator_max_retries: src.parsed("PROPAGATOR_MAX_RETRIES", 5)?,
            propagator_backoff_ms: src.parsed("PROPAGATOR_BACKOFF_MS", 100)?,
            reconcile_interval_secs: src.parsed("RECONCILE_INTERVAL_SECS", 60)?,
            reconcile_grace_ms: src.parsed("RECONCILE_GRACE_MS", 0)?,
            db_max_connections: src.parsed("DB_MAX_CONNECTIONS", 10)?,
        };

        if config.coordinate_precision > MAX_COORDINATE_PRECISION {
            return Err(ConfigError::Invalid {
                name: "COORDINATE_PRECISION",
                value: config.coordinate_precision.to_string(),
            });
        }
        if !(config.max_search_radius.is_finite() && config.max_search_radius > 0.0) {
            return Err(ConfigError::Invalid {
                name: "MAX_SEARCH_RADIUS",
                value: config.max_search_radius.to_string(),
            });
        }
        if config.search_cache_ttl_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "SEARCH_CACHE_TTL",
                value: "0".into(),
            });
        }

        // 未配置时取三倍存储超时，覆盖 EndTrip 两次写入之间的窗口
        if config.reconcile_grace_ms == 0 {
            config.reconcile_grace_ms = config.store_timeout_ms.saturating_mul(3);
        }

        Ok(config)
    }

    /// 不读取环境变量的默认配置，连接串为空，只能配合内存实现使用
    pub fn for_tests() -> Self {
        Self::from_lookup(|name| match name {
            "DATABASE_URL" => Some("postgres://unused".into()),
            "REDIS_URL" => Some("redis://unused".into()),
            _ => None,
        })
        .expect("default test configuration is valid")
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn propagator_backoff(&self) -> Duration {
        Duration::from_millis(self.propagator_backoff_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn reconcile_grace(&self) -> Duration {
        Duration::from_millis(self.reconcile_grace_ms)
    }
}
