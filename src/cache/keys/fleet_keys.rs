/// 车辆快照缓存键前缀
const FLEET_PREFIX: &str = "fleet:";

/// 行程快照缓存键前缀
const TRIP_PREFIX: &str = "trip:";

/// 可用车辆索引（有序集合，score 为最近一次变为可用的毫秒时间戳）
pub const AVAILABLE_SCOOTERS_KEY: &str = "available_scooters";

/// 用户累计里程排行榜（有序集合，score 为累计距离）
pub const USER_LEADERBOARD_KEY: &str = "user_leaderboard";

/// 生成车辆快照缓存键
pub fn fleet_key(scooter_id: &str) -> String {
    format!("{}{}", FLEET_PREFIX, scooter_id)
}

/// 生成行程快照缓存键
pub fn trip_key(trip_id: &str) -> String {
    format!("{}{}", TRIP_PREFIX, trip_id)
}
