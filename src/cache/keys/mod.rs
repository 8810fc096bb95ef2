/// 缓存键模块
/// 所有缓存键都在这里构造，其他模块不直接拼接字符串

// 车辆、行程与排行榜的键
pub mod fleet_keys;

// 附近搜索结果的键
pub mod search_keys;

pub use fleet_keys::{AVAILABLE_SCOOTERS_KEY, USER_LEADERBOARD_KEY, fleet_key, trip_key};
pub use search_keys::nearby_scooters_key;
