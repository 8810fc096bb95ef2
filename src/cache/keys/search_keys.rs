use crate::utils::geo::format_coordinate;

/// 附近车辆搜索结果缓存键前缀
const NEARBY_SCOOTERS_PREFIX: &str = "scooters:near:";

/// 生成附近车辆缓存键
/// 坐标按配置精度取整（3 位小数约 111 米网格），相邻的查询共享同一个键
pub fn nearby_scooters_key(lat: f64, lon: f64, radius_meters: f64, precision: u32) -> String {
    format!(
        "{}{}:{}:{}",
        NEARBY_SCOOTERS_PREFIX,
        format_coordinate(lat, precision),
        format_coordinate(lon, precision),
        radius_meters
    )
}
