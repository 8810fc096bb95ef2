/// 地球半径（米）
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// 坐标精度上限（小数位数）
pub const MAX_COORDINATE_PRECISION: u32 = 6;

// 使用Haversine公式计算两点之间的球面距离，返回米
pub fn calculate_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lon2 - lon1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// 将坐标四舍五入到指定小数位
pub fn round_coordinate(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision.min(MAX_COORDINATE_PRECISION) as i32);
    let rounded = (value * factor).round() / factor;
    // -0.0 和 0.0 必须生成同一个缓存键
    if rounded == 0.0 { 0.0 } else { rounded }
}

/// 按固定小数位格式化坐标，用于构造确定性的缓存键
pub fn format_coordinate(value: f64, precision: u32) -> String {
    let precision = precision.min(MAX_COORDINATE_PRECISION) as usize;
    format!("{:.*}", precision, round_coordinate(value, precision as u32))
}

pub fn is_valid_latitude(value: f64) -> bool {
    value.is_finite() && (-90.0..=90.0).contains(&value)
}

pub fn is_valid_longitude(value: f64) -> bool {
    value.is_finite() && (-180.0..=180.0).contains(&value)
}
