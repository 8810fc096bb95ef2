use serde::Deserialize;

use crate::error::AppError;

/// 查询参数先按字符串接收，非数字的值返回具体的校验错误
#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub latitude: Option<String>,
    pub longitude: Option<String>,
    pub radius: Option<String>,
}

fn parse_number(value: Option<&str>, name: &str) -> Result<f64, AppError> {
    let value = value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::Validation(format!("Missing required parameter {name}")))?;
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AppError::Validation(format!("Invalid {name}")))
}

impl SearchQuery {
    /// 返回 (latitude, longitude, radius)
    pub fn parse(&self) -> Result<(f64, f64, f64), AppError> {
        Ok((
            parse_number(self.latitude.as_deref(), "latitude")?,
            parse_number(self.longitude.as_deref(), "longitude")?,
            parse_number(self.radius.as_deref(), "radius")?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(lat: &str, lon: &str, radius: &str) -> SearchQuery {
        SearchQuery {
            latitude: Some(lat.into()),
            longitude: Some(lon.into()),
            radius: Some(radius.into()),
        }
    }

    #[test]
    fn parses_numeric_values() {
        assert_eq!(query("40.71", " -74.0 ", "1000").parse().unwrap(), (40.71, -74.0, 1000.0));
    }

    #[test]
    fn reports_the_offending_parameter() {
        let err = query("north", "-74.0", "1000").parse().unwrap_err();
        assert_eq!(err.to_string(), "Invalid latitude");

        let err = query("40.7", "-74.0", "NaN").parse().unwrap_err();
        assert_eq!(err.to_string(), "Invalid radius");

        let err = SearchQuery::default().parse().unwrap_err();
        assert_eq!(err.to_string(), "Missing required parameter latitude");
    }
}
