use serde::{Deserialize, Serialize};

pub const DEFAULT_TOP_RIDERS: usize = 10;
pub const MAX_TOP_RIDERS: usize = 100;

#[derive(Debug, Deserialize)]
pub struct TopRidersQuery {
    pub count: Option<usize>,
}

impl TopRidersQuery {
    pub fn count(&self) -> usize {
        self.count
            .unwrap_or(DEFAULT_TOP_RIDERS)
            .min(MAX_TOP_RIDERS)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RiderScore {
    pub user_id: String,
    /// 累计骑行距离（米）
    pub score: f64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RiderRank {
    pub user_id: String,
    /// 从 1 开始
    pub rank: usize,
    pub score: f64,
}
