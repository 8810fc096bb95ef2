use axum::extract::{Json, Query, State, rejection::QueryRejection};

use super::model::{RankQuery, RiderRank, RiderScore, TopRidersQuery};
use crate::AppState;
use crate::cache::keys::USER_LEADERBOARD_KEY;
use crate::error::AppError;
use crate::routes::query_rejection;
use crate::utils::timed;

#[axum::debug_handler]
pub async fn top_riders(
    State(state): State<AppState>,
    query: Result<Query<TopRidersQuery>, QueryRejection>,
) -> Result<Json<Vec<RiderScore>>, AppError> {
    let Query(query) = query.map_err(query_rejection)?;
    let count = query.count();
    if count == 0 {
        return Ok(Json(Vec::new()));
    }

    let stop = isize::try_from(count - 1).unwrap_or(isize::MAX);
    let riders = timed(
        state.config.cache_timeout(),
        state.cache.zrevrange_withscores(USER_LEADERBOARD_KEY, 0, stop),
    )
    .await?;

    Ok(Json(
        riders
            .into_iter()
            .map(|(user_id, score)| RiderScore { user_id, score })
            .collect(),
    ))
}

#[axum::debug_handler]
pub async fn rank(
    State(state): State<AppState>,
    query: Result<Query<RankQuery>, QueryRejection>,
) -> Result<Json<RiderRank>, AppError> {
    let Query(query) = query.map_err(query_rejection)?;
    let user_id = query
        .user_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::Validation("Missing required parameter userId".into()))?;

    let limit = state.config.cache_timeout();
    let rank = timed(limit, state.cache.zrevrank(USER_LEADERBOARD_KEY, &user_id)).await?;
    let score = timed(limit, state.cache.zscore(USER_LEADERBOARD_KEY, &user_id)).await?;

    match (rank, score) {
        (Some(rank), Some(score)) => Ok(Json(RiderRank {
            user_id,
            rank: rank + 1,
            score,
        })),
        _ => Err(AppError::NotFound("User not found in leaderboard".into())),
    }
}
