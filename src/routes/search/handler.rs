use axum::{
    extract::{Json, Query, State, rejection::QueryRejection},
    http::HeaderValue,
    response::{IntoResponse, Response},
};

use super::model::SearchQuery;
use crate::AppState;
use crate::error::AppError;
use crate::routes::query_rejection;

const CACHE_STATUS_HEADER: &str = "x-cache";

#[axum::debug_handler]
pub async fn search_scooters(
    State(state): State<AppState>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Response, AppError> {
    let Query(query) = query.map_err(query_rejection)?;
    let (latitude, longitude, radius) = query.parse()?;

    let outcome = state.search.search_nearby(latitude, longitude, radius).await?;
    if outcome.scooters.is_empty() {
        return Err(AppError::NotFound(
            "No scooters found for the given parameters".into(),
        ));
    }

    let mut response = Json(outcome.scooters).into_response();
    response.headers_mut().insert(
        CACHE_STATUS_HEADER,
        HeaderValue::from_static(outcome.source.as_str()),
    );
    Ok(response)
}
