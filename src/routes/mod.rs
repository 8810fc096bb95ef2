pub mod leaderboard;
pub mod search;
pub mod trip;

use std::future::Future;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use serde_json::{Value, json};

use crate::error::AppError;
use crate::reservation::ReservationError;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) fn json_rejection(rejection: JsonRejection) -> AppError {
    AppError::Validation(format!("Invalid request body: {}", rejection.body_text()))
}

pub(crate) fn query_rejection(rejection: QueryRejection) -> AppError {
    AppError::Validation(format!("Invalid query: {}", rejection.body_text()))
}

/// 在独立任务中运行预约操作，客户端断开连接不会让多步写入停在中途
pub(crate) async fn detached<T, F>(operation: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, ReservationError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(operation).await {
        Ok(result) => result.map_err(AppError::from),
        Err(e) => {
            tracing::error!("Reservation task failed: {}", e);
            Err(AppError::TransientInfra("Request could not be completed".into()))
        }
    }
}
