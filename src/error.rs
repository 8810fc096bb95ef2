use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::cache::CacheError;
use crate::store::StoreError;
use crate::utils::error_codes;

/// 对外暴露的错误分类。message 面向用户，不包含存储层的内部错误信息
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 输入缺失或格式错误
    #[error("{0}")]
    Validation(String),
    /// 实体不存在
    #[error("{0}")]
    NotFound(String),
    /// 条件更新因并发状态失败
    #[error("{0}")]
    Conflict(String),
    /// 存储或缓存不可达、超时，调用方可重试
    #[error("{0}")]
    TransientInfra(String),
    /// 多步写入中途失败，已记录并进入对账
    #[error("{0}")]
    InvariantViolation(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    code: i32,
    kind: &'static str,
    message: String,
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONFLICT",
            AppError::TransientInfra(_) => "TRANSIENT_INFRA",
            AppError::InvariantViolation(_) => "INVARIANT_VIOLATION",
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            AppError::Validation(_) => error_codes::VALIDATION_ERROR,
            AppError::NotFound(_) => error_codes::NOT_FOUND,
            AppError::Conflict(_) => error_codes::CONFLICT,
            AppError::TransientInfra(_) => error_codes::INTERNAL_ERROR,
            AppError::InvariantViolation(_) => error_codes::INVARIANT_VIOLATION,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Conflict(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::TransientInfra(_) | AppError::InvariantViolation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => AppError::NotFound("Record not found".into()),
            StoreError::ConditionFailed | StoreError::DuplicateIdempotencyKey(_) => {
                AppError::Conflict("Record was modified concurrently".into())
            }
            StoreError::Timeout | StoreError::Unavailable(_) => {
                AppError::TransientInfra("Fleet store is temporarily unavailable".into())
            }
            StoreError::Corrupt(e) => {
                tracing::error!("Corrupt record in fleet store: {}", e);
                AppError::TransientInfra("Fleet store returned an unreadable record".into())
            }
        }
    }
}

impl From<CacheError> for AppError {
    fn from(_: CacheError) -> Self {
        AppError::TransientInfra("Cache is temporarily unavailable".into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorResponse {
            code: self.code(),
            kind: self.kind(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}
